//! Consumer configuration.
//!
//! The acknowledgment behaviour of a consumer is a small set of choices:
//! the policy for failed callbacks, what to do on success, and the consumer
//! tag used to correlate log events. [`ConsumerConfig`] can be built in code,
//! deserialized with `serde`, or read from the environment.

use serde::{Deserialize, Serialize};

use crate::policy::{AckPolicy, OnSuccess, ParseError};

/// Environment variable holding the [`AckPolicy`].
pub const ACK_POLICY_ENV: &str = "LETTERBOX_ACK_POLICY";
/// Environment variable holding the [`OnSuccess`] mode.
pub const ACK_ON_SUCCESS_ENV: &str = "LETTERBOX_ACK_ON_SUCCESS";
/// Environment variable holding the consumer tag.
pub const CONSUMER_TAG_ENV: &str = "LETTERBOX_CONSUMER_TAG";

/// Acknowledgment settings of one consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Policy applied when the callback fails.
    pub policy: AckPolicy,
    /// What happens when the callback succeeds.
    pub on_success: OnSuccess,
    /// Tag identifying the consumer in log events.
    pub consumer_tag: Option<String>,
}

impl ConsumerConfig {
    pub fn with_policy(mut self, policy: AckPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_on_success(mut self, on_success: OnSuccess) -> Self {
        self.on_success = on_success;
        self
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Read the configuration from `LETTERBOX_*` environment variables.
    ///
    /// Unset variables keep their defaults; set but invalid values are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ACK_POLICY_ENV) {
            config.policy = value
                .parse()
                .map_err(|e| ConfigError::new(ACK_POLICY_ENV, e))?;
        }
        if let Some(value) = lookup(ACK_ON_SUCCESS_ENV) {
            config.on_success = value
                .parse()
                .map_err(|e| ConfigError::new(ACK_ON_SUCCESS_ENV, e))?;
        }
        config.consumer_tag = lookup(CONSUMER_TAG_ENV).filter(|tag| !tag.is_empty());

        Ok(config)
    }
}

/// Error returned when the environment holds an invalid setting.
#[derive(Debug)]
pub struct ConfigError {
    variable: &'static str,
    source: ParseError,
}

impl ConfigError {
    fn new(variable: &'static str, source: ParseError) -> Self {
        Self { variable, source }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.variable, self.source)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
