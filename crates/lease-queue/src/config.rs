//! Client configuration.

use crate::error::ConfigurationError;
use crate::message::ReceiveRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Configuration for a [`QueueClient`](crate::QueueClient) talking HTTP
///
/// Credentials and region are optional at the type level so that partially
/// populated sources (files, environment) deserialize; [`validate`](Self::validate)
/// rejects a configuration that is missing any of them.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,

    /// Queue addressed by push and pop; may instead come from `create_queue`
    pub queue_url: Option<String>,

    /// Service endpoint for queue-level calls, defaults to the regional endpoint
    pub endpoint: Option<String>,

    /// Per-request HTTP timeout; must exceed the long-poll wait
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub lease: LeaseSettings,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            access_key_id: None,
            secret_access_key: None,
            region: None,
            queue_url: None,
            endpoint: None,
            request_timeout_secs: default_request_timeout_secs(),
            lease: LeaseSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Create configuration from explicit credentials
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: Some(access_key_id.into()),
            secret_access_key: Some(secret_access_key.into()),
            region: Some(region.into()),
            ..Self::default()
        }
    }

    pub fn with_queue_url(mut self, queue_url: impl Into<String>) -> Self {
        self.queue_url = Some(queue_url.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Check required fields and timing constraints
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        required(&self.access_key_id, "access_key_id")?;
        required(&self.secret_access_key, "secret_access_key")?;
        required(&self.region, "region")?;

        if let Some(queue_url) = &self.queue_url {
            parse_url(queue_url, "queue_url")?;
        }
        self.endpoint_url()?;
        self.lease.validate()?;

        if self.request_timeout_secs <= u64::from(self.lease.wait_time_secs) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "request_timeout_secs ({}) must exceed the long-poll wait ({})",
                    self.request_timeout_secs, self.lease.wait_time_secs
                ),
            });
        }

        Ok(())
    }

    /// Endpoint for queue-level calls such as CreateQueue
    pub fn endpoint_url(&self) -> Result<Url, ConfigurationError> {
        match &self.endpoint {
            Some(endpoint) => parse_url(endpoint, "endpoint"),
            None => {
                let region = required(&self.region, "region")?;
                parse_url(&format!("https://sqs.{}.amazonaws.com/", region), "region")
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("region", &self.region)
            .field("queue_url", &self.queue_url)
            .field("endpoint", &self.endpoint)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("lease", &self.lease)
            .field("retry", &self.retry)
            .finish()
    }
}

fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str, ConfigurationError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigurationError::missing(key)),
    }
}

fn parse_url(value: &str, key: &str) -> Result<Url, ConfigurationError> {
    Url::parse(value).map_err(|e| ConfigurationError::Invalid {
        message: format!("{} '{}' is not a valid URL: {}", key, value, e),
    })
}

/// Timing of the visibility lease held while a popped message is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    /// Invisibility window granted on receive and on every renewal
    pub visibility_timeout_secs: u32,

    /// Period of the renewal timer
    pub renewal_interval_secs: u64,

    /// Long-poll duration of each receive call
    pub wait_time_secs: u32,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 30,
            renewal_interval_secs: 15,
            wait_time_secs: 20,
        }
    }
}

impl LeaseSettings {
    /// Renewal must fire at least twice per window so one missed tick still
    /// lands before expiry
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.renewal_interval_secs == 0 {
            return Err(ConfigurationError::Invalid {
                message: "renewal_interval_secs must be greater than zero".to_string(),
            });
        }
        if self.renewal_interval_secs.saturating_mul(2) > u64::from(self.visibility_timeout_secs) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "renewal_interval_secs ({}) must be at most half of visibility_timeout_secs ({})",
                    self.renewal_interval_secs, self.visibility_timeout_secs
                ),
            });
        }
        Ok(())
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    /// Parameters for the single-message receive issued by pop
    pub fn receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: 1,
            visibility_timeout_secs: self.visibility_timeout_secs,
            wait_time_secs: self.wait_time_secs,
        }
    }
}

/// Backoff applied by pop after failed receive calls
///
/// Empty receives are retried immediately; only genuine errors back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately after every failure
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before the next receive after `consecutive_errors` failures in a row
    pub fn backoff(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return Duration::ZERO;
        }
        let exponent = consecutive_errors.saturating_sub(1).min(16);
        let delay = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(exponent))
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}
