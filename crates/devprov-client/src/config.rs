//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisioningError, ProvisioningResult};

/// Default `User-Agent` header value.
pub const USER_AGENT_VALUE: &str = concat!("devprov-client/", env!("CARGO_PKG_VERSION"));

/// Provisioning client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Service host, or a full `http(s)://` base.
    #[serde(default = "default_global_endpoint")]
    pub global_endpoint: String,

    /// `api-version` query value.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Per transport call timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum retries of one step for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay of exponential backoff for transient failures.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Poll delay used when the service sends no retry-after hint.
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,

    /// Poll delay floor.
    #[serde(default = "default_min_poll_delay_ms")]
    pub min_poll_delay_ms: u64,

    /// Poll delay and backoff cap.
    #[serde(default = "default_max_poll_delay_ms")]
    pub max_poll_delay_ms: u64,

    /// Maximum number of status polls before giving up.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// SAS token lifetime in seconds.
    #[serde(default = "default_sas_token_ttl_secs")]
    pub sas_token_ttl_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_global_endpoint() -> String {
    "global.azure-devices-provisioning.net".to_string()
}

fn default_api_version() -> String {
    "2019-03-31".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_min_poll_delay_ms() -> u64 {
    1_000
}

fn default_max_poll_delay_ms() -> u64 {
    30_000
}

fn default_max_poll_attempts() -> u32 {
    60
}

/// Longest SAS token lifetime accepted by [`ProvisioningConfig::validate`] (one year).
pub const MAX_SAS_TOKEN_TTL_SECS: u64 = 365 * 24 * 3_600;

fn default_sas_token_ttl_secs() -> u64 {
    3_600
}

fn default_user_agent() -> String {
    USER_AGENT_VALUE.to_string()
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            global_endpoint: default_global_endpoint(),
            api_version: default_api_version(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            default_poll_interval_ms: default_poll_interval_ms(),
            min_poll_delay_ms: default_min_poll_delay_ms(),
            max_poll_delay_ms: default_max_poll_delay_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            sas_token_ttl_secs: default_sas_token_ttl_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl ProvisioningConfig {
    /// Create config from environment variables.
    ///
    /// The client never calls this on its own; callers opt in.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `DEVPROV_GLOBAL_ENDPOINT` | Service endpoint |
    /// | `DEVPROV_API_VERSION` | API version |
    /// | `DEVPROV_TIMEOUT_MS` | Per call timeout |
    /// | `DEVPROV_MAX_RETRIES` | Retry budget per step |
    /// | `DEVPROV_MAX_POLL_ATTEMPTS` | Poll budget |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            global_endpoint: std::env::var("DEVPROV_GLOBAL_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.global_endpoint),
            api_version: std::env::var("DEVPROV_API_VERSION")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.api_version),
            request_timeout_ms: env_parse("DEVPROV_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout_ms),
            max_retries: env_parse("DEVPROV_MAX_RETRIES").unwrap_or(defaults.max_retries),
            max_poll_attempts: env_parse("DEVPROV_MAX_POLL_ATTEMPTS")
                .unwrap_or(defaults.max_poll_attempts),
            ..defaults
        }
    }

    /// Reject empty endpoints, inverted poll bounds and out of range SAS lifetimes.
    pub fn validate(&self) -> ProvisioningResult<()> {
        if self.global_endpoint.trim().is_empty() {
            return Err(ProvisioningError::invalid("global endpoint cannot be empty"));
        }
        if self.api_version.trim().is_empty() {
            return Err(ProvisioningError::invalid("api version cannot be empty"));
        }
        if self.min_poll_delay_ms > self.max_poll_delay_ms {
            return Err(ProvisioningError::invalid(format!(
                "min poll delay ({}ms) exceeds max poll delay ({}ms)",
                self.min_poll_delay_ms, self.max_poll_delay_ms
            )));
        }
        if self.sas_token_ttl_secs == 0 {
            return Err(ProvisioningError::invalid("SAS token ttl must be positive"));
        }
        if self.sas_token_ttl_secs > MAX_SAS_TOKEN_TTL_SECS {
            return Err(ProvisioningError::invalid(format!(
                "SAS token ttl ({}s) exceeds {}s",
                self.sas_token_ttl_secs, MAX_SAS_TOKEN_TTL_SECS
            )));
        }
        Ok(())
    }

    /// Per call timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Set the service endpoint.
    pub fn with_global_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.global_endpoint = endpoint.into();
        self
    }

    /// Set the `api-version` query value.
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Set the per call timeout.
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    /// Set the retry budget per protocol step.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base delay for exponential backoff.
    pub fn with_retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.retry_base_delay_ms = ms;
        self
    }

    /// Set default poll interval, floor and cap in one go.
    pub fn with_poll_delays(mut self, default_ms: u64, min_ms: u64, max_ms: u64) -> Self {
        self.default_poll_interval_ms = default_ms;
        self.min_poll_delay_ms = min_ms;
        self.max_poll_delay_ms = max_ms;
        self
    }

    /// Set the status poll budget.
    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    /// Set the SAS token lifetime.
    pub fn with_sas_token_ttl_secs(mut self, secs: u64) -> Self {
        self.sas_token_ttl_secs = secs;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
