//! Configuration types for the FireFlow system
//!
//! Static configuration ([`FireflowConfig`]) is loaded once at boot. Runtime
//! settings the administrative surface may change live in a
//! [`crate::traits::ConfigSource`] under the names in [`keys`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::CloudCredentials;

/// Public IP-echo endpoint used when no source is configured
pub const DEFAULT_ADDRESS_SOURCE_URL: &str = "https://4.ipw.cn";

/// Schedule interval used when none is configured
pub const DEFAULT_SCHEDULE_INTERVAL_MINUTES: u32 = 30;

/// Longest accepted schedule interval (one day)
pub const MAX_SCHEDULE_INTERVAL_MINUTES: u32 = 1440;

/// Runtime configuration keys
pub mod keys {
    /// Address source URL
    pub const IP_FETCH_URL: &str = "ip_fetch_url";
    /// Schedule interval in minutes
    pub const SCHEDULE_INTERVAL_MINUTES: &str = "ip_check_interval";
    /// Whether the schedule is enabled ("true"/"false")
    pub const SCHEDULE_ENABLED: &str = "cron_enabled";
}

/// Main FireFlow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FireflowConfig {
    #[serde(default)]
    pub address: AddressConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Default credentials, one per provider
    #[serde(default)]
    pub credentials: Vec<CloudCredentials>,
}

impl FireflowConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.address.validate()?;
        self.engine.validate()?;

        for creds in &self.credentials {
            if creds.provider.is_empty() {
                return Err(crate::Error::config("credential provider cannot be empty"));
            }
            if creds.secret_id.is_empty() || creds.secret_key.is_empty() {
                return Err(crate::Error::config(format!(
                    "credentials for {} need both a secret id and a secret key",
                    creds.provider
                )));
            }
        }

        Ok(())
    }
}

/// Address source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressConfig {
    /// URL used when the `ip_fetch_url` key is unset
    #[serde(default = "default_address_url")]
    pub default_url: String,
}

impl AddressConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !self.default_url.starts_with("https://") && !self.default_url.starts_with("http://") {
            return Err(crate::Error::config(format!(
                "address source URL must use HTTP or HTTPS: {}",
                self.default_url
            )));
        }
        Ok(())
    }
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            default_url: default_address_url(),
        }
    }
}

fn default_address_url() -> String {
    DEFAULT_ADDRESS_SOURCE_URL.to_string()
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on every single network call (address fetch, provider call)
    ///
    /// A hung remote call must never wedge future passes.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Capacity of the engine event channel
    ///
    /// When full, events are dropped with a warning.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !(1..=300).contains(&self.call_timeout_secs) {
            return Err(crate::Error::config(format!(
                "call timeout must be between 1 and 300 seconds, got {}",
                self.call_timeout_secs
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("event channel capacity must be > 0"));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    256
}

/// Reject intervals outside 1..=1440 minutes
pub fn validate_interval_minutes(minutes: u32) -> Result<(), crate::Error> {
    if !(1..=MAX_SCHEDULE_INTERVAL_MINUTES).contains(&minutes) {
        return Err(crate::Error::invalid_input(format!(
            "schedule interval must be between 1 and {} minutes, got {}",
            MAX_SCHEDULE_INTERVAL_MINUTES, minutes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FireflowConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.address.default_url, DEFAULT_ADDRESS_SOURCE_URL);
    }

    #[test]
    fn interval_bounds() {
        assert!(validate_interval_minutes(0).is_err());
        assert!(validate_interval_minutes(1).is_ok());
        assert!(validate_interval_minutes(MAX_SCHEDULE_INTERVAL_MINUTES).is_ok());
        assert!(validate_interval_minutes(MAX_SCHEDULE_INTERVAL_MINUTES + 1).is_err());
    }

    #[test]
    fn rejects_incomplete_credentials() {
        let mut config = FireflowConfig::new();
        config
            .credentials
            .push(CloudCredentials::new("TencentCloud", "AKIDexample", ""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_partial_json() {
        let config: FireflowConfig = serde_json::from_str(
            r#"{"engine":{"call_timeout_secs":5}}"#,
        )
        .unwrap();
        assert_eq!(config.engine.call_timeout_secs, 5);
        assert_eq!(config.engine.event_channel_capacity, 256);
        assert!(config.credentials.is_empty());
    }
}
