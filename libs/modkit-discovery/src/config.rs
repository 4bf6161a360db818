//! Registry timing and session configuration.

use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::RegistryError;

/// Configuration for [`ServiceRegistry`](crate::ServiceRegistry).
///
/// Durations are humantime strings (`"5s"`, `"250ms"`). Every field has a
/// default, so an empty section is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Session timeout requested on reconnect.
    #[serde(with = "humantime_duration")]
    pub session_timeout: Duration,

    /// Delay before retrying a failed node creation.
    #[serde(with = "humantime_duration")]
    pub register_retry_delay: Duration,

    /// Period of the registration watchdog.
    #[serde(with = "humantime_duration")]
    pub watchdog_interval: Duration,

    /// Delay between failed reconnect attempts.
    #[serde(with = "humantime_duration")]
    pub reconnect_retry_delay: Duration,

    /// Pause after a successful reconnect before the session is used.
    #[serde(with = "humantime_duration")]
    pub reconnect_settle_delay: Duration,

    /// Delay before re-listing a service path that does not exist yet.
    #[serde(with = "humantime_duration")]
    pub discovery_missing_path_delay: Duration,

    /// Delay before re-listing after an unclassified error.
    #[serde(with = "humantime_duration")]
    pub discovery_error_delay: Duration,

    /// Period of the discovery membership poll.
    #[serde(with = "humantime_duration")]
    pub discovery_poll_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10),
            register_retry_delay: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(1),
            reconnect_retry_delay: Duration::from_secs(5),
            reconnect_settle_delay: Duration::from_secs(1),
            discovery_missing_path_delay: Duration::from_secs(5),
            discovery_error_delay: Duration::from_secs(10),
            discovery_poll_interval: Duration::from_secs(1),
        }
    }
}

impl RegistryConfig {
    /// Extract and validate the section at `key`. A missing section yields
    /// the defaults.
    ///
    /// # Errors
    /// Returns [`RegistryError::Config`] if the section cannot be deserialized
    /// and [`RegistryError::InvalidConfig`] if it fails validation.
    pub fn from_figment(figment: &Figment, key: &str) -> Result<Self, RegistryError> {
        let cfg = if figment.contains(key) {
            figment.extract_inner::<Self>(key)?
        } else {
            Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject zero periods, which would turn the polling loops into busy loops.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let periods = [
            ("session_timeout", self.session_timeout),
            ("register_retry_delay", self.register_retry_delay),
            ("watchdog_interval", self.watchdog_interval),
            ("reconnect_retry_delay", self.reconnect_retry_delay),
            ("discovery_missing_path_delay", self.discovery_missing_path_delay),
            ("discovery_error_delay", self.discovery_error_delay),
            ("discovery_poll_interval", self.discovery_poll_interval),
        ];
        for (name, value) in periods {
            if value.is_zero() {
                return Err(RegistryError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::{Format, Yaml};

    #[test]
    fn empty_section_uses_defaults() {
        let cfg: RegistryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RegistryConfig::default());
        assert_eq!(cfg.reconnect_retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn parses_humantime_values() {
        let cfg: RegistryConfig = serde_json::from_str(
            r#"{ "session_timeout": "30s", "discovery_poll_interval": "250ms" }"#,
        )
        .unwrap();
        assert_eq!(cfg.session_timeout, Duration::from_secs(30));
        assert_eq!(cfg.discovery_poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.watchdog_interval, Duration::from_secs(1));
    }

    #[test]
    fn rejects_unknown_fields() {
        let res: Result<RegistryConfig, _> = serde_json::from_str(r#"{ "sesion_timeout": "1s" }"#);
        assert!(res.is_err());
    }

    #[test]
    fn serializes_as_humantime() {
        let json = serde_json::to_value(RegistryConfig::default()).unwrap();
        assert_eq!(json["discovery_error_delay"], "10s");
    }

    #[test]
    fn loads_section_from_figment() {
        let figment = Figment::new().merge(Yaml::string(
            "registry:\n  watchdog_interval: 2s\n  reconnect_settle_delay: 500ms\n",
        ));
        let cfg = RegistryConfig::from_figment(&figment, "registry").unwrap();
        assert_eq!(cfg.watchdog_interval, Duration::from_secs(2));
        assert_eq!(cfg.reconnect_settle_delay, Duration::from_millis(500));

        let missing = RegistryConfig::from_figment(&figment, "other").unwrap();
        assert_eq!(missing, RegistryConfig::default());
    }

    #[test]
    fn zero_interval_is_invalid() {
        let figment = Figment::new().merge(Yaml::string("registry:\n  watchdog_interval: 0s\n"));
        let err = RegistryConfig::from_figment(&figment, "registry").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig(msg) if msg.contains("watchdog_interval")));
    }
}
