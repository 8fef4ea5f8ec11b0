//! Node configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Port used when a connect target names only a host.
pub const DEFAULT_PORT: u16 = 8888;

/// Serde helper for [`Duration`] stored as `u64` milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (dur.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Dial retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Retries after the first failed dial.
    pub retries: u32,
    /// Delay before the first retry.
    pub min_delay_ms: u64,
    /// Upper bound of the exponential backoff.
    pub max_delay_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            min_delay_ms: 300,
            max_delay_ms: 3000,
        }
    }
}

/// Configuration of one Netron node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetronConfig {
    /// Node uid. Generated when absent.
    pub uid: Option<Uuid>,
    /// Whether this node relays remotely attached contexts (hub role).
    pub is_super: bool,
    /// Run `on_confirm_connection` before accepting a handshake.
    pub restrict_access: bool,
    /// Time to wait for a get/call/ping/handshake response.
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,
    /// Dial retry policy.
    pub connect: ConnectConfig,
    /// Port used when a connect target has none.
    pub default_port: u16,
    /// Largest accepted frame, in bytes.
    pub max_message_size: u32,
}

impl Default for NetronConfig {
    fn default() -> Self {
        Self {
            uid: None,
            is_super: false,
            restrict_access: false,
            response_timeout: Duration::from_secs(180),
            connect: ConnectConfig::default(),
            default_port: DEFAULT_PORT,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetronConfig::default();
        assert_eq!(config.response_timeout, Duration::from_secs(180));
        assert_eq!(config.connect.retries, 3);
        assert_eq!(config.connect.min_delay_ms, 300);
        assert_eq!(config.connect.max_delay_ms, 3000);
        assert_eq!(config.default_port, 8888);
        assert!(!config.is_super);
    }

    #[test]
    fn test_partial_toml() {
        let config: NetronConfig = toml::from_str(
            r#"
            is_super = true
            response_timeout = 500

            [connect]
            retries = 5
            "#,
        )
        .unwrap();
        assert!(config.is_super);
        assert_eq!(config.response_timeout, Duration::from_millis(500));
        assert_eq!(config.connect.retries, 5);
        assert_eq!(config.connect.min_delay_ms, 300);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
    }
}
