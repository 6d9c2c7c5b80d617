use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// Coordinator settings, loadable from a JSON file. Missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Replica addresses, `host:port`.
    pub replicas: Vec<String>,
    pub call_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replicas: Vec::new(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// `count` addresses on `host` with consecutive ports from `base_port`.
    pub fn consecutive(host: &str, base_port: u16, count: u16) -> Result<Vec<String>> {
        (0..count)
            .map(|offset| -> Result<String> {
                let port = base_port
                    .checked_add(offset)
                    .with_context(|| format!("port range from {base_port} overflows"))?;
                Ok(format!("{host}:{port}"))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.replicas.is_empty(), "at least one replica address is required");
        let mut seen = HashSet::new();
        for addr in &self.replicas {
            ensure!(!addr.trim().is_empty(), "replica address must not be blank");
            ensure!(seen.insert(addr.as_str()), "duplicate replica address {addr}");
        }
        ensure!(self.call_timeout_ms > 0, "call timeout must be positive");
        ensure!(
            self.heartbeat_interval_ms > 0,
            "heartbeat interval must be positive"
        );
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: ClusterConfig =
            serde_json::from_str(r#"{"replicas":["127.0.0.1:2000"]}"#).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed = serde_json::from_str::<ClusterConfig>(r#"{"replicaz":[]}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn validation_catches_bad_settings() {
        assert!(ClusterConfig::default().validate().is_err());

        let duplicate = ClusterConfig {
            replicas: vec!["a:1".into(), "a:1".into()],
            ..ClusterConfig::default()
        };
        assert!(duplicate.validate().is_err());

        let zero = ClusterConfig {
            replicas: vec!["a:1".into()],
            call_timeout_ms: 0,
            ..ClusterConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn consecutive_ports() {
        assert_eq!(
            ClusterConfig::consecutive("127.0.0.1", 2000, 3).unwrap(),
            vec!["127.0.0.1:2000", "127.0.0.1:2001", "127.0.0.1:2002"]
        );
        assert!(ClusterConfig::consecutive("h", u16::MAX, 2).is_err());
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("dictionary-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"replicas":["h:1","h:2"],"heartbeat_interval_ms":500}"#).unwrap();
        let config = ClusterConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.replicas, vec!["h:1", "h:2"]);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));

        assert!(ClusterConfig::load(&path).is_err());
    }
}
