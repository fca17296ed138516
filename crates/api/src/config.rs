use std::time::Duration;

use flotilla_persist::{default_db_path, DEFAULT_EVENT_RETENTION};
use flotilla_store::BrokerConfig;
use tracing::warn;

/// Storage settings, normally read from `FLOTILLA_*` environment variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    pub db_path: String,
    pub broker: BrokerConfig,
    pub event_retention: usize,
    /// Reject updates whose `metadata.resourceVersion` differs from the
    /// stored one. Off by default: updates are last-write-wins.
    pub strict_resource_version: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            broker: BrokerConfig::default(),
            event_retention: DEFAULT_EVENT_RETENTION,
            strict_resource_version: false,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup. Unparsable values fall back to
    /// their defaults with a warning.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |key: &str, default: u64| -> u64 {
            match get(key) {
                None => default,
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    warn!(key, value = %raw, default, "ignoring unparsable setting");
                    default
                }),
            }
        };
        let poll_ms = num("FLOTILLA_WATCH_POLL_MS", d.broker.poll_interval.as_millis() as u64).max(1);
        Self {
            db_path: get("FLOTILLA_DB_PATH").filter(|p| !p.is_empty()).unwrap_or(d.db_path),
            broker: BrokerConfig {
                poll_interval: Duration::from_millis(poll_ms),
                batch_size: num("FLOTILLA_WATCH_BATCH", d.broker.batch_size as u64).max(1) as usize,
                channel_capacity: num("FLOTILLA_WATCH_CHANNEL_CAP", d.broker.channel_capacity as u64).max(1) as usize,
            },
            event_retention: num("FLOTILLA_EVENT_RETENTION", d.event_retention as u64).max(1) as usize,
            strict_resource_version: get("FLOTILLA_STRICT_RESOURCE_VERSION")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(d.strict_resource_version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FLOTILLA_DB_PATH", "/tmp/x.db"),
            ("FLOTILLA_WATCH_POLL_MS", "250"),
            ("FLOTILLA_WATCH_BATCH", "lots"),
            ("FLOTILLA_EVENT_RETENTION", "50"),
            ("FLOTILLA_STRICT_RESOURCE_VERSION", "true"),
        ]);
        let cfg = StorageConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.db_path, "/tmp/x.db");
        assert_eq!(cfg.broker.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.broker.batch_size, 100);
        assert_eq!(cfg.broker.channel_capacity, 100);
        assert_eq!(cfg.event_retention, 50);
        assert!(cfg.strict_resource_version);
    }

    #[test]
    fn defaults_without_env() {
        let cfg = StorageConfig::from_lookup(|_| None);
        assert_eq!(cfg.broker, BrokerConfig::default());
        assert_eq!(cfg.event_retention, 10_000);
        assert!(!cfg.strict_resource_version);
    }
}
