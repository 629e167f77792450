//! Configuration loader with file and environment variable support

use crate::{ConfigError, RelayConfig};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "relay.toml",
    "config.toml",
    "./config/relay.toml",
    "/etc/relay/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate.
    pub fn load(&self) -> Result<RelayConfig, ConfigError> {
        let mut config = RelayConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = RelayConfig::from_file(&path)?;
        }

        apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(val) = env::var(key) {
        *target = val;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = env::var(key) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}

fn apply_env_overrides(config: &mut RelayConfig) {
    // HTTP
    env_string("RELAY_HTTP_HOST", &mut config.http.host);
    env_parse("RELAY_HTTP_PORT", &mut config.http.port);
    env_parse("RELAY_METRICS_PORT", &mut config.metrics.port);

    // Store
    env_string("RELAY_DATABASE_URL", &mut config.store.database_url);
    env_parse("RELAY_STORE_MAX_CONNECTIONS", &mut config.store.max_connections);
    env_parse("RELAY_STATEMENT_TIMEOUT_MS", &mut config.store.statement_timeout_ms);

    // Queue defaults
    env_string("RELAY_QUEUE_NAME", &mut config.queue.queue_name);
    env_parse("RELAY_ACK_TIMEOUT_SECONDS", &mut config.queue.ack_timeout_seconds);
    env_parse("RELAY_MAX_ATTEMPTS", &mut config.queue.max_attempts);
    env_parse("RELAY_MAX_PRIORITY_LEVELS", &mut config.queue.max_priority_levels);

    // Requeue worker
    env_parse("RELAY_REQUEUE_BATCH_SIZE", &mut config.requeue.requeue_batch_size);
    env_parse(
        "RELAY_OVERDUE_CHECK_INTERVAL_MS",
        &mut config.requeue.overdue_check_interval_ms,
    );

    // Activity pipeline
    env_parse("RELAY_ACTIVITY_LOG_ENABLED", &mut config.activity.activity_log_enabled);
    env_parse(
        "RELAY_ACTIVITY_LOG_RETENTION_HOURS",
        &mut config.activity.activity_log_retention_hours,
    );
    env_parse(
        "RELAY_ACTIVITY_LARGE_PAYLOAD_THRESHOLD_BYTES",
        &mut config.activity.large_payload_threshold_bytes,
    );
    env_parse(
        "RELAY_ACTIVITY_BULK_OPERATION_THRESHOLD",
        &mut config.activity.bulk_operation_threshold,
    );
    env_parse(
        "RELAY_ACTIVITY_FLASH_MESSAGE_THRESHOLD_MS",
        &mut config.activity.flash_message_threshold_ms,
    );
    env_parse(
        "RELAY_ACTIVITY_LONG_PROCESSING_THRESHOLD_MS",
        &mut config.activity.long_processing_threshold_ms,
    );
    env_parse(
        "RELAY_ACTIVITY_ZOMBIE_THRESHOLD_MULTIPLIER",
        &mut config.activity.zombie_threshold_multiplier,
    );
    env_parse(
        "RELAY_ACTIVITY_NEAR_DLQ_THRESHOLD",
        &mut config.activity.near_dlq_threshold,
    );
    env_parse(
        "RELAY_ACTIVITY_BURST_THRESHOLD_COUNT",
        &mut config.activity.burst_threshold_count,
    );
    env_parse(
        "RELAY_ACTIVITY_BURST_THRESHOLD_SECONDS",
        &mut config.activity.burst_threshold_seconds,
    );

    // Events
    env_string("RELAY_EVENTS_CHANNEL", &mut config.events.events_channel);
    env_parse("RELAY_EVENTS_BUFFER_SIZE", &mut config.events.buffer_size);
    env_parse(
        "RELAY_EVENTS_PING_INTERVAL_SECONDS",
        &mut config.events.ping_interval_seconds,
    );

    // Actor labels
    env_string("RELAY_ACTOR", &mut config.actors.relay_actor);
    env_string("RELAY_MANUAL_OPERATION_ACTOR", &mut config.actors.manual_operation_actor);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides_apply() {
        let mut config = RelayConfig::default();
        env::set_var("RELAY_QUEUE_NAME", "env-queue");
        env::set_var("RELAY_MAX_ATTEMPTS", "9");
        env::set_var("RELAY_ACTIVITY_LOG_ENABLED", "false");

        apply_env_overrides(&mut config);

        assert_eq!(config.queue.queue_name, "env-queue");
        assert_eq!(config.queue.max_attempts, 9);
        assert!(!config.activity.activity_log_enabled);

        env::remove_var("RELAY_QUEUE_NAME");
        env::remove_var("RELAY_MAX_ATTEMPTS");
        env::remove_var("RELAY_ACTIVITY_LOG_ENABLED");
    }

    #[test]
    fn test_malformed_env_values_are_ignored() {
        let mut config = RelayConfig::default();
        env::set_var("RELAY_HTTP_PORT", "not-a-port");
        apply_env_overrides(&mut config);
        assert_eq!(config.http.port, 8080);
        env::remove_var("RELAY_HTTP_PORT");
    }
}
