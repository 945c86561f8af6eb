use std::env;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime tunables loaded from environment variables. Everything has a
/// default; the source list itself lives in the database.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub db_path: String,
    /// JSONL side log for rounds the store refused.
    pub backup_log_path: String,
    pub heartbeat_interval: Duration,
    pub reconcile_interval: Duration,
    pub health_interval: Duration,
    /// Linear backoff: attempt number times this delay.
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Attempts beyond this park the source until it is reconfigured.
    pub reconnect_max_attempts: u32,
    /// Wait for a late multiplier before persisting an ended round.
    pub finalize_grace: Duration,
    /// Delay between a successful persist and the aggregate reset.
    pub reset_delay: Duration,
    pub broadcast_capacity: usize,
    /// Bounded grace for final saves on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: "crashflow.db".to_string(),
            backup_log_path: "failed_rounds.jsonl".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_max_attempts: 10,
            finalize_grace: Duration::from_millis(2000),
            reset_delay: Duration::from_millis(2000),
            broadcast_capacity: 256,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            db_path: env::var("CRASHFLOW_DB_PATH").unwrap_or(defaults.db_path),
            backup_log_path: env::var("CRASHFLOW_BACKUP_LOG")
                .unwrap_or(defaults.backup_log_path),
            heartbeat_interval: secs_var("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            reconcile_interval: secs_var("RECONCILE_INTERVAL_SECS", defaults.reconcile_interval)?,
            health_interval: secs_var("HEALTH_INTERVAL_SECS", defaults.health_interval)?,
            reconnect_base_delay: secs_var(
                "RECONNECT_BASE_DELAY_SECS",
                defaults.reconnect_base_delay,
            )?,
            reconnect_max_delay: secs_var(
                "RECONNECT_MAX_DELAY_SECS",
                defaults.reconnect_max_delay,
            )?,
            reconnect_max_attempts: u32_var(
                "RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            )?,
            finalize_grace: millis_var("FINALIZE_GRACE_MS", defaults.finalize_grace)?,
            reset_delay: millis_var("ROUND_RESET_DELAY_MS", defaults.reset_delay)?,
            broadcast_capacity: defaults.broadcast_capacity,
            shutdown_grace: secs_var("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
        })
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name).map(|opt| opt.map(Duration::from_secs).unwrap_or(default))
}

fn millis_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name).map(|opt| opt.map(Duration::from_millis).unwrap_or(default))
}

fn u32_var(name: &str, default: u32) -> Result<u32, ConfigError> {
    match parse_var(name)? {
        Some(value) if value <= u32::MAX as u64 => Ok(value as u32),
        Some(value) => Err(ConfigError::InvalidValue(format!(
            "{} out of range: {}",
            name, value
        ))),
        None => Ok(default),
    }
}

fn parse_var(name: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{} must be an integer: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.reconcile_interval, Duration::from_secs(60));
        assert_eq!(config.health_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_max_attempts, 10);
    }
}
