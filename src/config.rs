//! Configuration management

use anyhow::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::engine::{DispatchConfig, OrchestratorConfig, RetryPolicy};

/// Which state store backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Attempts per escalation tier
    pub retry_limit: u32,

    /// Delay before the first retry
    pub backoff_base: Duration,

    /// Multiplier applied to the delay after each failed attempt
    pub backoff_multiplier: f64,

    /// Upper bound for the retry delay
    pub backoff_max: Duration,

    /// Timeout per executor invocation
    pub executor_timeout: Duration,

    /// Most steps accepted from the plan builder
    pub max_steps: usize,

    pub store: StoreBackend,

    /// SQLite database path (sqlite backend only)
    pub db_path: PathBuf,

    /// User id for sessions started by the runner
    pub user_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_millis(10_000),
            executor_timeout: Duration::from_millis(30_000),
            max_steps: 20,
            store: StoreBackend::Memory,
            db_path: default_db_path(),
            user_id: "console_user".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_lookup(|key| std::env::var(key).ok()))
    }

    /// Build from any key lookup; unset or invalid values keep the default
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let retry_limit = parse_or(&lookup, "TASKPLAN_RETRY_LIMIT", defaults.retry_limit)
            .max(1);
        let backoff_base = Duration::from_millis(parse_or(
            &lookup,
            "TASKPLAN_BACKOFF_BASE_MS",
            defaults.backoff_base.as_millis() as u64,
        ));
        let backoff_multiplier = parse_or(
            &lookup,
            "TASKPLAN_BACKOFF_MULTIPLIER",
            defaults.backoff_multiplier,
        );
        let backoff_max = Duration::from_millis(parse_or(
            &lookup,
            "TASKPLAN_BACKOFF_MAX_MS",
            defaults.backoff_max.as_millis() as u64,
        ));
        let executor_timeout = Duration::from_millis(parse_or(
            &lookup,
            "TASKPLAN_EXECUTOR_TIMEOUT_MS",
            defaults.executor_timeout.as_millis() as u64,
        ));
        let max_steps = parse_or(&lookup, "TASKPLAN_MAX_STEPS", defaults.max_steps);

        let store = match lookup("TASKPLAN_STORE").as_deref().map(str::trim) {
            None | Some("") | Some("memory") => StoreBackend::Memory,
            Some("sqlite") => StoreBackend::Sqlite,
            Some(other) => {
                warn!("Unknown TASKPLAN_STORE '{}', using memory", other);
                StoreBackend::Memory
            }
        };

        let db_path = lookup("TASKPLAN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let user_id = lookup("TASKPLAN_USER_ID")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.user_id);

        Self {
            retry_limit,
            backoff_base,
            backoff_multiplier,
            backoff_max,
            executor_timeout,
            max_steps,
            store,
            db_path,
            user_id,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_limit,
            initial_delay: self.backoff_base,
            max_delay: self.backoff_max,
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            dispatch: DispatchConfig {
                retry: self.retry_policy(),
                executor_timeout: self.executor_timeout,
            },
            max_steps: self.max_steps,
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskplan")
        .join("state.db")
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid {}='{}', using default {:?}", key, raw, default);
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_max, Duration::from_secs(10));
        assert_eq!(config.executor_timeout, Duration::from_secs(30));
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.user_id, "console_user");
        assert!(config.db_path.ends_with("taskplan/state.db"));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("TASKPLAN_RETRY_LIMIT", "5"),
            ("TASKPLAN_BACKOFF_BASE_MS", "250"),
            ("TASKPLAN_EXECUTOR_TIMEOUT_MS", "1500"),
            ("TASKPLAN_STORE", "sqlite"),
            ("TASKPLAN_DB_PATH", "/tmp/plans.db"),
        ]);

        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.store, StoreBackend::Sqlite);
        assert_eq!(config.db_path, PathBuf::from("/tmp/plans.db"));

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(250));
        assert_eq!(
            config.orchestrator_config().dispatch.executor_timeout,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config(&[
            ("TASKPLAN_RETRY_LIMIT", "lots"),
            ("TASKPLAN_BACKOFF_MULTIPLIER", "fast"),
            ("TASKPLAN_STORE", "redis"),
        ]);
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.store, StoreBackend::Memory);
    }

    #[test]
    fn test_zero_retry_limit_clamped() {
        assert_eq!(config(&[("TASKPLAN_RETRY_LIMIT", "0")]).retry_limit, 1);
    }
}
