//! Engine and database configuration

use std::time::Duration;

/// Tunables for the execution engine and the services built on it
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum events per execution (for safety)
    pub max_events_per_execution: usize,

    /// Take a snapshot every N events; 0 disables snapshots
    pub snapshot_interval: usize,

    /// An in-flight action claim older than this may be taken over
    pub action_claim_stale_after: Duration,

    /// SLA used for new task definitions created without a due date
    pub default_task_sla_days: i32,

    /// Priority for tasks that do not carry one
    pub default_task_priority: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events_per_execution: 10_000,
            snapshot_interval: 50,
            action_claim_stale_after: Duration::from_secs(300),
            default_task_sla_days: 3,
            default_task_priority: "medium".to_string(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OPSFLOW_MAX_EVENTS_PER_EXECUTION` (default: 10000)
    /// - `OPSFLOW_SNAPSHOT_INTERVAL` (default: 50, 0 disables)
    /// - `OPSFLOW_ACTION_CLAIM_STALE_SECS` (default: 300)
    /// - `OPSFLOW_DEFAULT_TASK_SLA_DAYS` (default: 3)
    /// - `OPSFLOW_DEFAULT_TASK_PRIORITY` (default: "medium")
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_events = env_parse("OPSFLOW_MAX_EVENTS_PER_EXECUTION")
            .unwrap_or(defaults.max_events_per_execution);
        let snapshot_interval =
            env_parse("OPSFLOW_SNAPSHOT_INTERVAL").unwrap_or(defaults.snapshot_interval);
        let stale_after = env_parse("OPSFLOW_ACTION_CLAIM_STALE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.action_claim_stale_after);
        let sla_days = env_parse::<i32>("OPSFLOW_DEFAULT_TASK_SLA_DAYS")
            .filter(|d| *d >= 1)
            .unwrap_or(defaults.default_task_sla_days);
        let priority = std::env::var("OPSFLOW_DEFAULT_TASK_PRIORITY")
            .unwrap_or(defaults.default_task_priority);

        Self {
            max_events_per_execution: max_events,
            snapshot_interval,
            action_claim_stale_after: stale_after,
            default_task_sla_days: sla_days,
            default_task_priority: priority,
        }
    }
}

/// PostgreSQL connection settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Read `DATABASE_URL` and `DATABASE_MAX_CONNECTIONS` (default: 10)
    ///
    /// Returns `None` when `DATABASE_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let max_connections = env_parse("DATABASE_MAX_CONNECTIONS").unwrap_or(10);
        Some(Self {
            url,
            max_connections,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
