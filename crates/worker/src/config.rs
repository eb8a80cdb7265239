//! Worker configuration from environment variables

use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::onboarding::TASK_QUEUE;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Worker process configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Deployment environment (e.g. "development", "production")
    pub environment: String,

    /// PostgreSQL URL; `None` runs against the in-memory store
    pub database_url: Option<String>,

    /// Namespace new executions are started in
    pub namespace: String,

    pub task_queue: String,

    pub worker_id: String,

    pub max_concurrent_activities: usize,

    /// Fastest poll interval; idle polling backs off from here
    pub poll_interval: Duration,

    pub timer_sweep_interval: Duration,

    /// How often running executions are re-advanced
    pub reconcile_interval: Duration,

    /// Log filter used when RUST_LOG is not set
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            database_url: None,
            namespace: "default".to_string(),
            task_queue: TASK_QUEUE.to_string(),
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrent_activities: 10,
            poll_interval: Duration::from_millis(100),
            timer_sweep_interval: Duration::from_millis(1000),
            reconcile_interval: Duration::from_secs(30),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `ENVIRONMENT`: Deployment environment (default: "development")
    /// - `DATABASE_URL`: PostgreSQL URL (unset: in-memory store)
    /// - `NAMESPACE`: Namespace for new executions (default: "default")
    /// - `TASK_QUEUE`: Task queue name (default: "user-onboarding")
    /// - `WORKER_ID`: Worker identifier (default: generated)
    /// - `MAX_CONCURRENT_ACTIVITIES`: Concurrent activity limit (default: 10)
    /// - `POLL_INTERVAL_MS`: Minimum poll interval (default: 100)
    /// - `TIMER_SWEEP_INTERVAL_MS`: Timer sweep interval (default: 1000)
    /// - `RECONCILE_INTERVAL_MS`: Re-advance interval for running executions (default: 30000)
    /// - `LOG_LEVEL`: Log filter (default: "info")
    /// - `LOG_FORMAT`: "pretty" or "json" (default: "pretty")
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            environment: lookup("ENVIRONMENT").unwrap_or(defaults.environment),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            namespace: lookup("NAMESPACE").unwrap_or(defaults.namespace),
            task_queue: lookup("TASK_QUEUE").unwrap_or(defaults.task_queue),
            worker_id: lookup("WORKER_ID").unwrap_or(defaults.worker_id),
            max_concurrent_activities: parsed("MAX_CONCURRENT_ACTIVITIES")
                .map(|n| n.max(1) as usize)
                .unwrap_or(defaults.max_concurrent_activities),
            poll_interval: parsed("POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            timer_sweep_interval: parsed("TIMER_SWEEP_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.timer_sweep_interval),
            reconcile_interval: parsed("RECONCILE_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconcile_interval),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.log_format),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
