//! Claim loop pacing
//!
//! A poller claims up to `batch_size` visible tasks per round. Each empty
//! round stretches the wait before the next one by `backoff_multiplier`,
//! capped at `max_interval`; any claimed task snaps it back to
//! `min_interval`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::persistence::{ClaimedTask, StoreError, WorkflowEventStore};
use crate::reliability::duration_millis;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Wait between rounds while work keeps arriving
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Longest wait after a run of empty rounds
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    pub backoff_multiplier: f64,

    /// Upper bound on tasks claimed in one round
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Values below 1.0 are raised to 1.0 (no backoff)
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Wait that follows `empty_rounds` consecutive rounds without work
    pub fn interval_after(&self, empty_rounds: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(empty_rounds.min(i32::MAX as u32) as i32);
        let secs = self.min_interval.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            return self.max_interval.max(self.min_interval);
        }
        Duration::from_secs_f64(secs)
    }
}

/// Claims tasks for one worker and paces the rounds between claims
pub struct TaskPoller<S: WorkflowEventStore> {
    store: Arc<S>,
    worker_id: String,
    activity_types: Vec<String>,
    config: PollerConfig,
    empty_rounds: u32,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: WorkflowEventStore> TaskPoller<S> {
    pub fn new(
        store: Arc<S>,
        worker_id: String,
        activity_types: Vec<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            worker_id,
            activity_types,
            config,
            empty_rounds: 0,
            shutdown_rx,
        }
    }

    /// Claim at most `capacity` tasks (and never more than `batch_size`)
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, capacity: usize) -> Result<Vec<ClaimedTask>, PollerError> {
        if self.is_shutdown() {
            return Err(PollerError::Shutdown);
        }

        let limit = capacity.min(self.config.batch_size);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let claimed = self
            .store
            .claim_tasks(&self.worker_id, &self.activity_types, limit, Utc::now())
            .await?;

        if claimed.is_empty() {
            self.empty_rounds = self.empty_rounds.saturating_add(1);
            trace!(
                empty_rounds = self.empty_rounds,
                next_wait_ms = self.current_interval().as_millis() as u64,
                "nothing to claim"
            );
        } else {
            self.empty_rounds = 0;
            debug!(claimed = claimed.len(), "claimed tasks");
        }

        Ok(claimed)
    }

    /// Sleep until the next round; `true` means shutdown arrived first
    pub async fn wait(&mut self) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let pause = self.current_interval();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(pause) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.config.interval_after(self.empty_rounds)
    }

    /// Consecutive rounds that claimed nothing
    pub fn empty_rounds(&self) -> u32 {
        self.empty_rounds
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker is shutting down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{HistoryAppend, InMemoryWorkflowEventStore, NewExecution, TaskDefinition};
    use crate::workflow::{ActivityOptions, WorkflowEvent};
    use uuid::Uuid;

    async fn enqueue_echo(store: &InMemoryWorkflowEventStore) {
        let run_id = Uuid::now_v7();
        store
            .create_execution(NewExecution {
                workflow_id: "wf".into(),
                run_id,
                workflow_type: "t".into(),
                namespace: "default".into(),
                input: serde_json::json!(null),
                start_time: Utc::now(),
                execution_deadline: None,
            })
            .await
            .unwrap();
        store
            .append(
                run_id,
                1,
                HistoryAppend::new(vec![WorkflowEvent::ActivityScheduled {
                    activity_id: "echo-0".into(),
                    activity_type: "echo".into(),
                    input: serde_json::json!({}),
                    options: ActivityOptions::default(),
                }])
                .with_task(TaskDefinition {
                    run_id,
                    workflow_id: "wf".into(),
                    activity_id: "echo-0".into(),
                    activity_type: "echo".into(),
                    input: serde_json::json!({}),
                    options: ActivityOptions::default(),
                    attempt: 1,
                    visible_at: Utc::now(),
                }),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_interval_grows_and_caps() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(300))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.interval_after(0), Duration::from_millis(100));
        assert_eq!(config.interval_after(1), Duration::from_millis(200));
        assert_eq!(config.interval_after(2), Duration::from_millis(300));
        assert_eq!(config.interval_after(u32::MAX), Duration::from_millis(300));
    }

    #[test]
    fn test_builder_clamps() {
        let config = PollerConfig::new()
            .with_backoff_multiplier(0.5)
            .with_batch_size(0);

        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.interval_after(10), config.min_interval);
    }

    #[test]
    fn test_config_serializes_millis() {
        let json = serde_json::to_value(PollerConfig::default()).unwrap();
        assert_eq!(json["min_interval"], 100);
        assert_eq!(json["max_interval"], 5000);
    }

    #[tokio::test]
    async fn test_backoff_resets_when_work_arrives() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(300))
            .with_backoff_multiplier(2.0);
        let mut poller = TaskPoller::new(
            Arc::clone(&store),
            "w1".into(),
            vec!["echo".into()],
            config,
            rx,
        );

        assert!(poller.poll(5).await.unwrap().is_empty());
        assert!(poller.poll(5).await.unwrap().is_empty());
        assert_eq!(poller.empty_rounds(), 2);
        assert_eq!(poller.current_interval(), Duration::from_millis(300));

        enqueue_echo(&store).await;

        assert_eq!(poller.poll(5).await.unwrap().len(), 1);
        assert_eq!(poller.empty_rounds(), 0);
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let (tx, rx) = watch::channel(false);
        let mut poller = TaskPoller::new(store, "w1".into(), vec![], PollerConfig::default(), rx);

        tx.send(true).unwrap();
        assert!(poller.is_shutdown());
        assert!(matches!(poller.poll(1).await, Err(PollerError::Shutdown)));
        assert!(poller.wait().await);
    }
}
