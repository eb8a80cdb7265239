//! In-memory implementation of WorkflowEventStore for testing

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::workflow::WorkflowEvent;

/// Internal execution state
struct ExecutionState {
    info: ExecutionInfo,
    events: Vec<WorkflowEvent>,
}

/// Internal task state
struct TaskState {
    id: Uuid,
    definition: TaskDefinition,
    status: TaskStatus,
    claimed_by: Option<String>,
    deadline: Option<DateTime<Utc>>,
}

impl TaskState {
    fn to_claimed(&self) -> ClaimedTask {
        ClaimedTask {
            id: self.id,
            run_id: self.definition.run_id,
            workflow_id: self.definition.workflow_id.clone(),
            activity_id: self.definition.activity_id.clone(),
            activity_type: self.definition.activity_type.clone(),
            input: self.definition.input.clone(),
            options: self.definition.options.clone(),
            attempt: self.definition.attempt,
            deadline: self.deadline.unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// Internal timer state
struct TimerState {
    fire_at: DateTime<Utc>,
    status: TimerStatus,
}

#[derive(Default)]
struct Inner {
    executions: HashMap<Uuid, ExecutionState>,
    /// Keyed by enqueue order
    tasks: BTreeMap<u64, TaskState>,
    task_index: HashMap<Uuid, u64>,
    next_task_seq: u64,
    timers: HashMap<(Uuid, String), TimerState>,
    fail_timer_writes: bool,
}

/// In-memory implementation of WorkflowEventStore
///
/// This is primarily for testing and single-process development. All tables
/// live behind one lock so that [`WorkflowEventStore::append`] is atomic, with
/// the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use steadyrun_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.execution_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Get the number of executions
    pub fn execution_count(&self) -> usize {
        self.inner.read().executions.len()
    }

    /// Get the number of pending tasks
    pub fn pending_task_count(&self) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Activity ID, attempt and status of every task of a run, in enqueue order
    pub fn task_statuses(&self, run_id: Uuid) -> Vec<(String, u32, TaskStatus)> {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.definition.run_id == run_id)
            .map(|t| {
                (
                    t.definition.activity_id.clone(),
                    t.definition.attempt,
                    t.status,
                )
            })
            .collect()
    }

    /// Status of one timer
    pub fn timer_status(&self, run_id: Uuid, timer_id: &str) -> Option<TimerStatus> {
        self.inner
            .read()
            .timers
            .get(&(run_id, timer_id.to_string()))
            .map(|t| t.status)
    }

    /// Make appends that persist timers fail with a database error (for testing)
    pub fn set_timer_writes_failing(&self, failing: bool) {
        self.inner.write().fail_timer_writes = failing;
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_execution(&self, execution: NewExecution) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        if let Some(running) = inner.executions.values().find(|e| {
            e.info.workflow_id == execution.workflow_id && !e.info.status.is_terminal()
        }) {
            return Err(StoreError::AlreadyRunning {
                workflow_id: execution.workflow_id.clone(),
                run_id: running.info.run_id,
            });
        }

        let started = execution.started_event();
        inner.executions.insert(
            execution.run_id,
            ExecutionState {
                info: ExecutionInfo {
                    workflow_id: execution.workflow_id,
                    run_id: execution.run_id,
                    workflow_type: execution.workflow_type,
                    namespace: execution.namespace,
                    status: WorkflowStatus::Running,
                    input: execution.input,
                    result: None,
                    error: None,
                    start_time: execution.start_time,
                    close_time: None,
                    history_cursor: 1,
                    execution_deadline: execution.execution_deadline,
                },
                events: vec![started],
            },
        );
        Ok(())
    }

    async fn get_execution(&self, run_id: Uuid) -> Result<ExecutionInfo, StoreError> {
        self.inner
            .read()
            .executions
            .get(&run_id)
            .map(|e| e.info.clone())
            .ok_or(StoreError::ExecutionNotFound(run_id))
    }

    async fn find_execution(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<ExecutionInfo, StoreError> {
        let inner = self.inner.read();
        let found = match run_id {
            Some(run_id) => inner
                .executions
                .get(&run_id)
                .filter(|e| e.info.workflow_id == workflow_id),
            None => inner
                .executions
                .values()
                .filter(|e| e.info.workflow_id == workflow_id)
                .max_by_key(|e| (e.info.start_time, e.info.run_id)),
        };
        found
            .map(|e| e.info.clone())
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn list_executions(
        &self,
        namespace: &str,
        pagination: Pagination,
    ) -> Result<Vec<ExecutionInfo>, StoreError> {
        let inner = self.inner.read();
        let mut executions: Vec<ExecutionInfo> = inner
            .executions
            .values()
            .filter(|e| e.info.namespace == namespace)
            .map(|e| e.info.clone())
            .collect();
        executions.sort_by(|a, b| (b.start_time, b.run_id).cmp(&(a.start_time, a.run_id)));

        Ok(executions
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn running_executions(&self) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.read();
        let mut running: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|e| e.info.status == WorkflowStatus::Running)
            .map(|e| e.info.run_id)
            .collect();
        running.sort();
        Ok(running)
    }

    async fn expired_executions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.read();
        let mut expired: Vec<(DateTime<Utc>, Uuid)> = inner
            .executions
            .values()
            .filter(|e| e.info.status == WorkflowStatus::Running)
            .filter_map(|e| {
                e.info
                    .execution_deadline
                    .filter(|deadline| *deadline <= now)
                    .map(|deadline| (deadline, e.info.run_id))
            })
            .collect();
        expired.sort();
        Ok(expired.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn append(
        &self,
        run_id: Uuid,
        expected_sequence: i64,
        append: HistoryAppend,
    ) -> Result<i64, StoreError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let execution = inner
            .executions
            .get_mut(&run_id)
            .ok_or(StoreError::ExecutionNotFound(run_id))?;

        if execution.info.status.is_terminal() {
            return Err(StoreError::ExecutionClosed {
                run_id,
                status: execution.info.status,
            });
        }

        let current_sequence = execution.events.len() as i64;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        if inner.fail_timer_writes && !append.timers.is_empty() {
            return Err(StoreError::Database("timer table unavailable".to_string()));
        }

        // Validate every transition before mutating anything
        for transition in &append.task_transitions {
            let claimed = inner
                .task_index
                .get(&transition.task_id)
                .and_then(|seq| inner.tasks.get(seq))
                .map(|t| {
                    t.status == TaskStatus::Claimed
                        && t.definition.attempt == transition.attempt
                        && t.definition.run_id == run_id
                })
                .unwrap_or(false);
            if !claimed {
                return Err(StoreError::StaleTask {
                    task_id: transition.task_id,
                    attempt: transition.attempt,
                });
            }
        }
        for timer_id in &append.fired_timers {
            let pending = inner
                .timers
                .get(&(run_id, timer_id.clone()))
                .map(|t| t.status == TimerStatus::Pending)
                .unwrap_or(false);
            if !pending {
                return Err(StoreError::StaleTimer {
                    run_id,
                    timer_id: timer_id.clone(),
                });
            }
        }

        let terminal = append.terminal_event().cloned();

        execution.events.extend(append.events);
        execution.info.history_cursor = execution.events.len() as i64;
        let new_sequence = execution.info.history_cursor;

        if let Some(event) = &terminal {
            if let Some(status) = event.terminal_status() {
                execution.info.status = status;
            }
            execution.info.result = event.terminal_result();
            execution.info.error = event.terminal_error();
            execution.info.close_time = Some(Utc::now());
        }

        for task in append.tasks {
            let seq = inner.next_task_seq;
            inner.next_task_seq += 1;
            let id = Uuid::now_v7();
            inner.task_index.insert(id, seq);
            inner.tasks.insert(
                seq,
                TaskState {
                    id,
                    definition: task,
                    status: TaskStatus::Pending,
                    claimed_by: None,
                    deadline: None,
                },
            );
        }

        for transition in append.task_transitions {
            if let Some(task) = inner
                .task_index
                .get(&transition.task_id)
                .and_then(|seq| inner.tasks.get_mut(seq))
            {
                task.status = transition.status;
            }
        }

        for timer in append.timers {
            inner.timers.insert(
                (run_id, timer.timer_id),
                TimerState {
                    fire_at: timer.fire_at,
                    status: TimerStatus::Pending,
                },
            );
        }

        for timer_id in append.fired_timers {
            if let Some(timer) = inner.timers.get_mut(&(run_id, timer_id)) {
                timer.status = TimerStatus::Fired;
            }
        }

        if terminal.is_some() {
            for task in inner.tasks.values_mut() {
                if task.definition.run_id == run_id
                    && matches!(task.status, TaskStatus::Pending | TaskStatus::Claimed)
                {
                    task.status = TaskStatus::Cancelled;
                }
            }
            for ((timer_run, _), timer) in inner.timers.iter_mut() {
                if *timer_run == run_id && timer.status == TimerStatus::Pending {
                    timer.status = TimerStatus::Cancelled;
                }
            }
        }

        Ok(new_sequence)
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<(i64, WorkflowEvent)>, StoreError> {
        let inner = self.inner.read();
        let execution = inner
            .executions
            .get(&run_id)
            .ok_or(StoreError::ExecutionNotFound(run_id))?;

        Ok(execution
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (i as i64, e.clone()))
            .collect())
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let mut inner = self.inner.write();

        let mut candidates: Vec<(DateTime<Utc>, u64)> = inner
            .tasks
            .iter()
            .filter(|(_, t)| {
                t.status == TaskStatus::Pending
                    && t.definition.visible_at <= now
                    && activity_types.contains(&t.definition.activity_type)
            })
            .map(|(seq, t)| (t.definition.visible_at, *seq))
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, seq) in candidates.into_iter().take(max_tasks) {
            if let Some(task) = inner.tasks.get_mut(&seq) {
                task.status = TaskStatus::Claimed;
                task.claimed_by = Some(worker_id.to_string());
                task.deadline = Some(instant_after(
                    now,
                    task.definition.options.start_to_close_timeout,
                ));
                claimed.push(task.to_claimed());
            }
        }

        Ok(claimed)
    }

    async fn timed_out_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Claimed && t.deadline.map(|d| d < now).unwrap_or(false)
            })
            .take(limit)
            .map(TaskState::to_claimed)
            .collect())
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueTimer>, StoreError> {
        let inner = self.inner.read();
        let mut due: Vec<DueTimer> = inner
            .timers
            .iter()
            .filter(|(_, t)| t.status == TimerStatus::Pending && t.fire_at <= now)
            .map(|((run_id, timer_id), t)| DueTimer {
                run_id: *run_id,
                timer_id: timer_id.clone(),
                fire_at: t.fire_at,
            })
            .collect();
        due.sort_by(|a, b| (a.fire_at, a.run_id).cmp(&(b.fire_at, b.run_id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn next_timer_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .inner
            .read()
            .timers
            .values()
            .filter(|t| t.status == TimerStatus::Pending)
            .map(|t| t.fire_at)
            .min())
    }
}
