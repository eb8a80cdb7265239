//! PostgreSQL implementation of WorkflowEventStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via the execution's history cursor
//! - Row locks on the execution so each append is one transaction
//! - Task claiming with SKIP LOCKED

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{ActivityOptions, WorkflowError, WorkflowEvent};

/// PostgreSQL implementation of WorkflowEventStore
///
/// # Example
///
/// ```ignore
/// use steadyrun_durable::PostgresWorkflowEventStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/steadyrun").await?;
/// let store = PostgresWorkflowEventStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowEventStore {
    pool: PgPool,
}

impl PostgresWorkflowEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn running_run_id(&self, workflow_id: &str) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id FROM durable_executions
            WHERE workflow_id = $1 AND status = 'running'
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.get("run_id")))
    }
}

#[async_trait]
impl WorkflowEventStore for PostgresWorkflowEventStore {
    #[instrument(skip(self, execution), fields(workflow_id = %execution.workflow_id, run_id = %execution.run_id))]
    async fn create_execution(&self, execution: NewExecution) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO durable_executions
                (run_id, workflow_id, workflow_type, namespace, status, input,
                 start_time, history_cursor, execution_deadline)
            VALUES ($1, $2, $3, $4, 'running', $5, $6, 1, $7)
            "#,
        )
        .bind(execution.run_id)
        .bind(&execution.workflow_id)
        .bind(&execution.workflow_type)
        .bind(&execution.namespace)
        .bind(&execution.input)
        .bind(execution.start_time)
        .bind(execution.execution_deadline)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            let unique_violation = e
                .as_database_error()
                .map(|db| db.is_unique_violation())
                .unwrap_or(false);
            if unique_violation {
                drop(tx);
                let run_id = self
                    .running_run_id(&execution.workflow_id)
                    .await?
                    .unwrap_or(execution.run_id);
                return Err(StoreError::AlreadyRunning {
                    workflow_id: execution.workflow_id,
                    run_id,
                });
            }
            error!("Failed to create execution: {}", e);
            return Err(StoreError::Database(e.to_string()));
        }

        insert_event(&mut tx, execution.run_id, 0, &execution.started_event()).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(workflow_type = %execution.workflow_type, "created execution");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, run_id: Uuid) -> Result<ExecutionInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM durable_executions WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ExecutionNotFound(run_id))?;

        execution_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn find_execution(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<ExecutionInfo, StoreError> {
        let row = match run_id {
            Some(run_id) => {
                sqlx::query(
                    r#"
                    SELECT * FROM durable_executions
                    WHERE workflow_id = $1 AND run_id = $2
                    "#,
                )
                .bind(workflow_id)
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM durable_executions
                    WHERE workflow_id = $1
                    ORDER BY start_time DESC, run_id DESC
                    LIMIT 1
                    "#,
                )
                .bind(workflow_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(db_err)?
        .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        execution_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_executions(
        &self,
        namespace: &str,
        pagination: Pagination,
    ) -> Result<Vec<ExecutionInfo>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_executions
            WHERE namespace = $1
            ORDER BY start_time DESC, run_id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(namespace)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn running_executions(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id FROM durable_executions
            WHERE status = 'running'
            ORDER BY run_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(|r| r.get("run_id")).collect())
    }

    #[instrument(skip(self))]
    async fn expired_executions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id FROM durable_executions
            WHERE status = 'running'
              AND execution_deadline IS NOT NULL
              AND execution_deadline <= $1
            ORDER BY execution_deadline, run_id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(|r| r.get("run_id")).collect())
    }

    #[instrument(skip(self, append), fields(events = append.events.len()))]
    async fn append(
        &self,
        run_id: Uuid,
        expected_sequence: i64,
        append: HistoryAppend,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Lock the execution row; concurrent appends serialize here
        let row = sqlx::query(
            r#"
            SELECT status, history_cursor
            FROM durable_executions
            WHERE run_id = $1
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ExecutionNotFound(run_id))?;

        let status = WorkflowStatus::parse(row.get::<String, _>("status").as_str())?;
        if status.is_terminal() {
            return Err(StoreError::ExecutionClosed { run_id, status });
        }

        let current_sequence: i64 = row.get("history_cursor");
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        // Dropping the transaction on any early return rolls everything back
        for transition in &append.task_transitions {
            let result = sqlx::query(
                r#"
                UPDATE durable_tasks
                SET status = $4
                WHERE id = $1 AND run_id = $2 AND attempt = $3 AND status = 'claimed'
                "#,
            )
            .bind(transition.task_id)
            .bind(run_id)
            .bind(transition.attempt as i32)
            .bind(transition.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::StaleTask {
                    task_id: transition.task_id,
                    attempt: transition.attempt,
                });
            }
        }

        for timer_id in &append.fired_timers {
            let result = sqlx::query(
                r#"
                UPDATE durable_timers
                SET status = 'fired'
                WHERE run_id = $1 AND timer_id = $2 AND status = 'pending'
                "#,
            )
            .bind(run_id)
            .bind(timer_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::StaleTimer {
                    run_id,
                    timer_id: timer_id.clone(),
                });
            }
        }

        let mut new_sequence = current_sequence;
        for event in &append.events {
            insert_event(&mut tx, run_id, new_sequence, event).await?;
            new_sequence += 1;
        }

        for task in &append.tasks {
            insert_task(&mut tx, task).await?;
        }

        for timer in &append.timers {
            sqlx::query(
                r#"
                INSERT INTO durable_timers (run_id, timer_id, fire_at, status)
                VALUES ($1, $2, $3, 'pending')
                "#,
            )
            .bind(run_id)
            .bind(&timer.timer_id)
            .bind(timer.fire_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        match append.terminal_event() {
            Some(terminal) => {
                let status = terminal
                    .terminal_status()
                    .unwrap_or(WorkflowStatus::Failed);
                let error_json = terminal
                    .terminal_error()
                    .map(|e| serde_json::to_value(&e))
                    .transpose()
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;

                sqlx::query(
                    r#"
                    UPDATE durable_executions
                    SET history_cursor = $2,
                        status = $3,
                        result = $4,
                        error = $5,
                        close_time = NOW()
                    WHERE run_id = $1
                    "#,
                )
                .bind(run_id)
                .bind(new_sequence)
                .bind(status.as_str())
                .bind(terminal.terminal_result())
                .bind(error_json)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                sqlx::query(
                    r#"
                    UPDATE durable_tasks
                    SET status = 'cancelled'
                    WHERE run_id = $1 AND status IN ('pending', 'claimed')
                    "#,
                )
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                sqlx::query(
                    r#"
                    UPDATE durable_timers
                    SET status = 'cancelled'
                    WHERE run_id = $1 AND status = 'pending'
                    "#,
                )
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE durable_executions SET history_cursor = $2 WHERE run_id = $1
                    "#,
                )
                .bind(run_id)
                .bind(new_sequence)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;

        debug!(%run_id, new_sequence, "appended events");
        Ok(new_sequence)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<(i64, WorkflowEvent)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_num, event_data
            FROM durable_events
            WHERE run_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load events: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if rows.is_empty() {
            // Every execution has its started event, so no rows means no execution
            self.get_execution(run_id).await?;
        }

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("sequence_num");
            let data: serde_json::Value = row.get("event_data");
            let event: WorkflowEvent = serde_json::from_value(data)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            events.push((seq, event));
        }

        Ok(events)
    }

    #[instrument(skip(self, activity_types))]
    async fn claim_tasks(
        &self,
        worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        if activity_types.is_empty() || max_tasks == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM durable_tasks
                WHERE status = 'pending'
                  AND activity_type = ANY($1)
                  AND visible_at <= $4
                ORDER BY visible_at, seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE durable_tasks t
            SET status = 'claimed',
                claimed_by = $3,
                claimed_at = $4,
                deadline = $4 + t.start_to_close_ms * INTERVAL '1 millisecond'
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.*
            "#,
        )
        .bind(activity_types)
        .bind(max_tasks as i64)
        .bind(worker_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut ordered = Vec::with_capacity(rows.len());
        for row in &rows {
            let visible_at: DateTime<Utc> = row.get("visible_at");
            let seq: i64 = row.get("seq");
            ordered.push(((visible_at, seq), claimed_from_row(row)?));
        }
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        let claimed: Vec<ClaimedTask> = ordered.into_iter().map(|(_, t)| t).collect();

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed tasks");
        }

        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn timed_out_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_tasks
            WHERE status = 'claimed' AND deadline < $1
            ORDER BY deadline
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(claimed_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueTimer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, timer_id, fire_at
            FROM durable_timers
            WHERE status = 'pending' AND fire_at <= $1
            ORDER BY fire_at, run_id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| DueTimer {
                run_id: row.get("run_id"),
                timer_id: row.get("timer_id"),
                fire_at: row.get("fire_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn next_timer_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MIN(fire_at) AS next_fire_at
            FROM durable_timers
            WHERE status = 'pending'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("next_fire_at"))
    }
}

// Helper functions

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    run_id: Uuid,
    sequence: i64,
    event: &WorkflowEvent,
) -> Result<(), StoreError> {
    let event_data =
        serde_json::to_value(event).map_err(|e| StoreError::Serialization(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO durable_events (run_id, sequence_num, event_type, event_data)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(run_id)
    .bind(sequence)
    .bind(event.event_type())
    .bind(&event_data)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(())
}

async fn insert_task(
    tx: &mut Transaction<'_, Postgres>,
    task: &TaskDefinition,
) -> Result<(), StoreError> {
    let options =
        serde_json::to_value(&task.options).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let start_to_close_ms =
        i64::try_from(task.options.start_to_close_timeout.as_millis()).unwrap_or(i64::MAX);

    sqlx::query(
        r#"
        INSERT INTO durable_tasks
            (id, run_id, workflow_id, activity_id, activity_type, input, options,
             attempt, start_to_close_ms, status, visible_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(task.run_id)
    .bind(&task.workflow_id)
    .bind(&task.activity_id)
    .bind(&task.activity_type)
    .bind(&task.input)
    .bind(&options)
    .bind(task.attempt as i32)
    .bind(start_to_close_ms)
    .bind(task.visible_at)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(())
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionInfo, StoreError> {
    let status: String = row.get("status");
    let error_json: Option<serde_json::Value> = row.get("error");
    let error = error_json
        .map(serde_json::from_value::<WorkflowError>)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(ExecutionInfo {
        workflow_id: row.get("workflow_id"),
        run_id: row.get("run_id"),
        workflow_type: row.get("workflow_type"),
        namespace: row.get("namespace"),
        status: WorkflowStatus::parse(&status)?,
        input: row.get("input"),
        result: row.get("result"),
        error,
        start_time: row.get("start_time"),
        close_time: row.get("close_time"),
        history_cursor: row.get("history_cursor"),
        execution_deadline: row.get("execution_deadline"),
    })
}

fn claimed_from_row(row: &PgRow) -> Result<ClaimedTask, StoreError> {
    let options_json: serde_json::Value = row.get("options");
    let options: ActivityOptions = serde_json::from_value(options_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let deadline: Option<DateTime<Utc>> = row.get("deadline");

    Ok(ClaimedTask {
        id: row.get("id"),
        run_id: row.get("run_id"),
        workflow_id: row.get("workflow_id"),
        activity_id: row.get("activity_id"),
        activity_type: row.get("activity_type"),
        input: row.get("input"),
        options,
        attempt: row.get::<i32, _>("attempt") as u32,
        deadline: deadline.unwrap_or(DateTime::<Utc>::MAX_UTC),
    })
}

#[cfg(test)]
mod tests {
    // Integration tests require a PostgreSQL database
    // Run with: DATABASE_URL=... cargo test -p steadyrun-durable --test postgres_integration_test -- --test-threads=1
}
