//! Integration tests for PostgresWorkflowEventStore
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p steadyrun-durable --test postgres_integration_test -- --test-threads=1
//!
//! Every test returns early when DATABASE_URL is not set. Migrations are
//! applied by the tests themselves.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use steadyrun_durable::engine::{StartRequest, WorkflowExecutor};
use steadyrun_durable::persistence::{
    HistoryAppend, NewExecution, Pagination, PostgresWorkflowEventStore, StoreError,
    TaskDefinition, TaskStatus, TaskTransition, TimerDefinition, WorkflowEventStore,
    WorkflowStatus,
};
use steadyrun_durable::workflow::{
    ActivityOptions, Workflow, WorkflowContext, WorkflowError, WorkflowEvent, WorkflowInterrupt,
};

/// Connect and migrate, or `None` when no database is configured
async fn create_test_store() -> Option<PostgresWorkflowEventStore> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to PostgreSQL at DATABASE_URL");
    let store = PostgresWorkflowEventStore::new(pool);
    store.migrate().await.expect("migrations should apply");
    Some(store)
}

/// Clean up test data for a specific run
async fn cleanup_run(store: &PostgresWorkflowEventStore, run_id: Uuid) {
    for table in ["durable_timers", "durable_tasks", "durable_events"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE run_id = $1"))
            .bind(run_id)
            .execute(store.pool())
            .await
            .ok();
    }
    sqlx::query("DELETE FROM durable_executions WHERE run_id = $1")
        .bind(run_id)
        .execute(store.pool())
        .await
        .ok();
}

fn new_execution(workflow_id: &str) -> NewExecution {
    NewExecution {
        workflow_id: workflow_id.to_string(),
        run_id: Uuid::now_v7(),
        workflow_type: "test_workflow".to_string(),
        namespace: format!("ns-{}", Uuid::now_v7()),
        input: json!({ "n": 1 }),
        start_time: Utc::now(),
        execution_deadline: None,
    }
}

fn scheduled(activity_id: &str, activity_type: &str) -> WorkflowEvent {
    WorkflowEvent::ActivityScheduled {
        activity_id: activity_id.to_string(),
        activity_type: activity_type.to_string(),
        input: json!({}),
        options: ActivityOptions::default(),
    }
}

fn task(execution: &NewExecution, activity_id: &str, activity_type: &str) -> TaskDefinition {
    TaskDefinition {
        run_id: execution.run_id,
        workflow_id: execution.workflow_id.clone(),
        activity_id: activity_id.to_string(),
        activity_type: activity_type.to_string(),
        input: json!({}),
        options: ActivityOptions::default(),
        attempt: 1,
        visible_at: Utc::now(),
    }
}

// ============================================
// Execution registry
// ============================================

#[test_log::test(tokio::test)]
async fn test_create_and_get_execution() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let execution = new_execution(&format!("wf-{}", Uuid::now_v7()));

    store.create_execution(execution.clone()).await.unwrap();

    let info = store.get_execution(execution.run_id).await.unwrap();
    assert_eq!(info.workflow_id, execution.workflow_id);
    assert_eq!(info.status, WorkflowStatus::Running);
    assert_eq!(info.input, json!({ "n": 1 }));
    assert_eq!(info.history_cursor, 1);

    let events = store.load_events(execution.run_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], (0, WorkflowEvent::WorkflowStarted { .. })));

    let found = store
        .find_execution(&execution.workflow_id, None)
        .await
        .unwrap();
    assert_eq!(found.run_id, execution.run_id);

    cleanup_run(&store, execution.run_id).await;
}

#[test_log::test(tokio::test)]
async fn test_duplicate_running_workflow_id_rejected() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let workflow_id = format!("wf-{}", Uuid::now_v7());
    let first = new_execution(&workflow_id);
    store.create_execution(first.clone()).await.unwrap();

    let result = store.create_execution(new_execution(&workflow_id)).await;
    match result {
        Err(StoreError::AlreadyRunning { run_id, .. }) => assert_eq!(run_id, first.run_id),
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }

    // Once closed, the id can be reused
    store
        .append(
            first.run_id,
            1,
            HistoryAppend::new(vec![WorkflowEvent::WorkflowCompleted { result: json!(1) }]),
        )
        .await
        .unwrap();
    let second = new_execution(&workflow_id);
    store.create_execution(second.clone()).await.unwrap();

    cleanup_run(&store, first.run_id).await;
    cleanup_run(&store, second.run_id).await;
}

#[test_log::test(tokio::test)]
async fn test_execution_not_found() {
    let Some(store) = create_test_store().await else {
        return;
    };

    let result = store.get_execution(Uuid::now_v7()).await;
    assert!(matches!(result, Err(StoreError::ExecutionNotFound(_))));

    let result = store.find_execution("no-such-workflow", None).await;
    assert!(matches!(result, Err(StoreError::WorkflowNotFound(_))));
}

#[test_log::test(tokio::test)]
async fn test_list_executions_newest_first() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let namespace = format!("ns-{}", Uuid::now_v7());

    let mut run_ids = Vec::new();
    for i in 0..3 {
        let mut execution = new_execution(&format!("wf-{i}-{}", Uuid::now_v7()));
        execution.namespace = namespace.clone();
        execution.start_time = Utc::now() + chrono::Duration::seconds(i);
        run_ids.push(execution.run_id);
        store.create_execution(execution).await.unwrap();
    }

    let page = store
        .list_executions(&namespace, Pagination { offset: 0, limit: 2 })
        .await
        .unwrap();
    assert_eq!(
        page.iter().map(|e| e.run_id).collect::<Vec<_>>(),
        vec![run_ids[2], run_ids[1]]
    );

    let rest = store
        .list_executions(&namespace, Pagination { offset: 2, limit: 2 })
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].run_id, run_ids[0]);

    for run_id in run_ids {
        cleanup_run(&store, run_id).await;
    }
}

// ============================================
// History
// ============================================

#[test_log::test(tokio::test)]
async fn test_append_and_concurrency_conflict() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let execution = new_execution(&format!("wf-{}", Uuid::now_v7()));
    store.create_execution(execution.clone()).await.unwrap();

    let cursor = store
        .append(
            execution.run_id,
            1,
            HistoryAppend::new(vec![scheduled("a-0", "a"), scheduled("b-1", "b")]),
        )
        .await
        .unwrap();
    assert_eq!(cursor, 3);

    let result = store
        .append(
            execution.run_id,
            1,
            HistoryAppend::new(vec![scheduled("c-2", "c")]),
        )
        .await;
    assert!(matches!(
        result,
        Err(StoreError::ConcurrencyConflict {
            expected: 1,
            actual: 3
        })
    ));

    let events = store.load_events(execution.run_id).await.unwrap();
    assert_eq!(
        events.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    cleanup_run(&store, execution.run_id).await;
}

#[test_log::test(tokio::test)]
async fn test_terminal_event_closes_execution() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let activity_type = format!("act-{}", Uuid::now_v7());
    let execution = new_execution(&format!("wf-{}", Uuid::now_v7()));
    store.create_execution(execution.clone()).await.unwrap();

    store
        .append(
            execution.run_id,
            1,
            HistoryAppend::new(vec![scheduled("a-0", &activity_type)])
                .with_task(task(&execution, "a-0", &activity_type))
                .with_timer(TimerDefinition {
                    timer_id: "timer-1".into(),
                    fire_at: Utc::now() - chrono::Duration::seconds(1),
                }),
        )
        .await
        .unwrap();

    let error = WorkflowError::new("boom");
    store
        .append(
            execution.run_id,
            2,
            HistoryAppend::new(vec![WorkflowEvent::WorkflowFailed {
                error: error.clone(),
            }]),
        )
        .await
        .unwrap();

    let info = store.get_execution(execution.run_id).await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Failed);
    assert_eq!(info.error, Some(error));
    assert!(info.close_time.is_some());

    // Pending task and timer were cancelled with the terminal write
    let claimed = store
        .claim_tasks("w1", &[activity_type], 10, Utc::now())
        .await
        .unwrap();
    assert!(claimed.is_empty());
    let due = store.due_timers(Utc::now(), 1000).await.unwrap();
    assert!(due.iter().all(|t| t.run_id != execution.run_id));

    let result = store
        .append(execution.run_id, 3, HistoryAppend::new(vec![scheduled("x-9", "x")]))
        .await;
    assert!(matches!(result, Err(StoreError::ExecutionClosed { .. })));

    cleanup_run(&store, execution.run_id).await;
}

// ============================================
// Task queue
// ============================================

#[test_log::test(tokio::test)]
async fn test_claim_filters_by_type_and_rejects_stale_reports() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let wanted = format!("wanted-{}", Uuid::now_v7());
    let other = format!("other-{}", Uuid::now_v7());
    let execution = new_execution(&format!("wf-{}", Uuid::now_v7()));
    store.create_execution(execution.clone()).await.unwrap();

    store
        .append(
            execution.run_id,
            1,
            HistoryAppend::new(vec![scheduled("w-0", &wanted), scheduled("o-1", &other)])
                .with_task(task(&execution, "w-0", &wanted))
                .with_task(task(&execution, "o-1", &other)),
        )
        .await
        .unwrap();

    let claimed = store
        .claim_tasks("w1", &[wanted.clone()], 10, Utc::now())
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].activity_id, "w-0");
    assert!(claimed[0].deadline > Utc::now());

    // Already claimed
    let again = store
        .claim_tasks("w2", &[wanted], 10, Utc::now())
        .await
        .unwrap();
    assert!(again.is_empty());

    let transition = TaskTransition {
        task_id: claimed[0].id,
        attempt: 1,
        status: TaskStatus::Completed,
    };
    let completed = HistoryAppend::new(vec![WorkflowEvent::ActivityCompleted {
        activity_id: "w-0".into(),
        attempt: 1,
        result: json!("ok"),
    }])
    .with_task_transition(transition.clone());
    store
        .append(execution.run_id, 3, completed.clone())
        .await
        .unwrap();

    // Duplicate report
    let result = store.append(execution.run_id, 4, completed).await;
    assert!(matches!(result, Err(StoreError::StaleTask { .. })));
    assert_eq!(
        store.get_execution(execution.run_id).await.unwrap().history_cursor,
        4
    );

    cleanup_run(&store, execution.run_id).await;
}

#[test_log::test(tokio::test)]
async fn test_concurrent_task_claiming() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let store = Arc::new(store);
    let activity_type = format!("act-{}", Uuid::now_v7());
    let execution = new_execution(&format!("wf-{}", Uuid::now_v7()));
    store.create_execution(execution.clone()).await.unwrap();

    let mut append = HistoryAppend::default();
    for i in 0..20 {
        let activity_id = format!("{activity_type}-{i}");
        append.events.push(scheduled(&activity_id, &activity_type));
        append.tasks.push(task(&execution, &activity_id, &activity_type));
    }
    store.append(execution.run_id, 1, append).await.unwrap();

    let mut handles = Vec::new();
    for worker in 0..4 {
        let store = Arc::clone(&store);
        let activity_type = activity_type.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = store
                    .claim_tasks(&format!("worker-{worker}"), &[activity_type.clone()], 3, Utc::now())
                    .await
                    .unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|t| t.id));
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 20);
    assert_eq!(all.len(), 20, "a task was claimed twice");

    cleanup_run(&store, execution.run_id).await;
}

#[test_log::test(tokio::test)]
async fn test_timed_out_tasks() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let activity_type = format!("act-{}", Uuid::now_v7());
    let execution = new_execution(&format!("wf-{}", Uuid::now_v7()));
    store.create_execution(execution.clone()).await.unwrap();

    let mut definition = task(&execution, "a-0", &activity_type);
    definition.options = ActivityOptions::new(Duration::from_secs(5));
    store
        .append(
            execution.run_id,
            1,
            HistoryAppend::new(vec![scheduled("a-0", &activity_type)]).with_task(definition),
        )
        .await
        .unwrap();

    let now = Utc::now();
    let claimed = store
        .claim_tasks("w1", &[activity_type], 1, now)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let expired = store.timed_out_tasks(now, 1000).await.unwrap();
    assert!(expired.iter().all(|t| t.id != claimed[0].id));

    let expired = store
        .timed_out_tasks(now + chrono::Duration::seconds(6), 1000)
        .await
        .unwrap();
    assert!(expired.iter().any(|t| t.id == claimed[0].id));

    cleanup_run(&store, execution.run_id).await;
}

// ============================================
// Timers
// ============================================

#[test_log::test(tokio::test)]
async fn test_timer_fires_once() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let execution = new_execution(&format!("wf-{}", Uuid::now_v7()));
    store.create_execution(execution.clone()).await.unwrap();

    let fire_at = Utc::now() + chrono::Duration::hours(1);
    store
        .append(
            execution.run_id,
            1,
            HistoryAppend::new(vec![WorkflowEvent::TimerStarted {
                timer_id: "timer-0".into(),
                fire_at,
            }])
            .with_timer(TimerDefinition {
                timer_id: "timer-0".into(),
                fire_at,
            }),
        )
        .await
        .unwrap();

    let due = store.due_timers(Utc::now(), 1000).await.unwrap();
    assert!(due.iter().all(|t| t.run_id != execution.run_id));

    let later = fire_at + chrono::Duration::seconds(1);
    let due = store.due_timers(later, 1000).await.unwrap();
    assert!(due
        .iter()
        .any(|t| t.run_id == execution.run_id && t.timer_id == "timer-0"));

    let fired = HistoryAppend::new(vec![WorkflowEvent::TimerFired {
        timer_id: "timer-0".into(),
    }])
    .with_fired_timer("timer-0");
    store
        .append(execution.run_id, 2, fired.clone())
        .await
        .unwrap();

    let result = store.append(execution.run_id, 3, fired).await;
    assert!(matches!(result, Err(StoreError::StaleTimer { .. })));

    cleanup_run(&store, execution.run_id).await;
}

// ============================================
// Engine over Postgres
// ============================================

struct PingWorkflow;

impl Workflow for PingWorkflow {
    const TYPE: &'static str = "pg_ping_workflow";
    type Input = String;
    type Output = String;

    fn new(_input: String) -> Self {
        Self
    }

    fn run(&self, ctx: &mut WorkflowContext) -> Result<String, WorkflowInterrupt> {
        ctx.sleep(Duration::from_millis(0))?;
        Ok("pong".to_string())
    }
}

#[test_log::test(tokio::test)]
async fn test_executor_recovers_timer_after_restart() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let workflow_id = format!("ping-{}", Uuid::now_v7());

    let handle = {
        let mut executor = WorkflowExecutor::new(store.clone());
        executor.register::<PingWorkflow>();
        executor
            .start_execution(StartRequest::for_workflow::<PingWorkflow>(&workflow_id, &"x".to_string()).unwrap())
            .await
            .unwrap()
    };

    // A new executor over the same database picks up the overdue timer
    let mut executor = WorkflowExecutor::new(store.clone());
    executor.register::<PingWorkflow>();
    executor.recover().await.unwrap();
    executor.fire_due_timers(Utc::now()).await.unwrap();

    let info = executor.describe(&workflow_id, None).await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert_eq!(info.result, Some(json!("pong")));

    cleanup_run(&store, handle.run_id).await;
}
