//! End-to-end tests for the onboarding workflow on the in-memory store

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use steadyrun_durable::activity::ActivityError;
use steadyrun_durable::engine::{ExecutorError, ReportOutcome, StartRequest, WorkflowExecutor};
use steadyrun_durable::persistence::{
    ClaimedTask, InMemoryWorkflowEventStore, StoreError, WorkflowEventStore, WorkflowStatus,
};
use steadyrun_durable::workflow::{FailureReason, WorkflowContext, WorkflowEvent};
use steadyrun_worker::onboarding::{
    self, UserOnboardingInput, UserOnboardingResult, UserOnboardingWorkflow, COMPLETED_MESSAGE,
    WELCOME_EMAIL_FAILED,
};
use steadyrun_worker::{DurableWorker, WorkerConfig};

const ACTIVITY_TYPES: [&str; 5] = [
    "send_welcome_email",
    "create_user_profile",
    "send_push_notification",
    "send_sms_notification",
    "send_follow_up_email",
];

fn input() -> UserOnboardingInput {
    UserOnboardingInput {
        user_id: 42,
        email: "a@b.com".into(),
        username: "a".into(),
    }
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "onboarding-test".into(),
        poll_interval: Duration::from_millis(10),
        timer_sweep_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Play the worker by hand: claim every visible task (looking past retry
/// backoff), answer it with `script`, and fire due timers (looking past the
/// 24h wait) until the execution closes.
async fn drive<F>(
    executor: &WorkflowExecutor<InMemoryWorkflowEventStore>,
    workflow_id: &str,
    mut script: F,
) -> HashMap<String, u32>
where
    F: FnMut(&ClaimedTask) -> Result<Value, ActivityError>,
{
    let types: Vec<String> = ACTIVITY_TYPES.iter().map(|t| t.to_string()).collect();
    let mut attempts: HashMap<String, u32> = HashMap::new();

    for _ in 0..50 {
        let info = executor.describe(workflow_id, None).await.unwrap();
        if info.status.is_terminal() {
            return attempts;
        }

        let later = Utc::now() + chrono::Duration::hours(25);
        let tasks = executor
            .store()
            .claim_tasks("driver", &types, 10, later)
            .await
            .unwrap();

        for task in &tasks {
            *attempts.entry(task.activity_type.clone()).or_default() += 1;
            let outcome = match script(task) {
                Ok(output) => executor.complete_activity(task, output).await.unwrap(),
                Err(error) => executor.fail_activity(task, error).await.unwrap(),
            };
            assert_ne!(outcome, ReportOutcome::Discarded);
        }

        if tasks.is_empty() {
            executor.fire_due_timers(later).await.unwrap();
        }
    }

    panic!("execution {workflow_id} did not close");
}

#[test_log::test(tokio::test)]
async fn test_push_failure_is_aggregated_into_result() {
    let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
    executor.register::<UserOnboardingWorkflow>();

    let workflow_id = onboarding::workflow_id(42);
    let request =
        StartRequest::for_workflow::<UserOnboardingWorkflow>(&workflow_id, &input()).unwrap();
    let handle = executor.start_execution(request).await.unwrap();

    let attempts = drive(&executor, &workflow_id, |task| {
        if task.activity_type == "send_push_notification" {
            Err(ActivityError::retryable("push gateway unavailable"))
        } else {
            Ok(json!({ "success": true, "id": format!("{}-42", task.activity_type) }))
        }
    })
    .await;

    // Push used its full budget, everything else succeeded first time
    assert_eq!(attempts["send_push_notification"], 3);
    for activity_type in [
        "send_welcome_email",
        "create_user_profile",
        "send_sms_notification",
        "send_follow_up_email",
    ] {
        assert_eq!(attempts[activity_type], 1, "{activity_type}");
    }

    let info = executor.describe(&workflow_id, None).await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Completed);
    let result: UserOnboardingResult = serde_json::from_value(info.result.unwrap()).unwrap();
    assert_eq!(
        result,
        UserOnboardingResult {
            success: true,
            welcome_email_sent: true,
            profile_created: true,
            notifications_sent: false,
            message: COMPLETED_MESSAGE.to_string(),
        }
    );

    // Retries are visible in history, only the last one settles the step
    let history = executor.history(handle.run_id).await.unwrap();
    let push_failures: Vec<(u32, bool)> = history
        .iter()
        .filter_map(|(_, event)| match event {
            WorkflowEvent::ActivityFailed {
                activity_id,
                attempt,
                will_retry,
                ..
            } if activity_id.starts_with("send_push_notification") => {
                Some((*attempt, *will_retry))
            }
            _ => None,
        })
        .collect();
    assert_eq!(push_failures, vec![(1, true), (2, true), (3, false)]);

    // The follow-up was only scheduled after the timer fired
    let position = |pred: &dyn Fn(&WorkflowEvent) -> bool| {
        history.iter().position(|(_, e)| pred(e)).unwrap()
    };
    let fired = position(&|e| matches!(e, WorkflowEvent::TimerFired { .. }));
    let follow_up = position(&|e| match e {
        WorkflowEvent::ActivityScheduled { activity_type, .. } => {
            activity_type == "send_follow_up_email"
        }
        _ => false,
    });
    assert!(fired < follow_up);
}

#[test_log::test(tokio::test)]
async fn test_welcome_email_failure_keeps_going() {
    let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
    executor.register::<UserOnboardingWorkflow>();

    let workflow_id = onboarding::workflow_id(7);
    let mut user = input();
    user.user_id = 7;
    let request =
        StartRequest::for_workflow::<UserOnboardingWorkflow>(&workflow_id, &user).unwrap();
    executor.start_execution(request).await.unwrap();

    let attempts = drive(&executor, &workflow_id, |task| {
        if task.activity_type == "send_welcome_email" {
            Err(ActivityError::non_retryable("mailbox does not exist"))
        } else {
            Ok(json!({ "success": true }))
        }
    })
    .await;
    assert_eq!(attempts["send_welcome_email"], 1);

    let info = executor.describe(&workflow_id, None).await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Completed);
    let result: UserOnboardingResult = serde_json::from_value(info.result.unwrap()).unwrap();
    assert!(!result.success);
    assert!(!result.welcome_email_sent);
    assert!(result.profile_created);
    assert!(result.notifications_sent);
    assert_eq!(result.message, "Failed to send welcome email");
}

#[test_log::test(tokio::test)]
async fn test_welcome_email_retries_exhausted_keeps_going() {
    let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
    executor.register::<UserOnboardingWorkflow>();

    let workflow_id = onboarding::workflow_id(9);
    let mut user = input();
    user.user_id = 9;
    let request =
        StartRequest::for_workflow::<UserOnboardingWorkflow>(&workflow_id, &user).unwrap();
    let handle = executor.start_execution(request).await.unwrap();

    let attempts = drive(&executor, &workflow_id, |task| {
        if task.activity_type == "send_welcome_email" {
            Err(ActivityError::retryable("smtp relay timed out"))
        } else {
            Ok(json!({ "success": true }))
        }
    })
    .await;
    assert_eq!(attempts["send_welcome_email"], 3);
    assert_eq!(attempts["create_user_profile"], 1);

    let info = executor.describe(&workflow_id, None).await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Completed);
    let result: UserOnboardingResult = serde_json::from_value(info.result.unwrap()).unwrap();
    assert!(!result.success);
    assert!(!result.welcome_email_sent);
    assert!(result.profile_created);
    assert_eq!(result.message, WELCOME_EMAIL_FAILED);

    // Replaying the first step shows why it settled
    let history = executor.history(handle.run_id).await.unwrap();
    let mut ctx = WorkflowContext::from_history(&workflow_id, handle.run_id, &history).unwrap();
    let failure = ctx
        .execute_activity("send_welcome_email", &json!({}), onboarding::activity_options())
        .unwrap()
        .unwrap_err();
    assert_eq!(failure.reason, FailureReason::RetriesExhausted);
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.error.message, "smtp relay timed out");
}

#[test_log::test(tokio::test)]
async fn test_worker_runs_onboarding_end_to_end() {
    let worker = DurableWorker::new(test_config(), InMemoryWorkflowEventStore::new());
    worker.start().await.unwrap();

    let handle = worker.start_onboarding(input()).await.unwrap();
    assert_eq!(handle.workflow_id, "user-onboarding-42");

    // Real activities run until the 24h timer is the only thing left
    let executor = worker.executor();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let history = executor.history(handle.run_id).await.unwrap();
        if history
            .iter()
            .any(|(_, e)| matches!(e, WorkflowEvent::TimerStarted { .. }))
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "timer never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        executor.describe("user-onboarding-42", None).await.unwrap().status,
        WorkflowStatus::Running
    );

    // A day passes
    let fired = executor
        .fire_due_timers(Utc::now() + chrono::Duration::hours(25))
        .await
        .unwrap();
    assert_eq!(fired, 1);

    let info = loop {
        let info = executor.describe("user-onboarding-42", None).await.unwrap();
        if info.status.is_terminal() {
            break info;
        }
        assert!(tokio::time::Instant::now() < deadline, "onboarding never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(info.status, WorkflowStatus::Completed);
    let result: UserOnboardingResult = serde_json::from_value(info.result.unwrap()).unwrap();
    assert!(result.success);
    assert!(result.welcome_email_sent);
    assert!(result.profile_created);
    assert!(result.notifications_sent);
    assert_eq!(result.message, COMPLETED_MESSAGE);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_onboarding_for_running_user_is_rejected() {
    let worker = DurableWorker::new(test_config(), InMemoryWorkflowEventStore::new());

    let first = worker.start_onboarding(input()).await.unwrap();
    let err = worker.start_onboarding(input()).await.unwrap_err();

    match err.downcast_ref::<ExecutorError>() {
        Some(ExecutorError::Store(StoreError::AlreadyRunning { run_id, .. })) => {
            assert_eq!(*run_id, first.run_id)
        }
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }
}
