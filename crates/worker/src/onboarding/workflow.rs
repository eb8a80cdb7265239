//! User onboarding workflow
//!
//! Welcome email, profile creation, push and SMS notifications in parallel,
//! a 24 hour durable wait, then a follow-up email. A failed step is recorded
//! in the result; only the follow-up email is allowed to fail silently.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use steadyrun_durable::activity::Activity;
use steadyrun_durable::reliability::RetryPolicy;
use steadyrun_durable::workflow::{ActivityOptions, Workflow, WorkflowContext, WorkflowInterrupt};
use tracing::{error, info};

use super::activities::{
    CreateProfileInput, CreateUserProfile, NotificationInput, SendEmailInput, SendFollowUpEmail,
    SendPushNotification, SendSmsNotification, SendWelcomeEmail,
};

/// Delay between signup and the follow-up email
pub const FOLLOW_UP_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

pub const PUSH_MESSAGE: &str = "Welcome to our platform!";
pub const SMS_MESSAGE: &str = "Welcome! Your account is ready.";

pub const WELCOME_EMAIL_FAILED: &str = "Failed to send welcome email";
pub const PROFILE_FAILED: &str = "; Failed to create user profile";
pub const COMPLETED_MESSAGE: &str = "User onboarding completed successfully";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserOnboardingInput {
    pub user_id: u64,
    pub email: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserOnboardingResult {
    pub success: bool,
    pub welcome_email_sent: bool,
    pub profile_created: bool,
    pub notifications_sent: bool,
    pub message: String,
}

/// Options shared by every onboarding step
///
/// 10s per attempt; retries after 1s, 2s, ... capped at 100s, 3 attempts total.
pub fn activity_options() -> ActivityOptions {
    ActivityOptions::new(Duration::from_secs(10)).with_retry_policy(
        RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(1))
            .with_backoff_coefficient(2.0)
            .with_max_interval(Duration::from_secs(100))
            .with_max_attempts(3),
    )
}

pub struct UserOnboardingWorkflow {
    input: UserOnboardingInput,
}

impl UserOnboardingWorkflow {
    fn email_input(&self) -> SendEmailInput {
        SendEmailInput {
            user_id: self.input.user_id,
            email: self.input.email.clone(),
            name: self.input.username.clone(),
        }
    }

    fn notification(&self, message: &str) -> NotificationInput {
        NotificationInput {
            user_id: self.input.user_id,
            message: message.to_string(),
        }
    }
}

impl Workflow for UserOnboardingWorkflow {
    const TYPE: &'static str = "UserOnboardingWorkflow";
    type Input = UserOnboardingInput;
    type Output = UserOnboardingResult;

    fn new(input: Self::Input) -> Self {
        Self { input }
    }

    fn run(&self, ctx: &mut WorkflowContext) -> Result<UserOnboardingResult, WorkflowInterrupt> {
        let user_id = self.input.user_id;
        if !ctx.is_replaying() {
            info!(user_id, "Starting user onboarding workflow");
        }

        let options = activity_options();
        let mut result = UserOnboardingResult {
            success: true,
            ..Default::default()
        };

        // Step 1: welcome email
        match ctx.execute_activity(SendWelcomeEmail::TYPE, &self.email_input(), options.clone())? {
            Ok(_) => result.welcome_email_sent = true,
            Err(failure) => {
                if !ctx.is_replaying() {
                    error!(user_id, error = %failure, "Failed to send welcome email");
                }
                result.success = false;
                result.message = WELCOME_EMAIL_FAILED.to_string();
            }
        }

        // Step 2: profile
        let profile = CreateProfileInput {
            user_id,
            username: self.input.username.clone(),
        };
        match ctx.execute_activity(CreateUserProfile::TYPE, &profile, options.clone())? {
            Ok(_) => result.profile_created = true,
            Err(failure) => {
                if !ctx.is_replaying() {
                    error!(user_id, error = %failure, "Failed to create user profile");
                }
                result.success = false;
                result.message.push_str(PROFILE_FAILED);
            }
        }

        // Step 3: notifications in parallel
        let push = ctx.schedule_activity(
            SendPushNotification::TYPE,
            &self.notification(PUSH_MESSAGE),
            options.clone(),
        )?;
        let sms = ctx.schedule_activity(
            SendSmsNotification::TYPE,
            &self.notification(SMS_MESSAGE),
            options.clone(),
        )?;

        let outcomes = ctx.join_all(&[push, sms])?;
        for failure in outcomes.iter().filter_map(|o| o.as_ref().err()) {
            if !ctx.is_replaying() {
                error!(user_id, error = %failure, "Failed to send notification");
            }
        }
        result.notifications_sent = outcomes.iter().all(Result::is_ok);

        // Step 4: follow-up a day later
        ctx.sleep(FOLLOW_UP_DELAY)?;

        if let Err(failure) =
            ctx.execute_activity(SendFollowUpEmail::TYPE, &self.email_input(), options)?
        {
            error!(user_id, error = %failure, "Failed to send follow-up email");
        }

        if result.success {
            result.message = COMPLETED_MESSAGE.to_string();
        }

        info!(user_id, success = result.success, "User onboarding workflow finished");
        Ok(result)
    }
}
