//! User onboarding example workload
//!
//! - [`UserOnboardingWorkflow`] - the workflow definition
//! - [`activities`] - the five activities it calls

pub mod activities;
mod workflow;

pub use activities::{
    CreateUserProfile, SendFollowUpEmail, SendPushNotification, SendSmsNotification,
    SendWelcomeEmail,
};
pub use workflow::{
    activity_options, UserOnboardingInput, UserOnboardingResult, UserOnboardingWorkflow,
    COMPLETED_MESSAGE, FOLLOW_UP_DELAY, PROFILE_FAILED, PUSH_MESSAGE, SMS_MESSAGE,
    WELCOME_EMAIL_FAILED,
};

/// Task queue the onboarding worker serves
pub const TASK_QUEUE: &str = "user-onboarding";

/// Workflow ID used for a user's onboarding run
pub fn workflow_id(user_id: u64) -> String {
    format!("user-onboarding-{user_id}")
}
