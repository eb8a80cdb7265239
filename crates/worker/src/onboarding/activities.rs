//! Onboarding activities
//!
//! Each activity simulates a call to an external service (email provider,
//! profile store, push/SMS gateways) and returns the id it was assigned.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use steadyrun_durable::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmailInput {
    pub user_id: u64,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmailResult {
    pub success: bool,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProfileInput {
    pub user_id: u64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProfileResult {
    pub success: bool,
    pub profile_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationInput {
    pub user_id: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationResult {
    pub success: bool,
    pub id: String,
}

/// Wait out the simulated call, giving up if the worker shuts down
async fn simulate_call(ctx: &ActivityContext, latency: Duration) -> Result<(), ActivityError> {
    tokio::select! {
        _ = tokio::time::sleep(latency) => Ok(()),
        _ = ctx.cancelled() => Err(ActivityError::retryable("worker shutting down")),
    }
}

macro_rules! simulated_activity {
    ($(#[$doc:meta])* $name:ident, $latency_ms:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            /// Simulated service latency
            pub latency: Duration,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    latency: Duration::from_millis($latency_ms),
                }
            }
        }

        impl $name {
            pub fn with_latency(latency: Duration) -> Self {
                Self { latency }
            }
        }
    };
}

simulated_activity!(
    /// Sends the welcome email
    SendWelcomeEmail,
    100
);
simulated_activity!(
    /// Sends the follow-up email a day after signup
    SendFollowUpEmail,
    100
);
simulated_activity!(
    /// Creates the user's profile record
    CreateUserProfile,
    200
);
simulated_activity!(SendPushNotification, 150);
simulated_activity!(SendSmsNotification, 150);

#[async_trait]
impl Activity for SendWelcomeEmail {
    const TYPE: &'static str = "send_welcome_email";
    type Input = SendEmailInput;
    type Output = SendEmailResult;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        info!(email = %input.email, attempt = ctx.attempt, "Sending welcome email");
        simulate_call(ctx, self.latency).await?;

        Ok(SendEmailResult {
            success: true,
            message_id: format!("welcome-{}-{}", input.user_id, Utc::now().timestamp()),
        })
    }
}

#[async_trait]
impl Activity for SendFollowUpEmail {
    const TYPE: &'static str = "send_follow_up_email";
    type Input = SendEmailInput;
    type Output = SendEmailResult;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        info!(email = %input.email, attempt = ctx.attempt, "Sending follow-up email");
        simulate_call(ctx, self.latency).await?;

        Ok(SendEmailResult {
            success: true,
            message_id: format!("followup-{}-{}", input.user_id, Utc::now().timestamp()),
        })
    }
}

#[async_trait]
impl Activity for CreateUserProfile {
    const TYPE: &'static str = "create_user_profile";
    type Input = CreateProfileInput;
    type Output = CreateProfileResult;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        info!(user_id = input.user_id, attempt = ctx.attempt, "Creating user profile");
        simulate_call(ctx, self.latency).await?;

        Ok(CreateProfileResult {
            success: true,
            profile_id: format!("profile-{}", input.user_id),
        })
    }
}

#[async_trait]
impl Activity for SendPushNotification {
    const TYPE: &'static str = "send_push_notification";
    type Input = NotificationInput;
    type Output = NotificationResult;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        info!(user_id = input.user_id, attempt = ctx.attempt, "Sending push notification");
        simulate_call(ctx, self.latency).await?;

        Ok(NotificationResult {
            success: true,
            id: format!("push-{}-{}", input.user_id, Utc::now().timestamp()),
        })
    }
}

#[async_trait]
impl Activity for SendSmsNotification {
    const TYPE: &'static str = "send_sms_notification";
    type Input = NotificationInput;
    type Output = NotificationResult;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        info!(user_id = input.user_id, attempt = ctx.attempt, "Sending SMS notification");
        simulate_call(ctx, self.latency).await?;

        Ok(NotificationResult {
            success: true,
            id: format!("sms-{}-{}", input.user_id, Utc::now().timestamp()),
        })
    }
}

/// Registry with all five onboarding activities at their default latency
pub fn registry() -> ActivityRegistry {
    let mut registry = ActivityRegistry::new();
    registry
        .register(SendWelcomeEmail::default())
        .register(CreateUserProfile::default())
        .register(SendPushNotification::default())
        .register(SendSmsNotification::default())
        .register(SendFollowUpEmail::default());
    registry
}
