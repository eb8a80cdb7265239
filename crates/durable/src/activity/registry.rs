//! Activity registry
//!
//! Maps activity names to handlers. A registry is built by the process that
//! runs activities and handed to its [`WorkerPool`](crate::worker::WorkerPool);
//! workflows only ever refer to activities by name.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};

/// Error type for activity inputs that cannot be decoded
pub const INVALID_INPUT: &str = "INVALID_INPUT";

/// Type-erased activity handler
pub type ActivityHandler = Arc<
    dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, ActivityError>>
        + Send
        + Sync,
>;

/// Named activity handlers for one worker process
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, ActivityHandler>,
}

impl ActivityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity under [`Activity::TYPE`]
    pub fn register<A: Activity>(&mut self, activity: A) -> &mut Self {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(move |ctx, input| {
            let activity = Arc::clone(&activity);
            Box::pin(async move {
                let input: A::Input = serde_json::from_value(input).map_err(|e| {
                    ActivityError::non_retryable(format!("invalid input for {}: {e}", A::TYPE))
                        .with_type(INVALID_INPUT)
                })?;
                let output = activity.execute(&ctx, input).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::non_retryable(format!(
                        "failed to serialize output of {}: {e}",
                        A::TYPE
                    ))
                })
            })
        });
        self.handlers.insert(A::TYPE.to_string(), handler);
        self
    }

    /// Register a closure that works on raw JSON
    pub fn register_fn<F, Fut>(&mut self, activity_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |ctx, input| Box::pin(handler(ctx, input)));
        self.handlers.insert(activity_type.into(), handler);
        self
    }

    /// Look up a handler
    pub fn get(&self, activity_type: &str) -> Option<ActivityHandler> {
        self.handlers.get(activity_type).cloned()
    }

    /// Check if an activity is registered
    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    /// Registered activity names, sorted
    pub fn activity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}
