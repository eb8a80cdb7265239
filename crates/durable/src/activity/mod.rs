//! Activity abstractions
//!
//! Activities are units of work that are executed by workers. They:
//! - May fail and be retried according to the step's retry policy
//! - Run under a start-to-close timeout
//! - Are looked up by name in an [`ActivityRegistry`]

mod context;
mod definition;
mod registry;

pub use context::ActivityContext;
pub use definition::{Activity, ActivityError, ActivityErrorKind, ACTIVITY_TIMEOUT};
pub use registry::{ActivityHandler, ActivityRegistry, INVALID_INPUT};
