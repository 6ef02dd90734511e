//! Activity abstractions
//!
//! Activities are the only place side effects happen. They:
//! - Are executed by workers outside the replayed workflow code
//! - Report a JSON result or an [`ActivityError`]
//! - Support cooperative cancellation

mod context;
mod definition;

pub use context::{ActivityContext, CancellationHandle};
pub use definition::{kinds, ActivityError, ActivityHandler};
