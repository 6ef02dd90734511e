//! Retry scheduling

mod retry;

pub(crate) use retry::millis;
pub use retry::RetryPolicy;
