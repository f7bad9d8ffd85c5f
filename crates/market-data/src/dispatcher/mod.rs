//! Request dispatch module.
//!
//! This module provides orchestration of upstream provider calls, including:
//! - Three priority lanes per provider
//! - Sliding-window rate limiting per provider
//! - Timeouts and retry with exponential backoff

mod queue;
mod request_dispatcher;
mod retry;
mod window;

pub use queue::Priority;
pub use request_dispatcher::{
    DispatcherSettings, DispatcherStats, ProviderQueueStats, RequestDispatcher,
};
pub use retry::{RetryPolicy, RetryPredicate};
pub use window::RateLimitWindow;
