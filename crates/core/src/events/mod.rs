//! Engine events module.
//!
//! Provides the events the scheduler emits while driving cycles and the
//! sink trait hosts implement to observe them.

mod engine_event;
mod sink;

pub use engine_event::*;
pub use sink::*;
