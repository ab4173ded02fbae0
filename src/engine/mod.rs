//! Asynchronous execution of step lists.
//!
//! The [`Worker`] takes a payload and an ordered list of steps and runs them
//! one after another on a thread pool. Each run is represented by an
//! [`ExecutionHandle`], which can cancel the whole run or withdraw a single
//! step that has not started yet. A run reports back exactly once, with a
//! [`HandleEvent`] sent over the channel it was started with.

mod diagnostics;
mod handle;
mod state;
mod worker;

pub use crate::engine::diagnostics::{Diagnostics, StepExecution};
pub use crate::engine::handle::{
    ExecutionHandle, Failure, HandleEvent, HandleId, Outcome, RunOutput,
};
pub use crate::engine::state::{StepState, StepStatus};
pub use crate::engine::worker::{StepJob, Worker};
