use std::borrow::Cow;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Anything that can flow through a pipeline.
///
/// The payload is opaque to the scheduler. The only thing it ever does with
/// one is clone it: a run always receives a copy of the node's data, never the
/// node's live value, and the result of a run is moved back into a node once
/// the run succeeds.
pub trait Payload: Clone + Send + 'static {}

impl<T> Payload for T where T: Clone + Send + 'static {}

/// Runtime options of a pipeline.
///
/// Every field has a default, so a partial configuration can be deserialized
/// from whatever format the application keeps its settings in.
///
/// ```rust
/// let options = nagare::Options {
///     worker_threads: 4,
///     ..Default::default()
/// };
/// assert_eq!(options.implicit_child_name, "Output");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Number of threads in the worker pool. Previews run next to the main
    /// pipeline, so anything below 2 is raised to 2.
    pub worker_threads: usize,
    /// Name given to the worker threads.
    pub thread_name: String,
    /// Name of the data nodes created to hold the output of a branch.
    pub implicit_child_name: String,
    /// Whether the pipeline starts in the paused state.
    pub start_paused: bool,
}

impl Options {
    pub(crate) fn threads(&self) -> usize {
        self.worker_threads.max(2)
    }

    pub(crate) fn child_name(&self) -> Cow<'static, str> {
        Cow::Owned(self.implicit_child_name.clone())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(2)
                .max(2),
            thread_name: String::from("nagare-worker"),
            implicit_child_name: String::from("Output"),
            start_paused: false,
        }
    }
}
