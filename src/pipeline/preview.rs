use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};

use crate::core::Payload;
use crate::engine::{ExecutionHandle, Failure, HandleEvent, HandleId, Outcome, StepJob};
use crate::error::PipelineError;
use crate::graph::StepId;
use crate::pipeline::Pipeline;
use crate::pipeline::events::Deferred;

/// How a preview ended.
#[derive(Debug)]
pub enum PreviewOutcome<P> {
    /// The payload as it would be right before the previewed step.
    Ready(P),
    Failed(Failure),
    /// The preview was canceled, or the pipeline went away before the
    /// preview could be resolved.
    Canceled,
}

/// The payload a data node would have right before one of its steps runs.
///
/// A preview works on its own copy of the node's payload and never writes to
/// the graph. It runs next to the pipeline's own handle and does not affect
/// it. Dropping the handle cancels the preview.
pub struct PreviewHandle<P: Payload> {
    step: StepId,
    id: HandleId,
    events: Receiver<HandleEvent<P>>,
    handle: Option<ExecutionHandle>,
    done: bool,
}

impl<P: Payload> PreviewHandle<P> {
    /// The step this preview stops in front of.
    pub fn step(&self) -> StepId {
        self.step
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Returns the outcome if the preview is done. The outcome is handed out
    /// only once.
    pub fn poll(&mut self) -> Option<PreviewOutcome<P>> {
        if self.done {
            return None;
        }

        match self.events.try_recv() {
            Ok(event) => Some(self.conclude(event)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.done = true;
                Some(PreviewOutcome::Canceled)
            }
        }
    }

    /// Blocks until the preview is done.
    ///
    /// A preview of the first step of a node is resolved by
    /// [`Pipeline::tick`], so it must not be waited on from the thread that
    /// drives the pipeline.
    pub fn wait(mut self) -> PreviewOutcome<P> {
        if self.done {
            return PreviewOutcome::Canceled;
        }

        match self.events.recv() {
            Ok(event) => self.conclude(event),
            Err(_) => PreviewOutcome::Canceled,
        }
    }

    /// Like [`PreviewHandle::wait`], giving up after `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<PreviewOutcome<P>> {
        if self.done {
            return None;
        }

        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(self.conclude(event)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.done = true;
                Some(PreviewOutcome::Canceled)
            }
        }
    }

    /// Cancels the run behind the preview. A preview of a first step has no
    /// run and cannot be canceled.
    pub fn cancel(&self) -> bool {
        self.handle.as_ref().is_some_and(ExecutionHandle::cancel)
    }

    pub fn is_running(&self) -> bool {
        if self.done {
            return false;
        }

        match &self.handle {
            Some(handle) => handle.is_running(),
            None => self.events.is_empty(),
        }
    }

    fn conclude(&mut self, event: HandleEvent<P>) -> PreviewOutcome<P> {
        self.done = true;

        match event.outcome {
            Outcome::Finished(Ok(output)) => PreviewOutcome::Ready(output.payload),
            Outcome::Finished(Err(failure)) => PreviewOutcome::Failed(failure),
            Outcome::Canceled => PreviewOutcome::Canceled,
        }
    }
}

impl<P: Payload> Drop for PreviewHandle<P> {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }
}

impl<P: Payload> Pipeline<P> {
    /// Computes the payload the owning node of `step` would have right
    /// before `step` runs.
    pub fn preview_before(&mut self, step: StepId) -> Result<PreviewHandle<P>, PipelineError> {
        let (data, index) = self.graph.position(step)?;
        let payload = self.graph.copy_data(data)?;
        let (sink, events) = bounded(1);

        if index == 0 {
            let id = self.worker.next_id();
            self.deferred.push_back(Deferred::Resolve {
                sink,
                handle: id,
                payload,
            });

            return Ok(PreviewHandle {
                step,
                id,
                events,
                handle: None,
                done: false,
            });
        }

        let mut jobs = Vec::with_capacity(index);
        for &before in &self.graph.steps(data)?[..index] {
            let node = self.graph.step(before)?;
            jobs.push(StepJob::detached(before, node.transform().clone()));
        }

        tracing::debug!(%step, steps = jobs.len(), "previewing");
        let handle = self.worker.run(payload, jobs, sink);

        Ok(PreviewHandle {
            step,
            id: handle.id(),
            events,
            handle: Some(handle),
            done: false,
        })
    }
}
