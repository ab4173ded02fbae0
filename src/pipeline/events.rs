use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::engine::{Failure, HandleEvent, HandleId, Outcome, RunOutput};
use crate::graph::{DataId, StepId};

/// How a pipeline run ended.
#[derive(Debug, Clone)]
pub enum Completion {
    /// The last branch without a further child finished.
    Success,
    /// A step failed. Nothing below it ran.
    Failed(Failure),
}

/// Notifications a pipeline sends to its observers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A run began while no other run was in progress.
    Started,
    /// The step list of a data node was handed to the worker.
    BranchStarted { data: DataId },
    /// The step list of a data node ran to completion.
    BranchFinished { data: DataId },
    /// The run ended, successfully or with a failed step.
    Finished(Completion),
    /// The run was canceled; nothing further was triggered.
    Canceled,
    /// A step got a new child data node.
    ChildCreated { step: StepId, data: DataId },
    /// An implicit child data node moved to a new owning step.
    ChildMoved { step: StepId, data: DataId },
    /// A child data node was discarded along with its own steps.
    ChildRemoved { data: DataId },
    /// The payload of a data node was replaced.
    DataChanged { data: DataId },
}

/// Observers registered with [`crate::Pipeline::subscribe`].
#[derive(Default)]
pub(crate) struct Observers {
    senders: Vec<Sender<PipelineEvent>>,
}

impl Observers {
    pub(crate) fn subscribe(&mut self) -> Receiver<PipelineEvent> {
        let (tx, rx) = unbounded();
        self.senders.push(tx);
        rx
    }

    /// Delivers an event to every observer, forgetting those that went away.
    pub(crate) fn emit(&mut self, event: PipelineEvent) {
        tracing::trace!(?event, "notify");
        self.senders.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

/// Work postponed to the next tick of the controlling thread.
pub(crate) enum Deferred<P> {
    Emit(PipelineEvent),
    Resolve {
        sink: Sender<HandleEvent<P>>,
        handle: HandleId,
        payload: P,
    },
    Callback(Box<dyn FnOnce() + Send>),
}

impl<P> Deferred<P> {
    pub(crate) fn run(self, observers: &mut Observers) {
        match self {
            Deferred::Emit(event) => observers.emit(event),
            Deferred::Resolve {
                sink,
                handle,
                payload,
            } => {
                let output = RunOutput {
                    payload,
                    ran: Vec::new(),
                    children: Vec::new(),
                };
                let _ = sink.send(HandleEvent {
                    handle,
                    outcome: Outcome::Finished(Ok(output)),
                    timings: Vec::new(),
                });
            }
            Deferred::Callback(callback) => callback(),
        }
    }
}
