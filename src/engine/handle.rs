use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::engine::StepExecution;
use crate::error::StepError;
use crate::graph::StepId;

/// Identifies one asynchronous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl Display for HandleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// A step that failed, and why.
#[derive(Debug, Clone)]
pub struct Failure {
    pub step: StepId,
    pub error: Arc<StepError>,
}

/// What a successful run produced.
#[derive(Debug)]
pub struct RunOutput<P> {
    /// Payload after the last step that ran.
    pub payload: P,
    /// Steps that actually ran, in order. Withdrawn steps are missing here.
    pub ran: Vec<StepId>,
    /// Payloads that producer steps handed over for their explicit children.
    pub children: Vec<(StepId, P)>,
}

/// Terminal outcome of a run.
#[derive(Debug)]
pub enum Outcome<P> {
    Finished(Result<RunOutput<P>, Failure>),
    Canceled,
}

/// The single terminal event of a run, sent exactly once.
#[derive(Debug)]
pub struct HandleEvent<P> {
    pub handle: HandleId,
    pub outcome: Outcome<P>,
    /// Timings of the steps that completed before the run ended.
    pub timings: Vec<(StepId, StepExecution)>,
}

#[derive(Debug)]
struct Progress {
    /// Index of the first step that has not started yet.
    next: usize,
    cancel_all: bool,
    withdrawn: Vec<bool>,
    terminal: bool,
}

pub(crate) enum Begin {
    Run,
    Skip,
    Stop,
}

/// State shared between a handle and the worker thread executing it.
#[derive(Debug)]
pub(crate) struct Shared {
    progress: Mutex<Progress>,
    cancel: AtomicBool,
}

impl Shared {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            progress: Mutex::new(Progress {
                next: 0,
                cancel_all: false,
                withdrawn: vec![false; len],
                terminal: false,
            }),
            cancel: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn flag(&self) -> &AtomicBool {
        &self.cancel
    }

    /// Called by the worker right before it starts step `index`. Once this
    /// returns `Run` the step can no longer be withdrawn.
    pub(crate) fn begin(&self, index: usize) -> Begin {
        let mut progress = self.lock();

        if progress.cancel_all {
            return Begin::Stop;
        }

        if progress.withdrawn.get(index).copied().unwrap_or(false) {
            return Begin::Skip;
        }

        progress.next = index + 1;
        Begin::Run
    }

    /// Marks the run as terminal. Returns `true` if the run was canceled, in
    /// which case the terminal event must be `Canceled` whatever the steps did.
    pub(crate) fn conclude(&self) -> bool {
        let mut progress = self.lock();
        progress.terminal = true;
        progress.cancel_all
    }

    fn cancel(&self) -> bool {
        let mut progress = self.lock();
        if progress.terminal {
            return false;
        }

        progress.cancel_all = true;
        self.cancel.store(true, Ordering::Release);
        true
    }

    fn withdraw(&self, index: usize) -> bool {
        let mut progress = self.lock();
        if progress.terminal || index < progress.next {
            return false;
        }

        match progress.withdrawn.get_mut(index) {
            Some(slot) => {
                *slot = true;
                true
            }
            None => false,
        }
    }

    fn is_terminal(&self) -> bool {
        self.lock().terminal
    }

    fn is_cancel_requested(&self) -> bool {
        self.lock().cancel_all
    }
}

/// Handle to one asynchronous run of a step list, see [`crate::engine::Worker`].
///
/// The run reports back through the event sink it was started with; the
/// handle itself only observes and steers it.
#[derive(Debug)]
pub struct ExecutionHandle {
    id: HandleId,
    steps: Vec<StepId>,
    shared: Arc<Shared>,
}

impl ExecutionHandle {
    pub(crate) fn new(id: HandleId, steps: Vec<StepId>, shared: Arc<Shared>) -> Self {
        Self { id, steps, shared }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The step list this run was started with.
    pub fn steps(&self) -> &[StepId] {
        &self.steps
    }

    /// Requests the run to stop. No further step starts; a step already in
    /// flight finishes (or notices [`crate::StepContext::is_canceled`]) and
    /// its output is thrown away.
    ///
    /// Returns `true` if the run will end with a `Canceled` event, `false` if
    /// it already reached its terminal state.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// Withdraws a single step from the run.
    ///
    /// The safety boundary is the start of the step: a step that has not
    /// started yet is skipped and the run carries on with the remaining steps
    /// on the output of the step before it. Once the step has started, or if
    /// it is not part of this run, this returns `false` and the caller has to
    /// run the branch again from scratch.
    pub fn cancel_from(&self, step: StepId) -> bool {
        match self.steps.iter().position(|&s| s == step) {
            Some(index) => self.shared.withdraw(index),
            None => false,
        }
    }

    /// Whether the run has not reached its terminal state yet.
    pub fn is_running(&self) -> bool {
        !self.shared.is_terminal()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.is_cancel_requested()
    }
}
