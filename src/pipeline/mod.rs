//! The pipeline coordinator.
//!
//! A [`Pipeline`] owns the graph and decides which branch has to run and from
//! where. It never blocks on a run: every run reports back over a channel, and
//! the reports are processed on the controlling thread whenever it calls
//! [`Pipeline::tick`] (or [`Pipeline::wait_idle`]).
//!
//! ## Runs and branches
//!
//! A *branch* is the step list of one data node. A *run* starts with a
//! [`PipelineEvent::Started`] and then executes branches one at a time: when a
//! branch succeeds, the children it fed are queued and run next, until the
//! queue is empty and [`PipelineEvent::Finished`] is sent. A run that is
//! canceled sends [`PipelineEvent::Canceled`] instead.
//!
//! At most one [`ExecutionHandle`] is active per pipeline. Dispatching a new
//! branch always cancels the previous handle first; reports from handles that
//! are no longer active are dropped.

mod edits;
mod events;
mod preview;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::blueprint::Blueprint;
use crate::core::{Options, Payload};
use crate::engine::{
    Diagnostics, ExecutionHandle, HandleEvent, HandleId, Outcome, RunOutput, StepJob, StepStatus,
    Worker,
};
use crate::error::PipelineError;
use crate::graph::{DataId, Graph, StepId};
use crate::transform::Transform;

pub use crate::pipeline::events::{Completion, PipelineEvent};
pub use crate::pipeline::preview::{PreviewHandle, PreviewOutcome};

use crate::pipeline::events::{Deferred, Observers};

type Callback = Box<dyn FnOnce() + Send>;

/// The handle currently running on behalf of the pipeline.
struct Active {
    handle: ExecutionHandle,
    data: DataId,
    /// Canceled by the user. The run already ended, so whatever the handle
    /// reports is ignored.
    canceled: bool,
}

/// A tree of data nodes and transform steps, re-executed incrementally.
///
/// See the [crate documentation](crate) for an overview.
pub struct Pipeline<P: Payload> {
    graph: Graph<P>,
    options: Options,
    worker: Worker,
    observers: Observers,
    deferred: VecDeque<Deferred<P>>,
    sink: Sender<HandleEvent<P>>,
    events: Receiver<HandleEvent<P>>,
    active: Option<Active>,
    /// Branches waiting to run as part of the current run.
    pending: VecDeque<DataId>,
    callbacks: HashMap<HandleId, Vec<Callback>>,
    in_progress: bool,
    paused: bool,
    diagnostics: Diagnostics,
}

impl<P: Payload> Pipeline<P> {
    /// Creates a pipeline with a root data node and default options.
    pub fn new(
        name: impl Into<std::borrow::Cow<'static, str>>,
        payload: P,
    ) -> Result<Self, PipelineError> {
        Blueprint::new(name, payload).finish()
    }

    pub(crate) fn from_parts(mut graph: Graph<P>, options: Options) -> Result<Self, PipelineError> {
        let worker = Worker::new(&options)?;
        let (sink, events) = unbounded();
        graph.clear_edits();

        tracing::debug!(threads = options.threads(), "pipeline ready");

        Ok(Self {
            graph,
            paused: options.start_paused,
            options,
            worker,
            observers: Observers::default(),
            deferred: VecDeque::new(),
            sink,
            events,
            active: None,
            pending: VecDeque::new(),
            callbacks: HashMap::new(),
            in_progress: false,
            diagnostics: Diagnostics::default(),
        })
    }

    pub fn graph(&self) -> &Graph<P> {
        &self.graph
    }

    pub fn root(&self) -> DataId {
        self.graph.root()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Registers a new observer. Dropping the receiver unsubscribes it.
    pub fn subscribe(&mut self) -> Receiver<PipelineEvent> {
        self.observers.subscribe()
    }

    /// Timings of the latest successful execution of every step.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Appends a step to a data node and runs the node's branch from it.
    pub fn add_step(
        &mut self,
        data: DataId,
        transform: impl Transform<P>,
    ) -> Result<StepId, PipelineError> {
        let step = self.graph.push_step(data, Arc::new(transform))?;
        self.apply_edits();
        Ok(step)
    }

    /// Inserts a step at `index` of a data node and runs the node's branch
    /// from it.
    pub fn insert_step(
        &mut self,
        data: DataId,
        index: usize,
        transform: impl Transform<P>,
    ) -> Result<StepId, PipelineError> {
        let step = self.graph.insert_step(data, index, Arc::new(transform))?;
        self.apply_edits();
        Ok(step)
    }

    /// Removes a step. Its implicit child moves to the new last plain step of
    /// the node, or is discarded together with its subtree if there is none.
    /// An explicit child is always discarded.
    pub fn remove_step(&mut self, step: StepId) -> Result<(), PipelineError> {
        self.graph.remove_step(step)?;
        self.apply_edits();
        Ok(())
    }

    /// Moves a step to position `to` in its node and re-runs the node.
    pub fn move_step(&mut self, step: StepId, to: usize) -> Result<(), PipelineError> {
        self.graph.move_step(step, to)?;
        self.apply_edits();
        Ok(())
    }

    /// Swaps the transform of a step, which re-runs the whole pipeline.
    pub fn replace_transform(
        &mut self,
        step: StepId,
        transform: impl Transform<P>,
    ) -> Result<(), PipelineError> {
        self.graph.replace_transform(step, Arc::new(transform))?;
        self.apply_edits();
        Ok(())
    }

    /// Tells the pipeline that the parameters of a step changed behind its
    /// back, which re-runs the whole pipeline.
    pub fn notify_transform_modified(&mut self, step: StepId) -> Result<(), PipelineError> {
        self.graph.mark_modified(step)?;
        self.apply_edits();
        Ok(())
    }

    /// Replaces the payload of a data node and re-runs its branch.
    pub fn set_data(&mut self, data: DataId, payload: P) -> Result<(), PipelineError> {
        self.graph.set_data(data, payload)?;
        self.apply_edits();
        Ok(())
    }

    /// Aborts whatever is running and executes the root branch from scratch.
    pub fn execute_all(&mut self) {
        if self.paused {
            return;
        }

        let root = self.graph.root();
        if self.graph.steps(root).map_or(true, <[StepId]>::is_empty) {
            return;
        }

        if let Some(active) = self.active.take() {
            active.handle.cancel();
        }

        self.pending.clear();
        if self.in_progress {
            self.stop(PipelineEvent::Canceled);
        }

        self.dispatch(root, None, false);
    }

    /// Executes the branch of `data`. With `from` set, the steps before it are
    /// not run again if the payload they produced is still cached.
    pub fn execute_from(&mut self, data: DataId, from: Option<StepId>) -> Result<(), PipelineError> {
        let steps = self.graph.steps(data)?;
        if let Some(step) = from
            && !steps.contains(&step)
        {
            return Err(PipelineError::StepNotFound(step));
        }

        self.dispatch(data, from, true);
        Ok(())
    }

    /// While paused every execution request is ignored.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self, auto_run: bool) {
        self.paused = false;
        if auto_run {
            self.execute_all();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Cancels the current run. Observers get [`PipelineEvent::Canceled`]
    /// right away; the next execution request opens a new run.
    pub fn cancel(&mut self) {
        self.request_cancel(None);
    }

    /// Cancels the current run and calls `on_canceled` once the active handle
    /// reported back. With nothing running the callback is called on the next
    /// tick.
    pub fn cancel_with(&mut self, on_canceled: impl FnOnce() + Send + 'static) {
        self.request_cancel(Some(Box::new(on_canceled)));
    }

    /// Whether a handle is active and has not reached its terminal state.
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.handle.is_running())
    }

    /// Processes deferred work and every report that arrived from the
    /// worker, without blocking.
    pub fn tick(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        for task in deferred {
            task.run(&mut self.observers);
        }

        self.apply_edits();

        while let Ok(event) = self.events.try_recv() {
            self.on_handle_event(event);
        }
    }

    /// Drives [`Pipeline::tick`] until no handle is active and nothing is
    /// deferred. Returns `false` if that did not happen within `timeout`.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            self.tick();

            if self.active.is_none() && self.deferred.is_empty() {
                return true;
            }

            if Instant::now() >= deadline {
                return false;
            }

            if self.deferred.is_empty()
                && let Ok(event) = self.events.recv_deadline(deadline)
            {
                self.on_handle_event(event);
            }
        }
    }

    fn request_cancel(&mut self, callback: Option<Callback>) {
        self.pending.clear();

        match &mut self.active {
            Some(active) => {
                active.canceled = true;
                active.handle.cancel();
                tracing::debug!(handle = %active.handle.id(), "cancel requested");

                if let Some(callback) = callback {
                    self.callbacks
                        .entry(active.handle.id())
                        .or_default()
                        .push(callback);
                }

                if self.in_progress {
                    self.stop(PipelineEvent::Canceled);
                }
            }
            None => {
                if let Some(callback) = callback {
                    self.deferred.push_back(Deferred::Callback(callback));
                }
            }
        }
    }

    /// Hands the branch of `data` to the worker. Returns `false` if nothing
    /// was dispatched.
    fn dispatch(&mut self, data: DataId, from: Option<StepId>, requeue: bool) -> bool {
        if self.paused {
            return false;
        }

        let steps = match self.graph.steps(data) {
            Ok(steps) if !steps.is_empty() => steps.to_vec(),
            _ => return false,
        };

        self.preempt(data, requeue);
        self.pending.retain(|&pending| pending != data);

        let (payload, start) = match self.resume_point(&steps, from) {
            Some(found) => found,
            None => match self.graph.copy_data(data) {
                Ok(payload) => (payload, 0),
                Err(_) => return false,
            },
        };

        let mut jobs = Vec::with_capacity(steps.len() - start);
        for &step in &steps[start..] {
            let Ok(node) = self.graph.step(step) else { continue };
            jobs.push(StepJob::new(
                step,
                node.transform().clone(),
                node.state().clone(),
            ));

            if let Some(child) = self.graph.child(step) {
                self.invalidate(child);
            }
        }

        if !self.in_progress {
            self.in_progress = true;
            self.observers.emit(PipelineEvent::Started);
        }
        self.observers.emit(PipelineEvent::BranchStarted { data });

        tracing::debug!(%data, start, steps = jobs.len(), "running branch");
        let handle = self.worker.run(payload, jobs, self.sink.clone());
        self.active = Some(Active {
            handle,
            data,
            canceled: false,
        });

        true
    }

    /// Cancels the active handle so another branch can take its place. A
    /// branch of another data node that gets interrupted this way is queued to
    /// run again when `requeue` is set.
    fn preempt(&mut self, data: DataId, requeue: bool) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.handle.cancel();
        tracing::debug!(handle = %active.handle.id(), "preempted");

        if requeue
            && !active.canceled
            && active.data != data
            && self.graph.contains_data(active.data)
            && !self.pending.contains(&active.data)
        {
            self.pending.push_back(active.data);
        }
    }

    /// Finds a cached payload to resume from, right before `from`.
    ///
    /// Canceled steps before the resume point are reset and force a run of
    /// the whole step list.
    fn resume_point(&self, steps: &[StepId], from: Option<StepId>) -> Option<(P, usize)> {
        let index = steps.iter().position(|&step| Some(step) == from)?;

        let mut canceled = false;
        for &step in &steps[..index] {
            if let Ok(node) = self.graph.step(step)
                && node.state().is_canceled()
            {
                node.state().reset();
                canceled = true;
            }
        }

        if canceled || index == 0 {
            return None;
        }

        let previous = steps[index - 1];
        let node = self.graph.step(previous).ok()?;
        if node.kind().is_producer() || node.status() != StepStatus::Finished {
            return None;
        }

        let child = self.graph.data(self.graph.child(previous)?).ok()?;
        if child.is_stale() {
            return None;
        }

        Some((child.payload().clone(), index))
    }

    fn on_handle_event(&mut self, event: HandleEvent<P>) {
        let callbacks = self.callbacks.remove(&event.handle).unwrap_or_default();

        match self.active.take_if(|active| active.handle.id() == event.handle) {
            // The run of a handle canceled by the user already ended.
            Some(active) if active.canceled => {
                tracing::trace!(handle = %event.handle, "canceled handle reported back");
            }
            Some(active) => match event.outcome {
                Outcome::Canceled => self.stop(PipelineEvent::Canceled),
                Outcome::Finished(Err(failure)) => {
                    tracing::warn!(step = %failure.step, "branch failed: {}", failure.error);
                    self.stop(PipelineEvent::Finished(Completion::Failed(failure)));
                }
                Outcome::Finished(Ok(output)) => {
                    self.diagnostics.record(event.timings);
                    self.on_branch_finished(active.data, output);
                }
            },
            None => tracing::trace!(handle = %event.handle, "dropping report of inactive handle"),
        }

        for callback in callbacks {
            callback();
        }
    }

    fn on_branch_finished(&mut self, data: DataId, output: RunOutput<P>) {
        let RunOutput {
            payload,
            ran,
            children,
        } = output;

        for (step, payload) in children {
            let Some(child) = self.graph.child(step) else {
                continue;
            };

            if self.graph.store_data(child, payload).is_ok() {
                self.invalidate_below(child);
                self.observers.emit(PipelineEvent::DataChanged { data: child });
            }
        }

        // Withdrawn steps are gone from the node, so its last step is the one
        // the result belongs to.
        let last = self
            .graph
            .steps(data)
            .ok()
            .and_then(|steps| steps.last().copied());

        if let Some(last) = last {
            self.store_transformed(last, payload);
        }

        let mut next = Vec::new();
        for step in ran.iter().copied().chain(last) {
            let Some(child) = self.graph.child(step) else {
                continue;
            };

            let has_steps = self.graph.steps(child).is_ok_and(|steps| !steps.is_empty());
            if has_steps && !next.contains(&child) {
                next.push(child);
            }
        }

        self.pending.retain(|pending| !next.contains(pending));
        for child in next.into_iter().rev() {
            self.pending.push_front(child);
        }

        self.observers.emit(PipelineEvent::BranchFinished { data });
        self.continue_run();
    }

    /// Stores the output of a branch into the implicit child of its last
    /// step, creating the child the first time.
    fn store_transformed(&mut self, last: StepId, payload: P) {
        let Ok(node) = self.graph.step(last) else {
            return;
        };
        if node.kind().is_producer() {
            return;
        }

        match self.graph.child(last) {
            Some(child) => {
                if self.graph.store_data(child, payload).is_ok() {
                    self.invalidate_below(child);
                    self.observers.emit(PipelineEvent::DataChanged { data: child });
                }
            }
            None => {
                let child = self.graph.add_data(self.options.child_name(), payload);
                if let Err(error) = self.graph.attach_child(last, child) {
                    tracing::error!(%error, "cannot attach output");
                    self.graph.discard(child);
                    return;
                }

                tracing::debug!(step = %last, %child, "output created");
                self.observers.emit(PipelineEvent::ChildCreated { step: last, data: child });
            }
        }
    }

    /// Dispatches the next queued branch, or ends the run.
    fn continue_run(&mut self) {
        if self.paused && !self.pending.is_empty() {
            return self.stop(PipelineEvent::Canceled);
        }

        while let Some(data) = self.pending.pop_front() {
            if self.dispatch(data, None, false) {
                return;
            }
        }

        self.in_progress = false;
        self.observers.emit(PipelineEvent::Finished(Completion::Success));
    }

    /// Ends the current run early.
    fn stop(&mut self, event: PipelineEvent) {
        self.pending.clear();
        self.in_progress = false;
        self.observers.emit(event);
    }
}

impl<P: Payload> Drop for Pipeline<P> {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.handle.cancel();
        }
    }
}
