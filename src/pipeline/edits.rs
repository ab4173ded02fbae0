//! Reactions to structural edits of the graph.

use crate::core::Payload;
use crate::graph::{DataId, GraphEdit, StepId};
use crate::pipeline::events::Deferred;
use crate::pipeline::{Pipeline, PipelineEvent};

impl<P: Payload> Pipeline<P> {
    /// Drains the edits recorded by the graph and reacts to each of them.
    pub(crate) fn apply_edits(&mut self) {
        while let Some(edit) = self.graph.pop_edit() {
            tracing::trace!(?edit, "graph edit");

            match edit {
                GraphEdit::StepAdded { data, step } => self.on_step_added(data, step),
                GraphEdit::StepRemoved {
                    data,
                    step,
                    child,
                    explicit,
                } => self.on_step_removed(data, step, child, explicit),
                GraphEdit::StepMoved { data, .. } => {
                    self.relocate(data);
                    self.invalidate_below(data);
                    self.dispatch(data, None, true);
                }
                GraphEdit::TransformModified { step } => {
                    if let Ok(owner) = self.graph.owner(step) {
                        self.invalidate_below(owner);
                    }
                    self.execute_all();
                }
                GraphEdit::DataChanged { data } => {
                    self.observers.emit(PipelineEvent::DataChanged { data });
                    self.invalidate_below(data);
                    self.dispatch(data, None, true);
                }
            }
        }
    }

    fn on_step_added(&mut self, data: DataId, step: StepId) {
        if let Some(child) = self.graph.child(step) {
            self.observers.emit(PipelineEvent::ChildCreated { step, data: child });
        }

        // Whatever follows the new step saw a different input.
        let after: Vec<_> = match self.graph.position(step) {
            Ok((_, index)) => self
                .graph
                .steps(data)
                .map(|steps| steps[index + 1..].to_vec())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for later in after {
            if let Some(child) = self.graph.child(later) {
                self.invalidate(child);
            }
        }

        self.dispatch(data, Some(step), true);
        self.relocate(data);
    }

    fn on_step_removed(
        &mut self,
        data: DataId,
        step: StepId,
        child: Option<DataId>,
        explicit: bool,
    ) {
        if let Some(child) = child {
            if explicit {
                self.discard(child);
            } else {
                self.adopt(data, child);
            }
        }

        self.invalidate_below(data);
        self.diagnostics.forget(&self.graph);

        let withdrawn = self
            .active
            .as_ref()
            .is_some_and(|active| {
                !active.canceled && active.data == data && active.handle.cancel_from(step)
            });

        if withdrawn {
            tracing::debug!(%step, "step withdrawn from the active run");
        } else {
            self.dispatch(data, None, true);
        }

        if self.active.is_none() && self.in_progress {
            self.continue_run();
        }
    }

    /// Gives an orphaned implicit child to the last plain step of `data`, or
    /// discards it if there is none.
    fn adopt(&mut self, data: DataId, child: DataId) {
        let Some(target) = self.graph.continuation_step(data) else {
            return self.discard(child);
        };

        match self.graph.attach_child(target, child) {
            Ok(()) => {
                self.invalidate(child);
                self.observers.emit(PipelineEvent::ChildMoved {
                    step: target,
                    data: child,
                });
            }
            Err(error) => {
                tracing::error!(%error, "cannot relocate orphaned output");
                self.discard(child);
            }
        }
    }

    /// Moves the implicit child of `data` to the step that is now entitled to
    /// it. Observers learn about the move on the next tick.
    fn relocate(&mut self, data: DataId) {
        let (Some(target), Some(current)) = (
            self.graph.continuation_step(data),
            self.graph.transformed_step(data),
        ) else {
            return;
        };

        if target == current {
            return;
        }

        let Some(child) = self.graph.detach_child(current) else {
            return;
        };

        if let Err(error) = self.graph.attach_child(target, child) {
            tracing::error!(%error, "cannot relocate output");
            return self.discard(child);
        }

        tracing::debug!(from = %current, to = %target, %child, "output relocated");
        self.invalidate(child);
        self.deferred.push_back(Deferred::Emit(PipelineEvent::ChildMoved {
            step: target,
            data: child,
        }));
    }

    /// Removes a child data node and everything below it.
    pub(crate) fn discard(&mut self, data: DataId) {
        let removed = self.graph.discard(data);
        if removed.is_empty() {
            return;
        }

        self.pending.retain(|pending| !removed.contains(pending));

        if let Some(active) = self
            .active
            .take_if(|active| removed.contains(&active.data))
        {
            active.handle.cancel();
        }

        for data in removed {
            tracing::debug!(%data, "discarded");
            self.observers.emit(PipelineEvent::ChildRemoved { data });
        }

        self.diagnostics.forget(&self.graph);
    }

    /// Marks `data` and every node below it stale.
    pub(crate) fn invalidate(&mut self, data: DataId) {
        self.graph.set_stale(data);
        self.invalidate_below(data);
    }

    /// Marks every node below `data` stale.
    pub(crate) fn invalidate_below(&mut self, data: DataId) {
        let mut stack = vec![data];

        while let Some(current) = stack.pop() {
            let Ok(steps) = self.graph.steps(current) else {
                continue;
            };

            let children: Vec<_> = steps
                .iter()
                .filter_map(|&step| self.graph.child(step))
                .collect();

            for child in children {
                self.graph.set_stale(child);
                stack.push(child);
            }
        }
    }
}
