//! The data node / transform step arena.
//!
//! A pipeline is a tree of data nodes. Every data node owns an ordered list of
//! transform steps, and every step may own a single child data node, which in
//! turn owns its own steps, and so on.
//!
//! ## Arena
//!
//! Nodes and steps point at each other in both directions (node → step →
//! child node → producing step). Instead of shared owning references the whole
//! structure is kept in a single [`StableGraph`], whose indices survive the
//! removal of other vertices:
//!
//! * an `Owns` edge goes from a data node to each of its steps,
//! * a `Child` edge goes from a step to the data node it owns.
//!
//! Walking in either direction is an edge lookup on a vertex with at most one
//! incoming edge. The edge set carries no ordering, so the step order of each
//! data node is kept in the node itself.
//!
//! ## Edits
//!
//! Structural edits made through the public API of [`crate::Pipeline`] are
//! recorded as [`GraphEdit`] messages. The pipeline drains them and decides
//! what part of the tree has to run again. The repair operations used while
//! reacting (`attach_child`, `detach_child`, `discard`) do not record edits.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;

use crate::core::Payload;
use crate::engine::{StepState, StepStatus};
use crate::error::PipelineError;
use crate::transform::{StepKind, Transform};

/// Reference to a data node.
///
/// An id stays valid for as long as its node exists, whatever else is added to
/// or removed from the graph. Once the node is removed the id is dead: the
/// arena reuses vacated slots, so a later vertex may end up behind the same
/// index. Drop ids on [`crate::PipelineEvent::ChildRemoved`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(pub(crate) NodeIndex);

/// Reference to a transform step. Dead once the step is removed, see
/// [`DataId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(pub(crate) NodeIndex);

impl Display for DataId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "d{}", self.0.index())
    }
}

impl Display for StepId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0.index())
    }
}

/// A data source: a payload plus the ordered steps applied to it.
pub struct DataNode<P> {
    name: Cow<'static, str>,
    payload: P,
    steps: Vec<StepId>,
    stale: bool,
}

impl<P> DataNode<P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn steps(&self) -> &[StepId] {
        &self.steps
    }

    /// A stale node holds a payload computed before the latest (re)run of
    /// the branch that feeds it.
    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

/// A transform step in the step list of a data node.
pub struct StepNode<P: Payload> {
    name: Cow<'static, str>,
    kind: StepKind,
    transform: Arc<dyn Transform<P>>,
    state: Arc<StepState>,
}

impl<P: Payload> StepNode<P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    pub fn status(&self) -> StepStatus {
        self.state.get()
    }

    pub fn transform(&self) -> &Arc<dyn Transform<P>> {
        &self.transform
    }

    pub(crate) fn state(&self) -> &Arc<StepState> {
        &self.state
    }
}

enum Vertex<P: Payload> {
    Data(DataNode<P>),
    Step(StepNode<P>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Owns,
    Child,
}

/// Structural edit recorded by the graph for the pipeline to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GraphEdit {
    StepAdded {
        data: DataId,
        step: StepId,
    },
    StepRemoved {
        data: DataId,
        step: StepId,
        child: Option<DataId>,
        explicit: bool,
    },
    StepMoved {
        data: DataId,
        step: StepId,
    },
    TransformModified {
        step: StepId,
    },
    DataChanged {
        data: DataId,
    },
}

/// The tree of data nodes and transform steps of a single pipeline.
pub struct Graph<P: Payload> {
    inner: StableGraph<Vertex<P>, Link>,
    root: DataId,
    edits: VecDeque<GraphEdit>,
}

impl<P: Payload> Graph<P> {
    /// Creates a graph holding only the root data node.
    pub fn new(name: impl Into<Cow<'static, str>>, payload: P) -> Self {
        let mut inner = StableGraph::new();
        let root = inner.add_node(Vertex::Data(DataNode {
            name: name.into(),
            payload,
            steps: Vec::new(),
            stale: false,
        }));

        Self {
            inner,
            root: DataId(root),
            edits: VecDeque::new(),
        }
    }

    pub fn root(&self) -> DataId {
        self.root
    }

    pub fn data(&self, id: DataId) -> Result<&DataNode<P>, PipelineError> {
        match self.inner.node_weight(id.0) {
            Some(Vertex::Data(node)) => Ok(node),
            _ => Err(PipelineError::DataNotFound(id)),
        }
    }

    pub fn step(&self, id: StepId) -> Result<&StepNode<P>, PipelineError> {
        match self.inner.node_weight(id.0) {
            Some(Vertex::Step(node)) => Ok(node),
            _ => Err(PipelineError::StepNotFound(id)),
        }
    }

    pub fn contains_data(&self, id: DataId) -> bool {
        self.data(id).is_ok()
    }

    pub fn contains_step(&self, id: StepId) -> bool {
        self.step(id).is_ok()
    }

    /// All data nodes currently in the tree, in no particular order.
    pub fn data_ids(&self) -> impl Iterator<Item = DataId> + '_ {
        self.inner
            .node_indices()
            .filter(|&index| matches!(self.inner[index], Vertex::Data(_)))
            .map(DataId)
    }

    pub fn steps(&self, data: DataId) -> Result<&[StepId], PipelineError> {
        Ok(self.data(data)?.steps())
    }

    /// Returns a copy of the payload held by a data node.
    pub fn copy_data(&self, data: DataId) -> Result<P, PipelineError> {
        Ok(self.data(data)?.payload.clone())
    }

    /// The data node whose step list contains `step`.
    pub fn owner(&self, step: StepId) -> Result<DataId, PipelineError> {
        self.step(step)?;
        self.linked(step.0, Direction::Incoming, Link::Owns)
            .map(DataId)
            .ok_or(PipelineError::StepNotFound(step))
    }

    /// Child data node of a step, explicit or implicit.
    pub fn child(&self, step: StepId) -> Option<DataId> {
        self.step(step).ok()?;
        self.linked(step.0, Direction::Outgoing, Link::Child)
            .map(DataId)
    }

    /// The step that produced this data node, `None` for the root.
    pub fn producer(&self, data: DataId) -> Option<StepId> {
        self.data(data).ok()?;
        self.linked(data.0, Direction::Incoming, Link::Child)
            .map(StepId)
    }

    /// Position of a step in its owner's step list.
    pub fn position(&self, step: StepId) -> Result<(DataId, usize), PipelineError> {
        let owner = self.owner(step)?;
        let index = self
            .steps(owner)?
            .iter()
            .position(|&s| s == step)
            .ok_or(PipelineError::StepNotFound(step))?;

        Ok((owner, index))
    }

    /// The step holding the transformed payload of `data`: the last step that
    /// is not a producer and currently owns a child.
    pub fn transformed_step(&self, data: DataId) -> Option<StepId> {
        self.data(data).ok()?.steps.iter().rev().copied().find(|&step| {
            self.step(step).is_ok_and(|node| !node.kind.is_producer()) && self.child(step).is_some()
        })
    }

    /// The step entitled to own the implicit child of `data`: the last step
    /// that is not a producer.
    pub fn continuation_step(&self, data: DataId) -> Option<StepId> {
        self.data(data)
            .ok()?
            .steps
            .iter()
            .rev()
            .copied()
            .find(|&step| self.step(step).is_ok_and(|node| !node.kind.is_producer()))
    }

    pub(crate) fn push_step(
        &mut self,
        data: DataId,
        transform: Arc<dyn Transform<P>>,
    ) -> Result<StepId, PipelineError> {
        let len = self.steps(data)?.len();
        self.insert_step(data, len, transform)
    }

    pub(crate) fn insert_step(
        &mut self,
        data: DataId,
        index: usize,
        transform: Arc<dyn Transform<P>>,
    ) -> Result<StepId, PipelineError> {
        let len = self.steps(data)?.len();
        if index > len {
            return Err(PipelineError::IndexOutOfBounds { data, index, len });
        }

        let kind = transform.kind();
        let step = StepId(self.inner.add_node(Vertex::Step(StepNode {
            name: transform.name(),
            kind: kind.clone(),
            transform,
            state: Arc::new(StepState::new()),
        })));
        self.inner.add_edge(data.0, step.0, Link::Owns);
        self.data_mut(data)?.steps.insert(index, step);

        if let StepKind::Producer { child } = kind {
            let payload = self.copy_data(data)?;
            let child = self.add_data(child, payload);
            self.inner.add_edge(step.0, child.0, Link::Child);
        }

        self.edits.push_back(GraphEdit::StepAdded { data, step });
        Ok(step)
    }

    /// Removes a step from its owner. A child the step owned is left in the
    /// arena without a producer; the pipeline either relocates or discards it.
    pub(crate) fn remove_step(&mut self, step: StepId) -> Result<DataId, PipelineError> {
        let (data, index) = self.position(step)?;
        let explicit = self.step(step)?.kind.is_producer();
        let child = self.child(step);

        self.data_mut(data)?.steps.remove(index);
        self.inner.remove_node(step.0);

        self.edits.push_back(GraphEdit::StepRemoved {
            data,
            step,
            child,
            explicit,
        });
        Ok(data)
    }

    pub(crate) fn move_step(&mut self, step: StepId, to: usize) -> Result<DataId, PipelineError> {
        let (data, from) = self.position(step)?;
        let len = self.steps(data)?.len();
        if to >= len {
            return Err(PipelineError::IndexOutOfBounds {
                data,
                index: to,
                len,
            });
        }

        if from != to {
            let steps = &mut self.data_mut(data)?.steps;
            let step = steps.remove(from);
            steps.insert(to, step);
            self.edits.push_back(GraphEdit::StepMoved { data, step });
        }

        Ok(data)
    }

    /// Swaps the transform of a step. The kind of a step is fixed when it is
    /// created, so the replacement has to be of the same kind.
    pub(crate) fn replace_transform(
        &mut self,
        step: StepId,
        transform: Arc<dyn Transform<P>>,
    ) -> Result<(), PipelineError> {
        let node = self.step_mut(step)?;
        if transform.kind().is_producer() != node.kind.is_producer() {
            return Err(PipelineError::KindMismatch(step));
        }

        node.name = transform.name();
        node.transform = transform;
        node.state.reset();

        self.edits
            .push_back(GraphEdit::TransformModified { step });
        Ok(())
    }

    pub(crate) fn mark_modified(&mut self, step: StepId) -> Result<(), PipelineError> {
        self.step(step)?.state.reset();
        self.edits
            .push_back(GraphEdit::TransformModified { step });
        Ok(())
    }

    pub(crate) fn set_data(&mut self, data: DataId, payload: P) -> Result<(), PipelineError> {
        self.store_data(data, payload)?;
        self.edits.push_back(GraphEdit::DataChanged { data });
        Ok(())
    }

    /// Replaces the payload of a node without recording an edit.
    pub(crate) fn store_data(&mut self, data: DataId, payload: P) -> Result<(), PipelineError> {
        let node = self.data_mut(data)?;
        node.payload = payload;
        node.stale = false;
        Ok(())
    }

    pub(crate) fn set_stale(&mut self, data: DataId) {
        if let Ok(node) = self.data_mut(data) {
            node.stale = true;
        }
    }

    pub(crate) fn add_data(&mut self, name: impl Into<Cow<'static, str>>, payload: P) -> DataId {
        DataId(self.inner.add_node(Vertex::Data(DataNode {
            name: name.into(),
            payload,
            steps: Vec::new(),
            stale: false,
        })))
    }

    pub(crate) fn attach_child(&mut self, step: StepId, child: DataId) -> Result<(), PipelineError> {
        self.step(step)?;
        self.data(child)?;

        if let Some(existing) = self.child(step) {
            return Err(PipelineError::ChildOccupied {
                step,
                child: existing,
            });
        }

        self.inner.add_edge(step.0, child.0, Link::Child);
        Ok(())
    }

    pub(crate) fn detach_child(&mut self, step: StepId) -> Option<DataId> {
        let edge = self
            .inner
            .edges_directed(step.0, Direction::Outgoing)
            .find(|edge| *edge.weight() == Link::Child)?;
        let (id, child) = (edge.id(), edge.target());

        self.inner.remove_edge(id);
        Some(DataId(child))
    }

    /// Removes a data node together with everything below it and returns the
    /// ids of the removed data nodes, outermost first. The root is never
    /// removed.
    pub(crate) fn discard(&mut self, data: DataId) -> Vec<DataId> {
        let mut removed = Vec::new();
        if data == self.root || !self.contains_data(data) {
            return removed;
        }

        let mut queue = VecDeque::from([data]);
        while let Some(current) = queue.pop_front() {
            let steps = match self.data(current) {
                Ok(node) => node.steps.clone(),
                Err(_) => continue,
            };

            for step in steps {
                if let Some(child) = self.child(step) {
                    queue.push_back(child);
                }
                self.inner.remove_node(step.0);
            }

            self.inner.remove_node(current.0);
            removed.push(current);
        }

        removed
    }

    pub(crate) fn pop_edit(&mut self) -> Option<GraphEdit> {
        self.edits.pop_front()
    }

    pub(crate) fn clear_edits(&mut self) {
        self.edits.clear();
    }

    fn data_mut(&mut self, id: DataId) -> Result<&mut DataNode<P>, PipelineError> {
        match self.inner.node_weight_mut(id.0) {
            Some(Vertex::Data(node)) => Ok(node),
            _ => Err(PipelineError::DataNotFound(id)),
        }
    }

    fn step_mut(&mut self, id: StepId) -> Result<&mut StepNode<P>, PipelineError> {
        match self.inner.node_weight_mut(id.0) {
            Some(Vertex::Step(node)) => Ok(node),
            _ => Err(PipelineError::StepNotFound(id)),
        }
    }

    fn linked(&self, index: NodeIndex, direction: Direction, link: Link) -> Option<NodeIndex> {
        self.inner
            .edges_directed(index, direction)
            .find(|edge| *edge.weight() == link)
            .map(|edge| match direction {
                Direction::Outgoing => edge.target(),
                Direction::Incoming => edge.source(),
            })
    }
}

/// Renders the tree as a Mermaid flowchart. Explicit children hang off a
/// solid edge, the implicit transformed-payload child off a dotted one.
impl<P: Payload> Display for Graph<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let mut data_ids: Vec<_> = self.data_ids().collect();
        data_ids.sort();

        for data in data_ids {
            let Ok(node) = self.data(data) else { continue };
            let name = node.name().replace('"', "\\\"");
            writeln!(f, "    {data}[(\"{name}\")]")?;

            let mut previous = data.to_string();
            for &step in node.steps() {
                let Ok(step_node) = self.step(step) else { continue };
                let name = step_node.name().replace('"', "\\\"");
                writeln!(f, "    {step}[\"{name}\"]")?;
                writeln!(f, "    {previous} --> {step}")?;
                previous = step.to_string();

                if let Some(child) = self.child(step) {
                    match step_node.kind() {
                        StepKind::Producer { .. } => writeln!(f, "    {step} --> {child}")?,
                        StepKind::Transform => writeln!(f, "    {step} -.-> {child}")?,
                    }
                }
            }
        }

        Ok(())
    }
}
