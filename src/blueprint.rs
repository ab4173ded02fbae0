use std::any::type_name;
use std::borrow::Cow;
use std::sync::Arc;

use crate::core::{Options, Payload};
use crate::error::PipelineError;
use crate::graph::{DataId, Graph, StepId};
use crate::pipeline::Pipeline;
use crate::transform::{StepContext, Transform, from_fn, producer_fn};

/// The blueprint for a pipeline.
///
/// `Blueprint` is used to lay out the initial tree of data nodes and steps
/// and to pick the [`Options`]. Nothing runs while the blueprint is being
/// built; once configured, convert it into a [`Pipeline`] with
/// [`Blueprint::finish`].
///
/// # Example
///
/// ```rust
/// use nagare::Blueprint;
///
/// let mut blueprint = Blueprint::new("Volume", 1_i64);
/// let root = blueprint.root();
///
/// blueprint.step(root).name("double").run(|x| Ok(x * 2)).unwrap();
/// let pipeline = blueprint.finish().unwrap();
/// assert_eq!(pipeline.graph().steps(root).unwrap().len(), 1);
/// ```
pub struct Blueprint<P: Payload> {
    graph: Graph<P>,
    options: Options,
}

impl<P: Payload> Blueprint<P> {
    /// Creates a blueprint holding only the root data node.
    pub fn new(name: impl Into<Cow<'static, str>>, payload: P) -> Self {
        Self {
            graph: Graph::new(name, payload),
            options: Options::default(),
        }
    }

    pub fn root(&self) -> DataId {
        self.graph.root()
    }

    pub fn graph(&self) -> &Graph<P> {
        &self.graph
    }

    pub fn options(&mut self, options: Options) -> &mut Self {
        self.options = options;
        self
    }

    /// Appends a step to a data node.
    pub fn add_step(
        &mut self,
        data: DataId,
        transform: impl Transform<P>,
    ) -> Result<StepId, PipelineError> {
        self.graph.push_step(data, Arc::new(transform))
    }

    /// The child data node of a step. Producer steps get theirs as soon as
    /// they are added.
    pub fn child(&self, step: StepId) -> Option<DataId> {
        self.graph.child(step)
    }

    /// Starts defining a closure backed step on a data node.
    pub fn step(&mut self, data: DataId) -> StepDef<'_, P> {
        StepDef {
            blueprint: self,
            data,
            name: None,
        }
    }

    /// Spins up the worker pool and hands the graph over to a pipeline. The
    /// pipeline starts idle, or paused if [`Options::start_paused`] is set.
    pub fn finish(self) -> Result<Pipeline<P>, PipelineError> {
        Pipeline::from_parts(self.graph, self.options)
    }
}

impl<P: Payload> std::fmt::Display for Blueprint<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.graph)
    }
}

pub struct StepDef<'a, P: Payload> {
    blueprint: &'a mut Blueprint<P>,
    data: DataId,
    name: Option<Cow<'static, str>>,
}

impl<'a, P: Payload> StepDef<'a, P> {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares that the step produces its own named child data node.
    pub fn produces(self, child: impl Into<Cow<'static, str>>) -> ProducerDef<'a, P> {
        ProducerDef {
            blueprint: self.blueprint,
            data: self.data,
            name: self.name,
            child: child.into(),
        }
    }

    pub fn run<F>(self, callback: F) -> Result<StepId, PipelineError>
    where
        F: Fn(P) -> anyhow::Result<P> + Send + Sync + 'static,
    {
        let name = self.name.unwrap_or(type_name::<F>().into());
        self.blueprint.add_step(self.data, from_fn(name, callback))
    }
}

pub struct ProducerDef<'a, P: Payload> {
    blueprint: &'a mut Blueprint<P>,
    data: DataId,
    name: Option<Cow<'static, str>>,
    child: Cow<'static, str>,
}

impl<P: Payload> ProducerDef<'_, P> {
    pub fn run<F>(self, callback: F) -> Result<StepId, PipelineError>
    where
        F: Fn(P, &mut StepContext<'_, P>) -> anyhow::Result<P> + Send + Sync + 'static,
    {
        let name = self.name.unwrap_or(type_name::<F>().into());
        self.blueprint
            .add_step(self.data, producer_fn(name, self.child, callback))
    }
}
