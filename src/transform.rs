//! The transform step capability.
//!
//! A [`Transform`] is the unit of work inside a data node's step list. The
//! scheduler never looks inside one: it hands the transform a copy of the
//! payload, gets a new payload back, and decides from the step's [`StepKind`]
//! what to do with the result.

use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Span;

use crate::core::Payload;

/// What a step does besides transforming the payload it is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// A plain transform. The output continues down the chain, and the last
    /// plain step of a node keeps the transformed payload in an implicit child.
    Transform,
    /// A step that declares its own output dataset. The named child data node
    /// is created together with the step and belongs to it for its whole life.
    Producer {
        /// Name of the explicit child data node.
        child: Cow<'static, str>,
    },
}

impl StepKind {
    pub fn is_producer(&self) -> bool {
        matches!(self, StepKind::Producer { .. })
    }
}

/// Execution context handed to a running step.
pub struct StepContext<'a, P> {
    cancel: &'a AtomicBool,
    child: Option<P>,
    span: Span,
}

impl<'a, P> StepContext<'a, P> {
    pub(crate) fn new(cancel: &'a AtomicBool, span: Span) -> Self {
        Self {
            cancel,
            child: None,
            span,
        }
    }

    /// Whether the run this step belongs to was asked to stop. Long running
    /// steps can poll this and bail out early; whatever they return after a
    /// cancellation request is discarded.
    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Hands over the payload for the explicit child of a producer step. It is
    /// stored into the child once the whole branch succeeds. Calling this from
    /// a plain transform has no effect.
    pub fn set_child_data(&mut self, data: P) {
        self.child = Some(data);
    }

    /// The tracing span of this step.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn take_child(&mut self) -> Option<P> {
        self.child.take()
    }
}

pub trait Transform<P: Payload>: Send + Sync + 'static {
    /// Human readable name used in logs, errors and diagrams.
    fn name(&self) -> Cow<'static, str>;

    fn kind(&self) -> StepKind {
        StepKind::Transform
    }

    /// Runs the transform. Failing here fails the whole branch.
    fn apply(&self, input: P, context: &mut StepContext<'_, P>) -> anyhow::Result<P>;
}

/// Closure backed transform, see [`from_fn`] and [`producer_fn`].
pub struct TransformFn<P, F>
where
    P: Payload,
    F: Fn(P, &mut StepContext<'_, P>) -> anyhow::Result<P> + Send + Sync + 'static,
{
    name: Cow<'static, str>,
    kind: StepKind,
    callback: F,
    _phantom: PhantomData<fn(P) -> P>,
}

impl<P, F> Transform<P> for TransformFn<P, F>
where
    P: Payload,
    F: Fn(P, &mut StepContext<'_, P>) -> anyhow::Result<P> + Send + Sync + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn kind(&self) -> StepKind {
        self.kind.clone()
    }

    fn apply(&self, input: P, context: &mut StepContext<'_, P>) -> anyhow::Result<P> {
        (self.callback)(input, context)
    }
}

/// Creates a plain transform from a closure.
///
/// ```rust
/// use nagare::transform::{Transform, from_fn};
///
/// let double = from_fn("double", |input: i64| Ok(input * 2));
/// assert_eq!(double.name(), "double");
/// ```
pub fn from_fn<P, F>(
    name: impl Into<Cow<'static, str>>,
    callback: F,
) -> TransformFn<P, impl Fn(P, &mut StepContext<'_, P>) -> anyhow::Result<P> + Send + Sync + 'static>
where
    P: Payload,
    F: Fn(P) -> anyhow::Result<P> + Send + Sync + 'static,
{
    TransformFn {
        name: name.into(),
        kind: StepKind::Transform,
        callback: move |input: P, _: &mut StepContext<'_, P>| callback(input),
        _phantom: PhantomData,
    }
}

/// Creates a producer step from a closure. The closure delivers the explicit
/// child's payload through [`StepContext::set_child_data`].
pub fn producer_fn<P, F>(
    name: impl Into<Cow<'static, str>>,
    child: impl Into<Cow<'static, str>>,
    callback: F,
) -> TransformFn<P, F>
where
    P: Payload,
    F: Fn(P, &mut StepContext<'_, P>) -> anyhow::Result<P> + Send + Sync + 'static,
{
    TransformFn {
        name: name.into(),
        kind: StepKind::Producer {
            child: child.into(),
        },
        callback,
        _phantom: PhantomData,
    }
}
