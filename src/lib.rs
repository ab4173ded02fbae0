#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod core;
mod error;
pub mod engine;
pub mod graph;
#[cfg(feature = "logging")]
pub mod logging;
mod pipeline;
pub mod transform;

pub use crate::blueprint::{Blueprint, ProducerDef, StepDef};
pub use crate::core::{Options, Payload};
pub use crate::engine::{Diagnostics, ExecutionHandle, Failure, HandleId, StepStatus};
pub use crate::error::{PipelineError, StepError};
pub use crate::graph::{DataId, DataNode, Graph, StepId, StepNode};
pub use crate::pipeline::{Completion, Pipeline, PipelineEvent, PreviewHandle, PreviewOutcome};
pub use crate::transform::{StepContext, StepKind, Transform};
