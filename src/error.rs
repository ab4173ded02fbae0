use thiserror::Error;

use crate::graph::{DataId, StepId};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Data node {0} not found")]
    DataNotFound(DataId),

    #[error("Step {0} not found")]
    StepNotFound(StepId),

    #[error("Index {index} is out of bounds for data node {data} with {len} steps")]
    IndexOutOfBounds {
        data: DataId,
        index: usize,
        len: usize,
    },

    #[error("Replacement transform for step {0} changes its kind")]
    KindMismatch(StepId),

    #[error("Step {step} already owns data node {child}")]
    ChildOccupied { step: StepId, child: DataId },

    #[error("Failed to build the worker pool:\n{0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Why a step did not produce an output.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Step '{0}':\n{1}")]
    Failed(String, anyhow::Error),

    #[error("Step '{0}' panicked: {1}")]
    Panicked(String, String),
}

impl StepError {
    /// Name of the transform that failed.
    pub fn name(&self) -> &str {
        match self {
            StepError::Failed(name, _) => name,
            StepError::Panicked(name, _) => name,
        }
    }
}
