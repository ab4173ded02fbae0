use std::sync::atomic::{AtomicU8, Ordering};

/// Execution state of a single transform step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StepStatus {
    /// Waiting to be run, either never run or invalidated by an edit.
    Pending = 0,
    /// Currently executing on a worker thread.
    Running = 1,
    /// Produced its output in the latest run.
    Finished = 2,
    /// The run it was part of was canceled before or while it executed.
    Canceled = 3,
    /// Returned an error or panicked.
    Failed = 4,
}

impl StepStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StepStatus::Running,
            2 => StepStatus::Finished,
            3 => StepStatus::Canceled,
            4 => StepStatus::Failed,
            _ => StepStatus::Pending,
        }
    }
}

/// State cell shared between the graph and the worker thread running the step.
#[derive(Debug, Default)]
pub struct StepState(AtomicU8);

impl StepState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> StepStatus {
        StepStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: StepStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    pub fn reset(&self) {
        self.set(StepStatus::Pending);
    }

    pub fn is_canceled(&self) -> bool {
        self.get() == StepStatus::Canceled
    }
}
