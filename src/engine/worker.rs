use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_channel::Sender;
use tracing::Level;

use crate::core::{Options, Payload};
use crate::engine::handle::{Begin, Shared};
use crate::engine::{
    ExecutionHandle, Failure, HandleEvent, HandleId, Outcome, RunOutput, StepExecution,
    StepState, StepStatus,
};
use crate::error::{PipelineError, StepError};
use crate::graph::StepId;
use crate::transform::{StepContext, Transform};

/// One step scheduled in a run.
pub struct StepJob<P: Payload> {
    pub(crate) step: StepId,
    pub(crate) transform: Arc<dyn Transform<P>>,
    pub(crate) state: Arc<StepState>,
}

impl<P: Payload> StepJob<P> {
    pub(crate) fn new(step: StepId, transform: Arc<dyn Transform<P>>, state: Arc<StepState>) -> Self {
        Self {
            step,
            transform,
            state,
        }
    }

    /// A job whose state is not shared with the graph, used for previews.
    pub(crate) fn detached(step: StepId, transform: Arc<dyn Transform<P>>) -> Self {
        Self::new(step, transform, Arc::new(StepState::new()))
    }
}

/// Runs step lists off the controlling thread.
///
/// Every run gets its own [`ExecutionHandle`]; the steps of a run execute
/// sequentially on one pool thread, each fed the output of the previous one.
pub struct Worker {
    pool: rayon::ThreadPool,
    next: AtomicU64,
}

impl Worker {
    pub fn new(options: &Options) -> Result<Self, PipelineError> {
        let name = options.thread_name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.threads())
            .thread_name(move |index| format!("{name}-{index}"))
            .build()?;

        Ok(Self {
            pool,
            next: AtomicU64::new(0),
        })
    }

    pub(crate) fn next_id(&self) -> HandleId {
        HandleId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Starts running `jobs` on `payload`. The terminal [`HandleEvent`] is
    /// delivered on `sink`.
    pub fn run<P: Payload>(
        &self,
        payload: P,
        jobs: Vec<StepJob<P>>,
        sink: Sender<HandleEvent<P>>,
    ) -> ExecutionHandle {
        let id = self.next_id();
        let shared = Arc::new(Shared::new(jobs.len()));
        let steps = jobs.iter().map(|job| job.step).collect();

        for job in &jobs {
            job.state.reset();
        }

        tracing::debug!(handle = %id, steps = jobs.len(), "dispatching run");

        let thread_shared = shared.clone();
        self.pool
            .spawn(move || execute(id, thread_shared, payload, jobs, sink));

        ExecutionHandle::new(id, steps, shared)
    }
}

fn execute<P: Payload>(
    id: HandleId,
    shared: Arc<Shared>,
    mut payload: P,
    jobs: Vec<StepJob<P>>,
    sink: Sender<HandleEvent<P>>,
) {
    let span = tracing::span!(Level::DEBUG, "run", handle = %id);
    let _enter = span.enter();

    let mut ran = Vec::with_capacity(jobs.len());
    let mut children = Vec::new();
    let mut timings = Vec::with_capacity(jobs.len());
    let mut last_ran = None;

    let send = |outcome, timings| {
        // The receiving side is gone when the pipeline was dropped mid-run.
        let _ = sink.send(HandleEvent {
            handle: id,
            outcome,
            timings,
        });
    };

    for (index, job) in jobs.iter().enumerate() {
        match shared.begin(index) {
            Begin::Run => {}
            Begin::Skip => {
                tracing::debug!(step = %job.step, "step withdrawn");
                continue;
            }
            Begin::Stop => {
                job.state.set(StepStatus::Canceled);
                shared.conclude();
                tracing::debug!(step = %job.step, "run canceled");
                return send(Outcome::Canceled, timings);
            }
        }

        let name = job.transform.name();
        let step_span = tracing::span!(Level::DEBUG, "step", name = %name, step = %job.step);
        let mut context = StepContext::new(shared.flag(), step_span.clone());

        job.state.set(StepStatus::Running);
        let start = Instant::now();

        let result = {
            let _enter = step_span.enter();
            panic::catch_unwind(AssertUnwindSafe(|| {
                job.transform.apply(payload, &mut context)
            }))
        };

        let duration = start.elapsed();

        let error = match result {
            Ok(Ok(output)) => {
                payload = output;
                job.state.set(StepStatus::Finished);
                ran.push(job.step);
                last_ran = Some(&job.state);
                timings.push((job.step, StepExecution { start, duration }));

                if let Some(child) = context.take_child() {
                    children.push((job.step, child));
                }

                continue;
            }
            Ok(Err(error)) => StepError::Failed(name.to_string(), error),
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };

                StepError::Panicked(name.to_string(), message)
            }
        };

        if shared.conclude() {
            job.state.set(StepStatus::Canceled);
            return send(Outcome::Canceled, timings);
        }

        tracing::debug!(step = %job.step, "step failed: {error}");
        job.state.set(StepStatus::Failed);
        let failure = Failure {
            step: job.step,
            error: Arc::new(error),
        };
        return send(Outcome::Finished(Err(failure)), timings);
    }

    if shared.conclude() {
        // The output of the last step is thrown away with the run.
        if let Some(state) = last_ran {
            state.set(StepStatus::Canceled);
        }
        return send(Outcome::Canceled, timings);
    }

    let output = RunOutput {
        payload,
        ran,
        children,
    };
    send(Outcome::Finished(Ok(output)), timings);
}
