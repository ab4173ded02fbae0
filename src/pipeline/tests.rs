use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use super::*;
use crate::Options;
use crate::transform::{StepContext, from_fn, producer_fn};

const TIMEOUT: Duration = Duration::from_secs(10);

fn pipeline(payload: i64) -> Pipeline<i64> {
    let mut blueprint = Blueprint::new("Volume", payload);
    blueprint.options(Options {
        worker_threads: 4,
        ..Default::default()
    });
    blueprint.finish().unwrap()
}

fn drain(events: &Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    events.try_iter().collect()
}

fn count(events: &[PipelineEvent], f: impl Fn(&PipelineEvent) -> bool) -> usize {
    events.iter().filter(|event| f(event)).count()
}

fn payload_of(pipeline: &Pipeline<i64>, data: DataId) -> i64 {
    *pipeline.graph().data(data).unwrap().payload()
}

/// Plain step that counts its invocations.
struct Counted {
    name: &'static str,
    add: i64,
    calls: Arc<AtomicUsize>,
}

impl Counted {
    fn new(name: &'static str, add: i64) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = Self {
            name,
            add,
            calls: calls.clone(),
        };
        (step, calls)
    }
}

impl Transform<i64> for Counted {
    fn name(&self) -> Cow<'static, str> {
        self.name.into()
    }

    fn apply(&self, input: i64, _: &mut StepContext<'_, i64>) -> anyhow::Result<i64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(input + self.add)
    }
}

/// Step that announces every invocation and blocks until released or
/// canceled.
struct Gate {
    add: i64,
    entered: Sender<()>,
    release: Receiver<()>,
}

struct GateControl {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl GateControl {
    fn wait_entered(&self) {
        self.entered.recv_timeout(TIMEOUT).unwrap();
    }

    /// Waits for the gate while ticking, for when the pipeline has to react
    /// to reports before it dispatches the gated branch.
    fn wait_entered_ticking(&self, pipeline: &mut Pipeline<i64>) {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            pipeline.tick();
            if self.entered.recv_timeout(Duration::from_millis(5)).is_ok() {
                return;
            }
            assert!(Instant::now() < deadline, "gate was never entered");
        }
    }

    fn open(&self) {
        self.release.send(()).unwrap();
    }
}

fn gate(add: i64) -> (Gate, GateControl) {
    let (entered_tx, entered_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    (
        Gate {
            add,
            entered: entered_tx,
            release: release_rx,
        },
        GateControl {
            entered: entered_rx,
            release: release_tx,
        },
    )
}

impl Transform<i64> for Gate {
    fn name(&self) -> Cow<'static, str> {
        "gate".into()
    }

    fn apply(&self, input: i64, context: &mut StepContext<'_, i64>) -> anyhow::Result<i64> {
        let _ = self.entered.send(());
        while !context.is_canceled() {
            if self.release.recv_timeout(Duration::from_millis(5)).is_ok() {
                break;
            }
        }
        Ok(input + self.add)
    }
}

#[test]
fn test_empty_branch_is_noop() {
    let mut pipeline = pipeline(1);
    let events = pipeline.subscribe();

    pipeline.execute_all();
    pipeline.execute_from(pipeline.root(), None).unwrap();

    assert!(!pipeline.is_running());
    assert!(pipeline.wait_idle(TIMEOUT));
    assert!(drain(&events).is_empty());
}

#[test]
fn test_linear_run_creates_output() {
    let mut blueprint = Blueprint::new("Volume", 1_i64);
    let root = blueprint.root();
    blueprint.add_step(root, from_fn("add", |x: i64| Ok(x + 2))).unwrap();
    let s2 = blueprint.add_step(root, from_fn("mul", |x: i64| Ok(x * 10))).unwrap();
    let mut pipeline = blueprint.finish().unwrap();
    let events = pipeline.subscribe();

    pipeline.execute_all();
    assert!(pipeline.wait_idle(TIMEOUT));

    let events = drain(&events);
    assert!(matches!(events.first(), Some(PipelineEvent::Started)));
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::Finished(Completion::Success))
    ));
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::ChildCreated { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::Finished(_))), 1);

    let output = pipeline.graph().child(s2).unwrap();
    assert_eq!(payload_of(&pipeline, output), 30);
    assert_eq!(payload_of(&pipeline, root), 1);
    assert_eq!(pipeline.graph().data(output).unwrap().name(), "Output");
    assert_eq!(pipeline.graph().producer(output), Some(s2));
    assert!(!pipeline.graph().data(output).unwrap().is_stale());
}

#[test]
fn test_run_continues_into_explicit_child() {
    let mut blueprint = Blueprint::new("Volume", 1_i64);
    let root = blueprint.root();
    blueprint.add_step(root, from_fn("s1", |x: i64| Ok(x + 1))).unwrap();
    let s2 = blueprint
        .add_step(
            root,
            producer_fn("recon", "Reconstruction", |x: i64, ctx: &mut StepContext<'_, i64>| {
                ctx.set_child_data(x * 100);
                Ok(x)
            }),
        )
        .unwrap();
    let s3 = blueprint.add_step(root, from_fn("s3", |x: i64| Ok(x + 3))).unwrap();

    let recon = blueprint.child(s2).unwrap();
    let t1 = blueprint.add_step(recon, from_fn("t1", |x: i64| Ok(x - 1))).unwrap();
    let mut pipeline = blueprint.finish().unwrap();
    let events = pipeline.subscribe();

    pipeline.execute_all();
    assert!(pipeline.wait_idle(TIMEOUT));
    let events = drain(&events);

    let branches: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::BranchStarted { data } => Some(("start", *data)),
            PipelineEvent::BranchFinished { data } => Some(("end", *data)),
            _ => None,
        })
        .collect();
    assert_eq!(
        branches,
        vec![("start", root), ("end", root), ("start", recon), ("end", recon)]
    );
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::Started)), 1);
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::Finished(Completion::Success))
    ));

    assert_eq!(payload_of(&pipeline, recon), 200);
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(s3).unwrap()), 5);
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(t1).unwrap()), 199);
}

#[test]
fn test_execute_all_is_idempotent() {
    let mut blueprint = Blueprint::new("Volume", 3_i64);
    let root = blueprint.root();
    let s1 = blueprint.add_step(root, from_fn("s1", |x: i64| Ok(x * 3))).unwrap();
    let mut pipeline = blueprint.finish().unwrap();

    pipeline.execute_all();
    assert!(pipeline.wait_idle(TIMEOUT));
    let output = pipeline.graph().child(s1).unwrap();
    let first = payload_of(&pipeline, output);

    pipeline.execute_all();
    assert!(pipeline.wait_idle(TIMEOUT));

    assert_eq!(pipeline.graph().child(s1), Some(output));
    assert_eq!(payload_of(&pipeline, output), first);
    assert_eq!(pipeline.graph().data_ids().count(), 2);
}

#[test]
fn test_added_step_takes_output() {
    let (s1, s1_calls) = Counted::new("s1", 1);
    let (s2, s2_calls) = Counted::new("s2", 10);

    let mut pipeline = pipeline(0);
    let root = pipeline.root();
    let events = pipeline.subscribe();

    let s1 = pipeline.add_step(root, s1).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));
    let output = pipeline.graph().child(s1).unwrap();
    assert_eq!(payload_of(&pipeline, output), 1);
    drain(&events);

    let s2 = pipeline.add_step(root, s2).unwrap();

    // The move is reported on the next tick, not from inside the edit.
    assert_eq!(pipeline.graph().child(s2), Some(output));
    assert_eq!(pipeline.graph().child(s1), None);
    assert_eq!(
        count(&drain(&events), |e| matches!(e, PipelineEvent::ChildMoved { .. })),
        0
    );

    assert!(pipeline.wait_idle(TIMEOUT));
    let events = drain(&events);
    assert!(events.iter().any(
        |e| matches!(e, PipelineEvent::ChildMoved { step, data } if *step == s2 && *data == output)
    ));

    assert_eq!(s1_calls.load(Ordering::SeqCst), 1);
    assert_eq!(s2_calls.load(Ordering::SeqCst), 1);
    assert_eq!(payload_of(&pipeline, output), 11);
    assert_eq!(pipeline.graph().data_ids().count(), 2);
}

#[test]
fn test_remove_started_step_reruns_branch() {
    let (s2, control) = gate(10);
    let (s3, _) = Counted::new("s3", 100);

    let mut blueprint = Blueprint::new("Volume", 1_i64);
    blueprint.options(Options {
        worker_threads: 4,
        ..Default::default()
    });
    let root = blueprint.root();
    let s1 = blueprint.add_step(root, from_fn("s1", |x: i64| Ok(x * 1000))).unwrap();
    blueprint.add_step(root, s2).unwrap();
    let s3 = blueprint.add_step(root, s3).unwrap();
    let mut pipeline = blueprint.finish().unwrap();
    let events = pipeline.subscribe();

    pipeline.execute_all();
    control.wait_entered();
    let first = pipeline.is_running();

    // s1 already ran, so it cannot be withdrawn: the branch runs again.
    pipeline.remove_step(s1).unwrap();
    control.wait_entered();
    control.open();
    control.open();

    assert!(first);
    assert!(pipeline.wait_idle(TIMEOUT));

    let events = drain(&events);
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::Started)), 1);
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::BranchStarted { .. })), 2);
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::Canceled)), 0);
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::Finished(Completion::Success))
    ));

    let output = pipeline.graph().child(s3).unwrap();
    assert_eq!(payload_of(&pipeline, output), 111);
}

#[test]
fn test_remove_pending_step_is_withdrawn() {
    let (s1, control) = gate(1);
    let (s2, s2_calls) = Counted::new("s2", 100);
    let (s3, s3_calls) = Counted::new("s3", 10);

    let mut blueprint = Blueprint::new("Volume", 0_i64);
    let root = blueprint.root();
    blueprint.add_step(root, s1).unwrap();
    let s2 = blueprint.add_step(root, s2).unwrap();
    let s3 = blueprint.add_step(root, s3).unwrap();
    let mut pipeline = blueprint.finish().unwrap();
    let events = pipeline.subscribe();

    pipeline.execute_all();
    control.wait_entered();
    pipeline.remove_step(s2).unwrap();
    control.open();

    assert!(pipeline.wait_idle(TIMEOUT));
    let events = drain(&events);
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::BranchStarted { .. })), 1);

    assert_eq!(s2_calls.load(Ordering::SeqCst), 0);
    assert_eq!(s3_calls.load(Ordering::SeqCst), 1);
    let output = pipeline.graph().child(s3).unwrap();
    assert_eq!(payload_of(&pipeline, output), 11);
}

#[test]
fn test_remove_last_step_relocates_output() {
    let mut blueprint = Blueprint::new("Volume", 1_i64);
    let root = blueprint.root();
    let s1 = blueprint.add_step(root, from_fn("s1", |x: i64| Ok(x + 1))).unwrap();
    let s2 = blueprint.add_step(root, from_fn("s2", |x: i64| Ok(x * 5))).unwrap();
    let mut pipeline = blueprint.finish().unwrap();

    pipeline.execute_all();
    assert!(pipeline.wait_idle(TIMEOUT));
    let output = pipeline.graph().child(s2).unwrap();
    assert_eq!(payload_of(&pipeline, output), 10);

    let events = pipeline.subscribe();
    pipeline.remove_step(s2).unwrap();

    assert_eq!(pipeline.graph().child(s1), Some(output));
    assert!(drain(&events).iter().any(
        |e| matches!(e, PipelineEvent::ChildMoved { step, data } if *step == s1 && *data == output)
    ));

    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(payload_of(&pipeline, output), 2);
}

#[test]
fn test_remove_only_step_discards_output() {
    let mut blueprint = Blueprint::new("Volume", 1_i64);
    let root = blueprint.root();
    let s1 = blueprint.add_step(root, from_fn("s1", |x: i64| Ok(x + 1))).unwrap();
    let mut pipeline = blueprint.finish().unwrap();

    pipeline.execute_all();
    assert!(pipeline.wait_idle(TIMEOUT));
    let output = pipeline.graph().child(s1).unwrap();
    let nested = pipeline
        .add_step(output, producer_fn("split", "Part", |x: i64, _: &mut StepContext<'_, i64>| Ok(x)))
        .unwrap();
    let part = pipeline.graph().child(nested).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));

    let events = pipeline.subscribe();
    pipeline.remove_step(s1).unwrap();

    let removed: Vec<_> = drain(&events)
        .into_iter()
        .filter_map(|event| match event {
            PipelineEvent::ChildRemoved { data } => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(removed, vec![output, part]);
    assert!(!pipeline.graph().contains_data(output));
    assert!(!pipeline.graph().contains_step(nested));
    assert!(pipeline.graph().contains_data(root));
    assert!(pipeline.wait_idle(TIMEOUT));
}

#[test]
fn test_remove_producer_discards_explicit_child() {
    let mut pipeline = pipeline(1);
    let root = pipeline.root();
    let events = pipeline.subscribe();

    let split = pipeline
        .add_step(root, producer_fn("split", "Part", |x: i64, _: &mut StepContext<'_, i64>| Ok(x)))
        .unwrap();
    let part = pipeline.graph().child(split).unwrap();
    assert!(drain(&events).iter().any(
        |e| matches!(e, PipelineEvent::ChildCreated { step, data } if *step == split && *data == part)
    ));
    assert!(pipeline.wait_idle(TIMEOUT));

    pipeline.remove_step(split).unwrap();
    assert!(!pipeline.graph().contains_data(part));
    assert!(drain(&events)
        .iter()
        .any(|e| matches!(e, PipelineEvent::ChildRemoved { data } if *data == part)));
    assert!(pipeline.wait_idle(TIMEOUT));
}

#[test]
fn test_preview_is_independent() {
    let (s1, _) = Counted::new("s1", 1);
    let (s3, control) = gate(0);

    let mut blueprint = Blueprint::new("Volume", 5_i64);
    blueprint.options(Options {
        worker_threads: 4,
        ..Default::default()
    });
    let root = blueprint.root();
    blueprint.add_step(root, s1).unwrap();
    let s2 = blueprint.add_step(root, from_fn("s2", |x: i64| Ok(x * 2))).unwrap();
    let s3 = blueprint.add_step(root, s3).unwrap();
    let mut pipeline = blueprint.finish().unwrap();

    pipeline.execute_all();
    control.wait_entered();
    let running = pipeline.is_running();

    let mut preview = pipeline.preview_before(s2).unwrap();
    let outcome = preview.wait_timeout(TIMEOUT);

    assert!(running);
    assert!(pipeline.is_running());
    assert!(matches!(outcome, Some(PreviewOutcome::Ready(6))));
    assert_eq!(payload_of(&pipeline, root), 5);

    control.open();
    assert!(pipeline.wait_idle(TIMEOUT));
    let output = pipeline.graph().child(s3).unwrap();
    assert_eq!(payload_of(&pipeline, output), 12);
}

#[test]
fn test_preview_of_first_step_resolves_on_tick() {
    let mut blueprint = Blueprint::new("Volume", 9_i64);
    let root = blueprint.root();
    let s1 = blueprint.add_step(root, from_fn("s1", |x: i64| Ok(x + 1))).unwrap();
    let mut pipeline = blueprint.finish().unwrap();

    let mut preview = pipeline.preview_before(s1).unwrap();
    assert!(preview.poll().is_none());
    assert!(preview.is_running());
    assert!(!preview.cancel());

    pipeline.tick();
    assert!(matches!(preview.poll(), Some(PreviewOutcome::Ready(9))));
    assert!(!preview.is_running());
    assert!(preview.poll().is_none());
}

#[test]
fn test_cancel_round_trip() {
    let (s1, control) = gate(1);
    let (s2, s2_calls) = Counted::new("s2", 1);

    let mut blueprint = Blueprint::new("Volume", 0_i64);
    let root = blueprint.root();
    blueprint.add_step(root, s1).unwrap();
    let s2 = blueprint.add_step(root, s2).unwrap();
    let mut pipeline = blueprint.finish().unwrap();
    let events = pipeline.subscribe();

    let called = Arc::new(AtomicUsize::new(0));
    let flag = called.clone();

    pipeline.execute_all();
    control.wait_entered();
    pipeline.cancel_with(move || {
        flag.fetch_add(1, Ordering::SeqCst);
    });

    assert!(pipeline.wait_idle(TIMEOUT));
    assert!(!pipeline.is_running());

    let events = drain(&events);
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::Canceled)), 1);
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::Finished(_))), 0);
    assert_eq!(called.load(Ordering::SeqCst), 1);
    assert_eq!(s2_calls.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.graph().child(s2), None);
    assert_eq!(
        pipeline.graph().step(s2).unwrap().status(),
        crate::engine::StepStatus::Canceled
    );
}

#[test]
fn test_cancel_with_nothing_running_calls_back_on_tick() {
    let mut pipeline = pipeline(0);
    let (tx, rx) = bounded(1);

    pipeline.cancel_with(move || {
        let _ = tx.send(());
    });
    assert!(rx.try_recv().is_err());

    pipeline.tick();
    assert!(rx.try_recv().is_ok());
}

#[test]
fn test_canceled_predecessor_forces_full_run() {
    let (s1, control) = gate(1);
    let (s2, s2_calls) = Counted::new("s2", 10);
    let (s3, s3_calls) = Counted::new("s3", 100);

    let mut blueprint = Blueprint::new("Volume", 0_i64);
    let root = blueprint.root();
    blueprint.add_step(root, s1).unwrap();
    let s2 = blueprint.add_step(root, s2).unwrap();
    let s3 = blueprint.add_step(root, s3).unwrap();
    let mut pipeline = blueprint.finish().unwrap();

    pipeline.execute_all();
    control.wait_entered();
    pipeline.cancel();
    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(
        pipeline.graph().step(s2).unwrap().status(),
        crate::engine::StepStatus::Canceled
    );

    pipeline.execute_from(root, Some(s3)).unwrap();
    control.wait_entered();
    control.open();
    assert!(pipeline.wait_idle(TIMEOUT));

    assert_eq!(s2_calls.load(Ordering::SeqCst), 1);
    assert_eq!(s3_calls.load(Ordering::SeqCst), 1);
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(s3).unwrap()), 111);
}

#[test]
fn test_execute_from_without_cache_runs_everything() {
    let (s1, s1_calls) = Counted::new("s1", 1);
    let (s2, s2_calls) = Counted::new("s2", 10);

    let mut pipeline = pipeline(0);
    let root = pipeline.root();
    pipeline.add_step(root, s1).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));
    let s2 = pipeline.add_step(root, s2).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));

    assert!(matches!(
        pipeline.execute_from(root, Some(StepId(petgraph::stable_graph::NodeIndex::new(99)))),
        Err(PipelineError::StepNotFound(_))
    ));

    // s2 owns the output now, so nothing is cached in front of it.
    pipeline.execute_from(root, Some(s2)).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));

    assert_eq!(s1_calls.load(Ordering::SeqCst), 2);
    assert_eq!(s2_calls.load(Ordering::SeqCst), 2);
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(s2).unwrap()), 11);
}

#[test]
fn test_execute_from_resumes_after_cached_step() {
    let (s1, s1_calls) = Counted::new("s1", 1);
    let split_calls = Arc::new(AtomicUsize::new(0));
    let counter = split_calls.clone();

    let mut pipeline = pipeline(0);
    let root = pipeline.root();
    let s1 = pipeline.add_step(root, s1).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));

    let split = pipeline
        .add_step(
            root,
            producer_fn("split", "Part", move |x: i64, ctx: &mut StepContext<'_, i64>| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.set_child_data(x * 2);
                Ok(x)
            }),
        )
        .unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));

    // The producer does not take the output away from s1.
    let output = pipeline.graph().child(s1).unwrap();
    let part = pipeline.graph().child(split).unwrap();
    assert_eq!(s1_calls.load(Ordering::SeqCst), 1);
    assert_eq!(split_calls.load(Ordering::SeqCst), 1);
    assert_eq!(payload_of(&pipeline, part), 2);

    pipeline.execute_from(root, Some(split)).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(s1_calls.load(Ordering::SeqCst), 1);
    assert_eq!(split_calls.load(Ordering::SeqCst), 2);

    pipeline.execute_from(root, None).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(s1_calls.load(Ordering::SeqCst), 2);
    assert_eq!(payload_of(&pipeline, output), 1);
}

#[test]
fn test_single_active_handle() {
    let (s1, control) = gate(1);

    let mut blueprint = Blueprint::new("Volume", 0_i64);
    blueprint.options(Options {
        worker_threads: 4,
        ..Default::default()
    });
    let root = blueprint.root();
    let s1 = blueprint.add_step(root, s1).unwrap();
    let mut pipeline = blueprint.finish().unwrap();
    let events = pipeline.subscribe();

    pipeline.execute_all();
    control.wait_entered();
    pipeline.execute_all();
    control.wait_entered();
    control.open();
    control.open();

    assert!(pipeline.wait_idle(TIMEOUT));
    let events = drain(&events);

    // The first run is superseded: one Canceled, then a complete second run.
    let kinds: Vec<_> = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                PipelineEvent::Started | PipelineEvent::Canceled | PipelineEvent::Finished(_)
            )
        })
        .collect();
    assert_eq!(kinds.len(), 4);
    assert!(matches!(kinds[0], PipelineEvent::Started));
    assert!(matches!(kinds[1], PipelineEvent::Canceled));
    assert!(matches!(kinds[2], PipelineEvent::Started));
    assert!(matches!(kinds[3], PipelineEvent::Finished(Completion::Success)));
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::ChildCreated { .. })), 1);
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(s1).unwrap()), 1);
}

#[test]
fn test_failure_ends_run() {
    let mut blueprint = Blueprint::new("Volume", 1_i64);
    let root = blueprint.root();
    let s1 = blueprint
        .add_step(root, from_fn("broken", |_: i64| -> anyhow::Result<i64> {
            anyhow::bail!("bad tilt axis")
        }))
        .unwrap();
    let mut pipeline = blueprint.finish().unwrap();
    let events = pipeline.subscribe();

    pipeline.execute_all();
    assert!(pipeline.wait_idle(TIMEOUT));

    let events = drain(&events);
    let failure = events.iter().find_map(|e| match e {
        PipelineEvent::Finished(Completion::Failed(failure)) => Some(failure),
        _ => None,
    });
    let failure = failure.unwrap();
    assert_eq!(failure.step, s1);
    assert!(failure.error.to_string().contains("bad tilt axis"));
    assert_eq!(pipeline.graph().child(s1), None);
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::ChildCreated { .. })), 0);
}

#[test]
fn test_pause_and_resume() {
    let (s1, calls) = Counted::new("s1", 1);

    let mut blueprint = Blueprint::new("Volume", 0_i64);
    blueprint.options(Options {
        start_paused: true,
        ..Default::default()
    });
    let root = blueprint.root();
    let s1 = blueprint.add_step(root, s1).unwrap();
    let mut pipeline = blueprint.finish().unwrap();
    let events = pipeline.subscribe();

    assert!(pipeline.is_paused());
    pipeline.execute_all();
    pipeline.set_data(root, 4).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!drain(&events).iter().any(|e| matches!(e, PipelineEvent::Started)));

    pipeline.resume(true);
    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(s1).unwrap()), 5);

    pipeline.pause();
    pipeline.resume(false);
    assert!(!pipeline.is_running());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_modified_transform_reruns_from_root() {
    let (s1, s1_calls) = Counted::new("s1", 1);
    let (t1, t1_calls) = Counted::new("t1", 1);

    let mut pipeline = pipeline(0);
    let root = pipeline.root();
    let s1 = pipeline.add_step(root, s1).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));
    let output = pipeline.graph().child(s1).unwrap();
    let t1 = pipeline.add_step(output, t1).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(s1_calls.load(Ordering::SeqCst), 1);
    assert_eq!(t1_calls.load(Ordering::SeqCst), 1);

    pipeline.notify_transform_modified(t1).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(s1_calls.load(Ordering::SeqCst), 2);
    assert_eq!(t1_calls.load(Ordering::SeqCst), 2);

    pipeline
        .replace_transform(s1, from_fn("s1", |x: i64| Ok(x + 50)))
        .unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(payload_of(&pipeline, output), 50);
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(t1).unwrap()), 51);

    assert!(matches!(
        pipeline.replace_transform(
            s1,
            producer_fn("p", "Part", |x: i64, _: &mut StepContext<'_, i64>| Ok(x))
        ),
        Err(PipelineError::KindMismatch(_))
    ));
}

#[test]
fn test_move_step_reorders_and_reruns() {
    let mut blueprint = Blueprint::new("Volume", 1_i64);
    let root = blueprint.root();
    let add = blueprint.add_step(root, from_fn("add", |x: i64| Ok(x + 1))).unwrap();
    let mul = blueprint.add_step(root, from_fn("mul", |x: i64| Ok(x * 10))).unwrap();
    let mut pipeline = blueprint.finish().unwrap();

    pipeline.execute_all();
    assert!(pipeline.wait_idle(TIMEOUT));
    let output = pipeline.graph().child(mul).unwrap();
    assert_eq!(payload_of(&pipeline, output), 20);

    pipeline.move_step(mul, 0).unwrap();
    assert_eq!(pipeline.graph().child(add), Some(output));
    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(payload_of(&pipeline, output), 11);
}

#[test]
fn test_set_data_reruns_branch() {
    let mut pipeline = pipeline(1);
    let root = pipeline.root();
    let s1 = pipeline.add_step(root, from_fn("double", |x: i64| Ok(x * 2))).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));

    let events = pipeline.subscribe();
    pipeline.set_data(root, 21).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));

    assert!(drain(&events)
        .iter()
        .any(|e| matches!(e, PipelineEvent::DataChanged { data } if *data == root)));
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(s1).unwrap()), 42);
    assert!(pipeline.diagnostics().execution_times.contains_key(&s1));
}

/// Root `[s1 (+1), gate]` with a step `t1 (+10)` on its output, after one
/// complete run.
struct Chained {
    pipeline: Pipeline<i64>,
    control: GateControl,
    output: DataId,
    t1: StepId,
    s1_calls: Arc<AtomicUsize>,
    t1_calls: Arc<AtomicUsize>,
}

fn chained() -> Chained {
    let (s1, s1_calls) = Counted::new("s1", 1);
    let (g, control) = gate(0);
    let (t1, t1_calls) = Counted::new("t1", 10);

    let mut blueprint = Blueprint::new("Volume", 0_i64);
    blueprint.options(Options {
        worker_threads: 4,
        ..Default::default()
    });
    let root = blueprint.root();
    blueprint.add_step(root, s1).unwrap();
    let g = blueprint.add_step(root, g).unwrap();
    let mut pipeline = blueprint.finish().unwrap();

    pipeline.execute_all();
    control.wait_entered();
    control.open();
    assert!(pipeline.wait_idle(TIMEOUT));

    let output = pipeline.graph().child(g).unwrap();
    let t1 = pipeline.add_step(output, t1).unwrap();
    assert!(pipeline.wait_idle(TIMEOUT));
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(t1).unwrap()), 11);

    Chained {
        pipeline,
        control,
        output,
        t1,
        s1_calls,
        t1_calls,
    }
}

fn run_markers(events: &[PipelineEvent]) -> Vec<&PipelineEvent> {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                PipelineEvent::Started | PipelineEvent::Canceled | PipelineEvent::Finished(_)
            )
        })
        .collect()
}

#[test]
fn test_execute_from_child_requeues_interrupted_root() {
    let Chained {
        mut pipeline,
        control,
        output,
        t1,
        s1_calls,
        t1_calls,
    } = chained();
    let root = pipeline.root();
    let events = pipeline.subscribe();

    pipeline.execute_all();
    control.wait_entered();
    pipeline.execute_from(output, None).unwrap();

    // The child branch runs first, then the root branch is picked up again.
    control.wait_entered_ticking(&mut pipeline);
    control.open();
    control.open();
    assert!(pipeline.wait_idle(TIMEOUT));

    assert_eq!(s1_calls.load(Ordering::SeqCst), 3);
    assert_eq!(t1_calls.load(Ordering::SeqCst), 3);
    assert!(!pipeline.graph().data(output).unwrap().is_stale());
    assert_eq!(payload_of(&pipeline, output), 1);
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(t1).unwrap()), 11);

    let events = drain(&events);
    let markers = run_markers(&events);
    assert_eq!(markers.len(), 2);
    assert!(matches!(markers[0], PipelineEvent::Started));
    assert!(matches!(markers[1], PipelineEvent::Finished(Completion::Success)));
    assert_eq!(
        count(&events, |e| matches!(e, PipelineEvent::BranchStarted { data } if *data == root)),
        2
    );
}

#[test]
fn test_set_data_on_child_requeues_interrupted_root() {
    let Chained {
        mut pipeline,
        control,
        output,
        t1,
        t1_calls,
        ..
    } = chained();
    let events = pipeline.subscribe();

    pipeline.execute_all();
    control.wait_entered();
    pipeline.set_data(output, 100).unwrap();

    control.wait_entered_ticking(&mut pipeline);
    control.open();
    control.open();
    assert!(pipeline.wait_idle(TIMEOUT));

    // The edited payload is derived data, so the root run overwrites it.
    assert_eq!(t1_calls.load(Ordering::SeqCst), 3);
    assert_eq!(payload_of(&pipeline, output), 1);
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(t1).unwrap()), 11);

    let events = drain(&events);
    assert_eq!(count(&events, |e| matches!(e, PipelineEvent::Canceled)), 0);
    assert!(matches!(
        run_markers(&events).last(),
        Some(PipelineEvent::Finished(Completion::Success))
    ));
}

#[test]
fn test_edit_after_cancel_starts_new_run() {
    let (g, control) = gate(1);

    let mut blueprint = Blueprint::new("Volume", 0_i64);
    blueprint.options(Options {
        worker_threads: 4,
        ..Default::default()
    });
    let root = blueprint.root();
    let g = blueprint.add_step(root, g).unwrap();
    let mut pipeline = blueprint.finish().unwrap();
    let events = pipeline.subscribe();

    let called = Arc::new(AtomicUsize::new(0));
    let flag = called.clone();

    pipeline.execute_all();
    control.wait_entered();
    pipeline.cancel_with(move || {
        flag.fetch_add(1, Ordering::SeqCst);
    });
    assert!(drain(&events).iter().any(|e| matches!(e, PipelineEvent::Canceled)));

    pipeline.set_data(root, 5).unwrap();
    control.wait_entered();
    control.open();
    control.open();
    assert!(pipeline.wait_idle(TIMEOUT));

    let drained = drain(&events);
    let markers = run_markers(&drained);
    assert_eq!(markers.len(), 2);
    assert!(matches!(markers[0], PipelineEvent::Started));
    assert!(matches!(markers[1], PipelineEvent::Finished(Completion::Success)));
    assert_eq!(payload_of(&pipeline, pipeline.graph().child(g).unwrap()), 6);

    // The superseded handle may report after the new run is over.
    let deadline = Instant::now() + TIMEOUT;
    while called.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        pipeline.tick();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(called.load(Ordering::SeqCst), 1);
    assert!(drain(&events).is_empty());
}
