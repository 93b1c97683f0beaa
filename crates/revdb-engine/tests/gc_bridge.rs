//! Weak references, destructors and finalizer queues across record and
//! replay.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use revdb_core::{ObjectIdentity, Uid};
use revdb_engine::protocol::{ANSWER_AT_END, ANSWER_INIT, ANSWER_READY};
use revdb_engine::{
    BreakpointMode, EngineError, Result, Session, SessionConfig, WEAKREF_AFTERWARDS_ALIVE,
    WEAKREF_AFTERWARDS_DEAD,
};
use revdb_log::{Fetched, Replayer};
use revdb_test_utils::{record_program, MockHeap, ReplayHarness};
use tempfile::TempDir;

type Trace = Arc<Mutex<Vec<String>>>;

// ── Helpers ─────────────────────────────────────────────────────

fn record<F>(program: F) -> (TempDir, PathBuf)
where
    F: FnOnce(&Session) -> Result<()>,
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gc.revdb");
    record_program(&path, vec!["gc".into()], program).unwrap();
    (dir, path)
}

fn replay_to_end<F>(log: &Path, program: F) -> Result<()>
where
    F: FnOnce(&Session) -> Result<()> + Send + 'static,
{
    let mut h = ReplayHarness::start(log, SessionConfig::default(), program)?;
    let c = h.controller();
    c.expect(ANSWER_INIT)?;
    c.expect(ANSWER_READY)?;
    c.forward(1000, BreakpointMode::Ignore)?;
    c.expect(ANSWER_AT_END)?;
    c.quit()?;
    h.join()
}

fn replay_until_failure<F>(log: &Path, program: F) -> EngineError
where
    F: FnOnce(&Session) -> Result<()> + Send + 'static,
{
    let mut h = ReplayHarness::start(log, SessionConfig::default(), program).unwrap();
    let c = h.controller();
    c.expect(ANSWER_INIT).unwrap();
    c.expect(ANSWER_READY).unwrap();
    c.forward(1000, BreakpointMode::Ignore).unwrap();
    h.join().unwrap_err()
}

fn next_u8(replayer: &mut Replayer<File>) -> u8 {
    loop {
        match replayer.read::<u8>().unwrap() {
            Fetched::Value(v) => return v,
            Fetched::Async(_) => {}
        }
    }
}

// ── Weak references ─────────────────────────────────────────────

fn weakref_program(trace: Trace) -> impl FnOnce(&Session) -> Result<()> + Send + 'static {
    move |s| {
        let heap = MockHeap::new(s);
        let obj = heap.allocate("target")?;
        let mut weak = s.weakref_create(&obj)?;
        assert!(weak.is_tracked());
        for _ in 0..2 {
            let alive = s.weakref_deref(&mut weak)?;
            trace.lock().unwrap().push(format!("{:?}", alive.map(|o| o.label.clone())));
        }
        drop(heap.collect(obj.uid()));
        drop(obj);
        let gone = s.weakref_deref(&mut weak)?;
        trace.lock().unwrap().push(format!("{:?}", gone.map(|o| o.label.clone())));
        s.stop_point(0)
    }
}

#[test]
fn weakref_liveness_replays_exactly() {
    let recorded: Trace = Arc::default();
    let (_dir, log) = record(weakref_program(recorded.clone()));

    let replayed: Trace = Arc::default();
    replay_to_end(&log, weakref_program(replayed.clone())).unwrap();

    let expected = vec![
        "Some(\"target\")".to_string(),
        "Some(\"target\")".to_string(),
        "None".to_string(),
    ];
    assert_eq!(*recorded.lock().unwrap(), expected);
    assert_eq!(*replayed.lock().unwrap(), expected);
}

#[test]
fn each_liveness_byte_is_patched_at_most_once() {
    let (_dir, log) = record(weakref_program(Arc::default()));
    let mut replayer = Replayer::open(File::open(&log).unwrap()).unwrap();
    assert_eq!(next_u8(&mut replayer), WEAKREF_AFTERWARDS_ALIVE);
    assert_eq!(next_u8(&mut replayer), WEAKREF_AFTERWARDS_ALIVE);
    assert_eq!(next_u8(&mut replayer), WEAKREF_AFTERWARDS_DEAD);
}

#[test]
fn inspection_weakrefs_are_untracked() {
    let s = Session::disabled(Vec::new());
    let heap = MockHeap::new(&s);
    let obj = heap.allocate("x").unwrap();
    let weak = s.weakref_create(&obj).unwrap();
    assert!(!weak.is_tracked());
    assert_eq!(weak.prev_log_offset(), -1);
}

// ── Destructors and finalizer queues ────────────────────────────

fn finalizer_program(trace: Trace) -> impl FnOnce(&Session) -> Result<()> + Send + 'static {
    move |s| {
        let heap = Arc::new(MockHeap::new(s));
        let a = heap.allocate("a")?;
        let b = heap.allocate("b")?;
        for obj in [&a, &b] {
            let t = trace.clone();
            let label = obj.label.clone();
            s.register_destructor(obj, move |_| {
                t.lock().unwrap().push(format!("del {label}"));
                Ok(())
            });
        }
        let (t, queue) = (trace.clone(), heap.clone());
        s.set_finalizer_trigger(move |_| {
            while let Some(obj) = queue.poll_finalizer()? {
                t.lock().unwrap().push(format!("fq {}", obj.label));
            }
            Ok(())
        });

        drop(heap.collect(b.uid()));
        drop(b);
        s.stop_point(0)?;
        trace.lock().unwrap().push("stop 1".into());

        let c = heap.allocate("c")?;
        heap.enqueue_finalizer(c);
        s.stop_point(0)?;
        trace.lock().unwrap().push("stop 2".into());

        drop(heap.collect(a.uid()));
        s.stop_point(0)
    }
}

#[test]
fn finalization_passes_run_at_the_recorded_stop_points() {
    let recorded: Trace = Arc::default();
    let (_dir, log) = record(finalizer_program(recorded.clone()));

    let replayed: Trace = Arc::default();
    replay_to_end(&log, finalizer_program(replayed.clone())).unwrap();

    let expected: Vec<String> = ["del b", "stop 1", "fq c", "stop 2", "del a"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(*recorded.lock().unwrap(), expected);
    assert_eq!(*replayed.lock().unwrap(), expected);
}

#[test]
fn replay_without_the_destructor_fails() {
    let (_dir, log) = record(|s| {
        let heap = MockHeap::new(s);
        let obj = heap.allocate("lonely")?;
        s.register_destructor(&obj, |_| Ok(()));
        drop(heap.collect(obj.uid()));
        s.stop_point(0)
    });
    let err = replay_until_failure(&log, |s| {
        let heap = MockHeap::new(s);
        heap.allocate("lonely")?;
        s.stop_point(0)
    });
    assert!(matches!(err, EngineError::MissingDestructor { uid: Uid(1) }));
}

#[test]
fn finalizer_queue_object_must_be_registered() {
    let (_dir, log) = record(|s| {
        let heap = MockHeap::new(s);
        let obj = heap.allocate("queued")?;
        heap.enqueue_finalizer(obj);
        assert!(heap.poll_finalizer()?.is_some());
        s.stop_point(0)
    });
    let err = replay_until_failure(&log, |s| {
        let heap = MockHeap::new(s);
        heap.allocate("queued")?;
        heap.poll_finalizer()?;
        s.stop_point(0)
    });
    assert!(matches!(err, EngineError::MissingFinalizerObject { uid: Uid(1) }));
}
