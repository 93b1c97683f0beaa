//! Program threads recorded concurrently and replayed one at a time.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use revdb_engine::protocol::{
    ANSWER_ATTEMPT_IO, ANSWER_AT_END, ANSWER_BREAKPOINT, ANSWER_INIT, ANSWER_READY,
};
use revdb_engine::{
    Answer, BranchStrategy, BreakpointMode, Command, Controller, EngineError, Result, Session,
    SessionConfig, THREAD_BREAKPOINT_ID,
};
use revdb_test_utils::{record_program, MockGil, ReplayHarness};
use tempfile::TempDir;

type Seen = Arc<Mutex<Vec<(u32, u64)>>>;

fn record<F>(program: F) -> (TempDir, PathBuf)
where
    F: FnOnce(&Session) -> Result<()>,
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("threads.revdb");
    record_program(&path, Vec::new(), program).unwrap();
    (dir, path)
}

/// Two threads taking turns under the GIL, each logging a shared counter.
fn counting_program(
    seen: Seen,
    counter: Arc<AtomicU64>,
) -> impl FnOnce(&Session) -> Result<()> + Send + 'static {
    move |s| {
        let gil = Arc::new(MockGil::new(s));
        gil.acquire()?;
        let worker = {
            let (gil, seen, counter) = (gil.clone(), seen.clone(), counter.clone());
            s.start_thread(move |s| {
                for _ in 0..3 {
                    gil.with(|| {
                        let v = s.emit(|| counter.fetch_add(1, Ordering::SeqCst))?;
                        seen.lock().unwrap().push((2, v));
                        Ok(())
                    })?;
                }
                Ok(())
            })?
        };
        gil.release()?;
        for _ in 0..3 {
            gil.with(|| {
                let v = s.emit(|| counter.fetch_add(1, Ordering::SeqCst))?;
                seen.lock().unwrap().push((1, v));
                s.stop_point(0)
            })?;
        }
        worker.join(s)
    }
}

#[test]
fn interleaving_replays_exactly() {
    let recorded: Seen = Arc::default();
    let counter = Arc::new(AtomicU64::new(0));
    let (_dir, log) = record(counting_program(recorded.clone(), counter.clone()));
    assert_eq!(counter.load(Ordering::SeqCst), 6);

    let replayed: Seen = Arc::default();
    let unused = Arc::new(AtomicU64::new(500));
    let mut h = ReplayHarness::start(
        &log,
        SessionConfig::default(),
        counting_program(replayed.clone(), unused.clone()),
    )
    .unwrap();
    let c = h.controller();
    c.expect(ANSWER_INIT).unwrap();
    c.expect(ANSWER_READY).unwrap();
    c.forward(100, BreakpointMode::Ignore).unwrap();
    let end = c.expect(ANSWER_AT_END).unwrap();
    assert_eq!(end.arg1, 3);
    c.quit().unwrap();
    h.join().unwrap();

    assert_eq!(*replayed.lock().unwrap(), *recorded.lock().unwrap());
    assert_eq!(unused.load(Ordering::SeqCst), 500);
    let mut values: Vec<u64> = recorded.lock().unwrap().iter().map(|(_, v)| *v).collect();
    values.sort_unstable();
    assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
}

fn worker_stops_program(s: &Session) -> Result<()> {
    s.set_thread_breakpoint(Some(2));
    let gil = Arc::new(MockGil::new(s));
    gil.acquire()?;
    let worker = {
        let gil = gil.clone();
        s.start_thread(move |s| gil.with(|| s.stop_point(7)))?
    };
    gil.release()?;
    worker.join(s)
}

#[test]
fn thread_breakpoint_stops_in_the_worker() {
    let (_dir, log) = record(worker_stops_program);
    let mut h = ReplayHarness::start(&log, SessionConfig::default(), worker_stops_program).unwrap();
    let c = h.controller();
    c.expect(ANSWER_INIT).unwrap();
    c.expect(ANSWER_READY).unwrap();
    c.forward(100, BreakpointMode::Break).unwrap();

    // The log may switch to the worker more than once before it stops,
    // depending on how the recording interleaved.
    let mut hits = 0;
    let ready = loop {
        let answer = c.recv().unwrap();
        match answer.code {
            ANSWER_BREAKPOINT => {
                assert_eq!((answer.arg1, answer.arg3), (0, THREAD_BREAKPOINT_ID));
                hits += 1;
            }
            ANSWER_READY => break answer,
            other => panic!("unexpected answer {other}"),
        }
    };
    assert!(hits >= 1);
    assert_eq!((ready.arg1, ready.arg3), (1, 2));

    c.forward(100, BreakpointMode::Ignore).unwrap();
    assert_eq!(c.expect(ANSWER_AT_END).unwrap().arg1, 1);
    c.quit().unwrap();
    h.join().unwrap();
}

fn pause_in_worker(c: &mut Controller) {
    c.expect(ANSWER_INIT).unwrap();
    c.expect(ANSWER_READY).unwrap();
    c.forward(100, BreakpointMode::Break).unwrap();
    loop {
        let answer = c.recv().unwrap();
        match answer.code {
            ANSWER_BREAKPOINT => {}
            ANSWER_READY => {
                assert_eq!(answer.arg3, 2);
                return;
            }
            other => panic!("unexpected answer {other}"),
        }
    }
}

#[test]
fn quit_from_worker_ends_cleanly() {
    let (_dir, log) = record(worker_stops_program);
    let mut h = ReplayHarness::start(&log, SessionConfig::default(), worker_stops_program).unwrap();
    pause_in_worker(h.controller());
    h.controller().quit().unwrap();
    h.join().unwrap();
}

#[test]
fn io_from_worker_inspection_ends_cleanly() {
    let (_dir, log) = record(worker_stops_program);
    let program = |s: &Session| {
        s.register_command(9, |s, _| s.emit(|| 0u8).map(drop));
        worker_stops_program(s)
    };
    let mut h = ReplayHarness::start(&log, SessionConfig::default(), program).unwrap();
    let c = h.controller();
    pause_in_worker(c);
    c.send(&Command::new(9)).unwrap();
    c.expect(ANSWER_ATTEMPT_IO).unwrap();
    h.join().unwrap();
}

#[test]
fn paused_worker_needs_a_respawned_branch() {
    const LIVE_THREADS: i32 = 8;
    let (_dir, log) = record(worker_stops_program);
    let program = |s: &Session| {
        s.register_command(LIVE_THREADS, |s, _| {
            s.send_answer(&Answer::with_args(LIVE_THREADS, s.live_threads() as i64, 0, 0))
        });
        worker_stops_program(s)
    };
    let mut h = ReplayHarness::start(&log, SessionConfig::default(), program).unwrap();
    let c = h.controller();
    pause_in_worker(c);
    c.send(&Command::new(LIVE_THREADS)).unwrap();
    let live = c.expect(LIVE_THREADS).unwrap().arg1;
    assert_eq!(live, 2);
    assert_eq!(BranchStrategy::for_live_threads(live as usize), BranchStrategy::Respawn);
    assert_eq!(c.expect(ANSWER_READY).unwrap().arg3, 2);
    c.quit().unwrap();
    h.join().unwrap();
}

#[test]
fn wrong_gil_tag_desynchronizes() {
    let (_dir, log) = record(|s| {
        s.gil_acquire_emit()?;
        s.stop_point(0)
    });
    let mut h = ReplayHarness::start(&log, SessionConfig::default(), |s| {
        s.gil_release_emit()?;
        s.stop_point(0)
    })
    .unwrap();
    let c = h.controller();
    c.expect(ANSWER_INIT).unwrap();
    c.expect(ANSWER_READY).unwrap();
    c.forward(100, BreakpointMode::Ignore).unwrap();
    assert!(matches!(
        h.join(),
        Err(EngineError::UnexpectedFlag {
            expected: b'G',
            found: b'g'
        })
    ));
}

#[test]
fn disabled_threads_run_directly() {
    let s = Session::disabled(Vec::new());
    let counter = Arc::new(AtomicU64::new(0));
    let c = counter.clone();
    let handle = s
        .start_thread(move |s| {
            s.emit(|| c.fetch_add(1, Ordering::SeqCst))?;
            Ok(())
        })
        .unwrap();
    handle.join(&s).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
