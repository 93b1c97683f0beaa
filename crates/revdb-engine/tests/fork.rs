//! `FORK` creates an independent timeline in a child process.

use revdb_engine::protocol::{ANSWER_AT_END, ANSWER_INIT, ANSWER_READY};
use revdb_engine::{BreakpointMode, Controller, FastForward, Result, Session, SessionConfig};
use revdb_test_utils::{record_program, ReplayHarness};

fn ticking(s: &Session) -> Result<()> {
    for place in 0..4u64 {
        s.emit(|| place * 10)?;
        s.allocate_uid()?;
        s.stop_point(place)?;
    }
    Ok(())
}

fn ready(c: &mut Controller) -> (i64, i64, i64) {
    let a = c.expect(ANSWER_READY).unwrap();
    (a.arg1, a.arg2, a.arg3)
}

#[test]
fn branches_step_independently() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("tick.revdb");
    record_program(&log, Vec::new(), ticking).unwrap();

    let mut h = ReplayHarness::start(&log, SessionConfig::default(), ticking).unwrap();
    let parent = h.controller();
    parent.expect(ANSWER_INIT).unwrap();
    assert_eq!(ready(parent), (0, 1, 1));
    parent.forward(1, BreakpointMode::Ignore).unwrap();
    assert_eq!(ready(parent), (1, 2, 1));

    let (pid, mut child) = parent.fork(false).unwrap();
    assert!(pid > 0);
    assert_eq!(ready(parent), (1, 2, 1));
    assert_eq!(ready(&mut child), (1, 2, 1));

    // A sibling from the same stop point.
    let (sibling_pid, mut sibling) = parent.fork(false).unwrap();
    assert!(sibling_pid > 0 && sibling_pid != pid);
    assert_eq!(ready(parent), (1, 2, 1));
    assert_eq!(ready(&mut sibling), (1, 2, 1));

    // The child runs ahead; the parent and the sibling do not move.
    child.forward(2, BreakpointMode::Ignore).unwrap();
    assert_eq!(ready(&mut child), (3, 4, 1));
    parent.ping().unwrap();
    assert_eq!(ready(parent), (1, 2, 1));
    sibling.ping().unwrap();
    assert_eq!(ready(&mut sibling), (1, 2, 1));

    // The sibling moves by a different amount; the child stays put.
    sibling.forward(1, BreakpointMode::Ignore).unwrap();
    assert_eq!(ready(&mut sibling), (2, 3, 1));
    child.ping().unwrap();
    assert_eq!(ready(&mut child), (3, 4, 1));

    // The parent moves too; neither branch follows.
    parent.forward(1, BreakpointMode::Ignore).unwrap();
    assert_eq!(ready(parent), (2, 3, 1));
    child.ping().unwrap();
    assert_eq!(ready(&mut child), (3, 4, 1));
    sibling.ping().unwrap();
    assert_eq!(ready(&mut sibling), (2, 3, 1));

    child.forward(10, BreakpointMode::Ignore).unwrap();
    let end = child.expect(ANSWER_AT_END).unwrap();
    assert_eq!((end.arg1, end.arg2), (4, 5));
    child.quit().unwrap();
    // The branch process exits instead of answering again.
    assert!(child.recv().is_err());

    sibling.quit().unwrap();
    assert!(sibling.recv().is_err());

    parent.forward(10, BreakpointMode::Ignore).unwrap();
    let end = parent.expect(ANSWER_AT_END).unwrap();
    assert_eq!((end.arg1, end.arg2), (4, 5));
    parent.quit().unwrap();
    h.join().unwrap();
}

#[test]
fn fast_forward_skips_init_and_pauses_at_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("tick.revdb");
    record_program(&log, Vec::new(), ticking).unwrap();

    let config = SessionConfig {
        fast_forward: Some(FastForward { stop_point: 2 }),
        ..Default::default()
    };
    let mut h = ReplayHarness::start(&log, config, ticking).unwrap();
    let c = h.controller();
    let first = c.recv().unwrap();
    assert_eq!(first.code, ANSWER_READY);
    assert_eq!((first.arg1, first.arg2, first.arg3), (2, 3, 1));

    c.forward(10, BreakpointMode::Ignore).unwrap();
    let end = c.expect(ANSWER_AT_END).unwrap();
    assert_eq!((end.arg1, end.arg2), (4, 5));
    c.quit().unwrap();
    h.join().unwrap();
}
