//! The record/replay session.
//!
//! A [`Session`] owns the log (a [`Recorder`] or a [`Replayer`]), the
//! counters that define replay time, and the control socket. It is a
//! cheap cloneable handle; all clones share one engine state behind a
//! single mutex, which is the global log lock of the recording side.
//!
//! Host code is never called with that lock held: value producers,
//! destructors, hooks and command handlers all run unlocked and may
//! call back into the session.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use revdb_core::{ThreadIdent, Uid};
use revdb_log::{AsyncEvent, Fetched, LogHeader, LogValue, Recorder, Replayer, FORMAT_VERSION};

use crate::address_space::identity_words;
use crate::breakpoints::{BreakpointMode, Breakpoints};
use crate::config::SessionConfig;
use crate::error::{EngineError, Result};
use crate::gc::FinalizerState;
use crate::hooks::Hooks;
use crate::protocol::{Answer, Command, ANSWER_INIT};
use crate::threads::ThreadTable;

/// Tag emitted after the host acquires its interpreter lock.
pub const GIL_ACQUIRE_TAG: u8 = b'g';

/// Tag emitted before the host releases its interpreter lock.
pub const GIL_RELEASE_TAG: u8 = b'G';

/// What a session does with nondeterministic values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// Values are produced by the program and written to the log.
    Record,
    /// Values are read back from the log.
    Replay,
    /// Values pass straight through; nothing is logged.
    Disabled,
}

/// Whether the running code may touch the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoMode {
    /// Normal program execution.
    Regular,
    /// Replay is paused and engine state is saved; log access is a bug.
    SavedState,
    /// Inspection code is running; log access is reported to the
    /// controller as `ATTEMPT_IO` and ends the session.
    Protected,
}

pub(crate) enum LogState {
    Recording(Recorder<File>),
    Replaying(Replayer<File>),
    Passthrough,
    Closed,
}

pub(crate) struct EngineState {
    pub(crate) log: LogState,
    pub(crate) io_mode: IoMode,
    pub(crate) started: bool,
    pub(crate) stop_point_seen: u64,
    pub(crate) stop_point_place: u64,
    pub(crate) total_stop_points: u64,
    pub(crate) unique_id_seen: u64,
    pub(crate) future_ids: VecDeque<u64>,
    pub(crate) breaks: Breakpoints,
    pub(crate) finalizers: FinalizerState,
    pub(crate) threads: ThreadTable,
    pub(crate) last_emitter: ThreadIdent,
    pub(crate) next_thread: ThreadIdent,
    pub(crate) is_branch: bool,
}

impl EngineState {
    fn new(
        log: LogState,
        config: &SessionConfig,
        total_stop_points: u64,
        main_thread: ThreadIdent,
        first_break: u64,
    ) -> Self {
        Self {
            log,
            io_mode: IoMode::Regular,
            started: false,
            stop_point_seen: 0,
            stop_point_place: 0,
            total_stop_points,
            unique_id_seen: Uid::FIRST.0,
            future_ids: VecDeque::new(),
            breaks: Breakpoints::new(config.recorded_breaks_limit, first_break),
            finalizers: FinalizerState::default(),
            threads: ThreadTable::new(main_thread),
            last_emitter: main_thread,
            next_thread: main_thread.next(),
            is_branch: false,
        }
    }

    pub(crate) fn recorder(&mut self) -> Result<&mut Recorder<File>> {
        match &mut self.log {
            LogState::Recording(rec) => Ok(rec),
            _ => Err(EngineError::SessionClosed),
        }
    }

    pub(crate) fn replayer(&mut self) -> Result<&mut Replayer<File>> {
        match &mut self.log {
            LogState::Replaying(rep) => Ok(rep),
            _ => Err(EngineError::SessionClosed),
        }
    }

    /// Write a `THREAD_SWITCH` marker if another thread emitted last.
    pub(crate) fn note_record_thread(&mut self) -> Result<()> {
        let me = current_record_thread();
        if me != self.last_emitter {
            self.recorder()?
                .write_async(AsyncEvent::ThreadSwitch { thread: me })?;
            self.last_emitter = me;
        }
        Ok(())
    }

    /// Append a value from the calling thread, returning its offset.
    pub(crate) fn record_value<T: LogValue>(&mut self, value: T) -> Result<u64> {
        self.note_record_thread()?;
        Ok(self.recorder()?.write(value)?)
    }
}

thread_local! {
    static RECORD_THREAD: Cell<ThreadIdent> = const { Cell::new(ThreadIdent::MAIN) };
}

pub(crate) fn current_record_thread() -> ThreadIdent {
    RECORD_THREAD.with(Cell::get)
}

pub(crate) fn set_record_thread(ident: ThreadIdent) {
    RECORD_THREAD.with(|c| c.set(ident));
}

pub(crate) struct Shared {
    mode: SessionMode,
    config: SessionConfig,
    argv: Vec<String>,
    log_path: Option<PathBuf>,
    state: Mutex<EngineState>,
    hooks: Mutex<Hooks>,
    control: Mutex<Option<UnixStream>>,
}

/// Handle to a record, replay or disabled session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    // ── Construction ────────────────────────────────────────────

    /// Start recording to `path`, truncating any existing file.
    pub fn record(
        path: impl AsRef<Path>,
        argv: Vec<String>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let header = LogHeader::new(identity_words(), argv.clone());
        let recorder = Recorder::new(file, &header, config.buffer_capacity)?;
        info!("recording to {}", path.display());
        let state = EngineState::new(
            LogState::Recording(recorder),
            &config,
            0,
            ThreadIdent::MAIN,
            u64::MAX,
        );
        Ok(Self::from_parts(
            SessionMode::Record,
            config,
            argv,
            Some(path.to_path_buf()),
            state,
            None,
        ))
    }

    /// Open `path` for replay, serving the controller on `control`.
    ///
    /// Nothing is sent on the socket until [`start`](Session::start).
    /// Registered hooks and commands should be installed before then.
    /// With a fast-forward target the replay skips `INIT` and first
    /// pauses at that stop point.
    pub fn replay(
        path: impl AsRef<Path>,
        control: UnixStream,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let replayer = Replayer::open(File::open(path)?)?;
        let header = replayer.header().clone();
        let current = identity_words();
        if config.check_identity && header.identity != current {
            return Err(EngineError::IdentityMismatch {
                recorded: header.identity,
                current,
            });
        }
        let total = replayer.total_stop_points();
        let first_break = config.fast_forward.map_or(0, |ff| ff.stop_point);
        let state = EngineState::new(
            LogState::Replaying(replayer),
            &config,
            total,
            header.main_thread,
            first_break,
        );
        info!(
            "replaying {} ({} stop points, {} argv entries)",
            path.display(),
            total,
            header.argv.len()
        );
        Ok(Self::from_parts(
            SessionMode::Replay,
            config,
            header.argv,
            Some(path.to_path_buf()),
            state,
            Some(control),
        ))
    }

    /// A session that logs nothing.
    pub fn disabled(argv: Vec<String>) -> Self {
        let config = SessionConfig::default();
        let state = EngineState::new(
            LogState::Passthrough,
            &config,
            0,
            ThreadIdent::MAIN,
            u64::MAX,
        );
        Self::from_parts(SessionMode::Disabled, config, argv, None, state, None)
    }

    fn from_parts(
        mode: SessionMode,
        config: SessionConfig,
        argv: Vec<String>,
        log_path: Option<PathBuf>,
        state: EngineState,
        control: Option<UnixStream>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                config,
                argv,
                log_path,
                state: Mutex::new(state),
                hooks: Mutex::new(Hooks::default()),
                control: Mutex::new(control),
            }),
        }
    }

    /// Announce the replay to the controller and pause at stop point 0.
    ///
    /// Called implicitly by the first [`stop_point`](Session::stop_point)
    /// and by [`finish`](Session::finish). A no-op outside replay and on
    /// the second call.
    pub fn start(&self) -> Result<()> {
        if self.shared.mode != SessionMode::Replay {
            return Ok(());
        }
        let total = {
            let mut st = self.lock();
            if st.started {
                return Ok(());
            }
            st.started = true;
            st.total_stop_points
        };
        if self.shared.config.fast_forward.is_none() {
            self.send_answer(&Answer::with_args(
                ANSWER_INIT,
                FORMAT_VERSION as i64,
                total as i64,
                0,
            ))?;
        }
        self.pause_at_stop_point()
    }

    // ── Internal access ─────────────────────────────────────────

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn hooks(&self) -> MutexGuard<'_, Hooks> {
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn control(&self) -> MutexGuard<'_, Option<UnixStream>> {
        self.shared
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn replace_control(&self, stream: UnixStream) {
        *self.control() = Some(stream);
    }

    pub(crate) fn mark_branch(&self) {
        self.lock().is_branch = true;
    }

    /// Send an answer to the controller.
    ///
    /// Inspection commands use this to reply; any code and payload are
    /// allowed.
    pub fn send_answer(&self, answer: &Answer) -> Result<()> {
        let mut control = self.control();
        let stream = control
            .as_mut()
            .ok_or_else(|| EngineError::protocol("session has no control socket"))?;
        answer.write_to(stream).map_err(EngineError::Socket)
    }

    pub(crate) fn read_command(&self) -> Result<Command> {
        let mut control = self.control();
        let stream = control
            .as_mut()
            .ok_or_else(|| EngineError::protocol("session has no control socket"))?;
        Command::read_from(stream).map_err(EngineError::Socket)
    }

    // ── Queries ─────────────────────────────────────────────────

    /// The session mode.
    pub fn mode(&self) -> SessionMode {
        self.shared.mode
    }

    /// The current I/O mode.
    pub fn io_mode(&self) -> IoMode {
        self.lock().io_mode
    }

    /// Program arguments; during replay these are the recorded ones.
    pub fn argv(&self) -> &[String] {
        &self.shared.argv
    }

    /// Path of the log file, if any.
    pub fn log_path(&self) -> Option<&Path> {
        self.shared.log_path.as_deref()
    }

    /// The configuration the session was opened with.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Number of stop points passed so far.
    pub fn stop_point_seen(&self) -> u64 {
        self.lock().stop_point_seen
    }

    /// Place argument of the most recent stop point.
    pub fn stop_point_place(&self) -> u64 {
        self.lock().stop_point_place
    }

    /// Total stop points of the recording (replay only, else 0).
    pub fn total_stop_points(&self) -> u64 {
        self.lock().total_stop_points
    }

    /// The uid the next allocation will receive.
    pub fn unique_id_seen(&self) -> u64 {
        self.lock().unique_id_seen
    }

    /// Sequential number of the running virtual thread (replay only).
    pub fn current_thread_num(&self) -> u32 {
        self.lock().threads.current_num()
    }

    /// `true` in a process created by `FORK`.
    pub fn is_branch(&self) -> bool {
        self.lock().is_branch
    }

    // ── Emit ────────────────────────────────────────────────────

    /// Log one nondeterministic value.
    ///
    /// While recording, `produce` is called and its result written.
    /// During replay `produce` is not called; the recorded value is
    /// returned instead. Disabled sessions just call `produce`.
    pub fn emit<T: LogValue>(&self, produce: impl FnOnce() -> T) -> Result<T> {
        match self.shared.mode {
            SessionMode::Disabled => Ok(produce()),
            SessionMode::Record => {
                let value = produce();
                self.lock().record_value(value)?;
                Ok(value)
            }
            SessionMode::Replay => self.replay_value(),
        }
    }

    /// Read the next value, handling any async markers in front of it.
    pub(crate) fn replay_value<T: LogValue>(&self) -> Result<T> {
        loop {
            let fetched = {
                let mut st = self.lock();
                if st.io_mode != IoMode::Regular {
                    return Err(EngineError::AttemptedIo);
                }
                st.replayer()?.read::<T>()?
            };
            match fetched {
                Fetched::Value(v) => return Ok(v),
                Fetched::Async(event) => self.handle_async(event)?,
            }
        }
    }

    pub(crate) fn handle_async(&self, event: AsyncEvent) -> Result<()> {
        match event {
            AsyncEvent::ThreadSwitch { thread } => self.switch_to(thread),
            AsyncEvent::FinalizerTrigger { stop_point } => {
                debug!("finalizer pass announced for stop point {stop_point}");
                self.lock().breaks.finalizer_break = stop_point;
                Ok(())
            }
        }
    }

    /// Log a fixed tag byte; replay fails if the log holds another byte.
    pub(crate) fn emit_tag(&self, tag: u8) -> Result<()> {
        match self.shared.mode {
            SessionMode::Replay => {
                let found: u8 = self.replay_value()?;
                if found != tag {
                    return Err(EngineError::UnexpectedFlag {
                        expected: tag,
                        found,
                    });
                }
                Ok(())
            }
            _ => self.emit(|| tag).map(drop),
        }
    }

    /// Anchor the calling thread's interpreter-lock acquisition.
    pub fn gil_acquire_emit(&self) -> Result<()> {
        self.emit_tag(GIL_ACQUIRE_TAG)
    }

    /// Anchor the calling thread's interpreter-lock release.
    pub fn gil_release_emit(&self) -> Result<()> {
        self.emit_tag(GIL_RELEASE_TAG)
    }

    // ── Stop points ─────────────────────────────────────────────

    /// Advance replay time by one stop point.
    ///
    /// Runs a pending finalization pass, evaluates watchpoints and
    /// pauses for the controller when the break is reached. Ignored
    /// while inspection code runs.
    pub fn stop_point(&self, place: u64) -> Result<()> {
        match self.shared.mode {
            SessionMode::Disabled => {
                let mut st = self.lock();
                st.stop_point_seen += 1;
                st.stop_point_place = place;
                Ok(())
            }
            SessionMode::Record => self.record_stop_point(place),
            SessionMode::Replay => self.replay_stop_point(place),
        }
    }

    fn record_stop_point(&self, place: u64) -> Result<()> {
        let run_finalizers = {
            let mut st = self.lock();
            if st.io_mode != IoMode::Regular {
                return Ok(());
            }
            st.note_record_thread()?;
            st.stop_point_seen += 1;
            st.stop_point_place = place;
            if st.finalizers.requested {
                st.finalizers.requested = false;
                let stop_point = st.stop_point_seen;
                st.recorder()?
                    .write_async(AsyncEvent::FinalizerTrigger { stop_point })?;
                true
            } else {
                false
            }
        };
        if run_finalizers {
            self.run_finalizers()?;
        }
        Ok(())
    }

    fn replay_stop_point(&self, place: u64) -> Result<()> {
        self.start()?;
        if self.lock().io_mode != IoMode::Regular {
            return Ok(());
        }
        loop {
            let event = self.lock().replayer()?.poll_async()?;
            match event {
                Some(event) => self.handle_async(event)?,
                None => break,
            }
        }
        let (finalize, watch) = {
            let mut st = self.lock();
            st.stop_point_seen += 1;
            st.stop_point_place = place;
            let seen = st.stop_point_seen;
            if st.breaks.finalizer_break < seen {
                return Err(EngineError::Desync {
                    detail: format!(
                        "finalizer pass for stop point {} was not run",
                        st.breaks.finalizer_break
                    ),
                });
            }
            let watch = st.breaks.mode != BreakpointMode::Ignore && st.breaks.has_watches();
            if seen < st.breaks.stop_point_break() && !watch {
                return Ok(());
            }
            let finalize = st.breaks.finalizer_break == seen;
            if finalize {
                st.breaks.finalizer_break = u64::MAX;
            }
            (finalize, watch)
        };
        if finalize {
            self.run_finalizers()?;
        }
        if watch {
            self.evaluate_watchpoints()?;
        }
        self.pause_at_stop_point()
    }

    // ── Allocation ──────────────────────────────────────────────

    fn next_uid(&self) -> (Uid, bool) {
        let mut st = self.lock();
        let uid = st.unique_id_seen;
        st.unique_id_seen += 1;
        let hit = self.shared.mode == SessionMode::Replay
            && st.io_mode == IoMode::Regular
            && st.future_ids.front() == Some(&uid);
        if hit {
            st.future_ids.pop_front();
        }
        (Uid(uid), hit)
    }

    /// Assign the next uid.
    ///
    /// During replay, a uid listed by `FUTUREIDS` pauses here and
    /// reports `BREAKPOINT(stop point, uid, -1)` before `READY`.
    pub fn allocate_uid(&self) -> Result<Uid> {
        let (uid, hit) = self.next_uid();
        if hit {
            self.pause_at_allocation(uid)?;
        }
        Ok(uid)
    }

    /// Assign the next uid and build the object that carries it.
    ///
    /// Like [`allocate_uid`](Session::allocate_uid), but a `FUTUREIDS`
    /// match first passes the new object to the allocating hook.
    pub fn allocate_object<O: std::any::Any>(&self, build: impl FnOnce(Uid) -> O) -> Result<O> {
        let (uid, hit) = self.next_uid();
        let object = build(uid);
        if hit {
            if let Some(hook) = self.allocating_hook() {
                let saved = self.save_state();
                let outcome = hook(self, uid, &object);
                self.restore_state(saved);
                outcome?;
            }
            self.pause_at_allocation(uid)?;
        }
        Ok(object)
    }

    // ── Breakpoints ─────────────────────────────────────────────

    /// Report a breakpoint hit; what happens depends on the mode the
    /// last `FORWARD` selected.
    pub fn breakpoint(&self, id: i64) {
        if self.shared.mode != SessionMode::Replay {
            return;
        }
        let mut st = self.lock();
        if st.io_mode != IoMode::Regular {
            warn!("breakpoint {id} hit from inspection code, ignored");
            return;
        }
        let seen = st.stop_point_seen;
        st.breaks.hit(seen, Uid::NONE, id);
    }

    /// Trigger breakpoint `-2` whenever replay switches to thread `num`.
    pub fn set_thread_breakpoint(&self, num: Option<u32>) {
        self.lock().breaks.thread_breakpoint = num;
    }

    /// Watch `expression`, starting from `initial`.
    pub fn add_watchpoint(&self, id: i64, expression: Vec<u8>, initial: Vec<u8>) {
        self.lock().breaks.add_watch(id, expression, initial);
    }

    /// Stop watching `id`; returns `false` if it was not watched.
    pub fn remove_watchpoint(&self, id: i64) -> bool {
        self.lock().breaks.remove_watch(id)
    }

    // ── End of run ──────────────────────────────────────────────

    /// End the run.
    ///
    /// Recording writes the stop-point trailer and flushes the log.
    /// Replay checks the trailer and that nothing follows it, then
    /// answers `AT_END` until the controller quits, so a successful
    /// replay finish returns [`EngineError::Quit`].
    pub fn finish(&self) -> Result<()> {
        match self.shared.mode {
            SessionMode::Disabled => Ok(()),
            SessionMode::Record => {
                let mut st = self.lock();
                let seen = st.stop_point_seen;
                st.record_value(seen)?;
                match std::mem::replace(&mut st.log, LogState::Closed) {
                    LogState::Recording(recorder) => {
                        recorder.finish()?;
                        info!("recording finished after {seen} stop points");
                        Ok(())
                    }
                    _ => Err(EngineError::SessionClosed),
                }
            }
            SessionMode::Replay => {
                let outcome = self.start().and_then(|()| self.check_trailer());
                let outcome = match outcome {
                    Ok(()) => self.serve_at_end(),
                    Err(e) => Err(e),
                };
                self.shutdown_threads();
                outcome
            }
        }
    }

    fn check_trailer(&self) -> Result<()> {
        let recorded: u64 = self.replay_value()?;
        let mut st = self.lock();
        let replayed = st.stop_point_seen;
        if recorded != replayed {
            return Err(EngineError::StopPointMismatch { recorded, replayed });
        }
        st.replayer()?.check_at_end()?;
        info!("replay reached the end of the log at stop point {replayed}");
        Ok(())
    }

    /// Final bookkeeping around a program's result.
    ///
    /// Releases parked virtual threads. Inside a forked branch this does
    /// not return: the process exits with status 0 for a clean result
    /// and 1 otherwise.
    pub fn conclude(&self, result: Result<()>) -> Result<()> {
        self.shutdown_threads();
        if self.is_branch() {
            self.exit_branch(result.err());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_session_passes_values_through() {
        let s = Session::disabled(vec!["prog".into()]);
        assert_eq!(s.mode(), SessionMode::Disabled);
        assert_eq!(s.emit(|| 5u32).unwrap(), 5);
        s.stop_point(11).unwrap();
        s.stop_point(12).unwrap();
        assert_eq!(s.stop_point_seen(), 2);
        assert_eq!(s.stop_point_place(), 12);
        assert_eq!(s.allocate_uid().unwrap(), Uid(1));
        assert_eq!(s.allocate_uid().unwrap(), Uid(2));
        s.finish().unwrap();
        assert_eq!(s.argv(), &["prog".to_string()]);
    }

    #[test]
    fn record_thread_defaults_to_main() {
        let handle = std::thread::spawn(current_record_thread);
        assert_eq!(handle.join().unwrap(), ThreadIdent::MAIN);
        let handle = std::thread::spawn(|| {
            set_record_thread(ThreadIdent(4));
            current_record_thread()
        });
        assert_eq!(handle.join().unwrap(), ThreadIdent(4));
    }

    #[test]
    fn record_after_finish_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let s = Session::record(dir.path().join("log"), vec![], SessionConfig::default()).unwrap();
        s.emit(|| 1u8).unwrap();
        s.finish().unwrap();
        assert!(matches!(s.emit(|| 1u8), Err(EngineError::SessionClosed)));
    }

    #[test]
    fn invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SessionConfig {
            buffer_capacity: 1,
            ..Default::default()
        };
        assert!(matches!(
            Session::record(dir.path().join("log"), vec![], cfg),
            Err(EngineError::Config(_))
        ));
    }
}
