//! Virtual threads.
//!
//! While recording, program threads run concurrently and the log
//! serializes them: whenever a thread other than the last emitter
//! writes, a `THREAD_SWITCH` marker names it. During replay exactly one
//! thread runs at a time. Each replayed thread is a real OS thread
//! parked on its own channel, and a `THREAD_SWITCH` marker hands control
//! to the named thread and parks the current one.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error};
use revdb_core::{ThreadIdent, Uid};
use revdb_log::AsyncEvent;

use crate::breakpoints::THREAD_BREAKPOINT_ID;
use crate::error::{EngineError, Result};
use crate::hooks::ThreadLocalsHook;
use crate::session::{set_record_thread, EngineState, Session, SessionMode};

/// Tag written by a thread before its body runs.
pub const THREAD_START_TAG: u8 = b'S';

/// Tag written by a thread after its body returns.
pub const THREAD_EXIT_TAG: u8 = b'E';

pub(crate) type ThreadBody = Box<dyn FnOnce(&Session) -> Result<()> + Send>;

#[derive(Debug)]
pub(crate) enum Wake {
    Run,
    Shutdown,
    Abort(ThreadIdent, String),
    /// Another thread ended the session cleanly (`QUIT` or `ATTEMPT_IO`).
    Exit { attempted_io: bool },
}

struct ReplayThread {
    num: u32,
    wake: Sender<Wake>,
    parked: Receiver<Wake>,
    saved_locals: Option<Box<dyn Any + Send>>,
}

pub(crate) enum Handoff {
    Resume(Sender<Wake>),
    Spawn { ident: ThreadIdent, body: ThreadBody },
}

/// Replay-side bookkeeping of virtual threads.
pub(crate) struct ThreadTable {
    current: ThreadIdent,
    threads: BTreeMap<ThreadIdent, ReplayThread>,
    pending: BTreeMap<ThreadIdent, ThreadBody>,
    finished: BTreeSet<ThreadIdent>,
    next_num: u32,
}

impl ThreadTable {
    pub(crate) fn new(main: ThreadIdent) -> Self {
        let mut table = Self {
            current: main,
            threads: BTreeMap::new(),
            pending: BTreeMap::new(),
            finished: BTreeSet::new(),
            next_num: 1,
        };
        table.register(main);
        table
    }

    fn register(&mut self, ident: ThreadIdent) -> u32 {
        let (wake, parked) = unbounded();
        let num = self.next_num;
        self.next_num += 1;
        self.threads.insert(
            ident,
            ReplayThread {
                num,
                wake,
                parked,
                saved_locals: None,
            },
        );
        num
    }

    pub(crate) fn current(&self) -> ThreadIdent {
        self.current
    }

    pub(crate) fn current_num(&self) -> u32 {
        self.threads.get(&self.current).map_or(0, |t| t.num)
    }

    /// Threads that exist and have not exited, parked or running.
    pub(crate) fn live_count(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn add_pending(&mut self, ident: ThreadIdent, body: ThreadBody) {
        self.pending.insert(ident, body);
    }

    fn suspend(
        &mut self,
        ident: ThreadIdent,
        locals: Option<Box<dyn Any + Send>>,
    ) -> Option<Receiver<Wake>> {
        let thread = self.threads.get_mut(&ident)?;
        thread.saved_locals = locals;
        Some(thread.parked.clone())
    }

    fn take_locals(&mut self, ident: ThreadIdent) -> Option<Box<dyn Any + Send>> {
        self.threads.get_mut(&ident)?.saved_locals.take()
    }

    /// Make `target` current, spawning it on first use.
    pub(crate) fn activate(&mut self, target: ThreadIdent) -> Result<(Handoff, u32)> {
        if let Some(thread) = self.threads.get(&target) {
            self.current = target;
            return Ok((Handoff::Resume(thread.wake.clone()), thread.num));
        }
        let body = self
            .pending
            .remove(&target)
            .ok_or(EngineError::UnknownThread { thread: target })?;
        let num = self.register(target);
        self.current = target;
        Ok((Handoff::Spawn { ident: target, body }, num))
    }

    fn finish(&mut self, ident: ThreadIdent) {
        self.threads.remove(&ident);
        self.finished.insert(ident);
    }

    fn is_finished(&self, ident: ThreadIdent) -> bool {
        self.finished.contains(&ident)
    }

    fn senders_except(&self, ident: ThreadIdent) -> Vec<Sender<Wake>> {
        self.threads
            .iter()
            .filter(|(id, _)| **id != ident)
            .map(|(_, t)| t.wake.clone())
            .collect()
    }
}

/// Note a thread breakpoint if `num` is the watched thread.
fn check_thread_breakpoint(st: &mut EngineState, num: u32) {
    if st.breaks.thread_breakpoint == Some(num) {
        let seen = st.stop_point_seen;
        st.breaks.hit(seen, Uid::NONE, THREAD_BREAKPOINT_ID);
    }
}

/// Handle to a thread started with [`Session::start_thread`].
pub struct ThreadHandle {
    ident: ThreadIdent,
    inner: Option<JoinHandle<Result<()>>>,
}

impl ThreadHandle {
    /// The thread's recorded identity.
    pub fn ident(&self) -> ThreadIdent {
        self.ident
    }

    /// Wait for the thread to finish.
    ///
    /// During replay this runs the log forward, switching threads as
    /// recorded, until the thread has exited.
    pub fn join(self, session: &Session) -> Result<()> {
        match self.inner {
            Some(handle) => handle
                .join()
                .map_err(|_| EngineError::host(format!("{} panicked", self.ident)))?,
            None => session.wait_virtual_thread(self.ident),
        }
    }
}

impl Session {
    /// Start a program thread running `body`.
    ///
    /// While recording the thread starts at once. During replay it
    /// starts when the log first switches to it.
    pub fn start_thread<F>(&self, body: F) -> Result<ThreadHandle>
    where
        F: FnOnce(&Session) -> Result<()> + Send + 'static,
    {
        match self.mode() {
            SessionMode::Disabled => {
                let ident = {
                    let mut st = self.lock();
                    let ident = st.next_thread;
                    st.next_thread = ident.next();
                    ident
                };
                let session = self.clone();
                let handle = thread::Builder::new()
                    .name(format!("revdb-{ident}"))
                    .spawn(move || body(&session))?;
                Ok(ThreadHandle {
                    ident,
                    inner: Some(handle),
                })
            }
            SessionMode::Record => {
                let ident = {
                    let mut st = self.lock();
                    let ident = st.next_thread;
                    st.next_thread = ident.next();
                    st.record_value(ident.0)?;
                    ident
                };
                let session = self.clone();
                let handle = thread::Builder::new()
                    .name(format!("revdb-{ident}"))
                    .spawn(move || {
                        set_record_thread(ident);
                        session.emit_tag(THREAD_START_TAG)?;
                        body(&session)?;
                        session.emit_tag(THREAD_EXIT_TAG)
                    })?;
                debug!("started {ident}");
                Ok(ThreadHandle {
                    ident,
                    inner: Some(handle),
                })
            }
            SessionMode::Replay => {
                let ident = ThreadIdent(self.replay_value::<u64>()?);
                self.lock().threads.add_pending(ident, Box::new(body));
                debug!("{ident} will start when the log switches to it");
                Ok(ThreadHandle { ident, inner: None })
            }
        }
    }

    /// Suspend the running virtual thread and resume `target`.
    pub(crate) fn switch_to(&self, target: ThreadIdent) -> Result<()> {
        if self.lock().threads.current() == target {
            return Ok(());
        }
        let hook = self.thread_locals_hook();
        let locals = hook.as_ref().map(|h| h.save());
        let (me, parked, handoff) = {
            let mut st = self.lock();
            let me = st.threads.current();
            let parked = st
                .threads
                .suspend(me, locals)
                .ok_or(EngineError::UnknownThread { thread: me })?;
            let (handoff, num) = st.threads.activate(target)?;
            check_thread_breakpoint(&mut st, num);
            (me, parked, handoff)
        };
        debug!("switching {me} -> {target}");
        self.hand_off(handoff)?;
        self.park(me, &parked, hook.as_deref())
    }

    fn hand_off(&self, handoff: Handoff) -> Result<()> {
        match handoff {
            Handoff::Resume(wake) => wake.send(Wake::Run).map_err(|_| EngineError::SessionClosed),
            Handoff::Spawn { ident, body } => {
                let session = self.clone();
                thread::Builder::new()
                    .name(format!("revdb-{ident}"))
                    .spawn(move || session.run_virtual_thread(ident, body))?;
                Ok(())
            }
        }
    }

    fn park(
        &self,
        me: ThreadIdent,
        parked: &Receiver<Wake>,
        hook: Option<&dyn ThreadLocalsHook>,
    ) -> Result<()> {
        match parked.recv() {
            Ok(Wake::Run) => {
                let locals = self.lock().threads.take_locals(me);
                if let (Some(hook), Some(locals)) = (hook, locals) {
                    hook.restore(locals);
                }
                Ok(())
            }
            Ok(Wake::Abort(thread, detail)) => Err(EngineError::VirtualThreadFailed { thread, detail }),
            Ok(Wake::Exit { attempted_io: true }) => Err(EngineError::AttemptedIo),
            Ok(Wake::Exit { attempted_io: false }) => Err(EngineError::Quit),
            Ok(Wake::Shutdown) | Err(_) => Err(EngineError::SessionClosed),
        }
    }

    fn run_virtual_thread(self, ident: ThreadIdent, body: ThreadBody) {
        let outcome = self
            .emit_tag(THREAD_START_TAG)
            .and_then(|()| body(&self))
            .and_then(|()| self.emit_tag(THREAD_EXIT_TAG))
            .and_then(|()| self.exit_virtual_thread(ident));
        match outcome {
            Ok(()) | Err(EngineError::SessionClosed | EngineError::VirtualThreadFailed { .. }) => {}
            Err(e) if e.is_clean_exit() => {
                debug!("session ended in virtual {ident}: {e}");
                let attempted_io = matches!(e, EngineError::AttemptedIo);
                let senders = self.lock().threads.senders_except(ident);
                for wake in senders {
                    let _ = wake.send(Wake::Exit { attempted_io });
                }
            }
            Err(e) => {
                error!("virtual {ident} failed: {e}");
                let senders = self.lock().threads.senders_except(ident);
                for wake in senders {
                    let _ = wake.send(Wake::Abort(ident, e.to_string()));
                }
            }
        }
    }

    /// Retire the current thread and hand control to the next one.
    fn exit_virtual_thread(&self, ident: ThreadIdent) -> Result<()> {
        let handoff = {
            let mut st = self.lock();
            st.threads.finish(ident);
            let event = st.replayer()?.next_async()?;
            let AsyncEvent::ThreadSwitch { thread } = event else {
                return Err(EngineError::Desync {
                    detail: format!("expected a thread switch after {ident} exited, log has {event:?}"),
                });
            };
            let (handoff, num) = st.threads.activate(thread)?;
            check_thread_breakpoint(&mut st, num);
            handoff
        };
        debug!("{ident} exited");
        self.hand_off(handoff)
    }

    pub(crate) fn wait_virtual_thread(&self, ident: ThreadIdent) -> Result<()> {
        loop {
            let event = {
                let mut st = self.lock();
                if st.threads.is_finished(ident) {
                    return Ok(());
                }
                st.replayer()?.poll_async()?
            };
            match event {
                Some(event) => self.handle_async(event)?,
                None => {
                    return Err(EngineError::Desync {
                        detail: format!("joining {ident}, but the log does not switch to it"),
                    })
                }
            }
        }
    }

    /// Release every parked virtual thread.
    pub(crate) fn shutdown_threads(&self) {
        if self.mode() != SessionMode::Replay {
            return;
        }
        let senders = {
            let st = self.lock();
            st.threads.senders_except(st.threads.current())
        };
        for wake in senders {
            let _ = wake.send(Wake::Shutdown);
        }
    }

    /// Number of virtual threads that have not exited (replay only).
    pub fn live_threads(&self) -> usize {
        self.lock().threads.live_count()
    }
}
