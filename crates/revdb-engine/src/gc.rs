//! Weak references, destructors and finalizer queues.
//!
//! Garbage collection differs between record and replay, so everything
//! it can observe is logged:
//!
//! - each weak reference logs one liveness byte per creation and per
//!   successful dereference. The byte is written as `DEAD` and patched
//!   to `ALIVE` the next time the reference is found alive;
//! - destructor runs are grouped into finalization passes, announced
//!   by a `FINALIZER_TRIGGER` marker and followed by the uids of the
//!   dead objects;
//! - finalizer-queue polls log the uid they returned.

use std::any::Any;
use std::collections::BTreeMap;

use log::debug;
use revdb_core::{HostObject, ObjectIdentity, Uid, WeakHandle};

use crate::error::{EngineError, Result};
use crate::session::{IoMode, Session, SessionMode};

/// Liveness byte: the target died before the next dereference.
pub const WEAKREF_AFTERWARDS_DEAD: u8 = b'D';

/// Liveness byte: the target was still alive at the next dereference.
pub const WEAKREF_AFTERWARDS_ALIVE: u8 = b'A';

const UNTRACKED: i64 = -1;

/// A weak reference whose observed liveness replays exactly.
///
/// While recording this holds a real weak handle. During replay it
/// holds the target strongly for as long as the recording found the
/// target alive, and nothing afterwards.
pub struct WeakRef<O: HostObject> {
    target: WeakTarget<O>,
    prev_log_offset: i64,
}

enum WeakTarget<O: HostObject> {
    Weak(O::Weak),
    Strong(O),
    Dead,
}

impl<O: HostObject> WeakRef<O> {
    fn untracked(target: &O) -> Self {
        Self {
            target: WeakTarget::Weak(target.downgrade()),
            prev_log_offset: UNTRACKED,
        }
    }

    /// `false` for references created by inspection code or in a
    /// disabled session; those log nothing.
    pub fn is_tracked(&self) -> bool {
        self.prev_log_offset != UNTRACKED
    }

    /// Log offset of the last liveness byte (record only).
    pub fn prev_log_offset(&self) -> i64 {
        self.prev_log_offset
    }
}

pub(crate) type Destructor = Box<dyn FnOnce(&Session) -> Result<()> + Send>;

#[derive(Default)]
pub(crate) struct FinalizerState {
    destructors: BTreeMap<Uid, Destructor>,
    dead_pending: Vec<Uid>,
    pub(crate) requested: bool,
    queued: BTreeMap<Uid, Box<dyn Any + Send>>,
}

impl Session {
    // ── Weak references ─────────────────────────────────────────

    /// Create a weak reference to `target`.
    pub fn weakref_create<O: HostObject>(&self, target: &O) -> Result<WeakRef<O>> {
        if self.io_mode() != IoMode::Regular {
            return Ok(WeakRef::untracked(target));
        }
        match self.mode() {
            SessionMode::Disabled => Ok(WeakRef::untracked(target)),
            SessionMode::Record => {
                let offset = self.lock().record_value(WEAKREF_AFTERWARDS_DEAD)?;
                Ok(WeakRef {
                    target: WeakTarget::Weak(target.downgrade()),
                    prev_log_offset: offset as i64,
                })
            }
            SessionMode::Replay => {
                let flag: u8 = self.replay_value()?;
                let target = match flag {
                    WEAKREF_AFTERWARDS_ALIVE => WeakTarget::Strong(target.clone()),
                    WEAKREF_AFTERWARDS_DEAD => WeakTarget::Dead,
                    found => {
                        return Err(EngineError::UnexpectedFlag {
                            expected: WEAKREF_AFTERWARDS_DEAD,
                            found,
                        })
                    }
                };
                Ok(WeakRef {
                    target,
                    prev_log_offset: 0,
                })
            }
        }
    }

    /// Dereference a weak reference.
    ///
    /// Returns the target if it was alive at this point of the
    /// recording.
    pub fn weakref_deref<O: HostObject>(&self, weakref: &mut WeakRef<O>) -> Result<Option<O>> {
        match &weakref.target {
            WeakTarget::Dead => Ok(None),
            WeakTarget::Weak(handle) => {
                let Some(object) = handle.upgrade() else {
                    return Ok(None);
                };
                if weakref.is_tracked() && self.mode() == SessionMode::Record {
                    let mut st = self.lock();
                    st.recorder()?.patch_byte(
                        weakref.prev_log_offset as u64,
                        WEAKREF_AFTERWARDS_DEAD,
                        WEAKREF_AFTERWARDS_ALIVE,
                    )?;
                    weakref.prev_log_offset = st.record_value(WEAKREF_AFTERWARDS_DEAD)? as i64;
                }
                Ok(Some(object))
            }
            WeakTarget::Strong(object) => {
                let object = object.clone();
                if self.io_mode() != IoMode::Regular {
                    return Ok(Some(object));
                }
                let flag: u8 = self.replay_value()?;
                match flag {
                    WEAKREF_AFTERWARDS_ALIVE => {}
                    WEAKREF_AFTERWARDS_DEAD => weakref.target = WeakTarget::Dead,
                    found => {
                        return Err(EngineError::UnexpectedFlag {
                            expected: WEAKREF_AFTERWARDS_ALIVE,
                            found,
                        })
                    }
                }
                Ok(Some(object))
            }
        }
    }

    // ── Destructors ─────────────────────────────────────────────

    /// Register the destructor to run when `object` dies.
    ///
    /// Destructors only run inside finalization passes, never directly
    /// from the collector.
    pub fn register_destructor<O, F>(&self, object: &O, destructor: F)
    where
        O: ObjectIdentity + ?Sized,
        F: FnOnce(&Session) -> Result<()> + Send + 'static,
    {
        self.lock()
            .finalizers
            .destructors
            .insert(object.uid(), Box::new(destructor));
    }

    /// Tell the recorder that the object `uid` was collected.
    ///
    /// Its destructor runs in the next finalization pass, at the next
    /// stop point. Replay ignores this: passes come from the log.
    pub fn object_died(&self, uid: Uid) {
        if self.mode() != SessionMode::Record {
            return;
        }
        let mut st = self.lock();
        if st.finalizers.destructors.contains_key(&uid) && !st.finalizers.dead_pending.contains(&uid) {
            st.finalizers.dead_pending.push(uid);
        }
        st.finalizers.requested = true;
    }

    /// Ask for a finalization pass at the next stop point (record only).
    pub fn request_finalizer_trigger(&self) {
        if self.mode() == SessionMode::Record {
            self.lock().finalizers.requested = true;
        }
    }

    pub(crate) fn run_finalizers(&self) -> Result<()> {
        let due = match self.mode() {
            SessionMode::Disabled => return Ok(()),
            SessionMode::Record => {
                let mut st = self.lock();
                let pending = std::mem::take(&mut st.finalizers.dead_pending);
                let mut due = Vec::with_capacity(pending.len());
                for uid in pending {
                    st.record_value(uid.0 as i64)?;
                    let destructor = st
                        .finalizers
                        .destructors
                        .remove(&uid)
                        .ok_or(EngineError::MissingDestructor { uid })?;
                    due.push(destructor);
                }
                st.record_value(-1i64)?;
                due
            }
            SessionMode::Replay => {
                let mut due = Vec::new();
                loop {
                    let raw: i64 = self.replay_value()?;
                    if raw == -1 {
                        break;
                    }
                    let uid = Uid(raw as u64);
                    let destructor = self
                        .lock()
                        .finalizers
                        .destructors
                        .remove(&uid)
                        .ok_or(EngineError::MissingDestructor { uid })?;
                    due.push(destructor);
                }
                due
            }
        };
        debug!("finalization pass at stop point {}: {} destructors", self.stop_point_seen(), due.len());
        for destructor in due {
            destructor(self)?;
        }
        if let Some(hook) = self.finalizer_trigger_hook() {
            hook(self)?;
        }
        Ok(())
    }

    // ── Finalizer queues ────────────────────────────────────────

    /// Keep `object` available to [`fq_next_dead`](Session::fq_next_dead).
    ///
    /// During replay the queue is rebuilt from the log, so the engine
    /// holds a strong clone of every object that may appear in it.
    pub fn fq_register<O: HostObject>(&self, object: &O) {
        if self.mode() != SessionMode::Replay {
            return;
        }
        let mut st = self.lock();
        if st.io_mode == IoMode::Regular {
            st.finalizers
                .queued
                .insert(object.uid(), Box::new(object.clone()));
        }
    }

    /// Fetch the next dead object from a finalizer queue.
    ///
    /// `poll` is the host's own queue and is only consulted while
    /// recording or disabled.
    pub fn fq_next_dead<O: HostObject>(&self, poll: impl FnOnce() -> Option<O>) -> Result<Option<O>> {
        match self.mode() {
            SessionMode::Disabled => Ok(poll()),
            SessionMode::Record => {
                let object = poll();
                let raw = object.as_ref().map_or(Uid::NONE.0, |o| o.uid().0);
                self.lock().record_value(raw)?;
                Ok(object)
            }
            SessionMode::Replay => {
                let raw: u64 = self.replay_value()?;
                let uid = Uid(raw);
                if uid.is_none() {
                    return Ok(None);
                }
                let boxed = self
                    .lock()
                    .finalizers
                    .queued
                    .remove(&uid)
                    .ok_or(EngineError::MissingFinalizerObject { uid })?;
                boxed
                    .downcast::<O>()
                    .map(|object| Some(*object))
                    .map_err(|_| EngineError::host(format!("finalizer-queue object {uid} has another type")))
            }
        }
    }
}
