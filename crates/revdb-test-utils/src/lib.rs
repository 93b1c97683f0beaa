//! Test utilities and mock host types for revdb development.
//!
//! Provides a minimal host runtime ([`MockHeap`], [`MockGil`]) built on
//! the engine's public API, plus [`record_program`] and
//! [`ReplayHarness`] for running the same program closure in record and
//! replay mode within one test.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod harness;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use revdb_core::{ObjectIdentity, Uid};
use revdb_engine::{Result, Session, SessionMode};

pub use harness::{record_program, ReplayHarness};

/// Payload of a mock host object.
#[derive(Debug)]
pub struct MockData {
    uid: Uid,
    pub label: String,
}

impl ObjectIdentity for MockData {
    fn uid(&self) -> Uid {
        self.uid
    }
}

/// Mock host object: reference counted, so weak references work.
pub type MockObject = Arc<MockData>;

/// A toy heap whose "collector" is driven explicitly by the test.
///
/// Objects stay alive while they are roots or while the test holds a
/// clone. [`collect`](MockHeap::collect) drops the root and tells the
/// session the object died.
pub struct MockHeap {
    session: Session,
    roots: Mutex<BTreeMap<Uid, MockObject>>,
    finalizer_queue: Mutex<VecDeque<MockObject>>,
}

impl MockHeap {
    pub fn new(session: &Session) -> Self {
        Self {
            session: session.clone(),
            roots: Mutex::new(BTreeMap::new()),
            finalizer_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Allocate a rooted object.
    pub fn allocate(&self, label: impl Into<String>) -> Result<MockObject> {
        let label = label.into();
        let object = self
            .session
            .allocate_object(|uid| Arc::new(MockData { uid, label }))?;
        self.roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(object.uid(), object.clone());
        Ok(object)
    }

    /// Drop the root for `uid` and report the death to the session.
    pub fn collect(&self, uid: Uid) -> Option<MockObject> {
        let root = self
            .roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&uid);
        self.session.object_died(uid);
        root
    }

    /// Number of rooted objects.
    pub fn live(&self) -> usize {
        self.roots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Put a dead object in the finalizer queue.
    pub fn enqueue_finalizer(&self, object: MockObject) {
        self.session.fq_register(&object);
        self.finalizer_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(object);
        self.session.request_finalizer_trigger();
    }

    /// Next object from the finalizer queue, as the log dictates.
    pub fn poll_finalizer(&self) -> Result<Option<MockObject>> {
        self.session.fq_next_dead(|| {
            self.finalizer_queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
        })
    }
}

/// A global interpreter lock.
///
/// While recording it is a real lock; during replay the log decides
/// which thread runs, so only the tags are checked.
pub struct MockGil {
    session: Session,
    held: Mutex<bool>,
    released: Condvar,
}

impl MockGil {
    pub fn new(session: &Session) -> Self {
        Self {
            session: session.clone(),
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> Result<()> {
        if self.session.mode() != SessionMode::Replay {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            while *held {
                held = self
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            *held = true;
        }
        self.session.gil_acquire_emit()
    }

    pub fn release(&self) -> Result<()> {
        let emitted = self.session.gil_release_emit();
        if self.session.mode() != SessionMode::Replay {
            *self.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
            self.released.notify_one();
        }
        emitted
    }

    /// Run `f` holding the lock.
    pub fn with<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.acquire()?;
        let outcome = f();
        self.release()?;
        outcome
    }
}
