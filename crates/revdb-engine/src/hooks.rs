//! Host-supplied callbacks.
//!
//! Hooks are stored behind their own lock, separate from the engine
//! state. They are cloned out before being called so host code always
//! runs with no engine lock held and may call back into the session.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use revdb_core::Uid;

use crate::error::Result;
use crate::protocol::Command;
use crate::session::Session;

/// Handler for a registered inspection command.
///
/// Runs while replay is paused, with log access refused. Replies are
/// sent with [`Session::send_answer`].
pub type CommandHandler = Arc<dyn Fn(&Session, &Command) -> Result<()> + Send + Sync>;

/// Callback re-entered from native code, identified by a location byte.
pub type CallbackFn = Arc<dyn Fn(&Session) -> Result<()> + Send + Sync>;

/// Called with each allocation that matches a `FUTUREIDS` entry.
pub type AllocatingHook = Arc<dyn Fn(&Session, Uid, &dyn Any) -> Result<()> + Send + Sync>;

/// Called at the end of every finalization pass to drain finalizer queues.
pub type FinalizerTriggerHook = Arc<dyn Fn(&Session) -> Result<()> + Send + Sync>;

/// Evaluates a watchpoint expression to its current value.
pub type WatchEvaluator = Arc<dyn Fn(&Session, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Saves and restores the host's per-thread state around virtual
/// thread switches during replay.
pub trait ThreadLocalsHook: Send + Sync {
    /// Snapshot the state of the thread about to be suspended.
    fn save(&self) -> Box<dyn Any + Send>;

    /// Reinstate a snapshot when its thread resumes.
    fn restore(&self, saved: Box<dyn Any + Send>);
}

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) commands: IndexMap<i32, CommandHandler>,
    pub(crate) callbacks: BTreeMap<u8, CallbackFn>,
    pub(crate) allocating: Option<AllocatingHook>,
    pub(crate) finalizer_trigger: Option<FinalizerTriggerHook>,
    pub(crate) watch_evaluator: Option<WatchEvaluator>,
    pub(crate) thread_locals: Option<Arc<dyn ThreadLocalsHook>>,
}

impl Session {
    /// Register a handler for a positive command code.
    ///
    /// Returns the handler previously registered for `code`, if any.
    /// Negative codes are reserved for built-in commands and are never
    /// dispatched to handlers.
    pub fn register_command<F>(&self, code: i32, handler: F) -> Option<CommandHandler>
    where
        F: Fn(&Session, &Command) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks().commands.insert(code, Arc::new(handler))
    }

    /// Register the callback for a native re-entry location.
    pub fn register_callback<F>(&self, loc: u8, callback: F)
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks().callbacks.insert(loc, Arc::new(callback));
    }

    /// Set the hook run on allocations matching `FUTUREIDS`.
    pub fn set_allocating_hook<F>(&self, hook: F)
    where
        F: Fn(&Session, Uid, &dyn Any) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks().allocating = Some(Arc::new(hook));
    }

    /// Set the hook run after destructors in every finalization pass.
    pub fn set_finalizer_trigger<F>(&self, hook: F)
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks().finalizer_trigger = Some(Arc::new(hook));
    }

    /// Set the watchpoint expression evaluator.
    pub fn set_watch_evaluator<F>(&self, evaluator: F)
    where
        F: Fn(&Session, &[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.hooks().watch_evaluator = Some(Arc::new(evaluator));
    }

    /// Set the thread-locals save/restore hook.
    pub fn set_thread_locals_hook(&self, hook: Arc<dyn ThreadLocalsHook>) {
        self.hooks().thread_locals = Some(hook);
    }

    pub(crate) fn command_handler(&self, code: i32) -> Option<CommandHandler> {
        self.hooks().commands.get(&code).cloned()
    }

    pub(crate) fn callback(&self, loc: u8) -> Option<CallbackFn> {
        self.hooks().callbacks.get(&loc).cloned()
    }

    pub(crate) fn allocating_hook(&self) -> Option<AllocatingHook> {
        self.hooks().allocating.clone()
    }

    pub(crate) fn finalizer_trigger_hook(&self) -> Option<FinalizerTriggerHook> {
        self.hooks().finalizer_trigger.clone()
    }

    pub(crate) fn watch_evaluator(&self) -> Option<WatchEvaluator> {
        self.hooks().watch_evaluator.clone()
    }

    pub(crate) fn thread_locals_hook(&self) -> Option<Arc<dyn ThreadLocalsHook>> {
        self.hooks().thread_locals.clone()
    }
}
