//! Calls into native code that may call back into the program.
//!
//! A callback entered while recording logs `CALLBACK_ENTER_TAG` plus a
//! location byte before its effects. When the external call returns,
//! `CALLBACK_RETURN_TAG` and the result follow. Replay does not make
//! the call; it re-enters the registered callbacks at the recorded
//! positions and returns the recorded result.

use log::trace;
use revdb_log::LogValue;

use crate::error::{EngineError, Result};
use crate::session::{Session, SessionMode};

/// Tag written when native code re-enters the program.
pub const CALLBACK_ENTER_TAG: u8 = 0xFC;

/// Tag written when an external call returns.
pub const CALLBACK_RETURN_TAG: u8 = 0xFD;

impl Session {
    /// Perform an external call whose result is logged.
    pub fn external_call<T: LogValue>(&self, call: impl FnOnce() -> T) -> Result<T> {
        match self.mode() {
            SessionMode::Disabled => Ok(call()),
            SessionMode::Record => {
                let value = call();
                self.emit_tag(CALLBACK_RETURN_TAG)?;
                self.emit(|| value)
            }
            SessionMode::Replay => {
                loop {
                    let tag: u8 = self.replay_value()?;
                    match tag {
                        CALLBACK_RETURN_TAG => break,
                        CALLBACK_ENTER_TAG => {
                            let loc: u8 = self.replay_value()?;
                            self.invoke_callback(loc)?;
                        }
                        found => {
                            return Err(EngineError::UnexpectedFlag {
                                expected: CALLBACK_RETURN_TAG,
                                found,
                            })
                        }
                    }
                }
                self.replay_value()
            }
        }
    }

    /// Log that native code entered the callback at `loc`.
    ///
    /// Call this at the top of the callback while recording. Replay
    /// re-enters callbacks from [`external_call`](Session::external_call)
    /// and ignores this.
    pub fn callback_entered(&self, loc: u8) -> Result<()> {
        if self.mode() != SessionMode::Record {
            return Ok(());
        }
        trace!("callback {loc} entered");
        let mut st = self.lock();
        st.record_value(CALLBACK_ENTER_TAG)?;
        st.record_value(loc)?;
        Ok(())
    }

    /// Run the callback registered for `loc`.
    pub fn invoke_callback(&self, loc: u8) -> Result<()> {
        let callback = self
            .callback(loc)
            .ok_or(EngineError::UnknownCallback { loc })?;
        callback(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_external_call_just_calls() {
        let s = Session::disabled(Vec::new());
        assert_eq!(s.external_call(|| 41u64 + 1).unwrap(), 42);
    }

    #[test]
    fn unregistered_callback_is_an_error() {
        let s = Session::disabled(Vec::new());
        assert!(matches!(s.invoke_callback(3), Err(EngineError::UnknownCallback { loc: 3 })));
        s.register_callback(3, |_| Ok(()));
        s.invoke_callback(3).unwrap();
    }
}
