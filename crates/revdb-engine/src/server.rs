//! Serving the controller while replay is paused.
//!
//! A pause saves the replay counters, reports pending breakpoint hits,
//! sends `READY` and handles one command. Inspection commands run with
//! the log locked away; whatever they do to the counters is undone when
//! the pause ends.

use log::{debug, error, info, warn};
use revdb_core::Uid;

use crate::breakpoints::{BreakHit, BreakpointMode, ALLOCATION_BREAKPOINT_ID};
use crate::error::{EngineError, Result};
use crate::protocol::{
    decode_future_ids, Answer, Command, ANSWER_AT_END, ANSWER_ATTEMPT_IO, ANSWER_BREAKPOINT,
    ANSWER_READY, CMD_FORK, CMD_FORWARD, CMD_FUTUREIDS, CMD_PING, CMD_QUIT,
};
use crate::session::{IoMode, Session};

/// Counters preserved across a pause.
pub(crate) struct SavedState {
    pub(crate) stop_point_seen: u64,
    pub(crate) unique_id_seen: u64,
    pub(crate) breakpoint_mode: BreakpointMode,
    pub(crate) io_mode: IoMode,
}

impl Session {
    pub(crate) fn save_state(&self) -> SavedState {
        let mut st = self.lock();
        let saved = SavedState {
            stop_point_seen: st.stop_point_seen,
            unique_id_seen: st.unique_id_seen,
            breakpoint_mode: st.breaks.mode,
            io_mode: st.io_mode,
        };
        st.breaks.mode = BreakpointMode::Ignore;
        st.io_mode = IoMode::SavedState;
        saved
    }

    pub(crate) fn restore_state(&self, saved: SavedState) {
        let mut st = self.lock();
        st.stop_point_seen = saved.stop_point_seen;
        st.unique_id_seen = saved.unique_id_seen;
        st.breaks.mode = saved.breakpoint_mode;
        st.io_mode = saved.io_mode;
    }

    // ── Pauses ──────────────────────────────────────────────────

    /// Serve the controller for as long as replay sits on its break.
    pub(crate) fn pause_at_stop_point(&self) -> Result<()> {
        loop {
            {
                let st = self.lock();
                if st.stop_point_seen != st.breaks.interactive_break {
                    return Ok(());
                }
            }
            self.serve_pause()?;
        }
    }

    /// Pause on an allocation named by `FUTUREIDS` until `FORWARD`.
    pub(crate) fn pause_at_allocation(&self, uid: Uid) -> Result<()> {
        {
            let mut st = self.lock();
            let stop_point = st.stop_point_seen;
            st.breaks.force(BreakHit {
                stop_point,
                uid,
                id: ALLOCATION_BREAKPOINT_ID,
            });
        }
        debug!("paused at the allocation of uid {uid}");
        while !self.serve_pause()? {}
        Ok(())
    }

    /// One `READY` and one command. Returns `true` after a `FORWARD`.
    fn serve_pause(&self) -> Result<bool> {
        let mut saved = self.save_state();
        let outcome = self.serve_command(&mut saved);
        self.restore_state(saved);
        self.leave_branch_on_error(outcome)
    }

    fn serve_command(&self, saved: &mut SavedState) -> Result<bool> {
        self.report_breaks()?;
        let thread = self.current_thread_num();
        self.send_answer(&Answer::with_args(
            ANSWER_READY,
            saved.stop_point_seen as i64,
            saved.unique_id_seen as i64,
            i64::from(thread),
        ))?;
        let cmd = self.read_command()?;
        match cmd.code {
            CMD_FORK => {
                self.fork_branch(&cmd)?;
                Ok(false)
            }
            CMD_QUIT => Err(EngineError::Quit),
            CMD_FORWARD => {
                self.forward(&cmd, saved)?;
                Ok(true)
            }
            CMD_FUTUREIDS => {
                let ids = decode_future_ids(&cmd.extra)?;
                let mut st = self.lock();
                st.future_ids = ids
                    .into_iter()
                    .filter(|&id| id >= saved.unique_id_seen)
                    .collect();
                debug!("watching {} future allocations", st.future_ids.len());
                Ok(false)
            }
            CMD_PING => Ok(false),
            code => {
                self.run_inspection(code, &cmd)?;
                Ok(false)
            }
        }
    }

    fn forward(&self, cmd: &Command, saved: &mut SavedState) -> Result<()> {
        if cmd.arg1 < 0 {
            return Err(EngineError::protocol(format!(
                "FORWARD by a negative step count {}",
                cmd.arg1
            )));
        }
        let mode = BreakpointMode::from_wire(cmd.arg2)
            .ok_or_else(|| EngineError::protocol(format!("unknown breakpoint mode {}", cmd.arg2)))?;
        let mut st = self.lock();
        st.breaks.interactive_break = saved.stop_point_seen.saturating_add(cmd.arg1 as u64);
        st.breaks.clear_hits();
        st.breaks.pending_report = true;
        saved.breakpoint_mode = mode;
        Ok(())
    }

    fn run_inspection(&self, code: i32, cmd: &Command) -> Result<()> {
        let handler = if code > 0 { self.command_handler(code) } else { None };
        let Some(handler) = handler else {
            return Err(EngineError::UnknownCommand { code });
        };
        self.lock().io_mode = IoMode::Protected;
        let outcome = handler(self, cmd);
        self.lock().io_mode = IoMode::SavedState;
        match outcome {
            Err(EngineError::AttemptedIo) => {
                warn!("command {code} attempted I/O; ending the session");
                self.send_answer(&Answer::new(ANSWER_ATTEMPT_IO))?;
                Err(EngineError::AttemptedIo)
            }
            other => other,
        }
    }

    /// Send `BREAKPOINT` for each hit collected since the last `FORWARD`.
    pub(crate) fn report_breaks(&self) -> Result<()> {
        let hits = self.lock().breaks.take_report();
        for hit in hits {
            self.send_answer(&Answer::with_args(
                ANSWER_BREAKPOINT,
                hit.stop_point as i64,
                hit.uid.0 as i64,
                hit.id,
            ))?;
        }
        Ok(())
    }

    /// Answer `AT_END` to everything but `FORK` and `QUIT`.
    pub(crate) fn serve_at_end(&self) -> Result<()> {
        let outcome = self.at_end_loop();
        self.leave_branch_on_error(outcome)
    }

    fn at_end_loop(&self) -> Result<()> {
        self.report_breaks()?;
        loop {
            let (seen, uid) = {
                let st = self.lock();
                (st.stop_point_seen, st.unique_id_seen)
            };
            self.send_answer(&Answer::with_args(ANSWER_AT_END, seen as i64, uid as i64, 0))?;
            let cmd = self.read_command()?;
            match cmd.code {
                CMD_FORK => self.fork_branch(&cmd)?,
                CMD_QUIT => return Err(EngineError::Quit),
                code => debug!("command {code} at the end of the log"),
            }
        }
    }

    // ── Watchpoints ─────────────────────────────────────────────

    pub(crate) fn evaluate_watchpoints(&self) -> Result<()> {
        let Some(evaluate) = self.watch_evaluator() else {
            return Ok(());
        };
        let watches = self.lock().breaks.watch_snapshot();
        let saved = self.save_state();
        let stop_point = saved.stop_point_seen;
        self.lock().io_mode = IoMode::Protected;
        let mut changed = Vec::new();
        let mut failure = None;
        for (id, watch) in watches {
            match evaluate(self, &watch.expression) {
                Ok(value) if value != watch.last => changed.push((id, value)),
                Ok(_) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.restore_state(saved);
        if let Some(e) = failure {
            return Err(e);
        }
        let mut st = self.lock();
        for (id, value) in changed {
            st.breaks.update_watch(id, value);
            st.breaks.hit(stop_point, Uid::NONE, id);
        }
        Ok(())
    }

    // ── Branch exit ─────────────────────────────────────────────

    fn leave_branch_on_error<T>(&self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Err(e) if self.is_branch() => self.exit_branch(Some(e)),
            other => other,
        }
    }

    /// Terminate a forked branch process without unwinding.
    pub(crate) fn exit_branch(&self, error: Option<EngineError>) -> ! {
        let status = match &error {
            None => 0,
            Some(e) if e.is_clean_exit() => {
                info!("branch exiting: {e}");
                0
            }
            Some(e) => {
                error!("branch failed: {e}");
                1
            }
        };
        log::logger().flush();
        std::process::exit(status)
    }
}
