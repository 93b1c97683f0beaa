//! The controller end of the control socket.
//!
//! A thin client used by debugger front ends and by the test harness.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::branch::send_fd;
use crate::breakpoints::BreakpointMode;
use crate::error::{EngineError, Result};
use crate::protocol::{
    encode_future_ids, Answer, Command, ANSWER_FORKED, CMD_FORK, CMD_FORWARD, CMD_FUTUREIDS,
    CMD_PING, CMD_QUIT,
};

/// Client for one replay process.
#[derive(Debug)]
pub struct Controller {
    stream: UnixStream,
}

impl Controller {
    /// Wrap a connected control socket.
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Send one command.
    pub fn send(&mut self, cmd: &Command) -> Result<()> {
        cmd.write_to(&mut self.stream).map_err(EngineError::Socket)
    }

    /// Read one answer.
    pub fn recv(&mut self) -> Result<Answer> {
        Answer::read_from(&mut self.stream).map_err(EngineError::Socket)
    }

    /// Read one answer and check its code.
    pub fn expect(&mut self, code: i32) -> Result<Answer> {
        let answer = self.recv()?;
        if answer.code != code {
            return Err(EngineError::protocol(format!(
                "expected answer {code}, got {} ({}, {}, {})",
                answer.code, answer.arg1, answer.arg2, answer.arg3
            )));
        }
        Ok(answer)
    }

    /// Run `steps` stop points forward.
    pub fn forward(&mut self, steps: u64, mode: BreakpointMode) -> Result<()> {
        let steps = i64::try_from(steps)
            .map_err(|_| EngineError::protocol(format!("step count {steps} too large")))?;
        self.send(&Command::with_args(CMD_FORWARD, steps, mode.to_wire(), 0))
    }

    /// Ask for a fresh `READY`.
    pub fn ping(&mut self) -> Result<()> {
        self.send(&Command::new(CMD_PING))
    }

    /// End the session.
    pub fn quit(&mut self) -> Result<()> {
        self.send(&Command::new(CMD_QUIT))
    }

    /// Pause at the allocation of any of `ids`.
    pub fn future_ids(&mut self, ids: &[u64]) -> Result<()> {
        self.send(&Command::new(CMD_FUTUREIDS).with_extra(encode_future_ids(ids)))
    }

    /// Branch the replay; returns the child pid and a controller for it.
    ///
    /// An `active` branch shares the controller's terminal signals.
    pub fn fork(&mut self, active: bool) -> Result<(i32, Controller)> {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        self.send(&Command::with_args(CMD_FORK, i64::from(active), 0, 0))?;
        send_fd(self.stream.as_raw_fd(), theirs.as_raw_fd())?;
        drop(theirs);
        let forked = self.expect(ANSWER_FORKED)?;
        let pid = i32::try_from(forked.arg1)
            .map_err(|_| EngineError::protocol(format!("bad child pid {}", forked.arg1)))?;
        Ok((pid, Controller::new(UnixStream::from(ours))))
    }

    /// The underlying socket.
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }
}
