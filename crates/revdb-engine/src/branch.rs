//! Process branching for `FORK`.
//!
//! The controller sends `FORK` followed by one byte carrying a socket
//! descriptor. The engine creates a process that continues the replay
//! from the current point and talks to the controller over that socket.
//! The parent answers `FORKED(child pid)` and keeps serving its own
//! socket.
//!
//! A plain `fork()` only copies the calling thread, so it is used only
//! while a single virtual thread is live. Otherwise the branch is a
//! fresh copy of the executable that fast-forwards to the same stop
//! point.

use std::fs::File;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::Command as ProcessCommand;

use log::{debug, info};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{EngineError, Result};
use crate::launch::{FAST_FORWARD_ENV, REPLAY_FLAG};
use crate::protocol::{Answer, Command, ANSWER_FORKED};
use crate::session::Session;

/// What a brancher is asked to do.
#[derive(Debug)]
pub struct BranchRequest {
    /// Control socket for the new branch.
    pub socket: OwnedFd,
    /// `false` keeps the branch out of the controller's terminal signals.
    pub active: bool,
}

/// Which side of a branch the caller is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchOutcome {
    /// The original process; `child` runs the new branch.
    Parent {
        /// Process id of the branch.
        child: Pid,
    },
    /// The new branch, continuing the replay.
    Child,
}

/// A way of creating a process that continues the current replay.
pub trait ProcessBrancher {
    /// Create the branch.
    fn branch(&self, session: &Session, request: BranchRequest) -> Result<BranchOutcome>;
}

/// Branch with `fork()`; valid while one virtual thread is live.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForkBrancher;

impl ProcessBrancher for ForkBrancher {
    fn branch(&self, session: &Session, request: BranchRequest) -> Result<BranchOutcome> {
        #[allow(unsafe_code)]
        // SAFETY: the calling thread holds no engine lock and is the only
        // thread the child needs; every other thread is parked on a
        // channel it never touches again in the child.
        let forked = unsafe { fork() }?;
        match forked {
            ForkResult::Parent { child } => {
                drop(request.socket);
                Ok(BranchOutcome::Parent { child })
            }
            ForkResult::Child => {
                let path = session
                    .log_path()
                    .ok_or_else(|| EngineError::protocol("replay session has no log path"))?;
                let file = File::open(path)?;
                session.lock().replayer()?.replace_source(file)?;
                session.replace_control(UnixStream::from(request.socket));
                if !request.active {
                    ignore_signal(Signal::SIGINT)?;
                }
                session.mark_branch();
                Ok(BranchOutcome::Child)
            }
        }
    }
}

/// Branch by re-running the executable with a fast-forward target.
#[derive(Clone, Copy, Debug, Default)]
pub struct RespawnBrancher;

impl RespawnBrancher {
    /// The command that starts a branch serving `fd`.
    ///
    /// The branch replays `session`'s log silently up to its current
    /// stop point.
    pub fn command(&self, session: &Session, fd: RawFd) -> Result<ProcessCommand> {
        let log = session
            .log_path()
            .ok_or_else(|| EngineError::protocol("replay session has no log path"))?;
        let mut cmd = ProcessCommand::new(std::env::current_exe()?);
        cmd.arg(REPLAY_FLAG)
            .arg(log)
            .arg(fd.to_string())
            .env(FAST_FORWARD_ENV, session.stop_point_seen().to_string());
        Ok(cmd)
    }
}

impl ProcessBrancher for RespawnBrancher {
    fn branch(&self, session: &Session, request: BranchRequest) -> Result<BranchOutcome> {
        let fd = request.socket.as_raw_fd();
        let mut cmd = self.command(session, fd)?;
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        if !request.active {
            cmd.process_group(0);
        }
        let child = cmd.spawn()?;
        drop(request.socket);
        let child = i32::try_from(child.id())
            .map_err(|_| EngineError::protocol(format!("child pid {} out of range", child.id())))?;
        Ok(BranchOutcome::Parent {
            child: Pid::from_raw(child),
        })
    }
}

/// Which brancher `FORK` uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchStrategy {
    /// [`ForkBrancher`].
    Fork,
    /// [`RespawnBrancher`].
    Respawn,
}

impl BranchStrategy {
    /// `fork()` cannot carry parked threads, so more than one live
    /// virtual thread means respawning.
    pub fn for_live_threads(live: usize) -> Self {
        if live > 1 {
            Self::Respawn
        } else {
            Self::Fork
        }
    }

    fn brancher(self) -> &'static dyn ProcessBrancher {
        match self {
            Self::Fork => &ForkBrancher,
            Self::Respawn => &RespawnBrancher,
        }
    }
}

impl Session {
    pub(crate) fn fork_branch(&self, cmd: &Command) -> Result<()> {
        let socket = {
            let control = self.control();
            let stream = control
                .as_ref()
                .ok_or_else(|| EngineError::protocol("session has no control socket"))?;
            receive_fd(stream.as_raw_fd())?
        };
        ignore_signal(Signal::SIGCHLD)?;
        let request = BranchRequest {
            socket,
            active: cmd.arg1 != 0,
        };
        let live = self.live_threads();
        let strategy = BranchStrategy::for_live_threads(live);
        debug!("{live} virtual threads live; branching with {strategy:?}");
        let outcome = strategy.brancher().branch(self, request)?;
        match outcome {
            BranchOutcome::Parent { child } => {
                info!("created branch {child} at stop point {}", self.stop_point_seen());
                self.send_answer(&Answer::with_args(
                    ANSWER_FORKED,
                    i64::from(child.as_raw()),
                    0,
                    0,
                ))
            }
            BranchOutcome::Child => Ok(()),
        }
    }
}

fn ignore_signal(sig: Signal) -> Result<()> {
    #[allow(unsafe_code)]
    // SAFETY: SIG_IGN installs no handler code.
    let _previous = unsafe { signal(sig, SigHandler::SigIgn) }?;
    Ok(())
}

/// Receive one descriptor sent with [`send_fd`].
pub fn receive_fd(socket: RawFd) -> Result<OwnedFd> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut space = nix::cmsg_space!(RawFd);
    let msg = recvmsg::<()>(socket, &mut iov, Some(&mut space), MsgFlags::MSG_CMSG_CLOEXEC)?;
    if msg.bytes == 0 {
        return Err(EngineError::protocol("control socket closed while a descriptor was expected"));
    }
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                #[allow(unsafe_code)]
                // SAFETY: the kernel just installed `fd` in this process
                // and nothing else refers to it.
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                return Ok(owned);
            }
        }
    }
    Err(EngineError::protocol("FORK frame was not followed by a descriptor"))
}

/// Send `fd` over `socket` as a one-byte message with `SCM_RIGHTS`.
pub fn send_fd(socket: RawFd, fd: RawFd) -> Result<()> {
    let iov = [IoSlice::new(&[0u8])];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(socket, &iov, &cmsg, MsgFlags::empty(), None)?;
    Ok(())
}
