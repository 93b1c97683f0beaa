//! Running one program closure in record and replay mode.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use revdb_engine::{Controller, EngineError, Result, Session, SessionConfig};

/// Record `program` into `path` and finish the log.
pub fn record_program<F>(path: &Path, argv: Vec<String>, program: F) -> Result<()>
where
    F: FnOnce(&Session) -> Result<()>,
{
    let session = Session::record(path, argv, SessionConfig::default())?;
    program(&session)?;
    session.finish()
}

/// A replay running on its own thread, driven through a [`Controller`].
pub struct ReplayHarness {
    controller: Controller,
    handle: JoinHandle<Result<()>>,
}

impl ReplayHarness {
    /// Open `log` for replay and run `program` under it.
    ///
    /// The replay announces itself with `INIT` and pauses at stop
    /// point 0 before `program` runs.
    pub fn start<F>(log: &Path, config: SessionConfig, program: F) -> Result<Self>
    where
        F: FnOnce(&Session) -> Result<()> + Send + 'static,
    {
        let (ours, theirs) = UnixStream::pair()?;
        let log: PathBuf = log.to_path_buf();
        let handle = thread::Builder::new()
            .name("revdb-replay".into())
            .spawn(move || {
                let session = Session::replay(&log, theirs, config)?;
                let result = session
                    .start()
                    .and_then(|()| program(&session))
                    .and_then(|()| session.finish());
                session.conclude(result)
            })?;
        Ok(Self {
            controller: Controller::new(ours),
            handle,
        })
    }

    pub fn controller(&mut self) -> &mut Controller {
        &mut self.controller
    }

    /// Wait for the replay; `QUIT` and `ATTEMPT_IO` endings count as success.
    pub fn join(self) -> Result<()> {
        drop(self.controller);
        match self.handle.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_clean_exit() => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::host("replay thread panicked")),
        }
    }
}
