//! Choosing and running a session from the process environment.
//!
//! ```text
//! REVDB=<log> program args...          record into <log>
//! program --revdb-replay <log> <fd>    replay <log>, controller on <fd>
//! program args...                      run normally
//! ```

use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};

use crate::address_space::DeterministicAddressSpace;
use crate::config::{ConfigError, FastForward, SessionConfig};
use crate::error::Result;
use crate::session::Session;

/// Command-line flag selecting replay mode.
pub const REPLAY_FLAG: &str = "--revdb-replay";

/// Environment variable naming the log to record into.
pub const RECORD_ENV: &str = "REVDB";

/// Environment variable carrying a respawned branch's catch-up target.
pub const FAST_FORWARD_ENV: &str = "REVDB_FAST_FORWARD";

/// How the process was asked to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LaunchMode {
    /// No recording or replay.
    Normal {
        /// Program arguments.
        argv: Vec<String>,
    },
    /// Record into `log`.
    Record {
        /// Log file path.
        log: PathBuf,
        /// Program arguments.
        argv: Vec<String>,
    },
    /// Replay `log` under a controller.
    Replay {
        /// Log file path.
        log: PathBuf,
        /// Inherited control socket descriptor.
        control_fd: RawFd,
        /// Set for respawned branches.
        fast_forward: Option<FastForward>,
    },
}

impl LaunchMode {
    /// Decide the mode from `args` (including `argv[0]`) and `env`.
    pub fn detect<F>(args: Vec<String>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if args.get(1).map(String::as_str) == Some(REPLAY_FLAG) {
            let (Some(log), Some(fd)) = (args.get(2), args.get(3)) else {
                return Err(ConfigError::MissingArgument {
                    flag: REPLAY_FLAG.to_string(),
                });
            };
            let control_fd = match fd.parse::<RawFd>() {
                Ok(n) if n >= 0 => n,
                _ => return Err(ConfigError::InvalidControlFd { value: fd.clone() }),
            };
            let fast_forward = match env(FAST_FORWARD_ENV) {
                None => None,
                Some(value) => match value.parse::<u64>() {
                    Ok(stop_point) => Some(FastForward { stop_point }),
                    Err(_) => return Err(ConfigError::InvalidFastForward { value }),
                },
            };
            return Ok(Self::Replay {
                log: PathBuf::from(log),
                control_fd,
                fast_forward,
            });
        }
        match env(RECORD_ENV).filter(|v| !v.is_empty()) {
            Some(log) => Ok(Self::Record {
                log: PathBuf::from(log),
                argv: args,
            }),
            None => Ok(Self::Normal { argv: args }),
        }
    }

    /// Decide the mode from the real process arguments and environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::detect(std::env::args().collect(), |key| std::env::var(key).ok())
    }

    /// Open the session this mode describes.
    ///
    /// Record and replay first make the address space deterministic,
    /// which may re-execute the process.
    pub fn open(self, mut config: SessionConfig) -> Result<Session> {
        match self {
            Self::Normal { argv } => Ok(Session::disabled(argv)),
            Self::Record { log, argv } => {
                DeterministicAddressSpace.ensure()?;
                std::env::remove_var(RECORD_ENV);
                Session::record(log, argv, config)
            }
            Self::Replay {
                log,
                control_fd,
                fast_forward,
            } => {
                DeterministicAddressSpace.ensure()?;
                #[allow(unsafe_code)]
                // SAFETY: the controller hands this descriptor to the
                // process and nothing else in it owns the number.
                let control = unsafe { UnixStream::from_raw_fd(control_fd) };
                let respawned = fast_forward.is_some();
                if respawned {
                    config.fast_forward = fast_forward;
                }
                let session = Session::replay(log, control, config)?;
                if respawned {
                    session.mark_branch();
                }
                Ok(session)
            }
        }
    }
}

/// Run `main` under the session chosen by the environment.
///
/// The program's entry point typically ends with
/// `revdb::launch::run(SessionConfig::default(), real_main)`. `main`
/// receives the session and the argv it should use
/// ([`Session::argv`]), which during replay is the recorded one.
pub fn run<F>(config: SessionConfig, main: F) -> ExitCode
where
    F: FnOnce(&Session) -> Result<()>,
{
    match run_session(config, main) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_clean_exit() => {
            info!("session ended: {e}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_session<F>(config: SessionConfig, main: F) -> Result<()>
where
    F: FnOnce(&Session) -> Result<()>,
{
    let session = LaunchMode::from_env()?.open(config)?;
    let result = session
        .start()
        .and_then(|()| main(&session))
        .and_then(|()| session.finish());
    session.conclude(result)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_run_is_normal() {
        let mode = LaunchMode::detect(args(&["prog", "x"]), env(&[])).unwrap();
        assert_eq!(mode, LaunchMode::Normal { argv: args(&["prog", "x"]) });
    }

    #[test]
    fn record_variable_selects_record() {
        let mode = LaunchMode::detect(args(&["prog"]), env(&[("REVDB", "/tmp/l")])).unwrap();
        assert_eq!(
            mode,
            LaunchMode::Record {
                log: PathBuf::from("/tmp/l"),
                argv: args(&["prog"])
            }
        );
        let mode = LaunchMode::detect(args(&["prog"]), env(&[("REVDB", "")])).unwrap();
        assert!(matches!(mode, LaunchMode::Normal { .. }));
    }

    #[test]
    fn replay_flag_takes_log_and_fd() {
        let mode = LaunchMode::detect(
            args(&["prog", "--revdb-replay", "log", "7"]),
            env(&[("REVDB_FAST_FORWARD", "12")]),
        )
        .unwrap();
        assert_eq!(
            mode,
            LaunchMode::Replay {
                log: PathBuf::from("log"),
                control_fd: 7,
                fast_forward: Some(FastForward { stop_point: 12 }),
            }
        );
    }

    #[test]
    fn bad_replay_arguments() {
        assert!(matches!(
            LaunchMode::detect(args(&["prog", "--revdb-replay", "log"]), env(&[])),
            Err(ConfigError::MissingArgument { .. })
        ));
        assert!(matches!(
            LaunchMode::detect(args(&["prog", "--revdb-replay", "log", "-3"]), env(&[])),
            Err(ConfigError::InvalidControlFd { .. })
        ));
        assert!(matches!(
            LaunchMode::detect(
                args(&["prog", "--revdb-replay", "log", "3"]),
                env(&[("REVDB_FAST_FORWARD", "soon")])
            ),
            Err(ConfigError::InvalidFastForward { .. })
        ));
    }
}
