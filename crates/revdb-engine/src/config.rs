//! Session configuration and validation.

use revdb_log::{DEFAULT_BUFFER_CAPACITY, MAX_PACKET_PAYLOAD, MIN_BUFFER_CAPACITY, PACKET_HEADER_SIZE};
use thiserror::Error;

// ── FastForward ───────────────────────────────────────────────────

/// Replay silently up to a stop point before serving the controller.
///
/// Used by branches created by re-executing the binary instead of
/// forking it: the new process catches up to the parent's position and
/// only then answers `READY`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FastForward {
    /// Stop point to pause at first.
    pub stop_point: u64,
}

// ── SessionConfig ─────────────────────────────────────────────────

/// Tunables for a record or replay session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Record packet buffer size in bytes. Default: 16384.
    ///
    /// Must lie in `64..=32769` so a full buffer fits one packet.
    pub buffer_capacity: usize,
    /// Size of the rolling list of recorded breakpoint hits. Default: 64.
    pub recorded_breaks_limit: usize,
    /// Refuse to replay logs whose identity words differ from this
    /// binary's. Default: true.
    pub check_identity: bool,
    /// Silent catch-up target for respawned branches. Default: none.
    pub fast_forward: Option<FastForward>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            recorded_breaks_limit: 64,
            check_identity: true,
            fast_forward: None,
        }
    }
}

impl SessionConfig {
    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = PACKET_HEADER_SIZE + MAX_PACKET_PAYLOAD;
        if !(MIN_BUFFER_CAPACITY..=max).contains(&self.buffer_capacity) {
            return Err(ConfigError::BufferCapacityOutOfRange {
                configured: self.buffer_capacity,
                min: MIN_BUFFER_CAPACITY,
                max,
            });
        }
        if self.recorded_breaks_limit == 0 {
            return Err(ConfigError::RecordedBreaksZero);
        }
        Ok(())
    }
}

// ── ConfigError ───────────────────────────────────────────────────

/// Errors detected in a [`SessionConfig`] or in launch arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `buffer_capacity` cannot be framed as a single packet.
    #[error("buffer capacity {configured} outside {min}..={max}")]
    BufferCapacityOutOfRange {
        /// The configured value.
        configured: usize,
        /// Smallest accepted value.
        min: usize,
        /// Largest accepted value.
        max: usize,
    },
    /// `recorded_breaks_limit` is zero.
    #[error("recorded breakpoint limit must be at least 1")]
    RecordedBreaksZero,
    /// A launch flag is missing its arguments.
    #[error("{flag} expects <log-file> <control-socket-fd>")]
    MissingArgument {
        /// The flag that was given.
        flag: String,
    },
    /// The control socket argument is not a file descriptor number.
    #[error("invalid control socket descriptor {value:?}")]
    InvalidControlFd {
        /// The argument as given.
        value: String,
    },
    /// The fast-forward environment variable is not a stop point.
    #[error("invalid fast-forward stop point {value:?}")]
    InvalidFastForward {
        /// The value as given.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn capacity_bounds() {
        let mut cfg = SessionConfig {
            buffer_capacity: 63,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BufferCapacityOutOfRange { configured: 63, .. })
        ));
        cfg.buffer_capacity = 32769;
        cfg.validate().unwrap();
        cfg.buffer_capacity = 32770;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_break_limit_rejected() {
        let cfg = SessionConfig {
            recorded_breaks_limit: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::RecordedBreaksZero));
    }
}
