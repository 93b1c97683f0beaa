//! Address-space determinism.
//!
//! Replay must see the same addresses the recording saw. The log header
//! stores two identity words derived from the binary's code and data
//! addresses, and on Linux the process re-executes itself once with
//! address randomization disabled.

use log::debug;

static IDENTITY_ANCHOR: u8 = 0;

/// Two words identifying this binary and its address layout.
pub fn identity_words() -> [u64; 2] {
    let code = identity_words as fn() -> [u64; 2] as usize as u64;
    let data = std::ptr::addr_of!(IDENTITY_ANCHOR) as usize as u64;
    [code, data]
}

/// Environment marker set before the re-exec, so it happens once.
pub const ADDR_NO_RANDOMIZE_ENV: &str = "REVDB_ADDR_NO_RANDOMIZE";

/// Makes the process run with address randomization disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeterministicAddressSpace;

impl DeterministicAddressSpace {
    /// Re-execute the current binary without address randomization if it
    /// is enabled. Returns only when no re-exec was needed or possible.
    #[cfg(target_os = "linux")]
    pub fn ensure(self) -> crate::Result<()> {
        use std::os::unix::process::CommandExt;

        use nix::sys::personality::{self, Persona};

        let persona = personality::get()?;
        if persona.contains(Persona::ADDR_NO_RANDOMIZE) {
            return Ok(());
        }
        if std::env::var_os(ADDR_NO_RANDOMIZE_ENV).is_some() {
            log::warn!("address randomization is still enabled after re-exec");
            return Ok(());
        }
        personality::set(persona | Persona::ADDR_NO_RANDOMIZE)?;
        debug!("re-executing with address randomization disabled");
        let mut args = std::env::args_os();
        let argv0 = args.next();
        let mut cmd = std::process::Command::new("/proc/self/exe");
        if let Some(argv0) = argv0 {
            cmd.arg0(argv0);
        }
        let err = cmd.args(args).env(ADDR_NO_RANDOMIZE_ENV, "1").exec();
        Err(err.into())
    }

    /// No-op outside Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn ensure(self) -> crate::Result<()> {
        debug!("address randomization control unavailable on this platform");
        Ok(())
    }
}
