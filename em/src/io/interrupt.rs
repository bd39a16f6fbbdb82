//! Process-wide interrupt flag.
//!
//! The handler only records that SIGINT arrived; the job supervisor polls the
//! flag so it can record the interruption before returning instead of dying
//! mid-update.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use tracing::debug;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static INSTALLED: OnceLock<Result<(), String>> = OnceLock::new();

/// Install the SIGINT handler (once per process) and return the flag it sets.
pub fn install() -> Result<&'static AtomicBool> {
    let installed = INSTALLED.get_or_init(|| {
        ctrlc::set_handler(|| {
            INTERRUPTED.store(true, Ordering::SeqCst);
        })
        .map_err(|err| err.to_string())
    });
    match installed {
        Ok(()) => {
            debug!("interrupt handler installed");
            Ok(&INTERRUPTED)
        }
        Err(err) => Err(anyhow!("install interrupt handler: {err}")),
    }
}
