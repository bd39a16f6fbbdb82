//! Process helpers: host identity, liveness checks and interrupt delivery.
//!
//! These shell out to `hostname` and `kill` rather than calling libc directly,
//! which keeps the crate free of `unsafe`.

use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::lifecycle::ExitKind;

const SIGINT: i32 = 2;

/// Name of this machine as reported by `hostname`, falling back to `$HOSTNAME`.
pub fn current_hostname() -> Result<String> {
    let out = Command::new("hostname").stderr(Stdio::null()).output();
    if let Ok(out) = out
        && out.status.success()
    {
        let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if !name.is_empty() {
            return Ok(name);
        }
    }
    if let Ok(name) = std::env::var("HOSTNAME")
        && !name.is_empty()
    {
        return Ok(name);
    }
    Err(anyhow!("could not determine hostname"))
}

/// True if a process with `pid` exists on this machine (`kill -0`).
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Deliver SIGINT to `pid`.
#[instrument]
pub fn send_interrupt(pid: u32) -> Result<()> {
    let out = Command::new("kill")
        .args(["-INT", &pid.to_string()])
        .output()
        .context("spawn kill")?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        warn!(pid, stderr = %stderr.trim(), "kill failed");
        return Err(anyhow!("kill -INT {pid} failed: {}", stderr.trim()));
    }
    debug!(pid, "interrupt sent");
    Ok(())
}

/// Classify how a child exited.
pub fn exit_kind(status: ExitStatus) -> ExitKind {
    if let Some(code) = status.code() {
        return ExitKind::Code(code);
    }
    match terminating_signal(status) {
        Some(SIGINT) => ExitKind::Interrupted,
        Some(signal) => ExitKind::Signal(signal),
        None => ExitKind::Code(-1),
    }
}

#[cfg(unix)]
fn terminating_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn terminating_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!is_pid_alive(pid));
    }

    #[test]
    fn hostname_is_non_empty() {
        let name = current_hostname().expect("hostname");
        assert!(!name.trim().is_empty());
    }

    #[test]
    fn exit_codes_are_classified() {
        let ok = Command::new("true").status().expect("true");
        assert_eq!(exit_kind(ok), ExitKind::Code(0));
        let fail = Command::new("sh").args(["-c", "exit 3"]).status().expect("sh");
        assert_eq!(exit_kind(fail), ExitKind::Code(3));
    }

    #[cfg(unix)]
    #[test]
    fn signal_death_is_not_a_code() {
        let status = Command::new("sh")
            .args(["-c", "kill -TERM $$"])
            .status()
            .expect("sh");
        assert_eq!(exit_kind(status), ExitKind::Signal(15));
    }

    #[cfg(unix)]
    #[test]
    fn sigint_death_is_interrupted() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn");
        send_interrupt(child.id()).expect("interrupt");
        let status = child.wait().expect("wait");
        assert_eq!(exit_kind(status), ExitKind::Interrupted);
    }

    #[test]
    fn interrupt_reaches_live_process_only() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn");
        send_interrupt(child.id()).expect("interrupt");
        child.kill().ok();
        child.wait().expect("wait");

        assert!(send_interrupt(child.id()).is_err());
    }
}
