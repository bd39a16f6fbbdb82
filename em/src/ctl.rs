//! `em ctl`: talk to a running experiment.
//!
//! `stop` interrupts the job's process; every other command is appended to
//! the experiment's control file for the program to pick up.

use anyhow::{Result, anyhow};
use tracing::instrument;

use crate::project::Project;

const STOP: &str = "stop";

#[instrument(skip(project))]
pub fn control_experiment(project: &Project, name: &str, tokens: &[String]) -> Result<()> {
    let runner = project.job_runner()?;
    match tokens {
        [] => Err(anyhow!("no control command given for experiment {name}")),
        [cmd, ..] if cmd == STOP => runner.signal_stop(name),
        _ => runner.write_control(name, tokens),
    }
}
