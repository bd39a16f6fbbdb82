//! Job execution and supervision.
//!
//! [`JobRunner`] spawns an experiment's entry point inside its checkout and
//! drives the record through `running` to exactly one terminal state. Every
//! transition is persisted before the runner moves on, so another `em`
//! invocation (or a crash) always observes a consistent record.
//!
//! Background runs hand supervision to a [`Detacher`]; the production one
//! re-executes this binary as `em supervise`, in its own process group so the
//! invoking terminal's Ctrl-C does not reach it.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::error::EmError;
use crate::core::lifecycle::{ExitKind, ensure_startable, running_pid, terminal_status};
use crate::core::types::ExperimentStatus;
use crate::io::init::ProjectPaths;
use crate::io::process::{current_hostname, exit_kind, is_pid_alive, send_interrupt};
use crate::io::state_store::StateStore;

const DEFAULT_POLL: Duration = Duration::from_millis(200);
const GPU_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// What to run for an experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub gpu: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Foreground,
    Background,
}

/// Standard streams handed to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStdio {
    Inherit,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Foreground supervision finished with this terminal status.
    Finished(ExperimentStatus),
    /// Supervision continues in a detached task; `pid` is the job's process.
    Detached { pid: u32 },
}

/// Turns a job into a background task and reports the job's pid once its
/// `running` record is durable.
pub trait Detacher {
    fn detach(&self, spec: &JobSpec) -> Result<u32>;
}

pub struct JobRunner<'a> {
    store: &'a StateStore,
    paths: &'a ProjectPaths,
    hostname: String,
    poll: Duration,
}

impl<'a> JobRunner<'a> {
    pub fn new(store: &'a StateStore, paths: &'a ProjectPaths) -> Result<Self> {
        Ok(Self {
            store,
            paths,
            hostname: current_hostname()?,
            poll: DEFAULT_POLL,
        })
    }

    /// How often the wait loop checks the interrupt flag.
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Start a job, rejecting it if the record claims a live process.
    #[instrument(skip_all, fields(name = %spec.name, mode = ?mode))]
    pub fn start(
        &self,
        spec: &JobSpec,
        mode: RunMode,
        detacher: &dyn Detacher,
        interrupted: &AtomicBool,
    ) -> Result<JobOutcome> {
        ensure_startable(&spec.name, self.store.get(&spec.name)?.as_ref())?;
        match mode {
            RunMode::Foreground => {
                let status = self.supervise(spec, ChildStdio::Inherit, interrupted, |_| Ok(()))?;
                Ok(JobOutcome::Finished(status))
            }
            RunMode::Background => {
                let pid = detacher.detach(spec)?;
                info!(pid, "job detached");
                Ok(JobOutcome::Detached { pid })
            }
        }
    }

    /// Spawn the job and wait for it, recording each transition.
    ///
    /// `on_running` is called with the child's pid after the `running` record
    /// is written. When `interrupted` is raised the runner stops waiting and
    /// records `interrupted`; the child receives the signal itself and is
    /// never killed here. The final update always clears `pid` and sets
    /// `ended`.
    #[instrument(skip_all, fields(name = %spec.name))]
    pub fn supervise<F>(
        &self,
        spec: &JobSpec,
        stdio: ChildStdio,
        interrupted: &AtomicBool,
        on_running: F,
    ) -> Result<ExperimentStatus>
    where
        F: FnOnce(u32) -> Result<()>,
    {
        let name = spec.name.as_str();
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| anyhow!("empty command for experiment {name}"))?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&spec.workdir);
        if let Some(gpu) = &spec.gpu {
            cmd.env(GPU_ENV, gpu);
        }
        if stdio == ChildStdio::Null {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }

        // Interrupts raised before the spawn do not apply to this child.
        interrupted.store(false, Ordering::SeqCst);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(program = %program, err = %err, "spawn failed");
                self.finish(name, ExperimentStatus::Error)?;
                return Err(err).with_context(|| format!("spawn {program} for experiment {name}"));
            }
        };
        let pid = child.id();
        let started = Utc::now();
        let recorded = self.store.upsert(name, |rec| {
            rec.status = ExperimentStatus::Running;
            rec.pid = Some(pid);
            rec.hostname = Some(self.hostname.clone());
            rec.started = Some(started);
            rec.ended = None;
            rec.gpu = spec.gpu.clone();
        });
        if let Err(err) = recorded {
            // No child outlives a missing running record.
            warn!(pid, "could not record running job, killing it");
            let _ = child.kill();
            let _ = child.wait();
            if let Err(finish_err) = self.finish(name, ExperimentStatus::Error) {
                warn!(err = %format!("{finish_err:#}"), "failed to record job error");
            }
            return Err(err).with_context(|| format!("record experiment {name} as running"));
        }
        info!(pid, "job running");

        if let Err(err) = on_running(pid) {
            warn!(err = %format!("{err:#}"), "failed to report running job");
        }

        let exit = loop {
            match child.wait_timeout(self.poll) {
                Ok(Some(status)) => break exit_kind(status),
                Ok(None) => {}
                Err(err) => {
                    self.finish(name, ExperimentStatus::Error)?;
                    return Err(err).with_context(|| format!("wait for experiment {name}"));
                }
            }
            if interrupted.swap(false, Ordering::SeqCst) {
                debug!(pid, "interrupted while waiting");
                break ExitKind::Interrupted;
            }
        };

        let status = terminal_status(exit);
        self.finish(name, status)?;
        info!(status = %status, exit = ?exit, "job finished");
        Ok(status)
    }

    fn finish(&self, name: &str, status: ExperimentStatus) -> Result<()> {
        self.store.upsert(name, |rec| {
            rec.status = status;
            rec.pid = None;
            rec.ended = Some(Utc::now());
        })?;
        Ok(())
    }

    /// Deliver an interrupt to the experiment's process.
    #[instrument(skip(self))]
    pub fn signal_stop(&self, name: &str) -> Result<()> {
        let pid = self.live_pid(name)?;
        send_interrupt(pid)?;
        info!(pid, "stop requested");
        Ok(())
    }

    /// Append one whitespace-joined line to the experiment's control file.
    #[instrument(skip(self))]
    pub fn write_control(&self, name: &str, tokens: &[String]) -> Result<()> {
        self.live_pid(name)?;
        let path = self.paths.ctl_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open control file {}", path.display()))?;
        writeln!(file, "{}", tokens.join(" "))
            .with_context(|| format!("write control file {}", path.display()))?;
        debug!(path = %path.display(), "control line written");
        Ok(())
    }

    /// The recorded pid, verified to belong to a live process on this host.
    fn live_pid(&self, name: &str) -> Result<u32> {
        let record = self.store.get(name)?;
        let pid = running_pid(name, record.as_ref())?;
        let host = record.as_ref().and_then(|rec| rec.hostname.as_deref());
        if let Some(host) = host
            && host != self.hostname
        {
            return Err(EmError::StaleRecord {
                name: name.to_string(),
                reason: format!("recorded on host {host}"),
            }
            .into());
        }
        if !is_pid_alive(pid) {
            return Err(EmError::StaleRecord {
                name: name.to_string(),
                reason: format!("pid {pid} is not alive"),
            }
            .into());
        }
        Ok(pid)
    }
}

/// Detaches by re-executing the current binary as `em supervise`.
pub struct SelfExecDetacher<'a> {
    pub paths: &'a ProjectPaths,
}

impl Detacher for SelfExecDetacher<'_> {
    #[instrument(skip_all, fields(name = %spec.name))]
    fn detach(&self, spec: &JobSpec) -> Result<u32> {
        let exe = std::env::current_exe().context("locate em executable")?;
        let mut cmd = Command::new(exe);
        cmd.arg("supervise").arg(&spec.name);
        if let Some(gpu) = &spec.gpu {
            cmd.arg("--gpu").arg(gpu);
        }
        cmd.arg("--")
            .args(&spec.command)
            .current_dir(&self.paths.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        new_process_group(&mut cmd);

        let mut supervisor = cmd.spawn().context("spawn supervisor")?;
        let stdout = supervisor
            .stdout
            .take()
            .context("supervisor stdout not captured")?;
        let mut line = String::new();
        BufReader::new(stdout)
            .read_line(&mut line)
            .context("read job pid from supervisor")?;
        if line.trim().is_empty() {
            let status = supervisor.wait().context("wait for supervisor")?;
            return Err(anyhow!(
                "supervisor exited ({status}) before starting experiment {}",
                spec.name
            ));
        }
        let pid = line
            .trim()
            .parse()
            .with_context(|| format!("parse job pid {:?}", line.trim()))?;
        Ok(pid)
    }
}

#[cfg(unix)]
fn new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn new_process_group(_cmd: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExperimentRecord;
    use std::cell::Cell;

    struct Fixture {
        _temp: tempfile::TempDir,
        paths: ProjectPaths,
        store: StateStore,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        fs::create_dir_all(&paths.state_dir).expect("state dir");
        fs::create_dir_all(paths.experiment_dir("x")).expect("checkout dir");
        let store = StateStore::open(&paths.state_dir).expect("store");
        Fixture {
            _temp: temp,
            paths,
            store,
        }
    }

    fn spec(fx: &Fixture, command: &[&str]) -> JobSpec {
        JobSpec {
            name: "x".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            workdir: fx.paths.experiment_dir("x"),
            gpu: None,
        }
    }

    struct NoDetach;

    impl Detacher for NoDetach {
        fn detach(&self, _spec: &JobSpec) -> Result<u32> {
            panic!("foreground run must not detach");
        }
    }

    #[test]
    fn successful_job_completes_and_clears_pid() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths).expect("runner");
        let flag = AtomicBool::new(false);

        let outcome = runner
            .start(&spec(&fx, &["true"]), RunMode::Foreground, &NoDetach, &flag)
            .expect("start");

        assert_eq!(outcome, JobOutcome::Finished(ExperimentStatus::Completed));
        let rec = fx.store.get("x").expect("get").expect("record");
        assert_eq!(rec.status, ExperimentStatus::Completed);
        assert_eq!(rec.pid, None);
        assert!(rec.started.is_some() && rec.ended.is_some());
        assert_eq!(rec.hostname.as_deref(), Some(runner.hostname()));
    }

    #[test]
    fn failing_job_is_error() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths).expect("runner");
        let flag = AtomicBool::new(false);

        let status = runner
            .supervise(&spec(&fx, &["sh", "-c", "exit 4"]), ChildStdio::Null, &flag, |_| Ok(()))
            .expect("supervise");
        assert_eq!(status, ExperimentStatus::Error);
    }

    #[test]
    fn spawn_failure_is_recorded_as_error() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths).expect("runner");
        let flag = AtomicBool::new(false);

        let result = runner.supervise(
            &spec(&fx, &["/nonexistent/em-test-program"]),
            ChildStdio::Null,
            &flag,
            |_| Ok(()),
        );

        assert!(result.is_err());
        let rec = fx.store.get("x").expect("get").expect("record");
        assert_eq!(rec.status, ExperimentStatus::Error);
        assert!(rec.ended.is_some());
    }

    #[test]
    fn running_record_is_rejected() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths).expect("runner");
        fx.store
            .put(
                "x",
                &ExperimentRecord {
                    status: ExperimentStatus::Running,
                    pid: Some(std::process::id()),
                    ..ExperimentRecord::starting()
                },
            )
            .expect("put");
        let flag = AtomicBool::new(false);

        let err = runner
            .start(&spec(&fx, &["true"]), RunMode::Foreground, &NoDetach, &flag)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmError>(),
            Some(EmError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn interrupt_while_waiting_records_interrupted() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths)
            .expect("runner")
            .with_poll(Duration::from_millis(20));
        let flag = AtomicBool::new(false);
        let child_pid = Cell::new(0);

        let status = runner
            .supervise(&spec(&fx, &["sleep", "30"]), ChildStdio::Null, &flag, |pid| {
                child_pid.set(pid);
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .expect("supervise");

        let _ = Command::new("kill").arg(child_pid.get().to_string()).status();
        assert_eq!(status, ExperimentStatus::Interrupted);
        let rec = fx.store.get("x").expect("get").expect("record");
        assert_eq!(rec.status, ExperimentStatus::Interrupted);
        assert_eq!(rec.pid, None);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn interrupt_raised_before_spawn_is_discarded() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths)
            .expect("runner")
            .with_poll(Duration::from_millis(20));
        let flag = AtomicBool::new(true);

        let status = runner
            .supervise(&spec(&fx, &["sh", "-c", "sleep 0.3"]), ChildStdio::Null, &flag, |_| Ok(()))
            .expect("supervise");

        assert_eq!(status, ExperimentStatus::Completed);
        let rec = fx.store.get("x").expect("get").expect("record");
        assert_eq!(rec.status, ExperimentStatus::Completed);
        assert_eq!(rec.pid, None);
    }

    #[test]
    fn unrecordable_job_is_killed() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths).expect("runner");
        fx.store.put("x", &ExperimentRecord::starting()).expect("put");
        // Occupy the temp path so the next record write fails.
        fs::create_dir_all(fx.paths.state_dir.join("x.json.tmp")).expect("blocker");
        let flag = AtomicBool::new(false);
        let reported = Cell::new(false);
        let begun = std::time::Instant::now();

        let err = runner
            .supervise(&spec(&fx, &["sleep", "30"]), ChildStdio::Null, &flag, |_| {
                reported.set(true);
                Ok(())
            })
            .unwrap_err();

        assert!(format!("{err:#}").contains("record experiment x as running"), "{err:#}");
        assert!(!reported.get());
        assert!(begun.elapsed() < Duration::from_secs(20));
        let rec = fx.store.get("x").expect("get").expect("record");
        assert!(!rec.is_running());
        assert_eq!(rec.pid, None);
    }

    #[test]
    fn gpu_selector_is_exported() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths).expect("runner");
        let flag = AtomicBool::new(false);
        let mut job = spec(&fx, &["sh", "-c", "test \"$CUDA_VISIBLE_DEVICES\" = 1,2"]);
        job.gpu = Some("1,2".to_string());

        let status = runner
            .supervise(&job, ChildStdio::Null, &flag, |_| Ok(()))
            .expect("supervise");
        assert_eq!(status, ExperimentStatus::Completed);
        let rec = fx.store.get("x").expect("get").expect("record");
        assert_eq!(rec.gpu.as_deref(), Some("1,2"));
    }

    #[test]
    fn control_requires_running_record() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths).expect("runner");
        fx.store
            .put("x", &ExperimentRecord::starting())
            .expect("put");

        let err = runner.write_control("x", &["lr".to_string()]).unwrap_err();
        assert!(matches!(err.downcast_ref::<EmError>(), Some(EmError::NotRunning(_))));
        let err = runner.signal_stop("missing").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmError>(),
            Some(EmError::NoSuchExperiment(_))
        ));
    }

    #[test]
    fn dead_or_foreign_pid_is_stale() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths).expect("runner");
        let mut child = Command::new("true").spawn().expect("spawn");
        let dead = child.id();
        child.wait().expect("wait");
        fx.store
            .put(
                "x",
                &ExperimentRecord {
                    status: ExperimentStatus::Running,
                    pid: Some(dead),
                    hostname: Some(runner.hostname().to_string()),
                    ..ExperimentRecord::starting()
                },
            )
            .expect("put");

        let err = runner.signal_stop("x").unwrap_err();
        assert!(matches!(err.downcast_ref::<EmError>(), Some(EmError::StaleRecord { .. })));

        fx.store
            .upsert("x", |rec| {
                rec.pid = Some(std::process::id());
                rec.hostname = Some("elsewhere.invalid".to_string());
            })
            .expect("upsert");
        let err = runner.write_control("x", &["lr".to_string()]).unwrap_err();
        assert!(matches!(err.downcast_ref::<EmError>(), Some(EmError::StaleRecord { .. })));
    }

    #[test]
    fn control_lines_are_appended() {
        let fx = fixture();
        let runner = JobRunner::new(&fx.store, &fx.paths).expect("runner");
        fx.store
            .put(
                "x",
                &ExperimentRecord {
                    status: ExperimentStatus::Running,
                    pid: Some(std::process::id()),
                    hostname: Some(runner.hostname().to_string()),
                    ..ExperimentRecord::starting()
                },
            )
            .expect("put");

        runner
            .write_control("x", &["lr".to_string(), "0.1".to_string()])
            .expect("first");
        runner.write_control("x", &["save".to_string()]).expect("second");

        let contents = fs::read_to_string(fx.paths.ctl_path("x")).expect("read ctl");
        assert_eq!(contents, "lr 0.1\nsave\n");
    }
}
