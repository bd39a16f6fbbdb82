//! Experiment manager CLI.
//!
//! Every command except `proj` operates on the project in the current
//! directory (the one holding `.em/state/`).

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use em::clean::{CleanScope, Selection, clean, reset};
use em::core::types::ExperimentStatus;
use em::ctl::control_experiment;
use em::exit_codes;
use em::fork::fork_experiment;
use em::io::config::{EmConfig, load_config};
use em::io::confirm::{AssumeYes, Confirm, StdinConfirm};
use em::io::interrupt;
use em::io::job::{ChildStdio, JobOutcome, JobSpec, RunMode, SelfExecDetacher};
use em::proj::create_project;
use em::project::Project;
use em::rename::rename_experiment;
use em::run::{ResumeRequest, RunRequest, resume_experiment, run_experiment};
use em::show::{RecordFilter, list_experiments, show_experiment};

#[derive(Parser)]
#[command(
    name = "em",
    version,
    about = "Manage reproducible, isolated experiments backed by git branches"
)]
struct Cli {
    /// Path to the config file (default: `.em/config.toml`).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new project.
    Proj {
        /// Project destination.
        dest: PathBuf,
        /// Template repository to clone (overrides the config).
        #[arg(long)]
        template: Option<String>,
    },
    /// Snapshot the source and run an experiment.
    Run {
        name: String,
        /// Comma-separated GPU ids exported as CUDA_VISIBLE_DEVICES.
        #[arg(short, long)]
        gpu: Option<String>,
        /// Run in the background.
        #[arg(short, long)]
        background: bool,
        /// Short description of the source changes (snapshot commit message).
        #[arg(long)]
        desc: Option<String>,
        /// Recreate an existing experiment without asking.
        #[arg(short, long)]
        yes: bool,
        /// Extra arguments for the program.
        #[arg(last = true)]
        extra: Vec<String>,
    },
    /// Fork an experiment, sharing its code and checkpoints.
    Fork { name: String, fork_name: String },
    /// Resume a stopped experiment.
    Resume {
        name: String,
        /// Epoch to resume from.
        #[arg(long)]
        epoch: Option<String>,
        #[arg(short, long)]
        gpu: Option<String>,
        #[arg(short, long)]
        background: bool,
        #[arg(last = true)]
        extra: Vec<String>,
    },
    /// Control a running experiment (`stop`, or a line for its control file).
    Ctl {
        name: String,
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
    /// List experiments.
    #[command(visible_alias = "ls")]
    List {
        /// Only experiments whose record has `<field>=<value>`.
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Show an experiment's record.
    Show {
        name: String,
        /// Also print the program's recorded options.
        #[arg(long)]
        opts: bool,
    },
    /// Remove experiments matching glob patterns.
    Clean {
        #[arg(required = true)]
        patterns: Vec<String>,
        /// Patterns of experiments to keep.
        #[arg(short, long, num_args = 1..)]
        exclude: Vec<String>,
        /// Include running experiments.
        #[arg(short, long)]
        force: bool,
        /// Only empty the snaps directories.
        #[arg(short, long)]
        snaps: bool,
        #[arg(short, long)]
        yes: bool,
    },
    /// Reset the state of glitched experiments.
    Reset {
        #[arg(required = true)]
        patterns: Vec<String>,
        #[arg(short, long, num_args = 1..)]
        exclude: Vec<String>,
        #[arg(short, long)]
        force: bool,
        #[arg(short, long)]
        yes: bool,
    },
    /// Rename an experiment.
    #[command(visible_alias = "mv")]
    Rename { name: String, new_name: String },
    /// Supervise a background job (used internally by `run -b`).
    #[command(hide = true)]
    Supervise {
        name: String,
        #[arg(long)]
        gpu: Option<String>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn main() {
    em::logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FAILURE
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = cli.config.as_deref();
    match cli.command {
        Command::Proj { dest, template } => {
            let mut cfg = match config {
                Some(path) => load_config(path)?,
                None => EmConfig::default(),
            };
            if template.is_some() {
                cfg.project.template_repo = template;
            }
            let paths = create_project(&dest, &cfg)?;
            println!("created project at {}", paths.root.display());
            Ok(exit_codes::OK)
        }
        Command::Run {
            name,
            gpu,
            background,
            desc,
            yes,
            extra,
        } => {
            let project = open_project(config)?;
            let interrupted = interrupt::install()?;
            let request = RunRequest {
                name,
                gpu,
                mode: run_mode(background),
                description: desc,
                extra,
            };
            let detacher = SelfExecDetacher {
                paths: &project.paths,
            };
            let outcome = run_experiment(
                &project,
                &request,
                confirmer(yes).as_ref(),
                &detacher,
                interrupted,
            )?;
            Ok(outcome.map_or(exit_codes::OK, |o| report(&request.name, o)))
        }
        Command::Fork { name, fork_name } => {
            let project = open_project(config)?;
            interrupt::install()?;
            let snapshot = fork_experiment(&project, &name, &fork_name)?;
            println!("forked {name} -> {fork_name} at {}", snapshot.commit);
            project.close();
            Ok(exit_codes::OK)
        }
        Command::Resume {
            name,
            epoch,
            gpu,
            background,
            extra,
        } => {
            let project = open_project(config)?;
            let interrupted = interrupt::install()?;
            let request = ResumeRequest {
                name,
                epoch,
                gpu,
                mode: run_mode(background),
                extra,
            };
            let detacher = SelfExecDetacher {
                paths: &project.paths,
            };
            let outcome = resume_experiment(&project, &request, &detacher, interrupted)?;
            Ok(report(&request.name, outcome))
        }
        Command::Ctl { name, cmd } => {
            let project = open_project(config)?;
            control_experiment(&project, &name, &cmd)?;
            project.close();
            Ok(exit_codes::OK)
        }
        Command::List { filter } => {
            let project = open_project(config)?;
            let filter = filter.as_deref().map(str::parse::<RecordFilter>).transpose()?;
            for name in list_experiments(&project, filter.as_ref())? {
                println!("{name}");
            }
            project.close();
            Ok(exit_codes::OK)
        }
        Command::Show { name, opts } => {
            let project = open_project(config)?;
            print!("{}", show_experiment(&project, &name, opts)?);
            project.close();
            Ok(exit_codes::OK)
        }
        Command::Clean {
            patterns,
            exclude,
            force,
            snaps,
            yes,
        } => {
            let project = open_project(config)?;
            let selection = Selection {
                patterns,
                exclude,
                force,
            };
            let scope = if snaps {
                CleanScope::SnapsOnly
            } else {
                CleanScope::Everything
            };
            clean(&project, &selection, scope, confirmer(yes).as_ref())?;
            project.close();
            Ok(exit_codes::OK)
        }
        Command::Reset {
            patterns,
            exclude,
            force,
            yes,
        } => {
            let project = open_project(config)?;
            let selection = Selection {
                patterns,
                exclude,
                force,
            };
            reset(&project, &selection, confirmer(yes).as_ref())?;
            project.close();
            Ok(exit_codes::OK)
        }
        Command::Rename { name, new_name } => {
            let project = open_project(config)?;
            rename_experiment(&project, &name, &new_name)?;
            project.close();
            Ok(exit_codes::OK)
        }
        Command::Supervise { name, gpu, command } => {
            let project = open_project(config)?;
            let interrupted = interrupt::install()?;
            let spec = JobSpec {
                workdir: project.paths.experiment_dir(&name),
                name,
                command,
                gpu,
            };
            project
                .job_runner()?
                .supervise(&spec, ChildStdio::Null, interrupted, report_pid)?;
            Ok(exit_codes::OK)
        }
    }
}

fn open_project(config: Option<&Path>) -> Result<Project> {
    let root = std::env::current_dir().context("resolve current directory")?;
    Project::open(&root, config)
}

fn run_mode(background: bool) -> RunMode {
    if background {
        RunMode::Background
    } else {
        RunMode::Foreground
    }
}

fn confirmer(yes: bool) -> Box<dyn Confirm> {
    if yes {
        Box::new(AssumeYes)
    } else {
        Box::new(StdinConfirm)
    }
}

fn report(name: &str, outcome: JobOutcome) -> i32 {
    match outcome {
        JobOutcome::Finished(ExperimentStatus::Error) => {
            eprintln!("experiment {name} failed");
            exit_codes::JOB_FAILED
        }
        JobOutcome::Finished(_) => exit_codes::OK,
        JobOutcome::Detached { pid } => {
            println!("experiment {name} running in background (pid {pid})");
            exit_codes::OK
        }
    }
}

/// Tell the detaching parent which pid the job got.
fn report_pid(pid: u32) -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{pid}").context("report pid")?;
    out.flush().context("flush pid")
}
