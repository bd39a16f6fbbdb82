//! Project configuration stored under `.em/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Experiment manager configuration (TOML).
///
/// Edited by humans; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct EmConfig {
    pub project: ProjectConfig,
    pub experiment: ExperimentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProjectConfig {
    /// Repository cloned by `em proj` (history is discarded).
    pub template_repo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExperimentConfig {
    /// File extensions (without the dot) whose changes count as source changes.
    pub track_files: Vec<String>,
    /// Entry point executed inside the experiment checkout.
    pub prog: String,
    /// Arguments passed to `prog` before any per-run arguments.
    pub prog_args: Vec<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            track_files: vec!["py".to_string(), "sh".to_string(), "txt".to_string()],
            prog: "python3".to_string(),
            prog_args: vec!["main.py".to_string()],
        }
    }
}

impl EmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.experiment.prog.trim().is_empty() {
            return Err(anyhow!("experiment.prog must not be empty"));
        }
        if self.experiment.track_files.is_empty() {
            return Err(anyhow!("experiment.track_files must not be empty"));
        }
        for ext in &self.experiment.track_files {
            if ext.is_empty() || ext.contains('.') || ext.contains('/') {
                return Err(anyhow!(
                    "experiment.track_files entries must be bare extensions (got '{ext}')"
                ));
            }
        }
        Ok(())
    }

    /// Full command line for a job: `prog prog_args extra`.
    pub fn command(&self, extra: &[String]) -> Vec<String> {
        let mut cmd = Vec::with_capacity(1 + self.experiment.prog_args.len() + extra.len());
        cmd.push(self.experiment.prog.clone());
        cmd.extend(self.experiment.prog_args.iter().cloned());
        cmd.extend(extra.iter().cloned());
        cmd
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EmConfig::default()`.
pub fn load_config(path: &Path) -> Result<EmConfig> {
    if !path.exists() {
        let cfg = EmConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EmConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EmConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
