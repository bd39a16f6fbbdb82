//! `em proj`: create a project.

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument};

use crate::io::config::{EmConfig, write_config};
use crate::io::init::{InitOptions, ProjectPaths, init_project};

/// Scaffold a project at `dest` and write a default config if it has none.
#[instrument(skip(config))]
pub fn create_project(dest: &Path, config: &EmConfig) -> Result<ProjectPaths> {
    let options = InitOptions {
        template_repo: config.project.template_repo.clone(),
    };
    let paths = init_project(dest, &options)?;
    if !paths.config_path.exists() {
        write_config(&paths.config_path, config)?;
        info!(path = %paths.config_path.display(), "wrote config");
    }
    Ok(paths)
}
