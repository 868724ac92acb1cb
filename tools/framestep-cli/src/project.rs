//! Project directory and configuration lookup shared by all commands.

use anyhow::{Context, Result};
use clap::Args;
use framestep_core::{CONFIG_FILE_NAME, RecorderConfig};
use std::path::PathBuf;

/// Where the project lives and which config file to use.
#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    /// Path to project directory (defaults to current directory)
    #[arg(short, long)]
    pub project: Option<PathBuf>,

    /// Path to config file (relative to project directory)
    #[arg(short, long, default_value = CONFIG_FILE_NAME)]
    pub config: PathBuf,
}

impl ProjectArgs {
    /// Resolve the project directory to an absolute path.
    pub fn dir(&self) -> Result<PathBuf> {
        let dir = match &self.project {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        dir.canonicalize()
            .with_context(|| format!("Project directory not found: {}", dir.display()))
    }

    /// Load the config file, or defaults if it does not exist.
    pub fn load_config(&self, project_dir: &std::path::Path) -> Result<RecorderConfig> {
        let path = project_dir.join(&self.config);
        Ok(RecorderConfig::load_or_default(&path)?)
    }
}
