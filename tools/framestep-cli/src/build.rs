//! Build step - run the project's build command before recording
//!
//! Whatever produces the application (patched SDK builds, make, cargo) is
//! configured as a plain command line in `[build]`; the recorder only checks
//! that it succeeded and that the expected artifact exists.

use anyhow::{Context, Result};
use framestep_core::{BuildCollaborator, BuildOptions, RecorderConfig};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Runs a command line in the project directory.
pub struct ScriptBuild;

impl BuildCollaborator for ScriptBuild {
    fn compile(&self, options: &BuildOptions) -> Result<PathBuf> {
        // Parse script into command and arguments
        let parts: Vec<&str> = options.command.split_whitespace().collect();
        let Some((cmd, cmd_args)) = parts.split_first() else {
            anyhow::bail!("Empty build command");
        };

        println!("Building: {}", options.command);

        // Use status() to inherit stdout/stderr so compiler output is visible
        let status = Command::new(cmd)
            .args(cmd_args)
            .current_dir(&options.project_dir)
            .status()
            .with_context(|| format!("Failed to execute build command: {}", cmd))?;

        if !status.success() {
            anyhow::bail!(
                "Build failed (exit code: {})\nCheck the error messages above.",
                status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
        }

        let Some(artifact) = &options.artifact else {
            return Ok(options.project_dir.clone());
        };
        let artifact = options.project_dir.join(artifact);
        if !artifact.exists() {
            anyhow::bail!(
                "Build succeeded but artifact is missing: {}",
                artifact.display()
            );
        }

        println!("  Output: {}", artifact.display());
        Ok(artifact)
    }
}

/// Run the configured build, if any. Returns the artifact path when a build ran.
pub fn run_configured(
    builder: &dyn BuildCollaborator,
    config: &RecorderConfig,
    project_dir: &Path,
) -> Result<Option<PathBuf>> {
    let Some(command) = &config.build.command else {
        tracing::debug!("No build command configured, skipping build");
        return Ok(None);
    };

    let options = BuildOptions {
        project_dir: project_dir.to_path_buf(),
        command: command.clone(),
        artifact: config.build.artifact.clone(),
    };
    builder.compile(&options).map(Some)
}
