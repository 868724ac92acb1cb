//! Init command - write a default framestep.toml

use anyhow::{Context, Result};
use clap::Args;
use framestep_core::RecorderConfig;

use crate::project::ProjectArgs;

/// Arguments for the init command
#[derive(Args, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

/// Execute the init command
pub fn execute(args: InitArgs) -> Result<()> {
    let project_dir = args.project.dir()?;
    let path = project_dir.join(&args.project.config);

    if path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let text = RecorderConfig::default().to_toml()?;
    std::fs::write(&path, text)
        .with_context(|| format!("Failed to write config: {}", path.display()))?;

    println!("Wrote {}", path.display());
    println!("Set [emulator] command to the emulator invocation before recording.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use framestep_core::CONFIG_FILE_NAME;
    use std::path::PathBuf;

    fn args(dir: &std::path::Path, force: bool) -> InitArgs {
        InitArgs {
            project: ProjectArgs {
                project: Some(dir.to_path_buf()),
                config: PathBuf::from(CONFIG_FILE_NAME),
            },
            force,
        }
    }

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        execute(args(dir.path(), false)).unwrap();

        let loaded = RecorderConfig::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(loaded, RecorderConfig::default());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "# mine\n").unwrap();

        assert!(execute(args(dir.path(), false)).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine\n");

        execute(args(dir.path(), true)).unwrap();
        assert!(RecorderConfig::load(&path).is_ok());
    }
}
