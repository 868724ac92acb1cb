//! Build collaborator interface
//!
//! Producing the application binary that runs inside the emulator is not the
//! recorder's business. Callers plug in whatever builds it; the recorder only
//! needs the resulting artifact path.

use anyhow::Result;
use std::path::PathBuf;

/// What to build and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Project root the build runs in
    pub project_dir: PathBuf,
    /// Command line to run
    pub command: String,
    /// Artifact the build is expected to produce (relative to `project_dir`)
    pub artifact: Option<PathBuf>,
}

/// Something that can turn a project into a binary.
pub trait BuildCollaborator {
    /// Build the project and return the produced artifact.
    fn compile(&self, options: &BuildOptions) -> Result<PathBuf>;
}
