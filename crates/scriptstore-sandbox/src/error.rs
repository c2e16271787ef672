//! Error types for the scriptstore-sandbox crate.

use std::path::PathBuf;

use scriptstore_core::ErrorKind;
use thiserror::Error;

/// All errors that can originate from sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The artifact has no dependency manifest to install from.
    #[error("Dependency manifest not found at {}", path.display())]
    ManifestMissing { path: PathBuf },

    /// A provisioning step (create / install) exited non-zero.
    #[error("{step} step failed (exit {exit_code:?}): {stderr}")]
    Provision {
        step: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// `run` was called for a key that has no intact sandbox.
    #[error("Environment not provisioned: {key}")]
    MissingEnvironment { key: String },

    /// A toolchain template is empty after substitution.
    #[error("Toolchain command '{0}' is empty")]
    EmptyCommand(&'static str),

    /// The child process could not be spawned.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Underlying filesystem or pipe failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Io(_) => ErrorKind::Internal,
            _ => ErrorKind::Environment,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
