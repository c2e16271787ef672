//! Error types for the orchestration flows.

use std::path::PathBuf;

use scriptstore_core::ErrorKind;
use scriptstore_registry::RegistryError;
use scriptstore_sandbox::SandboxError;
use scriptstore_scheduler::SchedulerError;
use scriptstore_validator::ValidationFailure;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Bad archive, bad name, or anything else the caller must fix.
    #[error("{0}")]
    InvalidInput(String),

    /// The active version has no entry point on disk.
    #[error("Main script not found at {}", path.display())]
    EntryPointNotFound { path: PathBuf },

    /// `register` was called before the artifact was placed on disk.
    #[error("Script directory not found: {}", path.display())]
    ScriptDirNotFound { path: PathBuf },

    /// The candidate version was rejected; nothing was activated.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    /// The sandbox for an execution could not be provisioned.
    #[error("Failed to set up environment: {0}")]
    EnvironmentSetupFailed(#[source] SandboxError),

    /// The script ran and failed. Already recorded in the registry.
    #[error("Script execution failed: {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::InvalidInput(_) => ErrorKind::Input,
            LifecycleError::EntryPointNotFound { .. } | LifecycleError::ScriptDirNotFound { .. } => {
                ErrorKind::NotFound
            }
            LifecycleError::Validation(f) => f.kind(),
            LifecycleError::EnvironmentSetupFailed(_) => ErrorKind::Environment,
            LifecycleError::ExecutionFailed { .. } => ErrorKind::Execution,
            LifecycleError::Registry(e) => e.kind(),
            LifecycleError::Scheduler(e) => e.kind(),
            LifecycleError::Sandbox(e) => e.kind(),
            LifecycleError::Io(_) | LifecycleError::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
