use scriptstore_core::ErrorKind;
use thiserror::Error;

/// Why a candidate version was rejected. The `Display` text is the message
/// reported to the uploader.
#[derive(Debug, Error)]
pub enum ValidationFailure {
    /// A required directory or file is missing.
    #[error("{0}")]
    StructureInvalid(String),

    /// The dependency manifest is unreadable, incomplete, or rejected by the
    /// toolchain's own check.
    #[error("{0}")]
    ManifestInvalid(String),

    /// The bundled test suite ran and failed.
    #[error("Tests failed:\n{stdout}\n{stderr}")]
    TestsFailed { stdout: String, stderr: String },

    /// The sandbox for the self-test could not be provisioned.
    #[error("Failed to install dependencies: {0}")]
    EnvironmentSetupFailed(String),
}

impl ValidationFailure {
    /// Every rejection, including a failed install, is reported as a
    /// validation error: nothing was activated.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

pub type Result<T> = std::result::Result<T, ValidationFailure>;
