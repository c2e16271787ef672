use thiserror::Error;

/// Failure classes shared by every component.
///
/// Components return their own error enums and map them onto a kind; only
/// the HTTP boundary turns a kind into a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad archive, malformed cron expression, malformed payload.
    Input,
    /// Structure, manifest or self-test failure.
    Validation,
    /// Sandbox provisioning or dependency install failure.
    Environment,
    /// The script ran and exited non-zero (or timed out).
    Execution,
    /// Unknown or inactive identity.
    NotFound,
    Internal,
}

impl ErrorKind {
    /// Short error code string used in logs and response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Input => "INPUT_ERROR",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Environment => "ENVIRONMENT_ERROR",
            ErrorKind::Execution => "EXECUTION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum ScriptStoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScriptStoreError>;
