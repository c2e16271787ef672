use scriptstore_core::ErrorKind;
use scriptstore_registry::RegistryError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The expression is not valid 5-field crontab syntax.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// Looking up or updating the script record failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The job store mutex was poisoned by a panicking writer.
    #[error("Scheduler store lock poisoned")]
    LockPoisoned,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::InvalidCronExpression { .. } => ErrorKind::Input,
            SchedulerError::Registry(e) => e.kind(),
            _ => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
