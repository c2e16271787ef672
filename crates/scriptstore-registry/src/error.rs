use scriptstore_core::{ErrorKind, Identity};
use thiserror::Error;

/// Errors that can occur within the version registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No active record exists for the identity.
    #[error("Script not found or not active: {identity}")]
    NotFound { identity: Identity },

    /// A stored version string is not `MAJOR.MINOR.PATCH`. Only this registry
    /// writes versions, so this means the database was edited by hand.
    #[error("Corrupt version '{version}' stored for {identity}")]
    CorruptVersion { identity: Identity, version: String },

    /// The connection mutex was poisoned by a panicking writer.
    #[error("Registry connection lock poisoned")]
    LockPoisoned,
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
