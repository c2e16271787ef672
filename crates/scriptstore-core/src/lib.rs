//! `scriptstore-core` - types, configuration and the error taxonomy shared by
//! every Script Store crate.

pub mod config;
pub mod error;
pub mod types;

pub use error::{ErrorKind, Result, ScriptStoreError};
pub use types::{ExecutionEntry, Identity, LastStatus, ScriptRecord, SourceMetadata, Trigger};
