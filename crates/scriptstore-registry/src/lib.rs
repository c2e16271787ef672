//! `scriptstore-registry` - SQLite-backed record of script versions.
//!
//! # Overview
//!
//! Each upload or CI registration of a `(project, script)` identity adds a
//! row to the `scripts` table. Exactly one row per identity is active; the
//! previous one is retired (never deleted) in the same transaction that
//! inserts its successor. Versions start at `1.0.0` and only the patch
//! component moves.
//!
//! Executions update the active row's statistics (`last_run`,
//! `last_status`, `run_count`) and append to the `executions` history.

pub mod db;
pub mod error;
pub mod registry;
pub mod version;

pub use error::{RegistryError, Result};
pub use registry::{ExecutionOutcome, Registration, RegistrationRequest, VersionRegistry};
pub use version::Version;
