//! `scriptstore-orchestrator` - the script lifecycle flows.
//!
//! # Overview
//!
//! - [`Deployer`] takes a candidate version (zip upload or an artifact
//!   already placed by CI), runs the [`Validator`](scriptstore_validator::Validator),
//!   activates it in the registry, retires the previous version's sandbox
//!   and (re)installs its cron trigger.
//! - [`Executor`] runs the active version inside its sandbox and records
//!   the outcome. It is also the scheduler's [`JobRunner`](scriptstore_scheduler::JobRunner).
//!
//! Both hold the same per-identity lock, so for one script a deployment and
//! any number of runs happen strictly one after another.

pub mod archive;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod locks;

pub use deploy::{Deployer, Deployment};
pub use error::{LifecycleError, Result};
pub use executor::{ExecutionReport, Executor};
pub use locks::IdentityLocks;
