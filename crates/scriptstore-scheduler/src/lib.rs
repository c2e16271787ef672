//! `scriptstore-scheduler` - cron triggers for active scripts, persisted in
//! SQLite.
//!
//! # Overview
//!
//! One trigger per `(project, script)` identity lives in the
//! `scheduled_jobs` table. The [`Scheduler`] polls that table on a fixed
//! tick, advances each due trigger to its next fire time and hands the
//! identity to a [`JobRunner`] (the executor). On [`Scheduler::start`] the
//! trigger set is reconciled against the registry's active records, so a
//! restart picks up exactly the schedules the registry says should exist.
//!
//! # Misfires
//!
//! A fire time that passed while the process was down is run as soon as
//! the loop starts. Several missed fire times for the same trigger run
//! once, not once each.

pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod types;

pub use cron::CronExpression;
pub use engine::{parse_cron, JobRunner, Scheduler};
pub use error::{Result, SchedulerError};
pub use types::{RestoreSummary, ScheduledJob, SchedulerState};
