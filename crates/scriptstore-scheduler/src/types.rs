use scriptstore_core::Identity;
use serde::{Deserialize, Serialize};

/// A persisted cron trigger for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// `<project>_<script>`, stable across restarts.
    pub job_id: String,
    pub project_name: String,
    pub script_name: String,
    pub cron_expression: String,
    /// RFC3339 UTC; `None` when the expression can never fire.
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub fire_count: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl ScheduledJob {
    pub fn identity(&self) -> Identity {
        Identity::new(&self.project_name, &self.script_name)
    }
}

pub fn job_id(identity: &Identity) -> String {
    format!("{}_{}", identity.project_name, identity.script_name)
}

/// Outcome of [`crate::Scheduler::restore_jobs`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub restored: usize,
    pub failed: usize,
    /// Stored triggers whose identity is no longer active with a schedule.
    pub removed: usize,
}

/// Lifecycle of the background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
}
