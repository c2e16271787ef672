use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The (project, script) pair naming a deployable script across all its versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub project_name: String,
    pub script_name: String,
}

impl Identity {
    pub fn new(project_name: impl Into<String>, script_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            script_name: script_name.into(),
        }
    }

    /// Reject names that could escape the scripts root once joined as a path.
    pub fn check_names(&self) -> std::result::Result<(), String> {
        for (label, value) in [
            ("project_name", &self.project_name),
            ("script_name", &self.script_name),
        ] {
            if value.is_empty() {
                return Err(format!("{label} must not be empty"));
            }
            if value == "." || value == ".." || value.starts_with('.') {
                return Err(format!("{label} must not start with '.'"));
            }
            if value.contains(['/', '\\', '\0']) {
                return Err(format!("{label} must not contain path separators"));
            }
        }
        Ok(())
    }

    /// `<root>/<project>/<script>`.
    pub fn script_dir(&self, scripts_root: &Path) -> PathBuf {
        scripts_root
            .join(&self.project_name)
            .join(&self.script_name)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_name, self.script_name)
    }
}

/// Outcome of the most recent execution; absent until the first run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastStatus {
    Success,
    Failed,
}

impl LastStatus {
    pub fn from_success(success: bool) -> Self {
        if success {
            LastStatus::Success
        } else {
            LastStatus::Failed
        }
    }
}

impl fmt::Display for LastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LastStatus::Success => "success",
            LastStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LastStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(LastStatus::Success),
            "failed" => Ok(LastStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// On-demand request.
    Manual,
    /// Fired by a cron trigger.
    Scheduled,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Trigger::Manual),
            "scheduled" => Ok(Trigger::Scheduled),
            other => Err(format!("unknown trigger: {other}")),
        }
    }
}

/// Where a version came from when it was deployed by external CI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
}

/// One version of one script.
///
/// Records are never deleted; a superseded version is retired by
/// clearing `is_active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRecord {
    /// SQLite rowid.
    pub id: i64,
    pub project_name: String,
    pub script_name: String,
    /// `MAJOR.MINOR.PATCH`; each new version increments PATCH.
    pub version: String,
    pub is_active: bool,
    /// RFC3339 creation timestamp.
    pub created_at: String,
    /// RFC3339 timestamp of the latest execution.
    pub last_run: Option<String>,
    pub last_status: Option<LastStatus>,
    pub run_count: u32,
    pub cron_expression: Option<String>,
    /// Key of the sandbox this version runs in.
    pub env_name: Option<String>,
    #[serde(flatten)]
    pub source: SourceMetadata,
}

impl ScriptRecord {
    pub fn identity(&self) -> Identity {
        Identity::new(&self.project_name, &self.script_name)
    }
}

/// One row of execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub id: i64,
    pub project_name: String,
    pub script_name: String,
    pub version: String,
    pub env_name: Option<String>,
    pub trigger: Trigger,
    pub started_at: String,
    pub finished_at: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}
