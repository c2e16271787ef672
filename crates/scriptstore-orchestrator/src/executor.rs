//! Runs one invocation of a script's active version.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scriptstore_core::{Identity, ScriptRecord, Trigger};
use scriptstore_registry::{ExecutionOutcome, VersionRegistry};
use scriptstore_sandbox::{truncate_output, EnvironmentManager, RunOutput, SandboxSpec};
use scriptstore_scheduler::JobRunner;
use serde::Serialize;
use tracing::{error, info};

use crate::error::{LifecycleError, Result};
use crate::locks::IdentityLocks;

/// What a successful run returns to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub version: String,
    pub env_name: String,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: String,
    /// The record after the run statistics were applied.
    #[serde(skip)]
    pub record: ScriptRecord,
}

pub struct Executor {
    registry: Arc<VersionRegistry>,
    env: Arc<EnvironmentManager>,
    locks: Arc<IdentityLocks>,
    timeout: Option<Duration>,
    history_output_chars: usize,
}

impl Executor {
    pub fn new(
        registry: Arc<VersionRegistry>,
        env: Arc<EnvironmentManager>,
        locks: Arc<IdentityLocks>,
        timeout: Option<Duration>,
        history_output_chars: usize,
    ) -> Self {
        Self {
            registry,
            env,
            locks,
            timeout,
            history_output_chars,
        }
    }

    /// Run the active version of `identity`, blocking until the process exits.
    ///
    /// `params` is split on whitespace into separate arguments. A failed run
    /// is recorded in the registry before `ExecutionFailed` is returned.
    pub async fn execute(
        &self,
        identity: &Identity,
        params: Option<&str>,
        trigger: Trigger,
    ) -> Result<ExecutionReport> {
        let _guard = self.locks.acquire(identity).await;

        let record = self.registry.get_active(identity)?;
        let workdir = identity.script_dir(self.env.scripts_root());
        let entry = self.entry_point(&workdir);
        if !entry.is_file() {
            return Err(LifecycleError::EntryPointNotFound { path: entry });
        }

        info!(
            project = %identity.project_name,
            script = %identity.script_name,
            version = %record.version,
            %trigger,
            "executing script"
        );

        let key = self
            .env
            .ensure(SandboxSpec {
                identity,
                version: &record.version,
                workdir: &workdir,
            })
            .await
            .map_err(LifecycleError::EnvironmentSetupFailed)?;

        let args: Vec<String> = params
            .unwrap_or_default()
            .split_whitespace()
            .map(String::from)
            .collect();
        let started_at = Utc::now();
        let out = match self.env.run(&key, &workdir, &args, self.timeout).await {
            Ok(out) => out,
            Err(e) => {
                error!(
                    project = %identity.project_name,
                    script = %identity.script_name,
                    "run failed to start: {e}"
                );
                RunOutput {
                    stderr: e.to_string(),
                    ..Default::default()
                }
            }
        };
        let success = out.success();

        let updated = self.registry.record_execution(
            identity,
            &ExecutionOutcome {
                version: record.version.clone(),
                success,
                exit_code: out.exit_code,
                env_name: Some(key.to_string()),
                trigger,
                started_at,
                stdout: truncate_output(&out.stdout, self.history_output_chars),
                stderr: truncate_output(&out.stderr, self.history_output_chars),
            },
        )?;

        if !success {
            error!(
                project = %identity.project_name,
                script = %identity.script_name,
                exit_code = ?out.exit_code,
                "script failed"
            );
            return Err(LifecycleError::ExecutionFailed {
                exit_code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }

        info!(
            project = %identity.project_name,
            script = %identity.script_name,
            run_count = updated.run_count,
            "script succeeded"
        );
        Ok(ExecutionReport {
            version: record.version,
            env_name: key.to_string(),
            exit_code: out.exit_code,
            output: out.stdout,
            error: out.stderr,
            record: updated,
        })
    }

    fn entry_point(&self, workdir: &std::path::Path) -> PathBuf {
        workdir.join(&self.env.toolchain().entry_point)
    }
}

#[async_trait]
impl JobRunner for Executor {
    async fn run_job(&self, identity: &Identity) -> std::result::Result<(), String> {
        self.execute(identity, None, Trigger::Scheduled)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
