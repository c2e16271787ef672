//! Upload and CI registration flows: validate a candidate, then activate it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use scriptstore_core::{Identity, ScriptRecord, SourceMetadata};
use scriptstore_registry::{RegistrationRequest, VersionRegistry};
use scriptstore_sandbox::{EnvironmentManager, SandboxSpec};
use scriptstore_scheduler::{parse_cron, ScheduledJob, Scheduler};
use scriptstore_validator::{ValidationReport, ValidationTarget, Validator};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive;
use crate::error::{LifecycleError, Result};
use crate::locks::IdentityLocks;

/// Outcome of a successful deployment.
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub record: ScriptRecord,
    /// Version that was retired, if any.
    pub superseded: Option<String>,
    pub message: String,
    /// Trigger installed for the new version (explicit or carried over).
    pub job: Option<ScheduledJob>,
}

pub struct Deployer {
    registry: Arc<VersionRegistry>,
    env: Arc<EnvironmentManager>,
    validator: Arc<Validator>,
    scheduler: Arc<Scheduler>,
    locks: Arc<IdentityLocks>,
}

impl Deployer {
    pub fn new(
        registry: Arc<VersionRegistry>,
        env: Arc<EnvironmentManager>,
        validator: Arc<Validator>,
        scheduler: Arc<Scheduler>,
        locks: Arc<IdentityLocks>,
    ) -> Self {
        Self {
            registry,
            env,
            validator,
            scheduler,
            locks,
        }
    }

    /// Deploy a zip artifact as the next version of `identity`.
    ///
    /// The archive is unpacked and validated in a staging directory next to
    /// the live one. Only a passing candidate replaces the live directory;
    /// on any failure the staging directory is discarded and the current
    /// version keeps running untouched.
    pub async fn deploy_archive(
        &self,
        identity: &Identity,
        filename: &str,
        bytes: Vec<u8>,
        cron_expression: Option<&str>,
    ) -> Result<Deployment> {
        identity.check_names().map_err(LifecycleError::InvalidInput)?;
        if !archive::is_zip_filename(filename) {
            return Err(LifecycleError::InvalidInput(
                "Only zip files are accepted".to_string(),
            ));
        }
        if let Some(expr) = cron_expression {
            parse_cron(expr)?;
        }

        let _guard = self.locks.acquire(identity).await;

        let live = identity.script_dir(self.env.scripts_root());
        let project_dir = self.env.scripts_root().join(&identity.project_name);
        tokio::fs::create_dir_all(&project_dir).await?;
        let staging = project_dir.join(format!(
            ".staging-{}-{}",
            identity.script_name,
            Uuid::new_v4().simple()
        ));

        let staged = self.stage(identity, bytes, &staging).await;
        let (version, report) = match staged {
            Ok(v) => v,
            Err(e) => {
                discard_dir(&staging).await;
                return Err(e);
            }
        };

        let retired =
            swap_into_place(&project_dir, &identity.script_name, &staging, &live).await?;

        let activated = self
            .activate(
                identity,
                &version,
                report,
                SourceMetadata::default(),
                cron_expression,
            )
            .await;
        let deployment = match activated {
            Ok(d) => d,
            Err(e) => {
                // Put the previous artifact back; the registry still points at it.
                if let Some(retired) = &retired {
                    discard_dir(&live).await;
                    if let Err(restore) = tokio::fs::rename(retired, &live).await {
                        warn!(identity = %identity, "failed to restore previous artifact: {restore}");
                    }
                }
                if let Err(cleanup) = self.env.remove_sandbox(identity, &version).await {
                    warn!(identity = %identity, version = %version, "failed to remove sandbox: {cleanup}");
                }
                return Err(e);
            }
        };

        if let Some(old_version) = &deployment.superseded {
            // After the swap, `staging` no longer exists, so only the sandbox goes.
            let old_workdir = retired.clone().unwrap_or_else(|| staging.clone());
            self.retire_sandbox(identity, old_version, &old_workdir).await;
        }
        if let Some(retired) = retired {
            discard_dir(&retired).await;
        }
        Ok(deployment)
    }

    /// Register an artifact that external CI already placed at the live
    /// script directory, validating it in place.
    pub async fn register_existing(
        &self,
        identity: &Identity,
        source: SourceMetadata,
        cron_expression: Option<&str>,
    ) -> Result<Deployment> {
        identity.check_names().map_err(LifecycleError::InvalidInput)?;
        if let Some(expr) = cron_expression {
            parse_cron(expr)?;
        }

        let _guard = self.locks.acquire(identity).await;

        let live = identity.script_dir(self.env.scripts_root());
        if !live.is_dir() {
            return Err(LifecycleError::ScriptDirNotFound { path: live });
        }

        let version = self.registry.next_version(identity)?.to_string();
        let report = self.validate(identity, &version, &live).await?;
        let deployment = self
            .activate(identity, &version, report, source, cron_expression)
            .await?;

        if let Some(old_version) = &deployment.superseded {
            // The files were replaced in place; their artifacts belong to the
            // new version now.
            if let Err(e) = self.env.remove_sandbox(identity, old_version).await {
                warn!(
                    identity = %identity,
                    version = %old_version,
                    "failed to remove old sandbox: {e}"
                );
            }
        }
        Ok(deployment)
    }

    async fn stage(
        &self,
        identity: &Identity,
        bytes: Vec<u8>,
        staging: &Path,
    ) -> Result<(String, ValidationReport)> {
        let files = archive::extract(bytes, staging.to_path_buf()).await?;
        let version = self.registry.next_version(identity)?.to_string();
        info!(identity = %identity, version = %version, files, "artifact staged");
        let report = self.validate(identity, &version, staging).await?;
        Ok((version, report))
    }

    /// Run the pipeline; a rejected candidate's sandbox is removed.
    async fn validate(
        &self,
        identity: &Identity,
        version: &str,
        workdir: &Path,
    ) -> Result<ValidationReport> {
        let target = ValidationTarget {
            identity,
            version,
            workdir,
        };
        match self.validator.validate_all(&target).await {
            Ok(report) => Ok(report),
            Err(failure) => {
                if let Err(e) = self.env.remove_sandbox(identity, version).await {
                    warn!(
                        identity = %identity,
                        version,
                        "failed to remove rejected sandbox: {e}"
                    );
                }
                Err(failure.into())
            }
        }
    }

    async fn activate(
        &self,
        identity: &Identity,
        version: &str,
        report: ValidationReport,
        source: SourceMetadata,
        cron_expression: Option<&str>,
    ) -> Result<Deployment> {
        let registration = self.registry.register_or_update(
            identity,
            &RegistrationRequest {
                cron_expression: cron_expression.map(String::from),
                source,
                env_name: report.env_key.as_ref().map(ToString::to_string),
            },
        )?;
        if registration.record.version != version {
            warn!(
                identity = %identity,
                validated = version,
                registered = %registration.record.version,
                "registered version differs from the validated one"
            );
        }

        let job = match registration.record.cron_expression.as_deref() {
            Some(expr) => match self.scheduler.schedule(identity, expr) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(
                        identity = %identity,
                        cron = expr,
                        "version active but not scheduled: {e}"
                    );
                    None
                }
            },
            None => None,
        };

        Ok(Deployment {
            record: registration.record,
            superseded: registration.superseded.map(|r| r.version),
            message: report.message().to_string(),
            job,
        })
    }

    async fn retire_sandbox(&self, identity: &Identity, version: &str, workdir: &Path) {
        let spec = SandboxSpec {
            identity,
            version,
            workdir,
        };
        if let Err(e) = self.env.teardown(spec).await {
            warn!(identity = %identity, version, "failed to tear down old sandbox: {e}");
        }
    }
}

/// Move the live directory aside (if any) and the staged one into its place.
/// Returns where the previous artifact now lives.
async fn swap_into_place(
    project_dir: &Path,
    script_name: &str,
    staging: &Path,
    live: &Path,
) -> Result<Option<PathBuf>> {
    let retired = if live.exists() {
        let retired = project_dir.join(format!(
            ".retired-{script_name}-{}",
            Uuid::new_v4().simple()
        ));
        tokio::fs::rename(live, &retired).await?;
        Some(retired)
    } else {
        None
    };

    if let Err(e) = tokio::fs::rename(staging, live).await {
        if let Some(retired) = &retired {
            if let Err(restore) = tokio::fs::rename(retired, live).await {
                warn!(live = %live.display(), "failed to restore previous artifact: {restore}");
            }
        }
        discard_dir(staging).await;
        return Err(e.into());
    }
    Ok(retired)
}

/// Best-effort recursive delete.
async fn discard_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove directory: {e}"),
    }
}
