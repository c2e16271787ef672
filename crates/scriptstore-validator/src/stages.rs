//! The three built-in stages: structure, manifest, self-test.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scriptstore_core::config::{ManifestConfig, ToolchainConfig};
use scriptstore_sandbox::{EnvironmentManager, SandboxSpec};
use tracing::{debug, info};

use crate::error::{Result, ValidationFailure};
use crate::pipeline::{ValidationReport, ValidationStage, ValidationTarget};

/// Required directories, then the manifest and entry point files.
pub struct StructureStage {
    required_dirs: Vec<String>,
    required_files: Vec<String>,
}

impl StructureStage {
    pub fn new(toolchain: &ToolchainConfig) -> Self {
        Self {
            required_dirs: toolchain.required_dirs.clone(),
            required_files: vec![toolchain.manifest.clone(), toolchain.entry_point.clone()],
        }
    }
}

#[async_trait]
impl ValidationStage for StructureStage {
    fn name(&self) -> &'static str {
        "structure"
    }

    async fn check(
        &self,
        target: &ValidationTarget<'_>,
        _report: &mut ValidationReport,
    ) -> Result<()> {
        for dir in &self.required_dirs {
            if !target.workdir.join(dir).is_dir() {
                return Err(ValidationFailure::StructureInvalid(format!(
                    "Missing required directory: {dir}"
                )));
            }
        }
        for file in &self.required_files {
            if !target.workdir.join(file).is_file() {
                return Err(ValidationFailure::StructureInvalid(format!(
                    "Missing required file: {file}"
                )));
            }
        }
        Ok(())
    }
}

/// Parses the TOML manifest, checks the configured sections and runtime
/// constraint, then runs the toolchain's own check command if there is one.
pub struct ManifestStage {
    file_name: String,
    rules: ManifestConfig,
    env: Arc<EnvironmentManager>,
}

impl ManifestStage {
    pub fn new(file_name: &str, rules: ManifestConfig, env: Arc<EnvironmentManager>) -> Self {
        Self {
            file_name: file_name.to_string(),
            rules,
            env,
        }
    }
}

#[async_trait]
impl ValidationStage for ManifestStage {
    fn name(&self) -> &'static str {
        "manifest"
    }

    async fn check(
        &self,
        target: &ValidationTarget<'_>,
        _report: &mut ValidationReport,
    ) -> Result<()> {
        let path = target.workdir.join(&self.file_name);
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ValidationFailure::ManifestInvalid(format!("Cannot read {}: {e}", self.file_name))
        })?;
        let manifest: toml::Table = toml::from_str(&text).map_err(|e| {
            ValidationFailure::ManifestInvalid(format!("Invalid {}: {e}", self.file_name))
        })?;

        for section in &self.rules.required_sections {
            if !lookup(&manifest, section).is_some_and(toml::Value::is_table) {
                return Err(ValidationFailure::ManifestInvalid(format!(
                    "Missing [{section}] section"
                )));
            }
        }
        if lookup(&manifest, &self.rules.runtime_key).is_none() {
            return Err(ValidationFailure::ManifestInvalid(format!(
                "Missing runtime version specification ({})",
                self.rules.runtime_key
            )));
        }

        let checked = self
            .env
            .run_check(target.workdir)
            .await
            .map_err(|e| ValidationFailure::ManifestInvalid(format!("Manifest check failed: {e}")))?;
        if let Some(out) = checked {
            if !out.success() {
                return Err(ValidationFailure::ManifestInvalid(format!(
                    "Manifest check failed: {}",
                    out.stderr.trim_end()
                )));
            }
        }
        Ok(())
    }
}

/// Resolve a dotted path (`tool.poetry.dependencies`) in a TOML table.
pub(crate) fn lookup<'a>(table: &'a toml::Table, dotted: &str) -> Option<&'a toml::Value> {
    let mut parts = dotted.split('.');
    let mut current = table.get(parts.next()?)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

/// Provisions the version's sandbox and runs the bundled tests in it.
///
/// The sandbox is left in place on success; the key goes into the report
/// so the caller can store it on the new record.
pub struct SelfTestStage {
    env: Arc<EnvironmentManager>,
    timeout: Option<Duration>,
}

impl SelfTestStage {
    pub fn new(env: Arc<EnvironmentManager>, timeout: Option<Duration>) -> Self {
        Self { env, timeout }
    }
}

#[async_trait]
impl ValidationStage for SelfTestStage {
    fn name(&self) -> &'static str {
        "self-test"
    }

    async fn check(
        &self,
        target: &ValidationTarget<'_>,
        report: &mut ValidationReport,
    ) -> Result<()> {
        let key = self
            .env
            .ensure(SandboxSpec {
                identity: target.identity,
                version: target.version,
                workdir: target.workdir,
            })
            .await
            .map_err(|e| ValidationFailure::EnvironmentSetupFailed(e.to_string()))?;
        report.env_key = Some(key.clone());

        info!(identity = %target.identity, version = target.version, env = %key, "running tests");
        let out = self
            .env
            .run_tests(&key, target.workdir, self.timeout)
            .await
            .map_err(|e| ValidationFailure::EnvironmentSetupFailed(e.to_string()))?;
        if !out.success() {
            return Err(ValidationFailure::TestsFailed {
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        debug!(identity = %target.identity, "tests passed");
        report.test_output = out.stdout;
        Ok(())
    }
}
