//! Ordered, fail-fast validation pipeline.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use scriptstore_core::config::ScriptStoreConfig;
use scriptstore_core::Identity;
use scriptstore_sandbox::{EnvironmentKey, EnvironmentManager};
use tracing::{info, warn};

use crate::error::Result;
use crate::stages::{ManifestStage, SelfTestStage, StructureStage};

/// Returned by [`Validator::validate_all`] when every stage passes.
pub const PASSED_MESSAGE: &str = "All validations passed successfully";

/// The candidate version being validated.
#[derive(Debug, Clone, Copy)]
pub struct ValidationTarget<'a> {
    pub identity: &'a Identity,
    /// Version the candidate will get if it is accepted.
    pub version: &'a str,
    /// Directory holding the extracted artifact.
    pub workdir: &'a Path,
}

/// What a successful run produced.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Stages that passed, in order.
    pub passed: Vec<&'static str>,
    /// Sandbox provisioned by the self-test.
    pub env_key: Option<EnvironmentKey>,
    /// Test suite stdout.
    pub test_output: String,
}

impl ValidationReport {
    pub fn message(&self) -> &'static str {
        PASSED_MESSAGE
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait ValidationStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(
        &self,
        target: &ValidationTarget<'_>,
        report: &mut ValidationReport,
    ) -> Result<()>;
}

pub struct Validator {
    stages: Vec<Box<dyn ValidationStage>>,
}

impl Validator {
    pub fn new(stages: Vec<Box<dyn ValidationStage>>) -> Self {
        Self { stages }
    }

    /// Structure, then manifest, then self-test, as configured.
    pub fn standard(config: &ScriptStoreConfig, env: Arc<EnvironmentManager>) -> Self {
        Self::new(vec![
            Box::new(StructureStage::new(&config.toolchain)),
            Box::new(ManifestStage::new(
                &config.toolchain.manifest,
                config.manifest.clone(),
                Arc::clone(&env),
            )),
            Box::new(SelfTestStage::new(env, config.execution.timeout())),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order; the first failure stops the pipeline and
    /// is returned as-is.
    pub async fn validate_all(&self, target: &ValidationTarget<'_>) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        for stage in &self.stages {
            if let Err(failure) = stage.check(target, &mut report).await {
                warn!(
                    identity = %target.identity,
                    version = target.version,
                    stage = stage.name(),
                    "validation failed: {failure}"
                );
                return Err(failure);
            }
            report.passed.push(stage.name());
        }
        info!(identity = %target.identity, version = target.version, "validation passed");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationFailure;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ValidationStage for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn check(
            &self,
            _target: &ValidationTarget<'_>,
            _report: &mut ValidationReport,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ValidationFailure::StructureInvalid(format!("{} broke", self.name)))
            } else {
                Ok(())
            }
        }
    }

    fn counting(name: &'static str, fail: bool) -> (Box<dyn ValidationStage>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Counting {
                name,
                calls: Arc::clone(&calls),
                fail,
            }),
            calls,
        )
    }

    fn target_in(dir: &Path) -> (Identity, std::path::PathBuf) {
        (Identity::new("etl", "v1"), dir.to_path_buf())
    }

    #[tokio::test]
    async fn first_failure_stops_later_stages() {
        let (structure, structure_calls) = counting("structure", true);
        let (manifest, manifest_calls) = counting("manifest", false);
        let (tests, test_calls) = counting("self-test", false);
        let validator = Validator::new(vec![structure, manifest, tests]);

        let dir = tempfile::tempdir().unwrap();
        let (identity, workdir) = target_in(dir.path());
        let err = validator
            .validate_all(&ValidationTarget {
                identity: &identity,
                version: "1.0.0",
                workdir: &workdir,
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "structure broke");
        assert_eq!(structure_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manifest_calls.load(Ordering::SeqCst), 0);
        assert_eq!(test_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_stages_run_in_order_when_passing() {
        let (a, a_calls) = counting("structure", false);
        let (b, b_calls) = counting("manifest", false);
        let validator = Validator::new(vec![a, b]);

        let dir = tempfile::tempdir().unwrap();
        let (identity, workdir) = target_in(dir.path());
        let report = validator
            .validate_all(&ValidationTarget {
                identity: &identity,
                version: "1.0.0",
                workdir: &workdir,
            })
            .await
            .unwrap();

        assert_eq!(report.passed, vec!["structure", "manifest"]);
        assert_eq!(report.message(), PASSED_MESSAGE);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn standard_pipeline_order() {
        let config = ScriptStoreConfig::default();
        let env = Arc::new(EnvironmentManager::new(
            config.toolchain.clone(),
            "/tmp/scripts",
            "/tmp/envs",
        ));
        let validator = Validator::standard(&config, env);
        assert_eq!(
            validator.stage_names(),
            vec!["structure", "manifest", "self-test"]
        );
    }
}
