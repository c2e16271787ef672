//! `EnvironmentManager`: one isolated dependency sandbox per script version.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use scriptstore_core::config::ToolchainConfig;
use scriptstore_core::Identity;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::key::EnvironmentKey;
use crate::output::RunOutput;
use crate::toolchain::{render, Invocation, Placeholders};

/// Marker written into a sandbox once its install step succeeded.
const STAMP_FILE: &str = ".installed";

/// Which version a sandbox belongs to, and where its files currently are.
///
/// `workdir` differs from the canonical script directory while a candidate
/// version is still being validated in a staging area; the key is always
/// derived from the canonical directory so the sandbox survives the swap.
#[derive(Debug, Clone, Copy)]
pub struct SandboxSpec<'a> {
    pub identity: &'a Identity,
    pub version: &'a str,
    pub workdir: &'a Path,
}

pub struct EnvironmentManager {
    toolchain: ToolchainConfig,
    scripts_root: PathBuf,
    envs_root: PathBuf,
    /// Serializes provisioning and teardown per sandbox.
    key_locks: DashMap<EnvironmentKey, Arc<Mutex<()>>>,
}

impl EnvironmentManager {
    pub fn new(
        toolchain: ToolchainConfig,
        scripts_root: impl Into<PathBuf>,
        envs_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            toolchain,
            scripts_root: scripts_root.into(),
            envs_root: envs_root.into(),
            key_locks: DashMap::new(),
        }
    }

    pub fn toolchain(&self) -> &ToolchainConfig {
        &self.toolchain
    }

    pub fn scripts_root(&self) -> &Path {
        &self.scripts_root
    }

    /// Pure key derivation; touches nothing on disk.
    pub fn key_for(&self, identity: &Identity, version: &str) -> EnvironmentKey {
        EnvironmentKey::derive(
            identity,
            version,
            &self.toolchain.runtime,
            &identity.script_dir(&self.scripts_root),
        )
    }

    pub fn env_dir(&self, key: &EnvironmentKey) -> PathBuf {
        self.envs_root.join(key.as_str())
    }

    /// A sandbox is intact when its install step completed.
    pub fn is_provisioned(&self, key: &EnvironmentKey) -> bool {
        self.env_dir(key).join(STAMP_FILE).is_file()
    }

    /// Return the sandbox for `spec`, provisioning it first if needed.
    ///
    /// An intact sandbox is reused without reinstalling. A half-built one
    /// (no stamp) is wiped and rebuilt from scratch.
    pub async fn ensure(&self, spec: SandboxSpec<'_>) -> Result<EnvironmentKey> {
        let manifest = spec.workdir.join(&self.toolchain.manifest);
        if !manifest.is_file() {
            return Err(SandboxError::ManifestMissing { path: manifest });
        }

        let key = self.key_for(spec.identity, spec.version);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if self.is_provisioned(&key) {
            debug!(key = %key, "reusing sandbox");
            return Ok(key);
        }

        let env_dir = self.env_dir(&key);
        if env_dir.exists() {
            warn!(key = %key, "removing incomplete sandbox");
            tokio::fs::remove_dir_all(&env_dir).await?;
        }
        tokio::fs::create_dir_all(&self.envs_root).await?;

        info!(identity = %spec.identity, version = spec.version, key = %key, "provisioning sandbox");

        if let Err(e) = self.provision(spec.workdir, &env_dir).await {
            if let Err(cleanup) = remove_dir_if_present(&env_dir).await {
                warn!(key = %key, error = %cleanup, "failed to clean up after provisioning error");
            }
            return Err(e);
        }

        tokio::fs::write(
            env_dir.join(STAMP_FILE),
            chrono::Utc::now().to_rfc3339(),
        )
        .await?;
        info!(key = %key, "sandbox ready");
        Ok(key)
    }

    async fn provision(&self, workdir: &Path, env_dir: &Path) -> Result<()> {
        match &self.toolchain.create {
            Some(template) => {
                let out = self
                    .invocation("create", template, workdir, env_dir, None)
                    .run()
                    .await?;
                check_step("create", out)?;
                // `create` may be a no-op for toolchains that manage their own dirs.
                tokio::fs::create_dir_all(env_dir).await?;
            }
            None => tokio::fs::create_dir_all(env_dir).await?,
        }

        let out = self
            .invocation("install", &self.toolchain.install, workdir, env_dir, None)
            .run()
            .await?;
        check_step("install", out)
    }

    /// Run the entry point inside the sandbox with `args` appended.
    pub async fn run(
        &self,
        key: &EnvironmentKey,
        workdir: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<RunOutput> {
        self.require(key)?;
        let env_dir = self.env_dir(key);
        let mut invocation = self.invocation("run", &self.toolchain.run, workdir, &env_dir, timeout);
        invocation.argv.extend(args.iter().cloned());
        invocation.run().await
    }

    /// Run the bundled test suite inside the sandbox.
    pub async fn run_tests(
        &self,
        key: &EnvironmentKey,
        workdir: &Path,
        timeout: Option<Duration>,
    ) -> Result<RunOutput> {
        self.require(key)?;
        let env_dir = self.env_dir(key);
        self.invocation("test", &self.toolchain.test, workdir, &env_dir, timeout)
            .run()
            .await
    }

    /// Run the toolchain's own manifest check; `None` when none is configured.
    pub async fn run_check(&self, workdir: &Path) -> Result<Option<RunOutput>> {
        let Some(template) = &self.toolchain.check else {
            return Ok(None);
        };
        let argv = render(
            template,
            Placeholders {
                env: &self.envs_root,
                script_dir: workdir,
                entry: &self.toolchain.entry_point,
            },
        );
        let out = Invocation {
            step: "check",
            argv,
            cwd: workdir,
            env_dir: None,
            timeout: None,
        }
        .run()
        .await?;
        Ok(Some(out))
    }

    /// Remove only the sandbox directory for `identity`@`version`.
    ///
    /// Used for candidates that failed validation, where the artifact
    /// directory is either discarded wholesale or not ours to clean.
    pub async fn remove_sandbox(&self, identity: &Identity, version: &str) -> Result<()> {
        let key = self.key_for(identity, version);
        {
            let lock = self.lock_for(&key);
            let _guard = lock.lock().await;
            remove_dir_if_present(&self.env_dir(&key)).await?;
        }
        // keep the entry while another task still holds or waits on it
        self.key_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        debug!(identity = %identity, version, key = %key, "sandbox removed");
        Ok(())
    }

    /// Remove the sandbox and the resolution artifacts left in `workdir`.
    ///
    /// Tearing down something that is already gone succeeds.
    pub async fn teardown(&self, spec: SandboxSpec<'_>) -> Result<()> {
        self.remove_sandbox(spec.identity, spec.version).await?;
        for artifact in &self.toolchain.artifacts {
            let path = spec.workdir.join(artifact);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "removed artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(identity = %spec.identity, version = spec.version, "sandbox torn down");
        Ok(())
    }

    fn require(&self, key: &EnvironmentKey) -> Result<()> {
        if self.is_provisioned(key) {
            Ok(())
        } else {
            Err(SandboxError::MissingEnvironment {
                key: key.to_string(),
            })
        }
    }

    fn lock_for(&self, key: &EnvironmentKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn invocation<'a>(
        &self,
        step: &'static str,
        template: &[String],
        workdir: &'a Path,
        env_dir: &'a Path,
        timeout: Option<Duration>,
    ) -> Invocation<'a> {
        Invocation {
            step,
            argv: render(
                template,
                Placeholders {
                    env: env_dir,
                    script_dir: workdir,
                    entry: &self.toolchain.entry_point,
                },
            ),
            cwd: workdir,
            env_dir: Some(env_dir),
            timeout,
        }
    }
}

fn check_step(step: &'static str, out: RunOutput) -> Result<()> {
    if out.success() {
        Ok(())
    } else {
        Err(SandboxError::Provision {
            step,
            exit_code: out.exit_code,
            stderr: out.stderr,
        })
    }
}

async fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
