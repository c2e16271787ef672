//! Rendering and spawning of toolchain argv templates.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::output::RunOutput;

/// Values substituted into `{env}`, `{script_dir}` and `{entry}`.
#[derive(Debug, Clone, Copy)]
pub struct Placeholders<'a> {
    pub env: &'a Path,
    pub script_dir: &'a Path,
    pub entry: &'a str,
}

/// Substitute placeholders in every argv element.
pub fn render(template: &[String], values: Placeholders<'_>) -> Vec<String> {
    let env = values.env.to_string_lossy();
    let script_dir = values.script_dir.to_string_lossy();
    template
        .iter()
        .map(|part| {
            part.replace("{env}", &env)
                .replace("{script_dir}", &script_dir)
                .replace("{entry}", values.entry)
        })
        .collect()
}

/// One fully rendered process invocation.
#[derive(Debug)]
pub struct Invocation<'a> {
    /// Short label used in logs and provisioning errors.
    pub step: &'static str,
    pub argv: Vec<String>,
    pub cwd: &'a Path,
    /// Sandbox to activate for the child, if any.
    pub env_dir: Option<&'a Path>,
    pub timeout: Option<Duration>,
}

impl Invocation<'_> {
    /// Spawn the process and wait for it, capturing both streams in full.
    ///
    /// On timeout the child is killed and the returned output has
    /// `timed_out` set. It keeps whatever was written before the kill, with
    /// the timeout notice appended to stderr.
    pub async fn run(self) -> Result<RunOutput> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or(SandboxError::EmptyCommand(self.step))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(self.cwd)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(env_dir) = self.env_dir {
            let bin = env_dir.join("bin");
            let path = match std::env::var_os("PATH") {
                Some(existing) => {
                    let mut joined = bin.into_os_string();
                    joined.push(":");
                    joined.push(existing);
                    joined
                }
                None => bin.into_os_string(),
            };
            cmd.env("VIRTUAL_ENV", env_dir).env("PATH", path);
        }

        debug!(step = self.step, argv = ?self.argv, cwd = %self.cwd.display(), "spawning");

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: program.clone(),
            source,
        })?;
        let stdout = Capture::start(child.stdout.take());
        let stderr = Capture::start(child.stderr.take());

        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait())
                .await
                .map_err(|_elapsed| limit),
            None => Ok(child.wait().await),
        };

        match waited {
            Ok(status) => {
                let status = status?;
                Ok(RunOutput {
                    exit_code: status.code(),
                    stdout: stdout.finish(None).await,
                    stderr: stderr.finish(None).await,
                    timed_out: false,
                })
            }
            Err(limit) => {
                warn!(step = self.step, secs = limit.as_secs(), "process timed out");
                if let Err(e) = child.kill().await {
                    warn!(step = self.step, error = %e, "failed to kill timed-out process");
                }
                // grandchildren may still hold the pipes open
                let stdout = stdout.finish(Some(DRAIN_GRACE)).await;
                let mut stderr = stderr.finish(Some(DRAIN_GRACE)).await;
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("timed out after {}s", limit.as_secs()));
                Ok(RunOutput {
                    exit_code: None,
                    stdout,
                    stderr,
                    timed_out: true,
                })
            }
        }
    }
}

/// How long a killed process's pipes are drained before giving up on EOF.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// One child pipe read into memory on a background task.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Capture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buf, task }
    }

    /// Wait for EOF (at most `grace`, if given) and return what was read.
    async fn finish(self, grace: Option<Duration>) -> String {
        let mut task = self.task;
        match grace {
            None => {
                let _ = (&mut task).await;
            }
            Some(grace) => {
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    task.abort();
                }
            }
        }
        let bytes = std::mem::take(&mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
