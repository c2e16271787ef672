use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_SCRIPTS_ROOT: &str = "/opt/scripts-store";
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_HISTORY_OUTPUT_CHARS: usize = 30_000;
pub const DEFAULT_TICK_MILLIS: u64 = 1000;

/// Plain env var holding the GitHub webhook shared secret.
pub const WEBHOOK_SECRET_ENV: &str = "GITHUB_WEBHOOK_SECRET";
/// Plain env var enabling diagnostic output (`DEBUG=true`).
pub const DEBUG_ENV: &str = "DEBUG";

/// Top-level config (scriptstore.toml + SCRIPTSTORE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScriptStoreConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Verbose diagnostics. Also switched on by `DEBUG=true`.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Where artifacts and sandboxes live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `<scripts_root>/<project>/<script>/` holds the extracted artifact.
    #[serde(default = "default_scripts_root")]
    pub scripts_root: PathBuf,
    /// `<envs_root>/<environment key>/` holds one sandbox.
    #[serde(default = "default_envs_root")]
    pub envs_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scripts_root: default_scripts_root(),
            envs_root: default_envs_root(),
        }
    }
}

/// How sandboxes are provisioned and how scripts run inside them.
///
/// Every command is an argv template. The placeholders `{env}`,
/// `{script_dir}` and `{entry}` are substituted before spawning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Pinned runtime tag, part of every environment key.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Dependency manifest file name.
    #[serde(default = "default_manifest_file")]
    pub manifest: String,
    #[serde(default = "default_required_dirs")]
    pub required_dirs: Vec<String>,
    /// Creates an empty sandbox in `{env}`. Skipped when unset.
    #[serde(default = "default_create")]
    pub create: Option<Vec<String>>,
    #[serde(default = "default_install")]
    pub install: Vec<String>,
    /// Tool-level manifest check run by the validator. Skipped when unset.
    #[serde(default = "default_check")]
    pub check: Option<Vec<String>>,
    #[serde(default = "default_test")]
    pub test: Vec<String>,
    #[serde(default = "default_run")]
    pub run: Vec<String>,
    /// Resolution artifacts (relative to the script dir) removed on teardown.
    #[serde(default = "default_artifacts")]
    pub artifacts: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            entry_point: default_entry_point(),
            manifest: default_manifest_file(),
            required_dirs: default_required_dirs(),
            create: default_create(),
            install: default_install(),
            check: default_check(),
            test: default_test(),
            run: default_run(),
            artifacts: default_artifacts(),
        }
    }
}

/// Rules applied to the parsed dependency manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Dotted TOML table paths that must be present.
    #[serde(default = "default_required_sections")]
    pub required_sections: Vec<String>,
    /// Dotted path of the runtime version constraint.
    #[serde(default = "default_runtime_key")]
    pub runtime_key: String,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            required_sections: default_required_sections(),
            runtime_key: default_runtime_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound for one script run in seconds. `0` lets a script run forever.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Characters of stdout/stderr kept per execution history row.
    #[serde(default = "default_history_output_chars")]
    pub history_output_chars: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            history_output_chars: default_history_output_chars(),
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Option<std::time::Duration> {
        (self.timeout_secs > 0).then(|| std::time::Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    /// HMAC-SHA256 signing secret shared with GitHub.
    pub secret: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}
fn default_db_path() -> String {
    format!("{}/.scriptstore/scriptstore.db", home_dir())
}
fn default_scripts_root() -> PathBuf {
    PathBuf::from(DEFAULT_SCRIPTS_ROOT)
}
fn default_envs_root() -> PathBuf {
    PathBuf::from(format!("{}/.scriptstore/envs", home_dir()))
}
fn default_runtime() -> String {
    "py3.9".to_string()
}
fn default_entry_point() -> String {
    "main.py".to_string()
}
fn default_manifest_file() -> String {
    "pyproject.toml".to_string()
}
fn default_required_dirs() -> Vec<String> {
    vec!["config".to_string(), "tests".to_string()]
}
fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
fn default_create() -> Option<Vec<String>> {
    Some(argv(&["python3", "-m", "venv", "{env}"]))
}
fn default_install() -> Vec<String> {
    argv(&["poetry", "install", "--no-root"])
}
fn default_check() -> Option<Vec<String>> {
    Some(argv(&["poetry", "check"]))
}
fn default_test() -> Vec<String> {
    argv(&["{env}/bin/python", "-m", "pytest", "tests/", "-v"])
}
fn default_run() -> Vec<String> {
    argv(&["{env}/bin/python", "{entry}"])
}
fn default_artifacts() -> Vec<String> {
    vec!["poetry.lock".to_string()]
}
fn default_required_sections() -> Vec<String> {
    vec![
        "tool.poetry".to_string(),
        "tool.poetry.dependencies".to_string(),
        "build-system".to_string(),
    ]
}
fn default_runtime_key() -> String {
    "tool.poetry.dependencies.python".to_string()
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_history_output_chars() -> usize {
    DEFAULT_HISTORY_OUTPUT_CHARS
}
fn default_tick_millis() -> u64 {
    DEFAULT_TICK_MILLIS
}

impl ScriptStoreConfig {
    /// Load config from a TOML file with SCRIPTSTORE_* env var overrides.
    ///
    /// Nested keys use a double underscore: `SCRIPTSTORE_SERVER__PORT=9000`.
    /// `GITHUB_WEBHOOK_SECRET` and `DEBUG` are applied last.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: ScriptStoreConfig =
            Figment::from(Serialized::defaults(ScriptStoreConfig::default()))
                .merge(Toml::file(&path))
                .merge(Env::prefixed("SCRIPTSTORE_").split("__"))
                .extract()
                .map_err(|e| crate::error::ScriptStoreError::Config(e.to_string()))?;

        config.apply_plain_env();
        Ok(config)
    }

    /// Overlay the two unprefixed variables the deployment contract names.
    pub fn apply_plain_env(&mut self) {
        if let Ok(secret) = std::env::var(WEBHOOK_SECRET_ENV) {
            if !secret.is_empty() {
                self.webhook.secret = Some(secret);
            }
        }
        if let Ok(flag) = std::env::var(DEBUG_ENV) {
            if flag.eq_ignore_ascii_case("true") {
                self.debug = true;
            }
        }
    }
}

fn default_config_path() -> String {
    format!("{}/.scriptstore/scriptstore.toml", home_dir())
}
