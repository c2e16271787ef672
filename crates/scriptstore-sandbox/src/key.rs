//! Deterministic environment keys.

use std::fmt;
use std::path::Path;

use scriptstore_core::Identity;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque name of one sandbox directory under the environments root.
///
/// Derived purely from the script's canonical path, its version and the
/// pinned runtime, so the same version always maps to the same sandbox and
/// two versions never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentKey(String);

impl EnvironmentKey {
    pub fn derive(identity: &Identity, version: &str, runtime: &str, script_dir: &Path) -> Self {
        let readable = sanitize(&format!(
            "{}-{}",
            identity.project_name, identity.script_name
        ));
        let runtime = sanitize(runtime);

        let mut hasher = Sha256::new();
        hasher.update(script_dir.to_string_lossy().as_bytes());
        hasher.update(b"@");
        hasher.update(version.as_bytes());
        hasher.update(b"-");
        hasher.update(runtime.as_bytes());
        let digest = hex::encode(hasher.finalize());

        Self(format!("{readable}-{}-{runtime}", &digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EnvironmentKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lowercase, and keep only characters that are safe in a directory name.
fn sanitize(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
