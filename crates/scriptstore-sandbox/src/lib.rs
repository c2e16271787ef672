//! Per-version dependency sandboxes.
//!
//! Every script version gets its own directory under the environments root,
//! named by a deterministic [`EnvironmentKey`]. The [`EnvironmentManager`]
//! provisions a sandbox once, reuses it for every later validation or run,
//! and tears it down when the version is superseded. What "provision",
//! "install" and "run" mean is entirely defined by the configured toolchain
//! argv templates.

pub mod error;
pub mod key;
pub mod manager;
pub mod output;
pub mod toolchain;

pub use error::{Result, SandboxError};
pub use key::EnvironmentKey;
pub use manager::{EnvironmentManager, SandboxSpec};
pub use output::{truncate_output, RunOutput};
