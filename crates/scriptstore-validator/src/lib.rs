//! Acceptance pipeline a script version must pass before it can be activated.
//!
//! Stages run in a fixed order and the pipeline stops at the first failure,
//! so a broken directory layout never reaches the (slow) dependency install.

pub mod error;
pub mod pipeline;
pub mod stages;

pub use error::{Result, ValidationFailure};
pub use pipeline::{ValidationReport, ValidationStage, ValidationTarget, Validator, PASSED_MESSAGE};
pub use stages::{ManifestStage, SelfTestStage, StructureStage};
