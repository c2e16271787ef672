//! Captured process output.

use serde::{Deserialize, Serialize};

/// Result of one toolchain or script process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutput {
    /// `None` when the process was killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    /// Full captured standard output.
    pub stdout: String,
    /// Full captured standard error.
    pub stderr: String,
    /// The time budget expired and the child was killed.
    pub timed_out: bool,
}

impl RunOutput {
    /// Success is a zero exit code, nothing else.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Cap `output` at `max_chars` characters using middle-omission.
///
/// History rows keep both the start of a run (what it was doing) and the
/// end (how it finished):
///
/// ```text
/// <first max_chars/2 chars>
///
/// ... [OUTPUT TRUNCATED: N chars omitted] ...
///
/// <last max_chars/2 chars>
/// ```
///
/// Splits on character boundaries, never inside a multi-byte sequence.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let half = max_chars / 2;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();
    let omitted = total - 2 * half;

    format!("{head}\n\n... [OUTPUT TRUNCATED: {omitted} chars omitted] ...\n\n{tail}")
}
