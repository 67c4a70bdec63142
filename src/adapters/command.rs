//! Subprocess-backed capability adapter.
//!
//! Each provider is an external command that reads the payload on stdin
//! and writes its result to stdout. Exit codes map to error tags so the
//! policy engine can pick a strategy without parsing provider output.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::domain::{ErrorKind, OperationKind, PipelineError};

use super::{AdapterOutput, CapabilityAdapter};

/// Exit codes providers use to tag their failures
///
/// Anything else is reported as `Unknown`.
const EXIT_RATE_LIMIT: i32 = 75;
const EXIT_VALIDATION: i32 = 65;
const EXIT_ASSET: i32 = 66;
const EXIT_UNAVAILABLE: i32 = 69;

/// Capability adapter that shells out to a provider command
pub struct CommandAdapter {
    /// Component name (matches config rankings)
    name: String,

    /// Program to execute
    program: String,

    /// Fixed arguments; the operation kind is appended as the last one
    args: Vec<String>,
}

impl CommandAdapter {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    fn map_exit_code(&self, code: Option<i32>, stderr: &str) -> PipelineError {
        let kind = match code {
            Some(EXIT_RATE_LIMIT) => ErrorKind::RateLimit,
            Some(EXIT_VALIDATION) => ErrorKind::Validation,
            Some(EXIT_ASSET) => ErrorKind::Asset,
            Some(EXIT_UNAVAILABLE) => ErrorKind::Unavailable,
            _ => ErrorKind::Unknown,
        };

        PipelineError::adapter(
            &self.name,
            kind,
            format!(
                "exit code {}: {}",
                code.unwrap_or(-1),
                stderr.trim()
            ),
        )
    }
}

#[async_trait]
impl CapabilityAdapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        kind: OperationKind,
        payload: &str,
    ) -> Result<AdapterOutput, PipelineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(kind.capability())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The orchestrator enforces the call timeout by dropping this
            // future; the child must not outlive it.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::adapter(
                    &self.name,
                    ErrorKind::Unavailable,
                    format!("failed to spawn '{}': {}", self.program, e),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await.map_err(|e| {
                PipelineError::adapter(&self.name, ErrorKind::Unknown, format!("stdin: {e}"))
            })?;
            // Drop stdin to signal EOF
        }

        let output = child.wait_with_output().await.map_err(|e| {
            PipelineError::adapter(&self.name, ErrorKind::Unknown, format!("wait: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.map_exit_code(output.status.code(), &stderr));
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| {
            PipelineError::adapter(&self.name, ErrorKind::Validation, "output is not valid UTF-8")
        })?;

        Ok(AdapterOutput::new(stdout))
    }
}
