//! Process Executor
//!
//! Runs the SMcli binary (or any other program) as a child process and
//! captures its exit code and output streams. Every run is bounded by a
//! timeout and can be interrupted through a cancellation token; in both
//! cases the child is killed.

use crate::domain::ports::{CommandExecutor, CommandOutput};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Default upper bound for a single command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Process Executor
// =============================================================================

/// [`CommandExecutor`] backed by `tokio::process`
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    timeout: Duration,
    cancel: CancellationToken,
}

impl ProcessExecutor {
    /// Create an executor with the given per-command timeout
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT, CancellationToken::new())
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput> {
        let program_name = program.display().to_string();
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::ProcessLaunch {
                program: program_name.clone(),
                source,
            })?;

        // Dropping the pending future kills the child
        let output = tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!(program = %program_name, "Command cancelled, killing process");
                return Err(Error::Cancelled);
            }
            _ = tokio::time::sleep(self.timeout) => {
                error!(program = %program_name, "Command timed out after {:?}", self.timeout);
                return Err(Error::CommandTimeout {
                    program: program_name.clone(),
                    timeout: self.timeout,
                });
            }
            output = child.wait_with_output() => output?,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(program = %program_name, exit_code, "Command finished");

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
