//! Running the platform's network configuration tools.
//!
//! Address, MTU, DNS and route changes are made by shelling out to `ip`
//! (Linux) or `netsh` / `route` (Windows). Each invocation is a program plus an
//! argument vector, so interface names containing spaces need no quoting.

use crate::{TunError, TunResult};
use tokio::process::Command;

/// One external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetCommand {
    /// Program to execute
    pub program: &'static str,
    /// Arguments
    pub args: Vec<String>,
}

impl NetCommand {
    /// Build an invocation from string-like arguments.
    pub fn new<I, S>(program: &'static str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Run the command and fail on a non-zero exit status.
    ///
    /// "Already exists" failures are treated as success so that setup is
    /// idempotent across restarts.
    ///
    /// # Errors
    ///
    /// Returns [`TunError::Configure`] with the tool's stderr.
    pub async fn run(&self) -> TunResult<()> {
        tracing::debug!(command = %self, "running network command");

        let output = Command::new(self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| TunError::Configure(format!("failed to execute {}: {e}", self.program)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if is_already_exists_error(&stderr) || is_already_exists_error(&stdout) {
            tracing::debug!(command = %self, "already configured");
            return Ok(());
        }

        Err(TunError::Configure(format!(
            "`{self}` exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }

    /// Run the command, logging instead of returning a failure.
    pub async fn run_best_effort(&self) {
        if let Err(e) = self.run().await {
            tracing::warn!(command = %self, error = %e, "network command failed");
        }
    }

    /// Blocking variant for use from `Drop`.
    pub fn run_blocking_best_effort(&self) {
        match std::process::Command::new(self.program)
            .args(&self.args)
            .output()
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::warn!(
                command = %self,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "network command failed"
            ),
            Err(e) => {
                tracing::warn!(command = %self, error = %e, "failed to execute network command");
            }
        }
    }
}

impl std::fmt::Display for NetCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Handles the formats of "already exists" produced by the supported tools:
/// - iproute2: "RTNETLINK answers: File exists"
/// - netsh: "The object already exists" or "Element already exists"
pub fn is_already_exists_error(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("file exists")
        || lower.contains("eexist")
        || lower.contains("object already exists")
        || lower.contains("element already exists")
}
