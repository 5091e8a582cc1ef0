//! Arbitrary user shell lines on the local host.
//!
//! Kept apart from the structured command path: nothing here is quoted or
//! validated beyond refusing NUL bytes, and every run is audited.

use std::path::PathBuf;
use std::process::Stdio;

use contour_core::{ContourError, Result};
use contour_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use contour_types::{CommandConstruction, ShellDialect, TrustBoundary};
use serde::Serialize;
use tokio::process::Command;
use tracing::Level;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default)]
pub struct TrustedShell {
    working_directory: Option<PathBuf>,
}

impl TrustedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn trust_boundary() -> TrustBoundary {
        TrustBoundary {
            label: "trusted escape hatch",
            transport_authenticated: true,
            transport_encrypted: false,
            construction: CommandConstruction::TrustedEscapeHatch,
            backend_output_trusted: false,
            notes: "Runs a line typed by the user through the host shell exactly as written. \
                    Only for explicit user action; never reached from submitted commands.",
        }
    }

    pub async fn run(&self, line: &str) -> Result<ShellOutput> {
        if line.trim().is_empty() {
            return Err(ContourError::UnsafeCommand("empty shell line".to_string()));
        }
        if line.contains('\0') {
            return Err(ContourError::UnsafeCommand(
                "NUL byte in shell line".to_string(),
            ));
        }

        let redacted = redact_text(line);
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "escape_hatch.run",
                component: "escape_hatch",
                status: Some("trusted"),
                detail: Some(&redacted),
                ..ObservabilityEvent::default()
            },
        );

        let mut command = match ShellDialect::for_host() {
            ShellDialect::Windows => {
                let mut cmd = Command::new("powershell");
                cmd.args(["-NoProfile", "-Command", line]);
                cmd
            }
            ShellDialect::Posix => {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", line]);
                cmd
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_directory {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|err| ContourError::BackendUnavailable(format!("host shell: {}", err)))?;
        Ok(ShellOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_line_is_refused() {
        let err = TrustedShell::new().run("   ").await.expect_err("empty");
        assert!(matches!(err, ContourError::UnsafeCommand(_)));
    }

    #[test]
    fn reports_its_own_trust_boundary() {
        let boundary = TrustedShell::trust_boundary();
        assert_eq!(boundary.construction, CommandConstruction::TrustedEscapeHatch);
        assert_eq!(boundary.label, "trusted escape hatch");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_line_through_host_shell() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = TrustedShell::new()
            .current_dir(dir.path())
            .run("echo one | tr a-z A-Z; exit 3")
            .await
            .expect("run");
        assert_eq!(output.stdout.trim(), "ONE");
        assert_eq!(output.exit_code, Some(3));
    }
}
