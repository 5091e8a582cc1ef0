use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use contour_core::{ContourError, ProtocolConfig, Result};
use tokio::process::{Child, Command};

use super::BackendLink;
use crate::transport::Channel;

/// Child process behind a local or remote-shell link.
pub struct BackendProcess {
    label: String,
    child: Child,
}

impl BackendProcess {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits up to `grace` for the process to exit on its own, then kills it.
    pub async fn shutdown(&mut self, grace: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => return Some(status),
            Ok(Err(err)) => {
                tracing::warn!("Failed to wait for backend {}: {}", self.label, err);
            }
            Err(_) => {
                tracing::info!(
                    "Backend {} did not exit within {:?}; killing",
                    self.label,
                    grace
                );
            }
        }
        self.kill().await;
        self.child.wait().await.ok()
    }

    pub async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            tracing::debug!("Kill of backend {} failed: {}", self.label, err);
        }
    }
}

/// Spawns `program` with piped stdio. Protocol frames travel over
/// stdin/stdout; stderr is handed back for draining.
pub(crate) fn spawn_piped(
    program: &str,
    args: &[String],
    working_directory: Option<&str>,
    environment: &BTreeMap<String, String>,
    protocol: &ProtocolConfig,
) -> Result<BackendLink> {
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(environment)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_directory {
        command.current_dir(dir);
    }

    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = command.spawn().map_err(|err| spawn_error(program, err))?;
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe(program, "stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe(program, "stdout"))?;
    let stderr = child.stderr.take();

    tracing::debug!("Spawned backend {} (pid {:?})", program, child.id());

    Ok(BackendLink {
        channel: Channel::new(stdout, stdin, protocol.framing, protocol.max_frame_bytes),
        process: Some(BackendProcess {
            label: program.to_string(),
            child,
        }),
        stderr,
    })
}

fn spawn_error(program: &str, err: std::io::Error) -> ContourError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            ContourError::BackendUnavailable(format!("`{}` was not found", program))
        }
        std::io::ErrorKind::PermissionDenied => {
            ContourError::BackendUnavailable(format!("`{}` is not executable", program))
        }
        _ => ContourError::BackendUnavailable(format!("failed to spawn `{}`: {}", program, err)),
    }
}

fn missing_pipe(program: &str, stream: &str) -> ContourError {
    ContourError::BackendUnavailable(format!("{} of `{}` was not captured", stream, program))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_backend_unavailable() {
        let result = spawn_piped(
            "contour-definitely-not-installed",
            &[],
            None,
            &BTreeMap::new(),
            &ProtocolConfig::default(),
        );
        let err = result.err().expect("spawn should fail");
        assert_eq!(err.code(), "backend_unavailable");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_kills_after_grace() {
        let mut link = spawn_piped(
            "sleep",
            &["30".to_string()],
            None,
            &BTreeMap::new(),
            &ProtocolConfig::default(),
        )
        .expect("spawn sleep");
        let mut process = link.process.take().expect("process");
        let status = process.shutdown(Duration::from_millis(50)).await;
        assert!(status.map(|s| !s.success()).unwrap_or(true));
    }
}
