//! Minimal backend that speaks the protocol on a pair of byte streams.
//!
//! Requests are handled one at a time: `hello` is answered with `ready`, each
//! `exec` runs to completion and yields one `result`, or one `error` when the
//! program cannot be started.

use std::process::Stdio;

use contour_core::{ContourError, Result};
use contour_types::{ExecutableForm, ShellDialect};
use contour_wire::{ExecResult, Framing, Reply, Request, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

use crate::transport::Channel;

pub async fn serve<R, W>(reader: R, writer: W, framing: Framing, max_frame_bytes: usize) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut channel = Channel::new(reader, writer, framing, max_frame_bytes);
    while let Some(frame) = channel.receive().await {
        let frame = frame?;
        let request = match Request::from_frame(&frame) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!("Ignoring request: {}", err);
                if let Some(id) = frame.id() {
                    let reply = Reply::Error {
                        id,
                        message: err.to_string(),
                    };
                    channel.send(&reply.to_frame()).await?;
                }
                continue;
            }
        };
        let reply = match request {
            Request::Hello { id } => Reply::Ready {
                id,
                protocol: Some(PROTOCOL_VERSION),
            },
            Request::Exec { id, form } => run(id, form).await,
        };
        channel.send(&reply.to_frame()).await?;
    }
    tracing::debug!("Input closed; agent exiting");
    Ok(())
}

async fn run(id: u64, form: ExecutableForm) -> Reply {
    let mut command = match command_for(form) {
        Ok(command) => command,
        Err(err) => {
            return Reply::Error {
                id,
                message: err.to_string(),
            }
        }
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match command.output().await {
        Ok(output) => Reply::Result(ExecResult {
            id,
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }),
        Err(err) => {
            tracing::debug!("Request {} failed to start: {}", id, err);
            Reply::Error {
                id,
                message: format!("failed to start: {}", err),
            }
        }
    }
}

fn command_for(form: ExecutableForm) -> Result<Command> {
    match form {
        ExecutableForm::Argv {
            argv,
            working_directory,
            environment,
        } => {
            let (program, args) = argv
                .split_first()
                .ok_or_else(|| ContourError::UnsafeCommand("empty argv".to_string()))?;
            let mut command = Command::new(program);
            command.args(args).envs(&environment);
            if let Some(dir) = working_directory {
                command.current_dir(dir);
            }
            Ok(command)
        }
        ExecutableForm::ShellLine { line, dialect } => {
            let mut command = match dialect {
                ShellDialect::Posix => {
                    let mut cmd = Command::new("sh");
                    cmd.arg("-c");
                    cmd
                }
                ShellDialect::Windows => {
                    let mut cmd = Command::new("cmd");
                    cmd.arg("/C");
                    cmd
                }
            };
            command.arg(line);
            Ok(command)
        }
    }
}
