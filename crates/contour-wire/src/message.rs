//! Typed protocol messages carried inside frames.
//!
//! Every request carries an `id`. A backend answers `hello` with `ready` and
//! each `exec` with exactly one terminator (`result` or `error`) bearing the
//! same id. Any number of `output` frames may precede the terminator; frames
//! whose id matches nothing in flight are unsolicited.

use std::collections::BTreeMap;

use contour_types::{ExecutableForm, Frame, FrameValue, ShellDialect};
use thiserror::Error;

pub const PROTOCOL_VERSION: i64 = 1;

/// Correlation id reserved for the startup handshake.
pub const HANDSHAKE_ID: u64 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Hello { id: u64 },
    Exec { id: u64, form: ExecutableForm },
}

impl Request {
    pub fn id(&self) -> u64 {
        match self {
            Request::Hello { id } | Request::Exec { id, .. } => *id,
        }
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            Request::Hello { id } => Frame::new()
                .with("kind", "hello")
                .with("id", *id)
                .with("protocol", PROTOCOL_VERSION),
            Request::Exec {
                id,
                form:
                    ExecutableForm::Argv {
                        argv,
                        working_directory,
                        environment,
                    },
            } => {
                let env = environment
                    .iter()
                    .map(|(k, v)| (k.clone(), FrameValue::from(v.as_str())))
                    .collect::<Vec<_>>();
                Frame::new()
                    .with("kind", "exec")
                    .with("id", *id)
                    .with("argv", argv.clone())
                    .with("cwd", working_directory.clone())
                    .with("env", FrameValue::Map(env))
            }
            Request::Exec {
                id,
                form: ExecutableForm::ShellLine { line, dialect },
            } => Frame::new()
                .with("kind", "exec")
                .with("id", *id)
                .with("shell", line.as_str())
                .with("dialect", dialect.as_str()),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, MessageError> {
        let id = required_id(frame)?;
        match frame.kind() {
            Some("hello") => Ok(Request::Hello { id }),
            Some("exec") => {
                if let Some(line) = frame.get_str("shell") {
                    let dialect = match frame.get_str("dialect") {
                        None | Some("posix") => ShellDialect::Posix,
                        Some("windows") => ShellDialect::Windows,
                        Some(_) => {
                            return Err(MessageError::InvalidField {
                                field: "dialect",
                                expected: "`posix` or `windows`",
                            })
                        }
                    };
                    return Ok(Request::Exec {
                        id,
                        form: ExecutableForm::ShellLine {
                            line: line.to_string(),
                            dialect,
                        },
                    });
                }
                let argv = string_list(frame.get("argv"), "argv")?;
                if argv.is_empty() {
                    return Err(MessageError::InvalidField {
                        field: "argv",
                        expected: "a non-empty list of strings",
                    });
                }
                let working_directory = match frame.get("cwd") {
                    None | Some(FrameValue::Null) => None,
                    Some(FrameValue::Str(dir)) => Some(dir.clone()),
                    Some(_) => {
                        return Err(MessageError::InvalidField {
                            field: "cwd",
                            expected: "a string or None",
                        })
                    }
                };
                let environment = string_map(frame.get("env"))?;
                Ok(Request::Exec {
                    id,
                    form: ExecutableForm::Argv {
                        argv,
                        working_directory,
                        environment,
                    },
                })
            }
            Some(other) => Err(MessageError::UnknownKind(other.to_string())),
            None => Err(MessageError::MissingField("kind")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub id: u64,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ready { id: u64, protocol: Option<i64> },
    Output {
        id: Option<u64>,
        stream: OutputStream,
        data: String,
    },
    Result(ExecResult),
    Error { id: u64, message: String },
}

impl Reply {
    /// Interprets a backend frame. Frames that are not recognizable replies
    /// yield `None` and are treated as unsolicited output.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame.kind()? {
            "ready" => Some(Reply::Ready {
                id: frame.id()?,
                protocol: frame.get_i64("protocol"),
            }),
            "output" => Some(Reply::Output {
                id: frame.id(),
                stream: match frame.get_str("stream") {
                    Some("stderr") => OutputStream::Stderr,
                    _ => OutputStream::Stdout,
                },
                data: frame.get_str("data").unwrap_or_default().to_string(),
            }),
            "result" => Some(Reply::Result(ExecResult {
                id: frame.id()?,
                exit_code: frame
                    .get_i64("exit_code")
                    .and_then(|code| i32::try_from(code).ok()),
                stdout: frame.get_str("stdout").unwrap_or_default().to_string(),
                stderr: frame.get_str("stderr").unwrap_or_default().to_string(),
            })),
            "error" => Some(Reply::Error {
                id: frame.id()?,
                message: frame
                    .get_str("message")
                    .unwrap_or("backend reported an error")
                    .to_string(),
            }),
            _ => None,
        }
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            Reply::Ready { id, protocol } => Frame::new()
                .with("kind", "ready")
                .with("id", *id)
                .with("protocol", *protocol),
            Reply::Output { id, stream, data } => Frame::new()
                .with("kind", "output")
                .with("id", *id)
                .with("stream", stream.as_str())
                .with("data", data.as_str()),
            Reply::Result(result) => Frame::new()
                .with("kind", "result")
                .with("id", result.id)
                .with("exit_code", result.exit_code)
                .with("stdout", result.stdout.as_str())
                .with("stderr", result.stderr.as_str()),
            Reply::Error { id, message } => Frame::new()
                .with("kind", "error")
                .with("id", *id)
                .with("message", message.as_str()),
        }
    }

    /// Id of the request this reply completes, if it is a terminator.
    pub fn terminates(&self) -> Option<u64> {
        match self {
            Reply::Ready { id, .. } | Reply::Error { id, .. } => Some(*id),
            Reply::Result(result) => Some(result.id),
            Reply::Output { .. } => None,
        }
    }
}

fn required_id(frame: &Frame) -> Result<u64, MessageError> {
    match frame.get("id") {
        None => Err(MessageError::MissingField("id")),
        Some(value) => value.as_u64().ok_or(MessageError::InvalidField {
            field: "id",
            expected: "a non-negative integer",
        }),
    }
}

fn string_list(value: Option<&FrameValue>, field: &'static str) -> Result<Vec<String>, MessageError> {
    let items = value
        .ok_or(MessageError::MissingField(field))?
        .as_list()
        .ok_or(MessageError::InvalidField {
            field,
            expected: "a list of strings",
        })?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or(MessageError::InvalidField {
                field,
                expected: "a list of strings",
            })
        })
        .collect()
}

fn string_map(value: Option<&FrameValue>) -> Result<BTreeMap<String, String>, MessageError> {
    let entries = match value {
        None | Some(FrameValue::Null) => return Ok(BTreeMap::new()),
        Some(value) => value.as_map().ok_or(MessageError::InvalidField {
            field: "env",
            expected: "a mapping of strings",
        })?,
    };
    entries
        .iter()
        .map(|(key, value)| {
            value
                .as_str()
                .map(|v| (key.clone(), v.to_string()))
                .ok_or(MessageError::InvalidField {
                    field: "env",
                    expected: "a mapping of strings",
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_request_survives_frame_conversion() {
        let request = Request::Exec {
            id: 9,
            form: ExecutableForm::Argv {
                argv: vec!["echo".into(), "hello".into()],
                working_directory: Some("/tmp".into()),
                environment: BTreeMap::from([("LANG".to_string(), "C".to_string())]),
            },
        };
        let frame = request.to_frame();
        assert_eq!(frame.kind(), Some("exec"));
        assert_eq!(Request::from_frame(&frame), Ok(request));
    }

    #[test]
    fn shell_exec_carries_dialect() {
        let request = Request::Exec {
            id: 2,
            form: ExecutableForm::ShellLine {
                line: "ls /".into(),
                dialect: ShellDialect::Windows,
            },
        };
        let frame = request.to_frame();
        assert_eq!(frame.get_str("dialect"), Some("windows"));
        assert_eq!(Request::from_frame(&frame), Ok(request));
    }

    #[test]
    fn request_without_id_is_rejected() {
        let frame = Frame::new().with("kind", "hello");
        assert_eq!(
            Request::from_frame(&frame),
            Err(MessageError::MissingField("id"))
        );
    }

    #[test]
    fn output_frames_never_terminate_a_request() {
        let frame = Frame::new()
            .with("kind", "output")
            .with("id", 4_i64)
            .with("stream", "stderr")
            .with("data", "warn");
        let reply = Reply::from_frame(&frame).expect("reply");
        assert_eq!(reply.terminates(), None);
        assert!(matches!(
            reply,
            Reply::Output {
                id: Some(4),
                stream: OutputStream::Stderr,
                ..
            }
        ));
    }

    #[test]
    fn result_reply_roundtrips() {
        let reply = Reply::Result(ExecResult {
            id: 5,
            exit_code: None,
            stdout: "hello\n".into(),
            stderr: String::new(),
        });
        let parsed = Reply::from_frame(&reply.to_frame()).expect("reply");
        assert_eq!(parsed, reply);
        assert_eq!(parsed.terminates(), Some(5));
    }

    #[test]
    fn unknown_kinds_are_not_replies() {
        let frame = Frame::new().with("kind", "telemetry").with("id", 1_i64);
        assert!(Reply::from_frame(&frame).is_none());
    }
}
