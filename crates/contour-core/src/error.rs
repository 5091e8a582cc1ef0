// Contour error types
use contour_wire::WireError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContourError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unsafe frame: {0}")]
    UnsafeFrame(String),

    #[error("Frame too large: {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend terminated: {0}")]
    BackendTerminated(String),

    #[error("Session busy: request {0} is still in flight")]
    SessionBusy(u64),

    #[error("Unsafe command: {0}")]
    UnsafeCommand(String),

    #[error("Unsafe path: {0}")]
    UnsafePath(String),

    #[error("Unsafe source: {0}")]
    UnsafeSource(String),

    #[error("Request {0} cancelled")]
    Cancelled(u64),

    #[error("Request {0} timed out")]
    Timeout(u64),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where an error originates, which decides how it is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Decode violations. Always fatal to the session.
    Protocol,
    /// Start/stop/submit ordering. Recoverable by retry, queueing or restart.
    Lifecycle,
    /// Rejected before any transport write.
    Construction,
    /// The caller gave up; backend work may continue.
    Caller,
    /// Host-side failures outside the protocol.
    Environment,
}

impl ContourError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ContourError::MalformedFrame(_)
            | ContourError::UnsafeFrame(_)
            | ContourError::FrameTooLarge { .. } => ErrorCategory::Protocol,
            ContourError::BackendUnavailable(_)
            | ContourError::BackendTerminated(_)
            | ContourError::SessionBusy(_) => ErrorCategory::Lifecycle,
            ContourError::UnsafeCommand(_)
            | ContourError::UnsafePath(_)
            | ContourError::UnsafeSource(_) => ErrorCategory::Construction,
            ContourError::Cancelled(_) | ContourError::Timeout(_) => ErrorCategory::Caller,
            ContourError::Download(_)
            | ContourError::InvalidConfig(_)
            | ContourError::Io(_)
            | ContourError::Serialization(_) => ErrorCategory::Environment,
        }
    }

    /// Stable machine-readable code, used in events and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            ContourError::MalformedFrame(_) => "malformed_frame",
            ContourError::UnsafeFrame(_) => "unsafe_frame",
            ContourError::FrameTooLarge { .. } => "frame_too_large",
            ContourError::BackendUnavailable(_) => "backend_unavailable",
            ContourError::BackendTerminated(_) => "backend_terminated",
            ContourError::SessionBusy(_) => "session_busy",
            ContourError::UnsafeCommand(_) => "unsafe_command",
            ContourError::UnsafePath(_) => "unsafe_path",
            ContourError::UnsafeSource(_) => "unsafe_source",
            ContourError::Cancelled(_) => "cancelled",
            ContourError::Timeout(_) => "timeout",
            ContourError::Download(_) => "download_failed",
            ContourError::InvalidConfig(_) => "invalid_config",
            ContourError::Io(_) => "io",
            ContourError::Serialization(_) => "serialization",
        }
    }

    pub fn is_fatal_to_session(&self) -> bool {
        self.category() == ErrorCategory::Protocol
    }

    /// Short message for the IDE, without internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            ContourError::MalformedFrame(_)
            | ContourError::UnsafeFrame(_)
            | ContourError::FrameTooLarge { .. } => {
                "The backend sent data that could not be trusted and was stopped."
            }
            ContourError::BackendUnavailable(_) => "The backend could not be started.",
            ContourError::BackendTerminated(_) => "The backend stopped before replying.",
            ContourError::SessionBusy(_) => "The backend is still running a previous command.",
            ContourError::UnsafeCommand(_) => "The command cannot be passed safely to this backend.",
            ContourError::UnsafePath(_) => "The path contains characters this backend does not allow.",
            ContourError::UnsafeSource(_) => "Only encrypted (https) sources can be downloaded.",
            ContourError::Cancelled(_) => "The command was cancelled.",
            ContourError::Timeout(_) => "The backend did not reply in time.",
            ContourError::Download(_) => "The download failed.",
            ContourError::InvalidConfig(_) => "The configuration is invalid.",
            ContourError::Io(_) | ContourError::Serialization(_) => "An internal error occurred.",
        }
    }
}

impl From<WireError> for ContourError {
    fn from(err: WireError) -> Self {
        let message = err.to_string();
        match err {
            WireError::Malformed { .. } | WireError::TooDeep { .. } => {
                ContourError::MalformedFrame(message)
            }
            WireError::Unsafe { .. } => ContourError::UnsafeFrame(message),
            WireError::TooLarge { size, limit } => ContourError::FrameTooLarge { size, limit },
            WireError::Io(io) => ContourError::Io(io),
        }
    }
}

impl Serialize for ContourError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ContourError", 3)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("category", &self.category())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

pub type Result<T> = std::result::Result<T, ContourError>;
