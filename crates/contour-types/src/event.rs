use serde::Serialize;

use crate::command::BackendKind;
use crate::frame::Frame;

/// Lifecycle of one backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Ready,
    Busy,
    Stopping,
    Terminated,
    Crashed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Stopping => "stopping",
            SessionState::Terminated => "terminated",
            SessionState::Crashed => "crashed",
        }
    }

    /// States in which the transport is (or may be) open.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Ready | SessionState::Busy | SessionState::Stopping
        )
    }
}

/// Events published to the IDE.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    Lifecycle {
        session_id: String,
        backend: BackendKind,
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// A frame that did not complete a request: streaming output or an
    /// unsolicited notification.
    Output {
        session_id: String,
        frame: Frame,
    },
    /// A line the backend wrote outside the protocol, e.g. on stderr.
    Stderr {
        session_id: String,
        line: String,
    },
    /// A request outlived its deadline; the IDE may offer a forced restart.
    Unresponsive {
        session_id: String,
        request_id: u64,
    },
    RestartScheduled {
        backend: BackendKind,
        attempt: u32,
    },
    RestartSuppressed {
        backend: BackendKind,
        failures: u32,
    },
}

impl BackendEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            BackendEvent::Lifecycle { session_id, .. }
            | BackendEvent::Output { session_id, .. }
            | BackendEvent::Stderr { session_id, .. }
            | BackendEvent::Unresponsive { session_id, .. } => Some(session_id),
            BackendEvent::RestartScheduled { .. } | BackendEvent::RestartSuppressed { .. } => None,
        }
    }

    pub fn lifecycle_state(&self) -> Option<SessionState> {
        match self {
            BackendEvent::Lifecycle { state, .. } => Some(*state),
            _ => None,
        }
    }
}

/// Completed reply to one submitted command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub request_id: u64,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The terminating frame exactly as the backend sent it.
    pub frame: Frame,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}
