use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed frame at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: String },

    #[error("unsafe frame at byte {offset}: {reason}")]
    Unsafe { offset: usize, reason: String },

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("frame nests deeper than {limit} levels")]
    TooDeep { limit: usize },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        WireError::Malformed {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsafe_at(offset: usize, reason: impl Into<String>) -> Self {
        WireError::Unsafe {
            offset,
            reason: reason.into(),
        }
    }

    /// Protocol violations end a session; I/O errors are reported as transport closure.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, WireError::Io(_))
    }
}
