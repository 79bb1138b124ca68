//! Error types and stable error codes.

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("send failed: {0}")]
    Send(String),

    #[error("server returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("message content is empty")]
    EmptyMessage,

    #[error("no failed provisional message with id {0}")]
    UnknownProvisional(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Transport(_) => "transport",
            Self::Frame(_) => "malformed_frame",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Send(_) => "send_failed",
            Self::Http { .. } => "http_status",
            Self::EmptyMessage => "empty_message",
            Self::UnknownProvisional(_) => "unknown_provisional",
            Self::Config(_) => "config",
        }
    }

    /// Connection-level errors are recovered by reconnecting; everything else
    /// is local to one frame or one send.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            SyncError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Frame(err.to_string())
    }
}

impl From<figment::Error> for SyncError {
    fn from(err: figment::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}
