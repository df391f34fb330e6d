//! Error types for the relocalization proxy

use crate::pipeline::state::SessionState;
use crate::pipeline::types::MappingStatus;

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Failures reported by (or around) the relocalization backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backend returned a non-success code
    #[error("backend call failed: {0}")]
    Failed(String),

    /// The backend panicked while serving the call
    #[error("backend panicked: {0}")]
    Panicked(String),

    /// The backend does not implement this optional call
    #[error("backend does not support {0}")]
    Unsupported(&'static str),
}

/// Proxy error types
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No live session with this identifier
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// A frame set must carry one (mono) or two (stereo) frames
    #[error("invalid frame count: {0} (expected 1 or 2)")]
    InvalidFrameCount(usize),

    /// Stereo frame sets must carry exactly sensors 0 and 1
    #[error("invalid stereo sensor layout: {0:?}")]
    InvalidSensorLayout(Vec<u8>),

    /// Image payload could not be turned into an internal image
    #[error("image conversion failed: {0}")]
    ImageConversion(String),

    /// Lifecycle call not allowed in the current session state
    #[error("cannot {op} a session in state {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    /// External pipeline failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Malformed wire request
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Mapping status to report alongside this error, if any.
    ///
    /// Backend failures are tagged `TrackingLost` so clients can tell a
    /// degraded backend apart from a transport problem.
    pub fn mapping_status(&self) -> Option<MappingStatus> {
        match self {
            ProxyError::Backend(_) => Some(MappingStatus::TrackingLost),
            _ => None,
        }
    }

    /// Short machine-readable category used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::UnknownSession(_) => "unknown_session",
            ProxyError::InvalidFrameCount(_)
            | ProxyError::InvalidSensorLayout(_)
            | ProxyError::ImageConversion(_) => "invalid_input",
            ProxyError::InvalidState { .. } => "invalid_state",
            ProxyError::Backend(_) => "backend",
            ProxyError::Protocol(_) => "protocol",
            ProxyError::Io(_) => "io",
        }
    }
}
