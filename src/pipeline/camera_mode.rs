//! Mono/stereo detection
//!
//! The camera mode of a session is inferred from the first frame set and
//! then locked. A mono session may be promoted to stereo; a stereo session
//! never falls back to mono.

use crate::error::{ProxyError, Result};
use crate::pipeline::types::CameraMode;

/// Outcome of reconciling a frame set against the session's mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub mode: CameraMode,
    pub accept: bool,
}

impl Reconciliation {
    /// True when the frame set promoted the session from mono to stereo
    pub fn switched_from(&self, previous: CameraMode) -> bool {
        self.accept && previous == CameraMode::Mono && self.mode == CameraMode::Stereo
    }
}

/// Map a frame count to a camera mode
pub fn classify(frame_count: usize) -> Result<CameraMode> {
    match frame_count {
        1 => Ok(CameraMode::Mono),
        2 => Ok(CameraMode::Stereo),
        n => Err(ProxyError::InvalidFrameCount(n)),
    }
}

/// Decide whether a frame set fits the session's locked mode
///
/// Frame counts other than 1 or 2 are an input error, never a silent drop.
pub fn reconcile(current: CameraMode, observed_frame_count: usize) -> Result<Reconciliation> {
    let observed = classify(observed_frame_count)?;

    let reconciliation = match current {
        CameraMode::Unknown | CameraMode::Mono => Reconciliation {
            mode: observed,
            accept: true,
        },
        CameraMode::Stereo => Reconciliation {
            mode: CameraMode::Stereo,
            accept: observed == CameraMode::Stereo,
        },
    };

    Ok(reconciliation)
}
