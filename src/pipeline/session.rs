//! Per-client session state

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::pipeline::frame_buffer::{FrameBuffer, ReorderConfig};
use crate::pipeline::health::SessionHealth;
use crate::pipeline::rate::RateMeter;
use crate::pipeline::state::SessionState;
use crate::pipeline::types::{CameraMode, PipelineMode};

/// Mutable part of a session, guarded by the session's own mutex
pub struct SessionInner {
    pub state: SessionState,
    pub camera_mode: CameraMode,
    pub pipeline_mode: Option<PipelineMode>,
    pub frames: FrameBuffer,
    pub rate: RateMeter,
}

/// Isolated state of one connected client
///
/// The inner mutex is the single serialization point of the frame path and
/// is never held across a backend call. Lifecycle calls (init/start/stop)
/// are additionally serialized by an async lock so that concurrent calls
/// reach the backend at most once.
pub struct ClientSession {
    id: String,
    registered_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    lifecycle: tokio::sync::Mutex<()>,
    health: SessionHealth,
    run: AtomicU64,
}

impl ClientSession {
    pub fn new(id: String, reorder: ReorderConfig) -> Self {
        Self {
            id,
            registered_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                camera_mode: CameraMode::Unknown,
                pipeline_mode: None,
                frames: FrameBuffer::new(reorder),
                rate: RateMeter::default(),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            health: SessionHealth::new(),
            run: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn health(&self) -> &SessionHealth {
        &self.health
    }

    /// Lock the mutable session state
    ///
    /// A panic while the lock was held leaves plain data behind, so a
    /// poisoned lock is recovered rather than propagated.
    pub fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize a lifecycle call on this session
    pub async fn lifecycle(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// Number of the current started period, 0 before the first start
    pub fn run(&self) -> u64 {
        self.run.load(Ordering::Acquire)
    }

    pub fn begin_run(&self) -> u64 {
        self.run.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn camera_mode(&self) -> CameraMode {
        self.lock().camera_mode
    }

    /// Reset the frame path for a fresh start
    pub fn reset_frames(&self) {
        let mut inner = self.lock();
        inner.camera_mode = CameraMode::Unknown;
        inner.frames.reset();
        inner.rate.reset();
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("registered_at", &self.registered_at)
            .field("state", &inner.state)
            .field("camera_mode", &inner.camera_mode)
            .field("buffered", &inner.frames.len())
            .finish()
    }
}
