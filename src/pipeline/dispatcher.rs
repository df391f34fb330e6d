//! Relocalization dispatcher
//!
//! Façade between the wire service and the backend. For each accepted frame
//! set it feeds the session's reorder window, releases the oldest entry once
//! the window is full and forwards it to the shared backend. Display and
//! persistence are fed best-effort after a successful dispatch.
//!
//! Frame path of one request:
//! 1. session gate (started, camera mode, staleness) under the session lock
//! 2. image decoding and stereo correction on the blocking pool, no lock
//! 3. second gate, insert and extract under the session lock
//! 4. backend call without any lock, panics caught
//! 5. non-blocking hand-off to the sinks, only if the session is still in
//!    the run the entry was released in

use futures_util::FutureExt;
use log::{debug, error, info, warn};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::assets::{SINK_CLOSE_TIMEOUT, STOP_FLUSH_TIMEOUT};
use crate::codec::rotate_180;
use crate::error::{BackendError, ProxyError, Result};
use crate::pipeline::backend::{BackendResult, RelocalizationPipeline, RelocalizationRequest};
use crate::pipeline::camera_mode;
use crate::pipeline::frame_buffer::ReorderConfig;
use crate::pipeline::registry::ClientSessionRegistry;
use crate::pipeline::session::{ClientSession, SessionInner};
use crate::pipeline::state::SessionState;
use crate::pipeline::types::{
    CameraMode, CameraParameters, FrameOutcome, FrameSet, OrderedQueueEntry, PipelineMode,
    PipelineResult, RectificationParameters, RelocalizationResponse, Timestamp,
};
use crate::workers::display::DisplayItem;
use crate::workers::save_stream::{SaveCommand, SaveItem};
use crate::workers::sink::AsyncSink;

/// Run a backend call, turning a panic into `BackendError::Panicked`
async fn guarded<T>(call: impl Future<Output = BackendResult<T>>) -> BackendResult<T> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(BackendError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Stereo frame sets must carry sensors 0 and 1, once each
fn check_sensor_layout(frame_set: &FrameSet) -> Result<()> {
    if frame_set.len() != 2 {
        return Ok(());
    }
    let mut ids: Vec<u8> = frame_set.frames.iter().map(|f| f.sensor_id).collect();
    ids.sort_unstable();
    if ids != [0, 1] {
        return Err(ProxyError::InvalidSensorLayout(ids));
    }
    Ok(())
}

/// Decode a frame set into a window entry, ordered by sensor id
///
/// In stereo the image of sensor 1 is rotated by 180° to undo the way the
/// second camera is mounted.
fn decode_frame_set(frame_set: FrameSet) -> Result<OrderedQueueEntry> {
    let FrameSet {
        mut frames,
        timestamp,
        ground_truth,
    } = frame_set;
    frames.sort_by_key(|f| f.sensor_id);
    let stereo = frames.len() == 2;

    let mut images = Vec::with_capacity(frames.len());
    let mut poses = Vec::with_capacity(frames.len());
    for frame in &frames {
        let decoded = frame.image.decode()?;
        let image = if stereo && frame.sensor_id == 1 {
            rotate_180(&decoded)
        } else {
            decoded
        };
        images.push(Arc::new(image));
        poses.push(frame.pose);
    }

    Ok(OrderedQueueEntry {
        images,
        poses,
        timestamp,
        ground_truth,
    })
}

pub struct RelocalizationDispatcher {
    pipeline: Arc<dyn RelocalizationPipeline>,
    registry: ClientSessionRegistry,
    display: Option<AsyncSink<DisplayItem>>,
    persistence: Option<AsyncSink<SaveCommand>>,
    stop_flush_timeout: Duration,
}

impl RelocalizationDispatcher {
    pub fn new(pipeline: Arc<dyn RelocalizationPipeline>, reorder: ReorderConfig) -> Self {
        Self {
            pipeline,
            registry: ClientSessionRegistry::new(reorder),
            display: None,
            persistence: None,
            stop_flush_timeout: STOP_FLUSH_TIMEOUT,
        }
    }

    pub fn with_display(mut self, sink: AsyncSink<DisplayItem>) -> Self {
        self.display = Some(sink);
        self
    }

    pub fn with_persistence(mut self, sink: AsyncSink<SaveCommand>) -> Self {
        self.persistence = Some(sink);
        self
    }

    pub fn with_stop_flush_timeout(mut self, timeout: Duration) -> Self {
        self.stop_flush_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ClientSessionRegistry {
        &self.registry
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub async fn register_client(&self) -> Result<String> {
        let session = self.registry.register();
        let id = session.id().to_string();

        if let Err(e) = guarded(self.pipeline.register_client(&id)).await {
            self.registry.unregister(&id);
            error!("Dispatcher: backend refused client {}: {}", id, e);
            return Err(e.into());
        }

        info!("Dispatcher: client {} registered", id);
        Ok(id)
    }

    /// Remove a session, stopping it first if needed
    pub async fn unregister_client(&self, session_id: &str) -> Result<()> {
        let session = self
            .registry
            .unregister(session_id)
            .ok_or_else(|| ProxyError::UnknownSession(session_id.to_string()))?;

        let _lifecycle = session.lifecycle().await;
        let was_started = {
            let mut inner = session.lock();
            let was_started = inner.state.is_started();
            inner.state = SessionState::Unregistered;
            inner.frames.clear();
            was_started
        };

        if was_started {
            if let Err(e) = guarded(self.pipeline.stop(session_id)).await {
                warn!("Dispatcher: stop of {} on unregister failed: {}", session_id, e);
            }
            self.close_persistence(&session).await;
        }
        if let Err(e) = guarded(self.pipeline.unregister_client(session_id)).await {
            warn!("Dispatcher: backend unregister of {} failed: {}", session_id, e);
        }

        let connected = chrono::Utc::now() - session.registered_at();
        info!(
            "Dispatcher: client {} unregistered after {}s ({} live). {}",
            session_id,
            connected.num_seconds(),
            self.registry.len(),
            session.health().summary()
        );
        Ok(())
    }

    /// Unregister every live session
    pub async fn shutdown(&self) {
        for id in self.registry.ids() {
            let _ = self.unregister_client(&id).await;
        }
    }

    pub async fn init(&self, session_id: &str, mode: PipelineMode) -> Result<()> {
        let session = self.registry.lookup(session_id)?;
        let _lifecycle = session.lifecycle().await;

        let state = session.state();
        if !state.can_transition_to(&SessionState::Initialized) {
            return Err(ProxyError::InvalidState { op: "init", state });
        }

        guarded(self.pipeline.init(session_id, mode)).await?;

        {
            let mut inner = session.lock();
            inner.state = SessionState::Initialized;
            inner.pipeline_mode = Some(mode);
        }
        info!("Dispatcher: {} initialized ({})", session_id, mode);
        Ok(())
    }

    pub async fn start(&self, session_id: &str) -> Result<()> {
        let session = self.registry.lookup(session_id)?;
        let _lifecycle = session.lifecycle().await;

        let state = session.state();
        if state.is_started() {
            info!("Dispatcher: {} already started", session_id);
            return Ok(());
        }
        let target = SessionState::Started {
            started_at: Instant::now(),
        };
        if !state.can_transition_to(&target) {
            return Err(ProxyError::InvalidState { op: "start", state });
        }

        session.reset_frames();
        guarded(self.pipeline.start(session_id)).await?;

        let run = session.begin_run();
        let mode = {
            let mut inner = session.lock();
            inner.state = target;
            inner.pipeline_mode.unwrap_or_default()
        };
        info!("Dispatcher: {} started ({}, run {})", session_id, mode, run);
        Ok(())
    }

    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let session = self.registry.lookup(session_id)?;
        let _lifecycle = session.lifecycle().await;

        let state = session.state();
        if state.is_stopped() {
            info!("Dispatcher: {} already stopped", session_id);
            return Ok(());
        }
        if !state.is_started() {
            info!("Dispatcher: {} not started ({}), nothing to stop", session_id, state);
            return Ok(());
        }

        guarded(self.pipeline.stop(session_id)).await?;

        let (discarded, (inserted, reordered, extracted, _)) = {
            let mut inner = session.lock();
            inner.state = SessionState::Stopped;
            (inner.frames.clear(), inner.frames.stats())
        };
        debug!(
            "Dispatcher: {} window: {} inserted, {} reordered, {} released, {} discarded",
            session_id, inserted, reordered, extracted, discarded
        );

        self.close_persistence(&session).await;

        info!(
            "Dispatcher: {} stopped after {:?}. {}",
            session_id,
            state.running_duration().unwrap_or_default(),
            session.health().summary()
        );
        Ok(())
    }

    // ── Configuration ────────────────────────────────────────────────────────

    pub async fn set_camera_parameters(
        &self,
        session_id: &str,
        params: &CameraParameters,
        params2: Option<&CameraParameters>,
    ) -> Result<()> {
        self.registry.lookup(session_id)?;
        guarded(self.pipeline.set_camera_parameters(session_id, params, params2)).await?;
        info!(
            "Dispatcher: {} camera parameters set ({} camera(s))",
            session_id,
            if params2.is_some() { 2 } else { 1 }
        );
        Ok(())
    }

    pub async fn set_rectification_parameters(
        &self,
        session_id: &str,
        rect1: &RectificationParameters,
        rect2: &RectificationParameters,
    ) -> Result<()> {
        self.registry.lookup(session_id)?;
        guarded(self.pipeline.set_rectification_parameters(session_id, rect1, rect2)).await?;
        info!("Dispatcher: {} rectification parameters set", session_id);
        Ok(())
    }

    // ── Frame path ───────────────────────────────────────────────────────────

    /// Admit a frame set into a session's window and dispatch when ready
    ///
    /// Not started, camera mode mismatch, stale timestamp and a window still
    /// filling up are all reported as a pending response, never as an error.
    pub async fn process_frame_set(
        &self,
        session_id: &str,
        frame_set: FrameSet,
    ) -> Result<RelocalizationResponse> {
        let session = self.registry.lookup(session_id)?;
        let count = frame_set.len();
        let timestamp = frame_set.timestamp;

        {
            let mut inner = session.lock();
            if !inner.state.is_started() {
                debug!("Dispatcher: {} not started, frame set at {} ignored", session_id, timestamp);
                return Ok(RelocalizationResponse::pending(FrameOutcome::NotStarted));
            }
            session.health().record_received();
            if let Some(outcome) = admit(&session, &mut inner, count, timestamp, false)? {
                return Ok(RelocalizationResponse::pending(outcome));
            }
            let fps = inner.rate.update();
            debug!("Dispatcher: {} frame set at {} ({:.1} fps)", session_id, timestamp, fps);
        }

        check_sensor_layout(&frame_set)?;
        let entry = tokio::task::spawn_blocking(move || decode_frame_set(frame_set))
            .await
            .map_err(|e| ProxyError::ImageConversion(format!("decoder task failed: {e}")))??;

        let (released, run) = {
            let mut inner = session.lock();
            if !inner.state.is_started() {
                return Ok(RelocalizationResponse::pending(FrameOutcome::NotStarted));
            }
            if let Some(outcome) = admit(&session, &mut inner, count, timestamp, true)? {
                return Ok(RelocalizationResponse::pending(outcome));
            }
            inner.frames.insert(entry);
            let released = inner.frames.extract_oldest();
            if released.is_none() {
                debug!(
                    "Dispatcher: {} buffering {}/{}",
                    session_id,
                    inner.frames.len(),
                    inner.frames.depth()
                );
            }
            (released, session.run())
        };

        let Some(entry) = released else {
            return Ok(RelocalizationResponse::pending(FrameOutcome::Buffering));
        };

        let result = self.dispatch(&session, &entry).await?;

        // stop() flips the state under this lock before closing the files
        {
            let inner = session.lock();
            if inner.state.is_started() && session.run() == run {
                self.publish(&session, entry);
            } else {
                debug!(
                    "Dispatcher: {} stopped during dispatch, entry {} not saved",
                    session_id, entry.timestamp
                );
            }
        }
        Ok(RelocalizationResponse::from_result(&result))
    }

    async fn dispatch(
        &self,
        session: &ClientSession,
        entry: &OrderedQueueEntry,
    ) -> Result<PipelineResult> {
        let request = RelocalizationRequest {
            images: &entry.images,
            poses: &entry.poses,
            timestamp: entry.timestamp,
            ground_truth: entry.ground_truth,
        };

        match guarded(self.pipeline.relocalize_process_request(session.id(), request)).await {
            Ok(result) => {
                session.health().record_dispatched();
                debug!(
                    "Dispatcher: {} entry {} -> {} ({}, {:.2})",
                    session.id(),
                    entry.timestamp,
                    result.mapping_status,
                    result.transform_status,
                    result.confidence
                );
                Ok(result)
            }
            Err(e) => {
                session.health().record_backend_failure();
                error!(
                    "Dispatcher: {} entry {} failed, tracking lost: {}",
                    session.id(),
                    entry.timestamp,
                    e
                );
                Err(e.into())
            }
        }
    }

    /// Hand a dispatched entry to display and persistence, dropping when full
    fn publish(&self, session: &ClientSession, entry: OrderedQueueEntry) {
        if let Some(display) = &self.display {
            let item = DisplayItem {
                session: session.id().to_string(),
                images: entry.images.clone(),
            };
            let sent = display.try_enqueue(item);
            if sent.is_full() {
                session.health().record_sink_drop();
                debug!("Dispatcher: {} display queue full, frame skipped", session.id());
            } else if sent.is_closed() {
                session.health().record_sink_drop();
            }
        }

        if let Some(persistence) = &self.persistence {
            let item = SaveCommand::Frame(SaveItem {
                session: session.id().to_string(),
                run: session.run(),
                timestamp: entry.timestamp,
                images: entry.images,
                poses: entry.poses,
            });
            let sent = persistence.try_enqueue(item);
            if sent.is_full() {
                session.health().record_sink_drop();
                warn!("Dispatcher: {} save queue full, frame not saved", session.id());
            } else if sent.is_closed() {
                session.health().record_sink_drop();
            }
        }
    }

    /// Let queued saves drain (bounded wait), then release the session's files
    async fn close_persistence(&self, session: &ClientSession) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if !persistence.flush(self.stop_flush_timeout).await {
            warn!(
                "Dispatcher: {} saves still pending after {:?}",
                session.id(),
                self.stop_flush_timeout
            );
        }
        let close = SaveCommand::Close {
            session: session.id().to_string(),
        };
        if !persistence.enqueue(close, SINK_CLOSE_TIMEOUT).await.is_queued() {
            error!("Dispatcher: {} files left open, save queue stuck", session.id());
        }
    }

    // ── Pass-through ─────────────────────────────────────────────────────────

    /// Latest transform known to the backend for a session
    pub async fn get_3d_transform(&self, session_id: &str) -> Result<PipelineResult> {
        self.registry.lookup(session_id)?;
        Ok(guarded(self.pipeline.get_3d_transform(session_id)).await?)
    }

    pub async fn reset_map(&self) -> Result<()> {
        guarded(self.pipeline.reset_map()).await?;
        info!("Dispatcher: map reset");
        Ok(())
    }

    pub fn send_message(&self, session_id: &str, message: &str) -> Result<()> {
        self.registry.lookup(session_id)?;
        info!("Client {}: {}", session_id, message);
        Ok(())
    }
}

/// Gate a frame set against the session's mode and window
///
/// Returns the pending outcome when the frame set must be dropped. With
/// `commit`, an accepted mono to stereo switch is applied and the window,
/// which only holds mono entries at that point, is flushed.
fn admit(
    session: &ClientSession,
    inner: &mut SessionInner,
    count: usize,
    timestamp: Timestamp,
    commit: bool,
) -> Result<Option<FrameOutcome>> {
    let previous = inner.camera_mode;
    let reconciliation = camera_mode::reconcile(previous, count)?;

    if !reconciliation.accept {
        warn!(
            "Dispatcher: {} is {}, {}-frame set at {} dropped",
            session.id(),
            previous,
            count,
            timestamp
        );
        session.health().record_mode_drop();
        return Ok(Some(FrameOutcome::ModeMismatch));
    }

    if inner.frames.is_stale(timestamp) {
        warn!(
            "Dispatcher: {} frame set at {} is older than released {}, dropped",
            session.id(),
            timestamp,
            inner.frames.last_emitted()
        );
        session.health().record_stale_drop();
        return Ok(Some(FrameOutcome::Stale));
    }

    if commit && reconciliation.mode != previous {
        if reconciliation.switched_from(previous) {
            let flushed = inner.frames.clear();
            session.health().record_switch_flush(flushed);
            warn!(
                "Dispatcher: {} switched from mono to stereo, {} buffered frame sets flushed",
                session.id(),
                flushed
            );
        } else {
            info!("Dispatcher: {} camera mode {}", session.id(), reconciliation.mode);
        }
        inner.camera_mode = reconciliation.mode;
    }

    Ok(None)
}
