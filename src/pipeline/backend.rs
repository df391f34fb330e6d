//! Relocalization backend interface
//!
//! The relocalization-and-mapping engine is an external collaborator. The
//! proxy only relies on the call contract below; a single instance is
//! shared by every client session.

use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::BackendError;
use crate::pipeline::types::{
    CameraParameters, GroundTruth, MappingStatus, PipelineMode, PipelineResult, Pose,
    RectificationParameters, SharedImage, Timestamp, TransformStatus,
};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// One ordered entry handed to the backend
#[derive(Debug, Clone)]
pub struct RelocalizationRequest<'a> {
    pub images: &'a [SharedImage],
    pub poses: &'a [Pose],
    pub timestamp: Timestamp,
    pub ground_truth: Option<GroundTruth>,
}

/// Capability interface of the relocalization-and-mapping engine
#[async_trait]
pub trait RelocalizationPipeline: Send + Sync {
    /// Allocate backend state for a new client
    async fn register_client(&self, session_id: &str) -> BackendResult<()>;

    /// Release backend state of a client
    async fn unregister_client(&self, session_id: &str) -> BackendResult<()>;

    async fn init(&self, session_id: &str, mode: PipelineMode) -> BackendResult<()>;

    async fn start(&self, session_id: &str) -> BackendResult<()>;

    async fn stop(&self, session_id: &str) -> BackendResult<()>;

    /// Intrinsics of one camera, or of both cameras of a stereo rig
    async fn set_camera_parameters(
        &self,
        session_id: &str,
        params: &CameraParameters,
        params2: Option<&CameraParameters>,
    ) -> BackendResult<()>;

    async fn set_rectification_parameters(
        &self,
        session_id: &str,
        rect1: &RectificationParameters,
        rect2: &RectificationParameters,
    ) -> BackendResult<()>;

    /// Relocalize and map one ordered entry
    async fn relocalize_process_request(
        &self,
        session_id: &str,
        request: RelocalizationRequest<'_>,
    ) -> BackendResult<PipelineResult>;

    /// Latest transform computed for a client, if the backend keeps one
    async fn get_3d_transform(&self, _session_id: &str) -> BackendResult<PipelineResult> {
        Err(BackendError::Unsupported("get_3d_transform"))
    }

    /// Drop the global map
    async fn reset_map(&self) -> BackendResult<()>;
}

#[derive(Debug, Default)]
struct LocalClient {
    mode: Option<PipelineMode>,
    started: bool,
    processed: u64,
    last: PipelineResult,
}

/// In-process stand-in used when no mapping service is attached
///
/// Tracks the per-client lifecycle and reports a bootstrap phase followed by
/// mapping, without ever producing a pose correction.
#[derive(Default)]
pub struct LocalPipeline {
    clients: Mutex<HashMap<String, LocalClient>>,
    bootstrap_frames: u64,
}

impl LocalPipeline {
    pub fn new(bootstrap_frames: u64) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            bootstrap_frames,
        }
    }

    fn with_client<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut LocalClient) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| BackendError::Failed("local pipeline state poisoned".into()))?;
        let client = clients
            .get_mut(session_id)
            .ok_or_else(|| BackendError::Failed(format!("client {session_id} not registered")))?;
        f(client)
    }
}

#[async_trait]
impl RelocalizationPipeline for LocalPipeline {
    async fn register_client(&self, session_id: &str) -> BackendResult<()> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| BackendError::Failed("local pipeline state poisoned".into()))?;
        clients.insert(session_id.to_string(), LocalClient::default());
        Ok(())
    }

    async fn unregister_client(&self, session_id: &str) -> BackendResult<()> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| BackendError::Failed("local pipeline state poisoned".into()))?;
        clients.remove(session_id);
        Ok(())
    }

    async fn init(&self, session_id: &str, mode: PipelineMode) -> BackendResult<()> {
        self.with_client(session_id, |c| {
            c.mode = Some(mode);
            Ok(())
        })
    }

    async fn start(&self, session_id: &str) -> BackendResult<()> {
        self.with_client(session_id, |c| {
            if c.mode.is_none() {
                return Err(BackendError::Failed("start before init".into()));
            }
            c.started = true;
            Ok(())
        })
    }

    async fn stop(&self, session_id: &str) -> BackendResult<()> {
        self.with_client(session_id, |c| {
            c.started = false;
            Ok(())
        })
    }

    async fn set_camera_parameters(
        &self,
        session_id: &str,
        params: &CameraParameters,
        params2: Option<&CameraParameters>,
    ) -> BackendResult<()> {
        self.with_client(session_id, |_| {
            debug!("LocalPipeline: camera {} intrinsics {}", params.name, params.intrinsic_matrix());
            if let Some(p) = params2 {
                debug!("LocalPipeline: camera {} intrinsics {}", p.name, p.intrinsic_matrix());
            }
            Ok(())
        })
    }

    async fn set_rectification_parameters(
        &self,
        session_id: &str,
        rect1: &RectificationParameters,
        rect2: &RectificationParameters,
    ) -> BackendResult<()> {
        self.with_client(session_id, |_| {
            debug!(
                "LocalPipeline: rectification ({:?}, baseline {}) P1 {} P2 {}",
                rect1.stereo_type,
                rect1.baseline,
                rect1.projection_matrix(),
                rect2.projection_matrix()
            );
            Ok(())
        })
    }

    async fn relocalize_process_request(
        &self,
        session_id: &str,
        request: RelocalizationRequest<'_>,
    ) -> BackendResult<PipelineResult> {
        let bootstrap_frames = self.bootstrap_frames;
        self.with_client(session_id, |c| {
            if !c.started {
                return Err(BackendError::Failed("client not started".into()));
            }
            c.processed += 1;
            c.last = PipelineResult {
                transform_status: TransformStatus::None,
                transform: Pose::identity(),
                confidence: 0.0,
                mapping_status: if c.processed <= bootstrap_frames {
                    MappingStatus::Bootstrap
                } else {
                    MappingStatus::Mapping
                },
            };
            debug!(
                "LocalPipeline: {} image(s) at {} -> {}",
                request.images.len(),
                request.timestamp,
                c.last.mapping_status
            );
            Ok(c.last)
        })
    }

    async fn get_3d_transform(&self, session_id: &str) -> BackendResult<PipelineResult> {
        self.with_client(session_id, |c| Ok(c.last))
    }

    async fn reset_map(&self) -> BackendResult<()> {
        info!("LocalPipeline: map reset");
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| BackendError::Failed("local pipeline state poisoned".into()))?;
        for client in clients.values_mut() {
            client.processed = 0;
            client.last = PipelineResult::default();
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_pipeline_lifecycle() {
        let pipeline = LocalPipeline::new(1);
        pipeline.register_client("a").await.unwrap();

        assert!(pipeline.start("a").await.is_err());
        pipeline.init("a", PipelineMode::RelocalizationOnly).await.unwrap();
        pipeline.start("a").await.unwrap();

        let request = RelocalizationRequest {
            images: &[],
            poses: &[],
            timestamp: Timestamp::from_millis(1),
            ground_truth: None,
        };
        let first = pipeline
            .relocalize_process_request("a", request.clone())
            .await
            .unwrap();
        assert_eq!(first.mapping_status, MappingStatus::Bootstrap);

        let second = pipeline.relocalize_process_request("a", request).await.unwrap();
        assert_eq!(second.mapping_status, MappingStatus::Mapping);
        assert_eq!(second.transform_status, TransformStatus::None);

        let latest = pipeline.get_3d_transform("a").await.unwrap();
        assert_eq!(latest, second);
    }

    #[tokio::test]
    async fn test_local_pipeline_unknown_client() {
        let pipeline = LocalPipeline::new(0);
        assert!(matches!(
            pipeline.init("ghost", PipelineMode::default()).await,
            Err(BackendError::Failed(_))
        ));
    }
}
