//! Core types for the frame-ordering pipeline

use image::DynamicImage;
use nalgebra::{Matrix3, Matrix3x4, Matrix4};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::codec::EncodedImage;

/// Rigid 4x4 transform (device pose or pose correction)
pub type Pose = Matrix4<f32>;

/// Decoded image, shared by whichever component holds it last
pub type SharedImage = Arc<DynamicImage>;

/// Capture timestamp in the client clock domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Milliseconds in the client clock domain
    pub millis: i64,
}

impl Timestamp {
    /// Create a new timestamp from milliseconds
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }
}

impl From<i64> for Timestamp {
    fn from(millis: i64) -> Self {
        Self::from_millis(millis)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.millis)
    }
}

/// Camera rig configuration, locked per session on the first frame set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraMode {
    #[default]
    Unknown,
    Mono,
    Stereo,
}

impl std::fmt::Display for CameraMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraMode::Unknown => write!(f, "Unknown"),
            CameraMode::Mono => write!(f, "Mono"),
            CameraMode::Stereo => write!(f, "Stereo"),
        }
    }
}

/// Backend operating mode requested by `Init`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    #[default]
    RelocalizationAndMapping,
    RelocalizationOnly,
}

impl std::fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineMode::RelocalizationAndMapping => write!(f, "RELOCALIZATION_AND_MAPPING"),
            PipelineMode::RelocalizationOnly => write!(f, "RELOCALIZATION_ONLY"),
        }
    }
}

/// Whether the backend produced a pose correction on this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformStatus {
    #[default]
    None,
    New,
    Previous,
}

impl std::fmt::Display for TransformStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformStatus::None => write!(f, "NO_3DTRANSFORM"),
            TransformStatus::New => write!(f, "NEW_3DTRANSFORM"),
            TransformStatus::Previous => write!(f, "PREVIOUS_3DTRANSFORM"),
        }
    }
}

/// Backend-reported SLAM state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    #[default]
    Bootstrap,
    Mapping,
    TrackingLost,
    LoopClosure,
}

impl std::fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingStatus::Bootstrap => write!(f, "BOOTSTRAP"),
            MappingStatus::Mapping => write!(f, "MAPPING"),
            MappingStatus::TrackingLost => write!(f, "TRACKING_LOST"),
            MappingStatus::LoopClosure => write!(f, "LOOP_CLOSURE_DETECTED"),
        }
    }
}

/// Pose status as reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoseStatus {
    #[default]
    NoPose,
    NewPose,
    LatestPose,
}

impl From<TransformStatus> for PoseStatus {
    fn from(status: TransformStatus) -> Self {
        match status {
            TransformStatus::None => PoseStatus::NoPose,
            TransformStatus::New => PoseStatus::NewPose,
            TransformStatus::Previous => PoseStatus::LatestPose,
        }
    }
}

/// What happened to a frame set submitted for relocalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrameOutcome {
    /// Session is not started, nothing was buffered
    #[default]
    NotStarted,
    /// Single-frame set received while locked in stereo mode
    ModeMismatch,
    /// Timestamp older than the last dispatched entry
    Stale,
    /// Buffered, reorder window not yet full
    Buffering,
    /// The oldest buffered entry was sent to the backend
    Dispatched,
}

/// Ground-truth parameters carried by the ground-truth request variant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundTruth {
    pub world_transform: Pose,
    pub fixed_pose: bool,
}

/// One camera's capture as received from a client, not yet decoded
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub sensor_id: u8,
    pub image: EncodedImage,
    pub pose: Pose,
}

/// Atomic unit of work: one (mono) or two (stereo) frames sharing a timestamp
#[derive(Debug, Clone)]
pub struct FrameSet {
    pub frames: Vec<RawFrame>,
    pub timestamp: Timestamp,
    pub ground_truth: Option<GroundTruth>,
}

impl FrameSet {
    /// Build a frame set without ground truth
    pub fn new(frames: Vec<RawFrame>, timestamp: impl Into<Timestamp>) -> Self {
        Self {
            frames,
            timestamp: timestamp.into(),
            ground_truth: None,
        }
    }

    /// Attach ground-truth parameters
    pub fn with_ground_truth(mut self, ground_truth: GroundTruth) -> Self {
        self.ground_truth = Some(ground_truth);
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Decoded frame set waiting in the reorder window
///
/// Images and poses are index-aligned by sensor id.
#[derive(Clone)]
pub struct OrderedQueueEntry {
    pub images: Vec<SharedImage>,
    pub poses: Vec<Pose>,
    pub timestamp: Timestamp,
    pub ground_truth: Option<GroundTruth>,
}

impl std::fmt::Debug for OrderedQueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("OrderedQueueEntry");
        debug
            .field("timestamp", &self.timestamp)
            .field("images", &self.images.len());

        if let Some(first) = self.images.first() {
            debug.field("width", &first.width());
            debug.field("height", &first.height());
        }
        if self.ground_truth.is_some() {
            debug.field("ground_truth", &true);
        }

        debug.finish()
    }
}

/// Output of one backend relocalization call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineResult {
    pub transform_status: TransformStatus,
    pub transform: Pose,
    pub confidence: f32,
    pub mapping_status: MappingStatus,
}

impl Default for PipelineResult {
    fn default() -> Self {
        Self {
            transform_status: TransformStatus::None,
            transform: Pose::identity(),
            confidence: 0.0,
            mapping_status: MappingStatus::Bootstrap,
        }
    }
}

/// Response returned to a client for one frame set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelocalizationResponse {
    pub confidence: f32,
    pub mapping_status: MappingStatus,
    pub pose_status: PoseStatus,
    pub pose: Pose,
    pub outcome: FrameOutcome,
}

impl RelocalizationResponse {
    /// "No result yet" response: zero confidence, no pose, bootstrap status
    pub fn pending(outcome: FrameOutcome) -> Self {
        Self {
            confidence: 0.0,
            mapping_status: MappingStatus::Bootstrap,
            pose_status: PoseStatus::NoPose,
            pose: Pose::identity(),
            outcome,
        }
    }

    /// Response built from a backend result
    pub fn from_result(result: &PipelineResult) -> Self {
        Self {
            confidence: result.confidence.clamp(0.0, 1.0),
            mapping_status: result.mapping_status,
            pose_status: result.transform_status.into(),
            pose: result.transform,
            outcome: FrameOutcome::Dispatched,
        }
    }
}

/// Camera model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CameraType {
    #[default]
    Rgb,
    Gray,
}

/// Intrinsic and distortion parameters of one camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    pub name: String,
    pub id: u32,
    pub camera_type: CameraType,
    pub width: u32,
    pub height: u32,
    /// Row-major 3x3 intrinsic matrix
    pub intrinsics: [[f32; 3]; 3],
    /// k1, k2, p1, p2, k3
    pub distortion: [f32; 5],
}

impl CameraParameters {
    pub fn intrinsic_matrix(&self) -> Matrix3<f32> {
        let k = &self.intrinsics;
        Matrix3::new(
            k[0][0], k[0][1], k[0][2], //
            k[1][0], k[1][1], k[1][2], //
            k[2][0], k[2][1], k[2][2],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StereoType {
    #[default]
    Horizontal,
    Vertical,
}

/// Rectification block for one camera of a stereo pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectificationParameters {
    /// Row-major 3x3 rectification rotation
    pub rotation: [[f32; 3]; 3],
    /// Row-major 3x4 projection in the rectified frame
    pub projection: [[f32; 4]; 3],
    pub stereo_type: StereoType,
    pub baseline: f32,
}

impl RectificationParameters {
    pub fn projection_matrix(&self) -> Matrix3x4<f32> {
        let p = &self.projection;
        Matrix3x4::new(
            p[0][0], p[0][1], p[0][2], p[0][3], //
            p[1][0], p[1][1], p[1][2], p[1][3], //
            p[2][0], p[2][1], p[2][2], p[2][3],
        )
    }
}

/// Convert a row-major array into a pose
pub fn pose_from_rows(rows: &[[f32; 4]; 4]) -> Pose {
    Pose::from_fn(|r, c| rows[r][c])
}

/// Convert a pose into a row-major array
pub fn pose_to_rows(pose: &Pose) -> [[f32; 4]; 4] {
    let mut rows = [[0.0; 4]; 4];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = pose[(r, c)];
        }
    }
    rows
}
