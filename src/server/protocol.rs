//! Wire message shapes
//!
//! Every request and response is one JSON text frame tagged by `"type"`.
//! Matrices travel as row-major nested arrays, image bytes as base64.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::codec::{EncodedImage, ImageCompression, ImageLayout};
use crate::error::{ProxyError, Result};
use crate::pipeline::types::{
    CameraParameters, FrameOutcome, FrameSet, GroundTruth, MappingStatus, PipelineMode,
    PipelineResult, PoseStatus, RawFrame, RectificationParameters, RelocalizationResponse,
    pose_from_rows, pose_to_rows,
};

pub type Matrix4Rows = [[f32; 4]; 4];

/// One camera frame as sent by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub sensor_id: u8,
    pub width: u32,
    pub height: u32,
    pub layout: ImageLayout,
    #[serde(default)]
    pub compression: ImageCompression,
    /// Base64 image payload
    pub data: String,
    /// Device pose, row-major
    pub pose: Matrix4Rows,
}

impl WireFrame {
    pub fn into_raw(self) -> Result<RawFrame> {
        let data = STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| ProxyError::Protocol(format!("frame {} image data: {}", self.sensor_id, e)))?;

        Ok(RawFrame {
            sensor_id: self.sensor_id,
            image: EncodedImage {
                width: self.width,
                height: self.height,
                layout: self.layout,
                compression: self.compression,
                data: data.into(),
            },
            pose: pose_from_rows(&self.pose),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    RegisterClient,
    UnregisterClient {
        client_uuid: String,
    },
    Init {
        client_uuid: String,
        #[serde(default)]
        mode: PipelineMode,
    },
    Start {
        client_uuid: String,
    },
    Stop {
        client_uuid: String,
    },
    SetCameraParameters {
        client_uuid: String,
        camera: CameraParameters,
    },
    SetCameraParametersStereo {
        client_uuid: String,
        camera1: CameraParameters,
        camera2: CameraParameters,
    },
    SetRectificationParameters {
        client_uuid: String,
        rect1: RectificationParameters,
        rect2: RectificationParameters,
    },
    RelocalizeAndMap {
        client_uuid: String,
        frames: Vec<WireFrame>,
        timestamp: i64,
    },
    RelocalizeAndMapGroundTruth {
        client_uuid: String,
        frames: Vec<WireFrame>,
        timestamp: i64,
        world_transform: Matrix4Rows,
        fixed_pose: bool,
    },
    Get3DTransform {
        client_uuid: String,
    },
    Reset,
    SendMessage {
        client_uuid: String,
        message: String,
    },
}

/// Build a frame set from wire frames, decoding base64 payloads
pub fn frame_set(
    frames: Vec<WireFrame>,
    timestamp: i64,
    ground_truth: Option<GroundTruth>,
) -> Result<FrameSet> {
    let frames = frames
        .into_iter()
        .map(WireFrame::into_raw)
        .collect::<Result<Vec<_>>>()?;

    let set = FrameSet::new(frames, timestamp);
    Ok(match ground_truth {
        Some(gt) => set.with_ground_truth(gt),
        None => set,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Ok,
    ClientUuid {
        client_uuid: String,
    },
    Relocalization {
        confidence: f32,
        mapping_status: MappingStatus,
        pose_status: PoseStatus,
        pose: Matrix4Rows,
        outcome: FrameOutcome,
    },
    Transform {
        pose_status: PoseStatus,
        transform: Matrix4Rows,
        confidence: f32,
        mapping_status: MappingStatus,
    },
    Error {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mapping_status: Option<MappingStatus>,
    },
}

impl Response {
    pub fn error(err: &ProxyError) -> Self {
        Response::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            mapping_status: err.mapping_status(),
        }
    }
}

impl From<RelocalizationResponse> for Response {
    fn from(r: RelocalizationResponse) -> Self {
        Response::Relocalization {
            confidence: r.confidence,
            mapping_status: r.mapping_status,
            pose_status: r.pose_status,
            pose: pose_to_rows(&r.pose),
            outcome: r.outcome,
        }
    }
}

impl From<PipelineResult> for Response {
    fn from(r: PipelineResult) -> Self {
        Response::Transform {
            pose_status: r.transform_status.into(),
            transform: pose_to_rows(&r.transform),
            confidence: r.confidence,
            mapping_status: r.mapping_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use serde_json::json;

    const IDENTITY: Matrix4Rows = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ];

    #[test]
    fn test_parse_relocalize_request() {
        let text = json!({
            "type": "RelocalizeAndMap",
            "client_uuid": "abc",
            "timestamp": 1234,
            "frames": [{
                "sensor_id": 0,
                "width": 2,
                "height": 1,
                "layout": "grey8",
                "data": STANDARD.encode([7u8, 9]),
                "pose": IDENTITY,
            }],
        })
        .to_string();

        let Request::RelocalizeAndMap {
            client_uuid,
            frames,
            timestamp,
        } = serde_json::from_str::<Request>(&text).unwrap()
        else {
            panic!("wrong request type");
        };
        assert_eq!(client_uuid, "abc");

        let set = frame_set(frames, timestamp, None).unwrap();
        assert_eq!(set.timestamp.millis, 1234);
        assert_eq!(set.frames[0].image.compression, ImageCompression::None);
        assert_eq!(set.frames[0].image.data.as_ref(), &[7, 9]);
    }

    #[test]
    fn test_parse_unit_requests() {
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"type":"RegisterClient"}"#).unwrap(),
            Request::RegisterClient
        ));
        let init: Request = serde_json::from_str(r#"{"type":"Init","client_uuid":"x"}"#).unwrap();
        assert!(matches!(
            init,
            Request::Init {
                mode: PipelineMode::RelocalizationAndMapping,
                ..
            }
        ));
    }

    #[test]
    fn test_bad_base64_is_protocol_error() {
        let frame = WireFrame {
            sensor_id: 0,
            width: 1,
            height: 1,
            layout: ImageLayout::Grey8,
            compression: ImageCompression::None,
            data: "***".into(),
            pose: IDENTITY,
        };
        assert!(matches!(frame.into_raw(), Err(ProxyError::Protocol(_))));
    }

    #[test]
    fn test_error_response_shape() {
        let err = ProxyError::from(BackendError::Failed("down".into()));
        let value = serde_json::to_value(Response::error(&err)).unwrap();
        assert_eq!(value["type"], "Error");
        assert_eq!(value["kind"], "backend");
        assert_eq!(value["mapping_status"], "tracking_lost");

        let value = serde_json::to_value(Response::error(&ProxyError::UnknownSession("x".into()))).unwrap();
        assert!(value.get("mapping_status").is_none());
        assert_eq!(serde_json::to_string(&Response::Ok).unwrap(), r#"{"type":"Ok"}"#);
    }

    #[test]
    fn test_pending_response_shape() {
        let response = Response::from(RelocalizationResponse::pending(FrameOutcome::Buffering));
        let value = serde_json::to_value(response).unwrap();
        assert_eq!(value["type"], "Relocalization");
        assert_eq!(value["confidence"], 0.0);
        assert_eq!(value["pose_status"], "no_pose");
        assert_eq!(value["mapping_status"], "bootstrap");
        assert_eq!(value["outcome"], "buffering");
    }
}
