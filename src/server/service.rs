//! Maps wire requests onto the dispatcher
//!
//! One `Connection` exists per WebSocket client. It remembers the sessions
//! registered through it so they can be released when the client goes away.

use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{ProxyError, Result};
use crate::pipeline::dispatcher::RelocalizationDispatcher;
use crate::pipeline::types::{GroundTruth, pose_from_rows};
use crate::server::protocol::{Request, Response, frame_set};

pub struct Connection {
    peer: String,
    dispatcher: Arc<RelocalizationDispatcher>,
    owned: HashSet<String>,
}

impl Connection {
    pub fn new(peer: impl Into<String>, dispatcher: Arc<RelocalizationDispatcher>) -> Self {
        Self {
            peer: peer.into(),
            dispatcher,
            owned: HashSet::new(),
        }
    }

    /// Handle one text frame and produce exactly one reply frame
    pub async fn handle_text(&mut self, text: &str) -> String {
        let response = match serde_json::from_str::<Request>(text) {
            Ok(request) => match self.handle(request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("{}: request failed: {}", self.peer, e);
                    Response::error(&e)
                }
            },
            Err(e) => {
                warn!("{}: malformed request: {}", self.peer, e);
                Response::error(&ProxyError::Protocol(e.to_string()))
            }
        };
        encode(&response)
    }

    /// Reply to a frame that cannot carry a request
    pub fn reject(&self, reason: &str) -> String {
        warn!("{}: {}", self.peer, reason);
        encode(&Response::error(&ProxyError::Protocol(reason.to_string())))
    }

    pub async fn handle(&mut self, request: Request) -> Result<Response> {
        let dispatcher = Arc::clone(&self.dispatcher);

        match request {
            Request::RegisterClient => {
                let client_uuid = dispatcher.register_client().await?;
                self.owned.insert(client_uuid.clone());
                Ok(Response::ClientUuid { client_uuid })
            }
            Request::UnregisterClient { client_uuid } => {
                self.owned.remove(&client_uuid);
                dispatcher.unregister_client(&client_uuid).await?;
                Ok(Response::Ok)
            }
            Request::Init { client_uuid, mode } => {
                dispatcher.init(&client_uuid, mode).await?;
                Ok(Response::Ok)
            }
            Request::Start { client_uuid } => {
                dispatcher.start(&client_uuid).await?;
                Ok(Response::Ok)
            }
            Request::Stop { client_uuid } => {
                dispatcher.stop(&client_uuid).await?;
                Ok(Response::Ok)
            }
            Request::SetCameraParameters {
                client_uuid,
                camera,
            } => {
                dispatcher
                    .set_camera_parameters(&client_uuid, &camera, None)
                    .await?;
                Ok(Response::Ok)
            }
            Request::SetCameraParametersStereo {
                client_uuid,
                camera1,
                camera2,
            } => {
                dispatcher
                    .set_camera_parameters(&client_uuid, &camera1, Some(&camera2))
                    .await?;
                Ok(Response::Ok)
            }
            Request::SetRectificationParameters {
                client_uuid,
                rect1,
                rect2,
            } => {
                dispatcher
                    .set_rectification_parameters(&client_uuid, &rect1, &rect2)
                    .await?;
                Ok(Response::Ok)
            }
            Request::RelocalizeAndMap {
                client_uuid,
                frames,
                timestamp,
            } => {
                let set = frame_set(frames, timestamp, None)?;
                let response = dispatcher.process_frame_set(&client_uuid, set).await?;
                Ok(response.into())
            }
            Request::RelocalizeAndMapGroundTruth {
                client_uuid,
                frames,
                timestamp,
                world_transform,
                fixed_pose,
            } => {
                let ground_truth = GroundTruth {
                    world_transform: pose_from_rows(&world_transform),
                    fixed_pose,
                };
                let set = frame_set(frames, timestamp, Some(ground_truth))?;
                let response = dispatcher.process_frame_set(&client_uuid, set).await?;
                Ok(response.into())
            }
            Request::Get3DTransform { client_uuid } => {
                let result = dispatcher.get_3d_transform(&client_uuid).await?;
                Ok(result.into())
            }
            Request::Reset => {
                dispatcher.reset_map().await?;
                Ok(Response::Ok)
            }
            Request::SendMessage {
                client_uuid,
                message,
            } => {
                dispatcher.send_message(&client_uuid, &message)?;
                Ok(Response::Ok)
            }
        }
    }

    /// Release every session registered over this connection
    pub async fn close(&mut self) {
        for id in self.owned.drain() {
            debug!("{}: releasing session {}", self.peer, id);
            if let Err(e) = self.dispatcher.unregister_client(&id).await {
                debug!("{}: session {} already gone: {}", self.peer, id, e);
            }
        }
    }
}

fn encode(response: &Response) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        format!(r#"{{"type":"Error","kind":"protocol","message":"{}"}}"#, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::backend::testing::{Call, RecordingPipeline};
    use crate::pipeline::frame_buffer::ReorderConfig;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::{Value, json};

    fn connection(depth: usize) -> (Arc<RecordingPipeline>, Connection) {
        let backend = Arc::new(RecordingPipeline::default());
        let dispatcher = RelocalizationDispatcher::new(backend.clone(), ReorderConfig { depth });
        (backend, Connection::new("test", Arc::new(dispatcher)))
    }

    async fn send(conn: &mut Connection, request: Value) -> Value {
        let reply = conn.handle_text(&request.to_string()).await;
        serde_json::from_str(&reply).unwrap()
    }

    fn relocalize(id: &str, timestamp: i64) -> Value {
        json!({
            "type": "RelocalizeAndMap",
            "client_uuid": id,
            "timestamp": timestamp,
            "frames": [{
                "sensor_id": 0,
                "width": 1,
                "height": 1,
                "layout": "rgb24",
                "data": STANDARD.encode([10u8, 20, 30, 255]),
                "pose": [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
            }],
        })
    }

    #[tokio::test]
    async fn test_full_session_over_json() {
        let (backend, mut conn) = connection(2);

        let reply = send(&mut conn, json!({"type": "RegisterClient"})).await;
        assert_eq!(reply["type"], "ClientUuid");
        let id = reply["client_uuid"].as_str().unwrap().to_string();

        let reply = send(&mut conn, json!({"type": "Init", "client_uuid": id, "mode": "relocalization_only"})).await;
        assert_eq!(reply["type"], "Ok");
        send(&mut conn, json!({"type": "Start", "client_uuid": id})).await;

        let reply = send(&mut conn, relocalize(&id, 100)).await;
        assert_eq!(reply["type"], "Relocalization");
        assert_eq!(reply["outcome"], "buffering");

        let reply = send(&mut conn, relocalize(&id, 200)).await;
        assert_eq!(reply["outcome"], "dispatched");
        assert_eq!(backend.dispatched(&id), vec![100]);

        let reply = send(&mut conn, json!({"type": "SendMessage", "client_uuid": id, "message": "hi"})).await;
        assert_eq!(reply["type"], "Ok");

        let reply = send(&mut conn, json!({"type": "Stop", "client_uuid": id})).await;
        assert_eq!(reply["type"], "Ok");
    }

    #[tokio::test]
    async fn test_malformed_json_is_protocol_error() {
        let (_backend, mut conn) = connection(5);

        let reply: Value = serde_json::from_str(&conn.handle_text("{not json").await).unwrap();
        assert_eq!(reply["type"], "Error");
        assert_eq!(reply["kind"], "protocol");

        // the connection keeps working
        let reply = send(&mut conn, json!({"type": "RegisterClient"})).await;
        assert_eq!(reply["type"], "ClientUuid");
    }

    #[test]
    fn test_rejected_frame_gets_protocol_error() {
        let (_backend, conn) = connection(5);

        let reply: Value = serde_json::from_str(&conn.reject("binary frame is not UTF-8")).unwrap();
        assert_eq!(reply["type"], "Error");
        assert_eq!(reply["kind"], "protocol");
        assert_eq!(reply["message"].as_str().map(|m| m.contains("UTF-8")), Some(true));
    }

    #[tokio::test]
    async fn test_unknown_session_error() {
        let (_backend, mut conn) = connection(5);

        let reply = send(&mut conn, json!({"type": "Stop", "client_uuid": "missing"})).await;
        assert_eq!(reply["type"], "Error");
        assert_eq!(reply["kind"], "unknown_session");
        assert!(reply.get("mapping_status").is_none());
    }

    #[tokio::test]
    async fn test_backend_failure_reports_tracking_lost() {
        let (backend, mut conn) = connection(1);
        let reply = send(&mut conn, json!({"type": "RegisterClient"})).await;
        let id = reply["client_uuid"].as_str().unwrap().to_string();
        send(&mut conn, json!({"type": "Init", "client_uuid": id})).await;
        send(&mut conn, json!({"type": "Start", "client_uuid": id})).await;

        backend
            .fail_relocalize
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let reply = send(&mut conn, relocalize(&id, 100)).await;
        assert_eq!(reply["type"], "Error");
        assert_eq!(reply["kind"], "backend");
        assert_eq!(reply["mapping_status"], "tracking_lost");
    }

    #[tokio::test]
    async fn test_close_releases_owned_sessions() {
        let (backend, mut conn) = connection(5);
        let dispatcher = Arc::clone(&conn.dispatcher);

        send(&mut conn, json!({"type": "RegisterClient"})).await;
        send(&mut conn, json!({"type": "RegisterClient"})).await;
        assert_eq!(dispatcher.registry().len(), 2);

        conn.close().await;
        assert!(dispatcher.registry().is_empty());
        assert_eq!(backend.count(|c| matches!(c, Call::Unregister(_))), 2);
    }
}
