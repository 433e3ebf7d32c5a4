//! Wire format for the persistent camera/viewer connection.
//!
//! Text messages are JSON objects tagged by `"type"`. Frames may also arrive
//! as binary messages: a 4-byte big-endian header length, a JSON
//! `FrameHeader`, then the raw encoded image.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::aggregate::CameraState;
use crate::error::{RouterError, RouterResult};
use crate::frame::{capture_time_from_secs, epoch_secs, CameraId, Frame};
use crate::router::RouterStats;

/// Upper bound on the JSON header of a binary frame.
const MAX_BINARY_HEADER: usize = 64 * 1024;

/// One expert name or a list of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpertTarget {
    One(String),
    Many(Vec<String>),
}

impl ExpertTarget {
    pub fn names(&self) -> Vec<&str> {
        match self {
            ExpertTarget::One(name) => vec![name.as_str()],
            ExpertTarget::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for ExpertTarget {
    fn from(name: &str) -> Self {
        ExpertTarget::One(name.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub camera_id: CameraId,
    #[serde(alias = "expert_target")]
    pub expert: ExpertTarget,
    /// Base64 encoded image. A `data:` URL prefix is tolerated.
    pub frame: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_time: Option<f64>,
}

/// Header of a binary frame message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub camera_id: CameraId,
    #[serde(alias = "expert_target")]
    pub expert: ExpertTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_time: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Frame(FrameMessage),
    Heartbeat {
        camera_id: CameraId,
    },
    Register {
        camera_id: CameraId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Subscribe {
        camera_id: CameraId,
    },
    Unsubscribe {
        camera_id: CameraId,
    },
    ListCameras,
    GetCameraState {
        camera_id: CameraId,
    },
    SnapshotAll,
    GetLatestFrame {
        camera_id: CameraId,
    },
    GetStats,
    SetExpertEnabled {
        expert: String,
        enabled: bool,
    },
    SetProcessingScale {
        value: f32,
    },
    GetProcessingScale,
}

impl ClientMessage {
    /// Operation name echoed in acks.
    pub fn op(&self) -> &'static str {
        match self {
            ClientMessage::Frame(_) => "frame",
            ClientMessage::Heartbeat { .. } => "heartbeat",
            ClientMessage::Register { .. } => "register",
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::ListCameras => "list_cameras",
            ClientMessage::GetCameraState { .. } => "get_camera_state",
            ClientMessage::SnapshotAll => "snapshot_all",
            ClientMessage::GetLatestFrame { .. } => "get_latest_frame",
            ClientMessage::GetStats => "get_stats",
            ClientMessage::SetExpertEnabled { .. } => "set_expert_enabled",
            ClientMessage::SetProcessingScale { .. } => "set_processing_scale",
            ClientMessage::GetProcessingScale => "get_processing_scale",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ack { op: String },
    Error { kind: String, message: String },
    Cameras { camera_ids: Vec<CameraId> },
    CameraState { state: CameraState },
    Snapshot { states: Vec<CameraState> },
    /// Most recent frame of a camera (base64) with the state current when it was read.
    LatestFrame {
        camera_id: CameraId,
        frame: String,
        capture_time: f64,
        state: CameraState,
    },
    Stats { stats: RouterStats },
    ProcessingScale { value: f32 },
}

impl ServerMessage {
    pub fn ack(op: &str) -> Self {
        ServerMessage::Ack { op: op.to_string() }
    }

    pub fn error(err: &RouterError) -> Self {
        ServerMessage::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn latest_frame(frame: &Frame, state: CameraState) -> Self {
        ServerMessage::LatestFrame {
            camera_id: frame.camera_id().clone(),
            frame: encode_payload(frame.payload()),
            capture_time: epoch_secs(frame.capture_time()),
            state,
        }
    }

    pub fn to_json(&self) -> RouterResult<String> {
        serde_json::to_string(self)
            .map_err(|e| RouterError::MalformedMessage(format!("encode reply: {}", e)))
    }
}

/// A decoded frame ready for the router.
#[derive(Clone, Debug)]
pub struct FrameRequest {
    pub experts: Vec<String>,
    pub frame: Frame,
}

fn malformed(msg: impl Into<String>) -> RouterError {
    RouterError::MalformedMessage(msg.into())
}

pub fn decode_text(text: &str) -> RouterResult<ClientMessage> {
    serde_json::from_str(text).map_err(|e| malformed(e.to_string()))
}

/// Decode base64 image data, with or without a `data:<mime>;base64,` prefix.
pub fn decode_payload(encoded: &str) -> RouterResult<Vec<u8>> {
    let data = match encoded.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| malformed("data URL without payload"))?,
        None => encoded,
    };
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| malformed(format!("frame is not valid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(malformed("frame payload is empty"));
    }
    Ok(bytes)
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn build_request(
    camera_id: CameraId,
    target: &ExpertTarget,
    capture_time: Option<f64>,
    payload: Vec<u8>,
) -> RouterResult<FrameRequest> {
    let experts: Vec<String> = target.names().into_iter().map(str::to_string).collect();
    if experts.is_empty() || experts.iter().any(|name| name.trim().is_empty()) {
        return Err(malformed("frame names no expert"));
    }
    let capture_time = match capture_time {
        Some(secs) => capture_time_from_secs(secs)?,
        None => SystemTime::now(),
    };
    Ok(FrameRequest {
        experts,
        frame: Frame::new(camera_id, payload, capture_time),
    })
}

impl FrameMessage {
    pub fn into_request(self) -> RouterResult<FrameRequest> {
        let payload = decode_payload(&self.frame)?;
        build_request(self.camera_id, &self.expert, self.capture_time, payload)
    }
}

/// Decode a binary frame message.
pub fn decode_binary(bytes: &[u8]) -> RouterResult<FrameRequest> {
    if bytes.len() < 4 {
        return Err(malformed("binary frame shorter than its length prefix"));
    }
    let header_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if header_len > MAX_BINARY_HEADER || header_len > bytes.len() - 4 {
        return Err(malformed(format!("bad binary header length {}", header_len)));
    }
    let header: FrameHeader = serde_json::from_slice(&bytes[4..4 + header_len])
        .map_err(|e| malformed(format!("binary frame header: {}", e)))?;
    let payload = &bytes[4 + header_len..];
    if payload.is_empty() {
        return Err(malformed("frame payload is empty"));
    }
    build_request(header.camera_id, &header.expert, header.capture_time, payload.to_vec())
}

pub fn encode_binary(header: &FrameHeader, payload: &[u8]) -> RouterResult<Vec<u8>> {
    let header = serde_json::to_vec(header).map_err(|e| malformed(e.to_string()))?;
    let mut out = Vec::with_capacity(4 + header.len() + payload.len());
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(out)
}
