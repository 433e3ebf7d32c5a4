//! Error taxonomy for the routing core.
//!
//! Only the query and administrative surfaces return these to callers. The
//! ingest path and the scheduling loops contain their errors locally: a bad
//! frame, a failed expert call or a dead subscriber is logged and counted,
//! never propagated into another camera's pipeline.

use thiserror::Error;

use crate::frame::CameraId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RouterError {
    #[error("unknown camera '{0}'")]
    UnknownCamera(CameraId),

    #[error("unknown expert '{0}'")]
    UnknownExpert(String),

    #[error("expert '{expert}' failed for camera '{camera_id}': {reason}")]
    ExpertInvocationFailure {
        camera_id: CameraId,
        expert: String,
        reason: String,
    },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("camera '{0}' has not sent a frame yet")]
    NoFrame(CameraId),

    #[error("subscriber {0} unreachable")]
    SubscriberUnreachable(u64),

    #[error("unknown subscriber {0}")]
    UnknownSubscriber(u64),

    #[error("processing scale {0} outside [0.1, 1.0]")]
    InvalidProcessingScale(f32),

    #[error("router is shutting down")]
    ShuttingDown,
}

impl RouterError {
    /// Stable snake_case identifier used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::UnknownCamera(_) => "unknown_camera",
            RouterError::UnknownExpert(_) => "unknown_expert",
            RouterError::ExpertInvocationFailure { .. } => "expert_invocation_failure",
            RouterError::MalformedMessage(_) => "malformed_message",
            RouterError::NoFrame(_) => "no_frame",
            RouterError::SubscriberUnreachable(_) => "subscriber_unreachable",
            RouterError::UnknownSubscriber(_) => "unknown_subscriber",
            RouterError::InvalidProcessingScale(_) => "invalid_processing_scale",
            RouterError::ShuttingDown => "shutting_down",
        }
    }
}

pub type RouterResult<T> = std::result::Result<T, RouterError>;
