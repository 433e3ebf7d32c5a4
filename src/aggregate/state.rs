use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::expert::ExpertOutput;
use crate::frame::CameraId;
use crate::liveness::ConnectionStatus;

/// Output of one successful expert invocation, as merged into `CameraState`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpertResult {
    pub camera_id: CameraId,
    pub expert: String,
    pub payload: ExpertOutput,
    /// Seconds since the Unix epoch when the invocation completed.
    pub produced_at: f64,
    /// Capture time of the frame the expert consumed.
    pub frame_captured_at: f64,
    /// 1-based count of results for this (camera, expert) pair.
    pub sequence: u64,
    /// Invocation wall time in milliseconds.
    pub latency_ms: f64,
    /// Rolling completions per second for this pair.
    pub fps: f64,
}

/// Per-expert entry in `CameraState::results`.
///
/// A missing entry means the expert is enabled but has produced nothing yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExpertReport {
    Ready(ExpertResult),
    /// Expert switched off by the toggle. Never carries a stale result.
    Disabled,
}

impl ExpertReport {
    pub fn result(&self) -> Option<&ExpertResult> {
        match self {
            ExpertReport::Ready(result) => Some(result),
            ExpertReport::Disabled => None,
        }
    }

    pub fn fps(&self) -> f64 {
        self.result().map(|r| r.fps).unwrap_or(0.0)
    }
}

/// Failure bookkeeping for a (camera, expert) pair.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    /// Failures since the last success. Zero means the expert is healthy again.
    pub consecutive: u64,
    pub total: u64,
    pub last_error: String,
    pub last_failed_at: f64,
}

/// Merged, queryable view of one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraState {
    pub camera_id: CameraId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: ConnectionStatus,
    /// Seconds since the Unix epoch of the last frame or heartbeat.
    pub last_seen: f64,
    pub frames_received: u64,
    pub ingest_fps: f64,
    pub results: BTreeMap<String, ExpertReport>,
    pub enabled: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<String, FailureSummary>,
    /// Increases on every change recorded for this camera.
    pub revision: u64,
}

impl CameraState {
    pub fn result(&self, expert: &str) -> Option<&ExpertResult> {
        self.results.get(expert).and_then(ExpertReport::result)
    }

    pub fn expert_fps(&self, expert: &str) -> f64 {
        self.results.get(expert).map(ExpertReport::fps).unwrap_or(0.0)
    }
}
