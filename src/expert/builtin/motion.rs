use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::expert::backend::Expert;
use crate::expert::output::ExpertOutput;
use crate::frame::{CameraId, Frame};

/// Change detector over encoded payloads.
///
/// Hashes each frame and compares it with the previous frame seen for the
/// same camera. Cheap enough to run at full cadence on every camera. History
/// for a camera is dropped when its scheduling loop stops.
pub struct MotionExpert {
    name: String,
    last_hash: Mutex<HashMap<CameraId, [u8; 32]>>,
}

#[derive(Serialize)]
struct MotionReport {
    motion: bool,
    confidence: f32,
    digest: String,
}

impl MotionExpert {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_hash: Mutex::new(HashMap::new()),
        }
    }

    fn history(&self) -> std::sync::MutexGuard<'_, HashMap<CameraId, [u8; 32]>> {
        self.last_hash.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of cameras with a remembered digest.
    pub fn tracked_cameras(&self) -> usize {
        self.history().len()
    }
}

impl Default for MotionExpert {
    fn default() -> Self {
        Self::new("motion")
    }
}

impl Expert for MotionExpert {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, frame: &Frame) -> Result<ExpertOutput> {
        let current_hash: [u8; 32] = Sha256::digest(frame.payload()).into();

        let previous = self
            .history()
            .insert(frame.camera_id().clone(), current_hash);
        let motion = match previous {
            Some(prev) => prev != current_hash,
            None => false,
        };

        ExpertOutput::json(&MotionReport {
            motion,
            confidence: if motion { 0.85 } else { 0.0 },
            digest: hex::encode(&current_hash[..8]),
        })
    }

    fn forget_camera(&self, camera: &CameraId) {
        self.history().remove(camera);
    }
}
