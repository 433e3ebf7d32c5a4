//! Frames and the latest-wins expert slot.
//!
//! - `CameraId`: stable opaque identifier, accepted on the wire as a string or integer.
//! - `Frame`: immutable encoded image plus capture time. Cloning shares the payload.
//! - `ExpertSlot`: single-frame buffer per (camera, expert) pair. A new arrival
//!   replaces an unconsumed one; the slot never holds more than one frame.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{RouterError, RouterResult};

const MAX_CAMERA_ID_LEN: usize = 128;

// ----------------------------------------------------------------------------
// CameraId
// ----------------------------------------------------------------------------

/// Opaque camera identifier.
///
/// The wire accepts a string or a non-negative integer and normalizes both to
/// the decimal string, so `3` and `"3"` name the same camera. Camera clients
/// pick one form per camera; ids are always echoed back as strings.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(id: impl Into<String>) -> RouterResult<Self> {
        let id = id.into();
        validate_camera_id(&id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for CameraId {
    fn from(index: u64) -> Self {
        Self(index.to_string())
    }
}

impl Serialize for CameraId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CameraId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Index(u64),
        }
        let id = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text,
            Raw::Index(index) => index.to_string(),
        };
        CameraId::new(id).map_err(serde::de::Error::custom)
    }
}

/// Camera ids are opaque but must be printable and bounded.
pub fn validate_camera_id(id: &str) -> RouterResult<()> {
    if id.trim().is_empty() {
        return Err(RouterError::MalformedMessage(
            "camera_id must not be empty".to_string(),
        ));
    }
    if id.len() > MAX_CAMERA_ID_LEN {
        return Err(RouterError::MalformedMessage(format!(
            "camera_id longer than {} bytes",
            MAX_CAMERA_ID_LEN
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(RouterError::MalformedMessage(
            "camera_id contains control characters".to_string(),
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Encoded image handed to experts. Resolution and codec are opaque here.
#[derive(Clone, Debug)]
pub struct Frame {
    camera_id: CameraId,
    payload: Arc<[u8]>,
    capture_time: SystemTime,
    received_at: Instant,
}

impl Frame {
    pub fn new(camera_id: CameraId, payload: impl Into<Arc<[u8]>>, capture_time: SystemTime) -> Self {
        Self {
            camera_id,
            payload: payload.into(),
            capture_time,
            received_at: Instant::now(),
        }
    }

    pub fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn capture_time(&self) -> SystemTime {
        self.capture_time
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Wall-clock age relative to capture. Clock skew in the future reads as zero.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.capture_time)
            .unwrap_or_default()
    }
}

/// Convert wire seconds-since-epoch into a `SystemTime`.
pub fn capture_time_from_secs(secs: f64) -> RouterResult<SystemTime> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .and_then(|offset| UNIX_EPOCH.checked_add(offset))
        .ok_or_else(|| {
            RouterError::MalformedMessage(format!(
                "capture_time {} is not a valid epoch timestamp",
                secs
            ))
        })
}

pub fn epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ----------------------------------------------------------------------------
// ExpertSlot
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SlotState {
    pending: Option<Frame>,
    closed: bool,
    superseded: u64,
}

/// Outcome of waiting on a slot.
#[derive(Debug)]
pub enum SlotWait {
    Frame(Frame),
    TimedOut,
    Closed,
}

/// Single-frame latest-wins buffer keyed by (camera, expert).
///
/// The intake path only ever does `put`; the pair's scheduling loop only ever
/// takes. The lock is held for a pointer swap, never across an expert call.
#[derive(Default)]
pub struct ExpertSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl ExpertSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `frame`, replacing any unconsumed frame. Returns true when a
    /// previous frame was discarded. Frames put into a closed slot are dropped.
    pub fn put(&self, frame: Frame) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let replaced = state.pending.replace(frame).is_some();
        if replaced {
            state.superseded += 1;
        }
        drop(state);
        self.ready.notify_all();
        replaced
    }

    /// Take the pending frame, leaving the slot empty.
    pub fn take(&self) -> Option<Frame> {
        self.lock().pending.take()
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Number of frames discarded because a newer one arrived before pickup.
    pub fn superseded(&self) -> u64 {
        self.lock().superseded
    }

    /// Wait up to `timeout` for a frame and take it.
    pub fn wait_take(&self, timeout: Duration) -> SlotWait {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return SlotWait::Closed;
            }
            if let Some(frame) = state.pending.take() {
                return SlotWait::Frame(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return SlotWait::TimedOut;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Sleep until `deadline` unless the slot is closed first. Returns true when closed.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut state = self.lock();
        loop {
            if state.closed {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Close the slot: drops the pending frame and wakes the scheduling loop.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.pending = None;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
