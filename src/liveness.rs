//! Camera connection liveness.
//!
//! Tracks connect, heartbeat and disconnect per camera independently of frame
//! content. Per camera the state cycles `Unknown -> Connected -> Disconnected
//! -> Connected ...`; `Unknown` is simply "not in the registry". Every frame or
//! heartbeat resets the camera's liveness timer. Reconnecting reuses the
//! existing entry, so counters and the merged camera state carry over.
//!
//! The registry also keeps the most recent frame each camera sent, whatever
//! expert it was addressed to, so it can be served on demand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::aggregate::FpsWindow;
use crate::frame::{CameraId, Frame};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Clone, Debug)]
pub struct LivenessSettings {
    /// No frame or heartbeat for this long marks a camera disconnected.
    pub heartbeat_timeout: Duration,
    /// Disconnected this long removes the camera entirely. `None` keeps it forever.
    pub eviction_after: Option<Duration>,
    pub fps_samples: usize,
    pub fps_window: Duration,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(10),
            eviction_after: Some(Duration::from_secs(60 * 60)),
            fps_samples: crate::aggregate::DEFAULT_FPS_SAMPLES,
            fps_window: crate::aggregate::DEFAULT_FPS_WINDOW,
        }
    }
}

/// Status change detected by a sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Disconnected(CameraId),
    Evicted(CameraId),
}

/// Point-in-time liveness of one camera.
#[derive(Clone, Debug)]
pub struct LivenessSnapshot {
    pub status: ConnectionStatus,
    pub name: Option<String>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub frames_received: u64,
    pub ingest_fps: f64,
}

struct CameraLiveness {
    status: ConnectionStatus,
    name: Option<String>,
    first_seen: SystemTime,
    last_seen: SystemTime,
    last_activity: Instant,
    disconnected_at: Option<Instant>,
    ingest: FpsWindow,
    latest_frame: Option<Frame>,
}

impl CameraLiveness {
    fn new(settings: &LivenessSettings, now: Instant) -> Self {
        let wall = SystemTime::now();
        Self {
            status: ConnectionStatus::Connected,
            name: None,
            first_seen: wall,
            last_seen: wall,
            last_activity: now,
            disconnected_at: None,
            ingest: FpsWindow::new(settings.fps_samples, settings.fps_window),
            latest_frame: None,
        }
    }

    fn effective_status(&self, now: Instant, timeout: Duration) -> ConnectionStatus {
        match self.status {
            ConnectionStatus::Connected
                if now.saturating_duration_since(self.last_activity) > timeout =>
            {
                ConnectionStatus::Disconnected
            }
            status => status,
        }
    }
}

pub struct ConnectionRegistry {
    settings: LivenessSettings,
    cameras: Mutex<BTreeMap<CameraId, CameraLiveness>>,
}

impl ConnectionRegistry {
    pub fn new(settings: LivenessSettings) -> Self {
        Self {
            settings,
            cameras: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &LivenessSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<CameraId, CameraLiveness>> {
        self.cameras.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark activity for `camera`, creating it on first contact.
    /// Returns true when the camera (re)entered `Connected`.
    fn touch(&self, camera: &CameraId, frame: Option<&Frame>) -> bool {
        let now = Instant::now();
        let timeout = self.settings.heartbeat_timeout;
        let mut cameras = self.lock();
        let mut created = false;
        let entry = cameras.entry(camera.clone()).or_insert_with(|| {
            created = true;
            CameraLiveness::new(&self.settings, now)
        });
        let was = entry.effective_status(now, timeout);
        entry.status = ConnectionStatus::Connected;
        entry.last_activity = now;
        entry.last_seen = SystemTime::now();
        entry.disconnected_at = None;
        if let Some(frame) = frame {
            entry.ingest.record(now);
            entry.latest_frame = Some(frame.clone());
        }
        created || was == ConnectionStatus::Disconnected
    }

    /// Explicit registration, e.g. a camera announcing itself before its first frame.
    pub fn register(&self, camera: &CameraId, name: Option<String>) -> bool {
        let connected = self.touch(camera, None);
        if let Some(name) = name {
            if let Some(entry) = self.lock().get_mut(camera) {
                entry.name = Some(name);
            }
        }
        connected
    }

    pub fn heartbeat(&self, camera: &CameraId) -> bool {
        self.touch(camera, None)
    }

    /// Count a frame arrival and keep it as the camera's latest frame.
    pub fn record_frame(&self, frame: &Frame) -> bool {
        self.touch(frame.camera_id(), Some(frame))
    }

    /// Most recent frame received from `camera`. Shares the payload.
    pub fn latest_frame(&self, camera: &CameraId) -> Option<Frame> {
        self.lock()
            .get(camera)
            .and_then(|entry| entry.latest_frame.clone())
    }

    /// Explicit disconnect (the camera's connection closed). Returns true on transition.
    pub fn disconnect(&self, camera: &CameraId) -> bool {
        let now = Instant::now();
        let mut cameras = self.lock();
        match cameras.get_mut(camera) {
            Some(entry) if entry.status == ConnectionStatus::Connected => {
                entry.status = ConnectionStatus::Disconnected;
                entry.disconnected_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Apply heartbeat timeouts and eviction as of `now`.
    pub fn sweep(&self, now: Instant) -> Vec<Transition> {
        let timeout = self.settings.heartbeat_timeout;
        let mut transitions = Vec::new();
        let mut cameras = self.lock();
        for (id, entry) in cameras.iter_mut() {
            if entry.status == ConnectionStatus::Connected
                && entry.effective_status(now, timeout) == ConnectionStatus::Disconnected
            {
                entry.status = ConnectionStatus::Disconnected;
                entry.disconnected_at = Some(entry.last_activity + timeout);
                transitions.push(Transition::Disconnected(id.clone()));
            }
        }
        if let Some(evict_after) = self.settings.eviction_after {
            let expired: Vec<CameraId> = cameras
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .disconnected_at
                        .map(|at| now.saturating_duration_since(at) > evict_after)
                        .unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                cameras.remove(&id);
                transitions.push(Transition::Evicted(id));
            }
        }
        transitions
    }

    pub fn snapshot(&self, camera: &CameraId) -> Option<LivenessSnapshot> {
        let now = Instant::now();
        let cameras = self.lock();
        cameras.get(camera).map(|entry| LivenessSnapshot {
            status: entry.effective_status(now, self.settings.heartbeat_timeout),
            name: entry.name.clone(),
            first_seen: entry.first_seen,
            last_seen: entry.last_seen,
            frames_received: entry.ingest.total(),
            ingest_fps: entry.ingest.fps(now),
        })
    }

    pub fn status(&self, camera: &CameraId) -> Option<ConnectionStatus> {
        let now = Instant::now();
        self.lock()
            .get(camera)
            .map(|entry| entry.effective_status(now, self.settings.heartbeat_timeout))
    }

    /// Known cameras in id order.
    pub fn cameras(&self) -> Vec<CameraId> {
        self.lock().keys().cloned().collect()
    }

    pub fn contains(&self, camera: &CameraId) -> bool {
        self.lock().contains_key(camera)
    }

    pub fn connected_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|entry| {
                entry.effective_status(now, self.settings.heartbeat_timeout)
                    == ConnectionStatus::Connected
            })
            .count()
    }

    pub fn frames_received(&self) -> u64 {
        self.lock().values().map(|entry| entry.ingest.total()).sum()
    }
}

/// Background thread that periodically sweeps the registry.
pub struct LivenessMonitor {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    pub fn spawn<F>(registry: Arc<ConnectionRegistry>, every: Duration, on_transitions: F) -> Self
    where
        F: Fn(Vec<Transition>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let join = std::thread::Builder::new()
            .name("liveness".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(every) {
                    Err(RecvTimeoutError::Timeout) => {
                        let transitions = registry.sweep(Instant::now());
                        if !transitions.is_empty() {
                            on_transitions(transitions);
                        }
                    }
                    _ => break,
                }
            });
        let join = match join {
            Ok(join) => Some(join),
            Err(err) => {
                log::error!("failed to start liveness monitor: {}", err);
                None
            }
        };
        Self {
            stop: Some(stop_tx),
            join,
        }
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("liveness monitor panicked");
            }
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
