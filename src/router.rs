//! The routing core as one handle.
//!
//! `Router` wires the connection registry, toggle store, aggregator,
//! publisher and dispatcher together, owns the liveness monitor and exposes
//! the ingest, administrative, query and push surfaces. Transports (the
//! WebSocket server, tests) talk only to this type.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::aggregate::{Aggregator, CameraState};
use crate::control::{ControlStore, DEFAULT_PROCESSING_SCALE};
use crate::dispatch::{DispatchStats, Dispatcher, SubmitOutcome};
use crate::error::{RouterError, RouterResult};
use crate::expert::ExpertRegistry;
use crate::frame::{CameraId, Frame};
use crate::liveness::{ConnectionRegistry, LivenessMonitor, LivenessSettings, Transition};
use crate::publish::{Publisher, SubscriberId, DEFAULT_QUEUE_DEPTH};

#[derive(Clone, Debug)]
pub struct RouterSettings {
    pub liveness: LivenessSettings,
    /// How often heartbeat timeouts and eviction are applied.
    pub liveness_sweep: Duration,
    pub subscriber_queue: usize,
    pub processing_scale: f32,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            liveness: LivenessSettings::default(),
            liveness_sweep: Duration::from_millis(500),
            subscriber_queue: DEFAULT_QUEUE_DEPTH,
            processing_scale: DEFAULT_PROCESSING_SCALE,
        }
    }
}

/// Process-wide counters returned by `get_stats`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterStats {
    pub connected_subscriber_count: usize,
    /// Sum of the current completion rates of every enabled (camera, expert) pair.
    pub aggregate_fps: f64,
    pub total_frames_processed: u64,
    pub uptime_secs: f64,
    pub frames_received: u64,
    pub frames_superseded: u64,
    pub failed_invocations: u64,
    pub cameras: usize,
    pub connected_cameras: usize,
    pub processing_scale: f32,
}

pub struct Router {
    experts: Arc<ExpertRegistry>,
    controls: Arc<ControlStore>,
    registry: Arc<ConnectionRegistry>,
    aggregator: Arc<Aggregator>,
    publisher: Arc<Publisher>,
    dispatcher: Arc<Dispatcher>,
    monitor: Mutex<Option<LivenessMonitor>>,
    started: Instant,
    shut_down: AtomicBool,
}

impl Router {
    pub fn new(experts: ExpertRegistry, settings: RouterSettings) -> Self {
        let experts = Arc::new(experts);
        let controls = Arc::new(ControlStore::from_registry(
            &experts,
            settings.processing_scale,
        ));
        let registry = Arc::new(ConnectionRegistry::new(settings.liveness.clone()));
        let publisher = Arc::new(Publisher::new(settings.subscriber_queue));
        let aggregator = Arc::new(Aggregator::new(
            registry.clone(),
            controls.clone(),
            publisher.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            experts.clone(),
            controls.clone(),
            registry.clone(),
            aggregator.clone(),
        ));

        let monitor = LivenessMonitor::spawn(registry.clone(), settings.liveness_sweep, {
            let aggregator = aggregator.clone();
            let dispatcher = dispatcher.clone();
            move |transitions| apply_transitions(&aggregator, &dispatcher, transitions)
        });

        log::info!(
            "router ready: experts [{}], heartbeat timeout {:?}",
            experts.names().join(", "),
            settings.liveness.heartbeat_timeout
        );
        Self {
            experts,
            controls,
            registry,
            aggregator,
            publisher,
            dispatcher,
            monitor: Mutex::new(Some(monitor)),
            started: Instant::now(),
            shut_down: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> RouterResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RouterError::ShuttingDown);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    /// Route one frame to one expert. Never waits on the expert.
    pub fn submit_frame(&self, expert: &str, frame: Frame) -> RouterResult<SubmitOutcome> {
        self.dispatcher.submit_frame(expert, frame)
    }

    /// Route one frame to several experts. Each gets its own reference to the payload.
    pub fn submit_frame_to<S: AsRef<str>>(
        &self,
        experts: &[S],
        frame: Frame,
    ) -> RouterResult<Vec<SubmitOutcome>> {
        self.dispatcher.submit_frame_to(experts, frame)
    }

    pub fn heartbeat(&self, camera: &CameraId) -> RouterResult<()> {
        self.ensure_running()?;
        if self.registry.heartbeat(camera) {
            log::info!("camera '{}' connected", camera);
            self.aggregator.touch(camera);
        }
        Ok(())
    }

    pub fn register_camera(&self, camera: &CameraId, name: Option<String>) -> RouterResult<()> {
        self.ensure_running()?;
        let renamed = name.is_some();
        if self.registry.register(camera, name) {
            log::info!("camera '{}' registered", camera);
            self.aggregator.touch(camera);
        } else if renamed {
            self.aggregator.touch(camera);
        }
        Ok(())
    }

    /// The camera's connection closed. Its state is kept.
    pub fn disconnect_camera(&self, camera: &CameraId) {
        if self.registry.disconnect(camera) {
            log::info!("camera '{}' disconnected", camera);
            self.aggregator.touch(camera);
        }
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Flip a model toggle. Takes effect before the next scheduling tick of every pair.
    pub fn set_expert_enabled(&self, expert: &str, enabled: bool) -> RouterResult<()> {
        let previous = self.controls.set_enabled(expert, enabled)?;
        if previous != enabled {
            log::info!(
                "expert '{}' {}",
                expert,
                if enabled { "enabled" } else { "disabled" }
            );
            self.aggregator.touch_all();
        }
        Ok(())
    }

    pub fn is_expert_enabled(&self, expert: &str) -> bool {
        self.controls.is_enabled(expert)
    }

    pub fn expert_names(&self) -> Vec<String> {
        self.experts.names()
    }

    pub fn set_processing_scale(&self, value: f32) -> RouterResult<f32> {
        let value = self.controls.set_processing_scale(value)?;
        log::info!("processing scale set to {:.2}", value);
        Ok(value)
    }

    pub fn processing_scale(&self) -> f32 {
        self.controls.processing_scale()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Known cameras in id order.
    pub fn list_cameras(&self) -> Vec<CameraId> {
        self.registry.cameras()
    }

    pub fn get_camera_state(&self, camera: &CameraId) -> RouterResult<CameraState> {
        self.aggregator.snapshot(camera)
    }

    pub fn snapshot_all(&self) -> Vec<CameraState> {
        self.aggregator.snapshot_all()
    }

    /// The camera's most recent frame together with its current state.
    ///
    /// The frame is whatever arrived last, regardless of which expert it was
    /// addressed to or whether that expert is enabled.
    pub fn latest_frame(&self, camera: &CameraId) -> RouterResult<(Frame, CameraState)> {
        let frame = match self.registry.latest_frame(camera) {
            Some(frame) => frame,
            None if self.registry.contains(camera) => {
                return Err(RouterError::NoFrame(camera.clone()))
            }
            None => return Err(RouterError::UnknownCamera(camera.clone())),
        };
        let state = self.aggregator.snapshot(camera)?;
        Ok((frame, state))
    }

    pub fn get_stats(&self) -> RouterStats {
        let dispatch: DispatchStats = self.dispatcher.stats();
        RouterStats {
            connected_subscriber_count: self.publisher.subscriber_count(),
            aggregate_fps: self.aggregator.aggregate_fps(),
            total_frames_processed: self.aggregator.processed_total(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            frames_received: self.registry.frames_received(),
            frames_superseded: dispatch.frames_superseded,
            failed_invocations: self.aggregator.failed_total(),
            cameras: self.registry.cameras().len(),
            connected_cameras: self.registry.connected_count(),
            processing_scale: self.controls.processing_scale(),
        }
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    // ------------------------------------------------------------------
    // Push surface
    // ------------------------------------------------------------------

    /// Open a subscriber. Pushed `CameraState`s arrive on the returned receiver.
    pub fn open_subscriber(
        &self,
        label: impl Into<String>,
    ) -> RouterResult<(SubscriberId, Receiver<Arc<CameraState>>)> {
        self.ensure_running()?;
        Ok(self.publisher.open(label))
    }

    /// Subscribe to `camera`. A known camera's current state is pushed immediately.
    pub fn subscribe(&self, subscriber: SubscriberId, camera: &CameraId) -> RouterResult<()> {
        self.ensure_running()?;
        self.aggregator.with_snapshot(camera, |state| {
            self.publisher
                .subscribe(subscriber, camera, state.map(Arc::new))
        })
    }

    pub fn unsubscribe(&self, subscriber: SubscriberId, camera: &CameraId) -> RouterResult<bool> {
        self.publisher.unsubscribe(subscriber, camera)
    }

    pub fn close_subscriber(&self, subscriber: SubscriberId) -> bool {
        self.publisher.close(subscriber)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop all scheduling loops and the liveness monitor, and drop every subscriber.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("router shutting down");
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut monitor) = monitor {
            monitor.stop();
        }
        self.dispatcher.shutdown();
        self.publisher.close_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Capture-time helper for callers without their own clock source.
    pub fn frame_now(camera: CameraId, payload: impl Into<Arc<[u8]>>) -> Frame {
        Frame::new(camera, payload, SystemTime::now())
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_transitions(aggregator: &Aggregator, dispatcher: &Dispatcher, transitions: Vec<Transition>) {
    for transition in transitions {
        match transition {
            Transition::Disconnected(camera) => {
                log::info!("camera '{}' timed out; marked disconnected", camera);
                aggregator.touch(&camera);
            }
            Transition::Evicted(camera) => {
                let stopped = dispatcher.remove_camera(&camera);
                aggregator.remove_camera(&camera);
                log::info!(
                    "camera '{}' evicted after extended disconnect ({} scheduling loop(s) stopped)",
                    camera,
                    stopped
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expert::{ExpertSchedule, FrameInfoExpert};
    use crate::liveness::ConnectionStatus;

    fn router() -> Router {
        let mut experts = ExpertRegistry::new();
        experts
            .register(
                FrameInfoExpert::new("frame_info"),
                ExpertSchedule::every(Duration::from_millis(10)),
            )
            .unwrap();
        Router::new(experts, RouterSettings::default())
    }

    fn cam(id: &str) -> CameraId {
        CameraId::new(id).unwrap()
    }

    #[test]
    fn unknown_camera_and_expert() {
        let router = router();
        assert_eq!(
            router.get_camera_state(&cam("nope")),
            Err(RouterError::UnknownCamera(cam("nope")))
        );
        assert_eq!(
            router.set_expert_enabled("nope", false),
            Err(RouterError::UnknownExpert("nope".to_string()))
        );
        assert!(router
            .submit_frame("nope", Router::frame_now(cam("cam0"), vec![1u8]))
            .is_err());
    }

    #[test]
    fn frame_produces_result_visible_in_state() {
        let router = router();
        router
            .submit_frame("frame_info", Router::frame_now(cam("cam0"), vec![7u8; 32]))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let state = loop {
            let state = router.get_camera_state(&cam("cam0")).unwrap();
            if state.result("frame_info").is_some() || Instant::now() > deadline {
                break state;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        let result = state.result("frame_info").expect("result");
        assert_eq!(result.payload.value()["bytes"], 32);
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(router.list_cameras(), vec![cam("cam0")]);
        assert_eq!(router.get_stats().total_frames_processed, 1);
    }

    #[test]
    fn subscribe_receives_current_state_then_updates() {
        let router = router();
        router.register_camera(&cam("cam0"), Some("Lobby".into())).unwrap();
        let (id, rx) = router.open_subscriber("viewer").unwrap();
        router.subscribe(id, &cam("cam0")).unwrap();
        let initial = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(initial.name.as_deref(), Some("Lobby"));

        router.set_expert_enabled("frame_info", false).unwrap();
        let update = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(update.enabled.get("frame_info"), Some(&false));
        assert!(update.revision > initial.revision);
        assert_eq!(router.get_stats().connected_subscriber_count, 1);
    }

    #[test]
    fn latest_frame_is_the_newest_submission() {
        let router = router();
        assert_eq!(
            router.latest_frame(&cam("ghost")).map(|(f, _)| f.payload().to_vec()),
            Err(RouterError::UnknownCamera(cam("ghost")))
        );
        router.heartbeat(&cam("cam0")).unwrap();
        assert_eq!(
            router.latest_frame(&cam("cam0")).map(|(f, _)| f.payload().to_vec()),
            Err(RouterError::NoFrame(cam("cam0")))
        );

        for byte in 1..=5u8 {
            router
                .submit_frame("frame_info", Router::frame_now(cam("cam0"), vec![byte; 16]))
                .unwrap();
        }
        let (frame, state) = router.latest_frame(&cam("cam0")).unwrap();
        assert_eq!(frame.payload(), &[5u8; 16]);
        assert_eq!(frame.camera_id(), &cam("cam0"));
        assert_eq!(state.frames_received, 5);

        // Frames for a disabled expert still count as the latest frame.
        router.set_expert_enabled("frame_info", false).unwrap();
        router
            .submit_frame("frame_info", Router::frame_now(cam("cam0"), vec![9u8; 4]))
            .unwrap();
        let (frame, _) = router.latest_frame(&cam("cam0")).unwrap();
        assert_eq!(frame.payload(), &[9u8; 4]);
    }

    #[test]
    fn processing_scale_bounds() {
        let router = router();
        assert_eq!(router.processing_scale(), 0.5);
        assert_eq!(router.set_processing_scale(0.25), Ok(0.25));
        assert_eq!(
            router.set_processing_scale(1.5),
            Err(RouterError::InvalidProcessingScale(1.5))
        );
        assert_eq!(router.processing_scale(), 0.25);
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let router = router();
        router.shutdown();
        assert!(router.is_shut_down());
        assert_eq!(router.heartbeat(&cam("cam0")), Err(RouterError::ShuttingDown));
        assert!(router.open_subscriber("late").is_err());
        router.shutdown();
    }
}
