//! Result aggregation.
//!
//! The aggregator owns every (camera, expert) result record: the latest
//! result, the rolling completion rate and failure counters. It merges them
//! with liveness and toggle state into `CameraState` and hands each change
//! to the publisher.
//!
//! Lock order is aggregator -> connection registry -> publisher. Building a
//! snapshot and pushing it happen under the aggregator lock so pushes for a
//! camera leave in revision order; both steps are constant-time.
//!
//! Records exist only for cameras the registry knows. A result that lands
//! after its camera was evicted is discarded.

mod fps;
mod state;

pub use fps::{round_fps, FpsWindow, DEFAULT_FPS_SAMPLES, DEFAULT_FPS_WINDOW};
pub use state::{CameraState, ExpertReport, ExpertResult, FailureSummary};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use crate::control::ControlStore;
use crate::error::{RouterError, RouterResult};
use crate::expert::ExpertOutput;
use crate::frame::{epoch_secs, CameraId};
use crate::liveness::{ConnectionRegistry, ConnectionStatus};
use crate::publish::Publisher;

struct PairRecord {
    latest: Option<ExpertResult>,
    fps: FpsWindow,
    sequence: u64,
    failures: Option<FailureSummary>,
}

#[derive(Default)]
struct CameraResults {
    experts: BTreeMap<String, PairRecord>,
    revision: u64,
}

pub struct Aggregator {
    cameras: Mutex<BTreeMap<CameraId, CameraResults>>,
    registry: Arc<ConnectionRegistry>,
    controls: Arc<ControlStore>,
    publisher: Arc<Publisher>,
    fps_samples: usize,
    fps_window: Duration,
    processed_total: AtomicU64,
    failed_total: AtomicU64,
}

impl Aggregator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        controls: Arc<ControlStore>,
        publisher: Arc<Publisher>,
    ) -> Self {
        let fps_samples = registry.settings().fps_samples;
        let fps_window = registry.settings().fps_window;
        Self {
            cameras: Mutex::new(BTreeMap::new()),
            registry,
            controls,
            publisher,
            fps_samples,
            fps_window,
            processed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<CameraId, CameraResults>> {
        self.cameras.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pair<'a>(&self, results: &'a mut CameraResults, expert: &str) -> &'a mut PairRecord {
        results
            .experts
            .entry(expert.to_string())
            .or_insert_with(|| PairRecord {
                latest: None,
                fps: FpsWindow::new(self.fps_samples, self.fps_window),
                sequence: 0,
                failures: None,
            })
    }

    /// Entry for `camera`, or `None` once the registry has forgotten it.
    fn entry<'a>(
        &self,
        cameras: &'a mut BTreeMap<CameraId, CameraResults>,
        camera: &CameraId,
    ) -> Option<&'a mut CameraResults> {
        if !self.registry.contains(camera) {
            cameras.remove(camera);
            return None;
        }
        Some(cameras.entry(camera.clone()).or_default())
    }

    /// Overwrite the latest result for (camera, expert), update its rate and publish.
    /// Returns `None` when the camera is no longer known.
    pub fn record_result(
        &self,
        camera: &CameraId,
        expert: &str,
        output: ExpertOutput,
        frame_captured_at: SystemTime,
        latency: Duration,
    ) -> Option<ExpertResult> {
        let now = Instant::now();
        let mut cameras = self.lock();
        let Some(results) = self.entry(&mut cameras, camera) else {
            log::debug!("dropping '{}' result for evicted camera '{}'", expert, camera);
            return None;
        };
        results.revision += 1;
        let record = self.pair(results, expert);
        record.fps.record(now);
        record.sequence += 1;
        if let Some(failures) = record.failures.as_mut() {
            failures.consecutive = 0;
        }
        let result = ExpertResult {
            camera_id: camera.clone(),
            expert: expert.to_string(),
            payload: output,
            produced_at: epoch_secs(SystemTime::now()),
            frame_captured_at: epoch_secs(frame_captured_at),
            sequence: record.sequence,
            latency_ms: latency.as_secs_f64() * 1000.0,
            fps: round_fps(record.fps.fps(now)),
        };
        record.latest = Some(result.clone());
        self.processed_total.fetch_add(1, Ordering::Relaxed);
        self.publish_locked(&cameras, camera);
        Some(result)
    }

    /// Count a failed invocation. The previous result stays visible.
    pub fn record_failure(&self, camera: &CameraId, expert: &str, reason: &str) {
        let mut cameras = self.lock();
        let Some(results) = self.entry(&mut cameras, camera) else {
            return;
        };
        results.revision += 1;
        let record = self.pair(results, expert);
        let failures = record.failures.get_or_insert_with(FailureSummary::default);
        failures.consecutive += 1;
        failures.total += 1;
        failures.last_error = reason.to_string();
        failures.last_failed_at = epoch_secs(SystemTime::now());
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        self.publish_locked(&cameras, camera);
    }

    /// Push the current state of `camera` after a liveness or toggle change.
    pub fn touch(&self, camera: &CameraId) {
        let mut cameras = self.lock();
        if let Some(results) = self.entry(&mut cameras, camera) {
            results.revision += 1;
            self.publish_locked(&cameras, camera);
        }
    }

    /// Push every known camera, e.g. after an expert toggle.
    pub fn touch_all(&self) {
        let mut cameras = self.lock();
        for results in cameras.values_mut() {
            results.revision += 1;
        }
        let ids: Vec<CameraId> = cameras.keys().cloned().collect();
        for id in ids {
            self.publish_locked(&cameras, &id);
        }
    }

    pub fn remove_camera(&self, camera: &CameraId) {
        self.lock().remove(camera);
    }

    fn publish_locked(&self, cameras: &BTreeMap<CameraId, CameraResults>, camera: &CameraId) {
        if !self.publisher.has_subscribers(camera) {
            return;
        }
        if let Some(state) = self.build(cameras, camera) {
            self.publisher.publish(camera, Arc::new(state));
        }
    }

    fn build(
        &self,
        cameras: &BTreeMap<CameraId, CameraResults>,
        camera: &CameraId,
    ) -> Option<CameraState> {
        let liveness = self.registry.snapshot(camera);
        let entry = cameras.get(camera);
        if liveness.is_none() && entry.is_none() {
            return None;
        }
        let now = Instant::now();
        let enabled = self.controls.toggles();
        let mut results = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (name, on) in &enabled {
            if !on {
                results.insert(name.clone(), ExpertReport::Disabled);
                continue;
            }
            let Some(record) = entry.and_then(|e| e.experts.get(name)) else {
                continue;
            };
            if let Some(latest) = &record.latest {
                let mut latest = latest.clone();
                latest.fps = round_fps(record.fps.fps(now));
                results.insert(name.clone(), ExpertReport::Ready(latest));
            }
            if let Some(summary) = &record.failures {
                failures.insert(name.clone(), summary.clone());
            }
        }
        let (status, name, last_seen, frames_received, ingest_fps) = match liveness {
            Some(l) => (
                l.status,
                l.name,
                epoch_secs(l.last_seen),
                l.frames_received,
                round_fps(l.ingest_fps),
            ),
            None => (ConnectionStatus::Disconnected, None, 0.0, 0, 0.0),
        };
        Some(CameraState {
            camera_id: camera.clone(),
            name,
            status,
            last_seen,
            frames_received,
            ingest_fps,
            results,
            enabled,
            failures,
            revision: entry.map(|e| e.revision).unwrap_or(0),
        })
    }

    /// Current merged view of one camera.
    pub fn snapshot(&self, camera: &CameraId) -> RouterResult<CameraState> {
        let cameras = self.lock();
        self.build(&cameras, camera)
            .ok_or_else(|| RouterError::UnknownCamera(camera.clone()))
    }

    /// Current merged view of every known camera, ordered by camera id.
    pub fn snapshot_all(&self) -> Vec<CameraState> {
        let cameras = self.lock();
        let mut ids = self.registry.cameras();
        for id in cameras.keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids.sort();
        ids.iter()
            .filter_map(|id| self.build(&cameras, id))
            .collect()
    }

    /// Run `f` with the current snapshot while no result can be recorded,
    /// so an initial push cannot overtake a concurrent update.
    pub fn with_snapshot<R>(&self, camera: &CameraId, f: impl FnOnce(Option<CameraState>) -> R) -> R {
        let cameras = self.lock();
        f(self.build(&cameras, camera))
    }

    /// Sum of the current rates of all enabled experts across all cameras.
    pub fn aggregate_fps(&self) -> f64 {
        let now = Instant::now();
        let cameras = self.lock();
        let total: f64 = cameras
            .values()
            .flat_map(|results| results.experts.iter())
            .filter(|(name, _)| self.controls.is_enabled(name))
            .map(|(_, record)| record.fps.fps(now))
            .sum();
        round_fps(total)
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::Relaxed)
    }

    pub fn failed_total(&self) -> u64 {
        self.failed_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expert::{ExpertRegistry, ExpertSchedule, FrameInfoExpert};
    use crate::frame::Frame;
    use crate::liveness::{LivenessSettings, Transition};
    use serde_json::json;

    fn setup() -> (Aggregator, Arc<ConnectionRegistry>, Arc<ControlStore>) {
        let mut experts = ExpertRegistry::new();
        experts
            .register(FrameInfoExpert::new("detect"), ExpertSchedule::per_second(5.0))
            .unwrap();
        experts
            .register(FrameInfoExpert::new("caption"), ExpertSchedule::per_second(1.0 / 3.0))
            .unwrap();
        let registry = Arc::new(ConnectionRegistry::new(LivenessSettings::default()));
        let controls = Arc::new(ControlStore::from_registry(&experts, 0.5));
        let publisher = Arc::new(Publisher::new(8));
        let agg = Aggregator::new(registry.clone(), controls.clone(), publisher);
        (agg, registry, controls)
    }

    fn cam(id: &str) -> CameraId {
        CameraId::new(id).unwrap()
    }

    fn arrive(registry: &ConnectionRegistry, id: &str) {
        registry.record_frame(&Frame::new(cam(id), vec![0u8; 4], SystemTime::now()));
    }

    #[test]
    fn unknown_camera_snapshot_is_an_error() {
        let (agg, _, _) = setup();
        assert_eq!(
            agg.snapshot(&cam("ghost")),
            Err(RouterError::UnknownCamera(cam("ghost")))
        );
    }

    #[test]
    fn latest_result_wins_and_missing_means_pending() {
        let (agg, registry, _) = setup();
        arrive(&registry, "cam0");
        for i in 1..=5u64 {
            agg.record_result(
                &cam("cam0"),
                "detect",
                ExpertOutput::new(json!({ "n": i })),
                SystemTime::now(),
                Duration::from_millis(3),
            );
        }
        let state = agg.snapshot(&cam("cam0")).unwrap();
        let detect = state.result("detect").expect("detect result");
        assert_eq!(detect.sequence, 5);
        assert_eq!(detect.payload.value()["n"], 5);
        assert!(state.results.get("caption").is_none());
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(agg.processed_total(), 5);
    }

    #[test]
    fn disabled_expert_reports_placeholder_and_zero_fps() {
        let (agg, registry, controls) = setup();
        arrive(&registry, "cam0");
        agg.record_result(
            &cam("cam0"),
            "detect",
            ExpertOutput::default(),
            SystemTime::now(),
            Duration::ZERO,
        );
        controls.set_enabled("detect", false).unwrap();
        let state = agg.snapshot(&cam("cam0")).unwrap();
        assert_eq!(state.results.get("detect"), Some(&ExpertReport::Disabled));
        assert_eq!(state.expert_fps("detect"), 0.0);
        assert_eq!(state.enabled.get("detect"), Some(&false));

        controls.set_enabled("detect", true).unwrap();
        let state = agg.snapshot(&cam("cam0")).unwrap();
        assert!(state.result("detect").is_some());
    }

    #[test]
    fn failure_keeps_stale_result_visible() {
        let (agg, registry, _) = setup();
        arrive(&registry, "cam0");
        agg.record_result(
            &cam("cam0"),
            "caption",
            ExpertOutput::new(json!({ "caption": "a person at a door" })),
            SystemTime::now(),
            Duration::ZERO,
        );
        agg.record_failure(&cam("cam0"), "caption", "model timeout");
        agg.record_failure(&cam("cam0"), "caption", "model timeout");

        let state = agg.snapshot(&cam("cam0")).unwrap();
        assert_eq!(
            state.result("caption").unwrap().payload.value()["caption"],
            "a person at a door"
        );
        let failures = &state.failures["caption"];
        assert_eq!(failures.consecutive, 2);
        assert_eq!(failures.total, 2);

        agg.record_result(
            &cam("cam0"),
            "caption",
            ExpertOutput::default(),
            SystemTime::now(),
            Duration::ZERO,
        );
        let state = agg.snapshot(&cam("cam0")).unwrap();
        assert_eq!(state.failures["caption"].consecutive, 0);
        assert_eq!(agg.failed_total(), 2);
    }

    #[test]
    fn snapshot_all_is_ordered_and_includes_frameless_cameras() {
        let (agg, registry, _) = setup();
        registry.register(&cam("b"), None);
        arrive(&registry, "a");
        registry.heartbeat(&cam("c"));
        let ids: Vec<String> = agg
            .snapshot_all()
            .into_iter()
            .map(|s| s.camera_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn late_result_for_evicted_camera_is_dropped() {
        let (agg, registry, _) = setup();
        arrive(&registry, "cam0");
        agg.record_failure(&cam("cam0"), "detect", "busy");
        registry.disconnect(&cam("cam0"));
        let evicted = registry.sweep(Instant::now() + Duration::from_secs(2 * 60 * 60));
        assert_eq!(evicted, vec![Transition::Evicted(cam("cam0"))]);

        // A worker finishing between registry eviction and aggregator removal.
        assert!(agg
            .record_result(
                &cam("cam0"),
                "detect",
                ExpertOutput::default(),
                SystemTime::now(),
                Duration::ZERO,
            )
            .is_none());
        agg.record_failure(&cam("cam0"), "detect", "late");
        agg.touch(&cam("cam0"));

        assert_eq!(
            agg.snapshot(&cam("cam0")),
            Err(RouterError::UnknownCamera(cam("cam0")))
        );
        assert!(agg.snapshot_all().is_empty());
        assert_eq!(agg.processed_total(), 0);
        assert_eq!(agg.failed_total(), 1);
    }
}
