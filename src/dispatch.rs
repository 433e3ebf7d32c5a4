//! Frame intake and expert scheduling.
//!
//! `submit_frame` never waits on an expert: it marks camera activity, checks
//! the toggle and swaps the frame into the (camera, expert) slot. Each pair
//! gets its own scheduling thread, created on the first frame addressed to
//! it. The thread waits until the pair's interval has elapsed since the
//! previous invocation *completed*, takes whatever frame is in the slot and
//! invokes the expert. Frames that arrive faster than the expert's cadence
//! are overwritten in the slot and never reported individually.
//!
//! Within a pair, invocations are strictly sequential. Pairs are independent.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::aggregate::Aggregator;
use crate::control::ControlStore;
use crate::error::{RouterError, RouterResult};
use crate::expert::{Expert, ExpertOutput, ExpertRegistry, ExpertSchedule};
use crate::frame::{CameraId, ExpertSlot, Frame, SlotWait};
use crate::liveness::ConnectionRegistry;

/// How long an idle scheduling loop waits for a frame before re-checking its slot.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// What happened to a submitted frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stored in the slot. `superseded` is true when an unconsumed frame was replaced.
    Queued { superseded: bool },
    /// The expert is toggled off; the frame was dropped without error.
    Disabled,
}

type PairKey = (CameraId, String);

struct PairHandle {
    slot: Arc<ExpertSlot>,
    join: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct DispatchCounters {
    submitted: AtomicU64,
    dropped_disabled: AtomicU64,
    superseded: AtomicU64,
    invocations: AtomicU64,
}

/// Snapshot of dispatcher counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub frames_submitted: u64,
    pub frames_dropped_disabled: u64,
    pub frames_superseded: u64,
    pub invocations: u64,
    pub active_pairs: usize,
}

pub struct Dispatcher {
    experts: Arc<ExpertRegistry>,
    controls: Arc<ControlStore>,
    registry: Arc<ConnectionRegistry>,
    aggregator: Arc<Aggregator>,
    pairs: Mutex<HashMap<PairKey, PairHandle>>,
    counters: Arc<DispatchCounters>,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        experts: Arc<ExpertRegistry>,
        controls: Arc<ControlStore>,
        registry: Arc<ConnectionRegistry>,
        aggregator: Arc<Aggregator>,
    ) -> Self {
        Self {
            experts,
            controls,
            registry,
            aggregator,
            pairs: Mutex::new(HashMap::new()),
            counters: Arc::new(DispatchCounters::default()),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PairKey, PairHandle>> {
        self.pairs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route `frame` to `expert` for the frame's camera.
    ///
    /// Fails only for an unregistered expert (or during shutdown). A disabled
    /// expert drops the frame silently.
    pub fn submit_frame(&self, expert: &str, frame: Frame) -> RouterResult<SubmitOutcome> {
        let mut outcomes = self.submit_frame_to(&[expert], frame)?;
        Ok(outcomes.pop().unwrap_or(SubmitOutcome::Disabled))
    }

    /// Route one frame to several experts; each slot shares the payload.
    ///
    /// Every target is checked before anything is routed, so an unknown name
    /// rejects the whole frame. The frame counts once toward camera liveness.
    pub fn submit_frame_to<S: AsRef<str>>(
        &self,
        experts: &[S],
        frame: Frame,
    ) -> RouterResult<Vec<SubmitOutcome>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RouterError::ShuttingDown);
        }
        let targets = experts
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.experts
                    .get(name)
                    .map(|entry| (name, entry))
                    .ok_or_else(|| RouterError::UnknownExpert(name.to_string()))
            })
            .collect::<RouterResult<Vec<_>>>()?;

        let camera = frame.camera_id().clone();
        if self.registry.record_frame(&frame) {
            log::info!("camera '{}' connected", camera);
            self.aggregator.touch(&camera);
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let mut outcomes = Vec::with_capacity(targets.len());
        for (name, entry) in targets {
            if !self.controls.is_enabled(name) {
                self.counters.dropped_disabled.fetch_add(1, Ordering::Relaxed);
                log::trace!("expert '{}' disabled; dropping frame for '{}'", name, camera);
                outcomes.push(SubmitOutcome::Disabled);
                continue;
            }
            let slot = self.slot_for(&camera, name, entry.expert.clone(), entry.schedule)?;
            let superseded = slot.put(frame.clone());
            if superseded {
                self.counters.superseded.fetch_add(1, Ordering::Relaxed);
            }
            outcomes.push(SubmitOutcome::Queued { superseded });
        }
        Ok(outcomes)
    }

    fn slot_for(
        &self,
        camera: &CameraId,
        expert_name: &str,
        expert: Arc<dyn Expert>,
        schedule: ExpertSchedule,
    ) -> RouterResult<Arc<ExpertSlot>> {
        let key = (camera.clone(), expert_name.to_string());
        let mut pairs = self.lock();
        if let Some(handle) = pairs.get(&key) {
            return Ok(handle.slot.clone());
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RouterError::ShuttingDown);
        }
        let slot = Arc::new(ExpertSlot::new());
        let worker = PairWorker {
            camera: camera.clone(),
            expert_name: expert_name.to_string(),
            expert: expert.clone(),
            invoker: Invoker::new(expert, schedule.timeout),
            interval: schedule.interval,
            slot: slot.clone(),
            controls: self.controls.clone(),
            aggregator: self.aggregator.clone(),
            counters: self.counters.clone(),
        };
        let join = std::thread::Builder::new()
            .name(format!("pair-{}-{}", camera, expert_name))
            .spawn(move || worker.run());
        let join = match join {
            Ok(join) => Some(join),
            Err(err) => {
                // The slot still accepts frames; nothing will consume them.
                log::error!(
                    "failed to start scheduling loop for '{}'/'{}': {}",
                    camera,
                    expert_name,
                    err
                );
                None
            }
        };
        log::debug!("scheduling loop started for '{}'/'{}'", camera, expert_name);
        pairs.insert(
            key,
            PairHandle {
                slot: slot.clone(),
                join,
            },
        );
        Ok(slot)
    }

    /// Stop every scheduling loop of `camera`. Loops exit after any in-flight call.
    pub fn remove_camera(&self, camera: &CameraId) -> usize {
        let mut pairs = self.lock();
        let keys: Vec<PairKey> = pairs
            .keys()
            .filter(|(cam, _)| cam == camera)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(handle) = pairs.remove(key) {
                handle.slot.close();
            }
        }
        keys.len()
    }

    /// True when a frame for (camera, expert) is waiting for pickup.
    pub fn is_pending(&self, camera: &CameraId, expert: &str) -> bool {
        self.lock()
            .get(&(camera.clone(), expert.to_string()))
            .map(|handle| handle.slot.is_pending())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            frames_submitted: self.counters.submitted.load(Ordering::Relaxed),
            frames_dropped_disabled: self.counters.dropped_disabled.load(Ordering::Relaxed),
            frames_superseded: self.counters.superseded.load(Ordering::Relaxed),
            invocations: self.counters.invocations.load(Ordering::Relaxed),
            active_pairs: self.lock().len(),
        }
    }

    /// Close every slot and wait for the loops to finish their current invocation.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let handles: Vec<PairHandle> = self.lock().drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            handle.slot.close();
        }
        for mut handle in handles {
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    log::error!("scheduling loop panicked during shutdown");
                }
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for handle in self.lock().values() {
            handle.slot.close();
        }
    }
}

// ----------------------------------------------------------------------------
// Per-pair scheduling loop
// ----------------------------------------------------------------------------

struct PairWorker {
    camera: CameraId,
    expert_name: String,
    expert: Arc<dyn Expert>,
    invoker: Invoker,
    interval: Duration,
    slot: Arc<ExpertSlot>,
    controls: Arc<ControlStore>,
    aggregator: Arc<Aggregator>,
    counters: Arc<DispatchCounters>,
}

impl PairWorker {
    fn run(mut self) {
        let mut next_due = Instant::now();
        loop {
            if self.slot.sleep_until(next_due) {
                break;
            }
            // A call abandoned by the timeout must return before the next one starts.
            if !self.invoker.settle(&self.slot) {
                break;
            }
            let frame = match self.slot.wait_take(IDLE_WAIT) {
                SlotWait::Frame(frame) => frame,
                SlotWait::TimedOut => continue,
                SlotWait::Closed => break,
            };
            if !self.controls.is_enabled(&self.expert_name) {
                continue;
            }

            self.counters.invocations.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let outcome = self.invoker.invoke(&frame);
            let latency = started.elapsed();
            if self.slot.is_closed() {
                break;
            }
            match outcome {
                Ok(output) => {
                    self.aggregator.record_result(
                        &self.camera,
                        &self.expert_name,
                        output,
                        frame.capture_time(),
                        latency,
                    );
                }
                Err(err) => {
                    let failure = RouterError::ExpertInvocationFailure {
                        camera_id: self.camera.clone(),
                        expert: self.expert_name.clone(),
                        reason: err.to_string(),
                    };
                    log::warn!("{}", failure);
                    self.aggregator
                        .record_failure(&self.camera, &self.expert_name, &err.to_string());
                }
            }
            next_due = Instant::now() + self.interval;
        }
        self.expert.forget_camera(&self.camera);
        log::debug!(
            "scheduling loop for '{}'/'{}' stopped",
            self.camera,
            self.expert_name
        );
    }
}

fn guarded_invoke(expert: &dyn Expert, frame: &Frame) -> Result<ExpertOutput> {
    match catch_unwind(AssertUnwindSafe(|| expert.invoke(frame))) {
        Ok(result) => result,
        Err(_) => Err(anyhow!("expert panicked")),
    }
}

/// Calls the expert inline, or on a helper thread when a timeout is configured.
enum Invoker {
    Inline(Arc<dyn Expert>),
    Timed(TimedInvoker),
}

struct TimedInvoker {
    timeout: Duration,
    requests: Sender<Frame>,
    replies: Receiver<Result<ExpertOutput>>,
    /// A timed-out call whose reply has not been collected yet.
    outstanding: bool,
}

impl Invoker {
    fn new(expert: Arc<dyn Expert>, timeout: Option<Duration>) -> Self {
        let Some(timeout) = timeout else {
            return Invoker::Inline(expert);
        };
        let (req_tx, req_rx) = mpsc::channel::<Frame>();
        let (rep_tx, rep_rx) = mpsc::channel::<Result<ExpertOutput>>();
        let spawned = std::thread::Builder::new()
            .name(format!("invoke-{}", expert.name()))
            .spawn({
                let expert = expert.clone();
                move || {
                    for frame in req_rx {
                        if rep_tx.send(guarded_invoke(expert.as_ref(), &frame)).is_err() {
                            break;
                        }
                    }
                }
            });
        match spawned {
            Ok(_) => Invoker::Timed(TimedInvoker {
                timeout,
                requests: req_tx,
                replies: rep_rx,
                outstanding: false,
            }),
            Err(err) => {
                log::warn!(
                    "expert '{}': no helper thread ({}); invoking without timeout",
                    expert.name(),
                    err
                );
                Invoker::Inline(expert)
            }
        }
    }

    /// Block until any abandoned call has returned, discarding its result.
    /// Returns false if `slot` is closed while waiting.
    fn settle(&mut self, slot: &ExpertSlot) -> bool {
        let Invoker::Timed(timed) = self else {
            return true;
        };
        while timed.outstanding {
            match timed.replies.recv_timeout(IDLE_WAIT) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => timed.outstanding = false,
                Err(RecvTimeoutError::Timeout) if slot.is_closed() => return false,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        true
    }

    fn invoke(&mut self, frame: &Frame) -> Result<ExpertOutput> {
        match self {
            Invoker::Inline(expert) => guarded_invoke(expert.as_ref(), frame),
            Invoker::Timed(timed) => {
                timed
                    .requests
                    .send(frame.clone())
                    .map_err(|_| anyhow!("invocation thread stopped"))?;
                match timed.replies.recv_timeout(timed.timeout) {
                    Ok(result) => result,
                    Err(RecvTimeoutError::Timeout) => {
                        timed.outstanding = true;
                        Err(anyhow!("timed out after {} ms", timed.timeout.as_millis()))
                    }
                    Err(RecvTimeoutError::Disconnected) => Err(anyhow!("invocation thread stopped")),
                }
            }
        }
    }
}
