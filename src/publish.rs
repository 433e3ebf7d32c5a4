//! Best-effort fan-out of camera state.
//!
//! Every subscriber owns a small bounded queue drained by its own push path
//! (the session thread of its connection). `publish` only ever does a
//! non-blocking `try_send`; a subscriber whose queue is full or whose
//! receiver is gone is dropped from every subscription on the spot. Missed
//! updates are not buffered or retried. Viewers can always pull the current
//! truth with a snapshot query.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::aggregate::CameraState;
use crate::error::{RouterError, RouterResult};
use crate::frame::CameraId;

pub type SubscriberId = u64;

pub const DEFAULT_QUEUE_DEPTH: usize = 8;

struct SubscriberEntry {
    label: String,
    tx: SyncSender<Arc<CameraState>>,
    cameras: BTreeSet<CameraId>,
}

#[derive(Default)]
struct Subscriptions {
    subscribers: HashMap<SubscriberId, SubscriberEntry>,
    by_camera: HashMap<CameraId, BTreeSet<SubscriberId>>,
}

impl Subscriptions {
    fn drop_subscriber(&mut self, id: SubscriberId) -> Option<SubscriberEntry> {
        let entry = self.subscribers.remove(&id)?;
        for camera in &entry.cameras {
            if let Some(ids) = self.by_camera.get_mut(camera) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_camera.remove(camera);
                }
            }
        }
        Some(entry)
    }
}

/// Outcome of a single `publish` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct Publisher {
    inner: Mutex<Subscriptions>,
    next_id: AtomicU64,
    queue_depth: usize,
    delivered_total: AtomicU64,
    dropped_total: AtomicU64,
}

impl Publisher {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Mutex::new(Subscriptions::default()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            delivered_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscriptions> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a subscriber connection. The receiver is the subscriber's push queue.
    pub fn open(&self, label: impl Into<String>) -> (SubscriberId, Receiver<Arc<CameraState>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(self.queue_depth);
        self.lock().subscribers.insert(
            id,
            SubscriberEntry {
                label: label.into(),
                tx,
                cameras: BTreeSet::new(),
            },
        );
        (id, rx)
    }

    /// Remove a subscriber and all its subscriptions. Returns false if unknown.
    pub fn close(&self, id: SubscriberId) -> bool {
        self.lock().drop_subscriber(id).is_some()
    }

    /// Subscribe `id` to `camera`. `initial`, when given, is pushed right away.
    pub fn subscribe(
        &self,
        id: SubscriberId,
        camera: &CameraId,
        initial: Option<Arc<CameraState>>,
    ) -> RouterResult<()> {
        let mut subs = self.lock();
        let entry = subs
            .subscribers
            .get_mut(&id)
            .ok_or(RouterError::UnknownSubscriber(id))?;
        entry.cameras.insert(camera.clone());
        let push_failed = match initial {
            Some(state) => entry.tx.try_send(state).is_err(),
            None => false,
        };
        subs.by_camera.entry(camera.clone()).or_default().insert(id);
        if push_failed {
            self.drop_unreachable(&mut subs, id);
            return Err(RouterError::SubscriberUnreachable(id));
        }
        Ok(())
    }

    /// Returns Ok(false) when `id` was not subscribed to `camera`.
    pub fn unsubscribe(&self, id: SubscriberId, camera: &CameraId) -> RouterResult<bool> {
        let mut subs = self.lock();
        let entry = subs
            .subscribers
            .get_mut(&id)
            .ok_or(RouterError::UnknownSubscriber(id))?;
        if !entry.cameras.remove(camera) {
            return Ok(false);
        }
        if let Some(ids) = subs.by_camera.get_mut(camera) {
            ids.remove(&id);
            if ids.is_empty() {
                subs.by_camera.remove(camera);
            }
        }
        Ok(true)
    }

    pub fn has_subscribers(&self, camera: &CameraId) -> bool {
        self.lock().by_camera.contains_key(camera)
    }

    /// Push `state` to every subscriber of `camera` without waiting on any of them.
    pub fn publish(&self, camera: &CameraId, state: Arc<CameraState>) -> PublishReport {
        let mut subs = self.lock();
        let Some(ids) = subs.by_camera.get(camera) else {
            return PublishReport::default();
        };
        let mut report = PublishReport::default();
        let mut unreachable = Vec::new();
        for id in ids {
            let Some(entry) = subs.subscribers.get(id) else {
                continue;
            };
            match entry.tx.try_send(state.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    unreachable.push(*id)
                }
            }
        }
        for id in unreachable {
            self.drop_unreachable(&mut subs, id);
            report.dropped += 1;
        }
        self.delivered_total
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        report
    }

    fn drop_unreachable(&self, subs: &mut Subscriptions, id: SubscriberId) {
        if let Some(entry) = subs.drop_subscriber(id) {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "{}; dropping subscriber '{}' from {} camera(s)",
                RouterError::SubscriberUnreachable(id),
                entry.label,
                entry.cameras.len()
            );
        }
    }

    pub fn subscriptions(&self, id: SubscriberId) -> Option<Vec<CameraId>> {
        self.lock()
            .subscribers
            .get(&id)
            .map(|entry| entry.cameras.iter().cloned().collect())
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn delivered_total(&self) -> u64 {
        self.delivered_total.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Drop every subscriber. Their receivers observe a closed queue.
    pub fn close_all(&self) {
        let mut subs = self.lock();
        subs.subscribers.clear();
        subs.by_camera.clear();
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}
