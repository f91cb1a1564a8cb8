//! Frame Router
//!
//! Authoritative per-camera state and fan-out to subscribers.
//!
//! ## Delivery model
//!
//! Each camera has a single "latest" slot. [`FrameRouter::ingest`] replaces
//! whatever sits in the slot and, unless a delivery for that camera is
//! already running, drains the slot to the camera's subscribers. A frame
//! that arrives while subscribers are still busy (from a re-entrant call or
//! another thread) is parked in the slot; if another frame arrives before the
//! slot drains, the older one is dropped and counted as coalesced. Producers
//! never wait on a slow subscriber and nothing ever queues.
//!
//! Callbacks run with no router lock held, so they may subscribe,
//! unsubscribe, ingest or acknowledge freely. A panicking callback is logged
//! and does not affect other subscribers.
//!
//! ## Liveness
//!
//! `fps` comes from a bounded window of capture timestamps. `is_stale` is
//! computed whenever metadata is read; cameras are only removed by an
//! explicit roster update.
//!
//! ## Example
//!
//! ```rust
//! use camstream_protocol::protocol::FrameEnvelope;
//! use camstream_protocol::router::FrameRouter;
//! use std::sync::{Arc, Mutex};
//!
//! let router = FrameRouter::default();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! let subscription = router.subscribe_to_frames("cam1", move |update| {
//!     sink.lock().unwrap().push(update.frame.frame_number);
//! });
//!
//! router.ingest(FrameEnvelope::jpeg("cam1", 1, 0, vec![0xFF, 0xD8]));
//! subscription.unsubscribe();
//! router.ingest(FrameEnvelope::jpeg("cam1", 2, 0, vec![0xFF, 0xD8]));
//!
//! assert_eq!(*seen.lock().unwrap(), vec![1]);
//! ```

pub mod clock;
pub mod fps;

use crate::points::PointObservation;
use crate::protocol::{FrameEnvelope, MultiFramePayload, Observation};
use crate::{Result, StreamError};
use clock::{Clock, SystemClock};
use fps::FpsWindow;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Default number of timestamps in the FPS window
pub const DEFAULT_FPS_WINDOW_FRAMES: usize = 30;

/// Default time span of the FPS window
pub const DEFAULT_FPS_WINDOW: Duration = Duration::from_secs(2);

/// Default age after which a camera reads as stale
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(2);

/// Router configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    pub fps_window_frames: usize,
    pub fps_window: Duration,
    pub stale_threshold: Duration,
    /// Send a `frame_ack` upstream for every acknowledged frame
    pub forward_acks: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fps_window_frames: DEFAULT_FPS_WINDOW_FRAMES,
            fps_window: DEFAULT_FPS_WINDOW,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            forward_acks: false,
        }
    }
}

/// Snapshot of one camera's liveness
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraMetadata {
    pub camera_id: String,
    pub fps: f64,
    pub last_frame_number: u64,
    /// Router clock at the last accepted frame
    pub last_seen_at_ns: u64,
    pub is_stale: bool,
    pub image_width: u32,
    pub image_height: u32,
}

/// Per-camera delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CameraStats {
    /// Frames accepted into the latest slot
    pub frames_received: u64,
    /// Frames handed to at least one subscriber
    pub frames_delivered: u64,
    /// Frames replaced in the slot before anyone saw them
    pub frames_coalesced: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub frames_acknowledged: u64,
    pub last_acknowledged_frame: Option<u64>,
}

impl CameraStats {
    /// Share of delivered frames that were never acknowledged as rendered
    pub fn drop_rate(&self) -> f64 {
        if self.frames_delivered == 0 {
            return 0.0;
        }
        let acked = self.frames_acknowledged.min(self.frames_delivered);
        1.0 - acked as f64 / self.frames_delivered as f64
    }
}

/// Counters for every known camera
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterStats {
    pub cameras: BTreeMap<String, CameraStats>,
}

impl RouterStats {
    pub fn total(&self) -> CameraStats {
        self.cameras
            .values()
            .fold(CameraStats::default(), |mut acc, s| {
                acc.frames_received += s.frames_received;
                acc.frames_delivered += s.frames_delivered;
                acc.frames_coalesced += s.frames_coalesced;
                acc.duplicates += s.duplicates;
                acc.out_of_order += s.out_of_order;
                acc.frames_acknowledged += s.frames_acknowledged;
                acc.last_acknowledged_frame =
                    acc.last_acknowledged_frame.max(s.last_acknowledged_frame);
                acc
            })
    }

    pub fn drop_rate(&self) -> f64 {
        self.total().drop_rate()
    }
}

/// What a subscriber receives for one frame
#[derive(Debug, Clone)]
pub struct FrameUpdate {
    pub frame: Arc<FrameEnvelope>,
    pub metadata: CameraMetadata,
    /// Most recent observation for this camera, if any
    pub observation: Option<Arc<PointObservation>>,
}

/// How the router treated an ingested frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Same frame number as the last accepted one; not applied
    Duplicate,
    /// Lower frame number than the last accepted one; not applied
    OutOfOrder { previous: u64 },
}

/// Receiver of acknowledgements the router forwards upstream
pub trait AckForwarder: Send + Sync {
    fn forward_ack(&self, camera_id: &str, frame_number: u64);
}

type FrameCallback = dyn Fn(&FrameUpdate) + Send + Sync;
type MetadataCallback = dyn Fn(&BTreeMap<String, CameraMetadata>) + Send + Sync;

struct Subscriber<F: ?Sized> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Arc<F>,
}

impl<F: ?Sized> Clone for Subscriber<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: self.active.clone(),
            callback: self.callback.clone(),
        }
    }
}

enum SubscriptionKind {
    Frames(String),
    Metadata,
}

/// Handle returned by the `subscribe_*` methods
///
/// Dropping the handle does not unsubscribe. [`unsubscribe`](Self::unsubscribe)
/// is idempotent and safe to call from inside the subscribed callback.
pub struct Subscription {
    id: u64,
    kind: SubscriptionKind,
    active: Arc<AtomicBool>,
    router: Weak<RouterInner>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.remove_subscriber(self.id, &self.kind);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

struct CameraState {
    fps: FpsWindow,
    last_frame_number: u64,
    last_seen_at_ns: u64,
    image_width: u32,
    image_height: u32,
    pending: Option<Arc<FrameEnvelope>>,
    observation: Option<Arc<PointObservation>>,
    stats: CameraStats,
}

impl CameraState {
    fn metadata(&self, camera_id: &str, now_ns: u64, stale_threshold_ns: u64) -> CameraMetadata {
        CameraMetadata {
            camera_id: camera_id.to_string(),
            fps: self.fps.fps(),
            last_frame_number: self.last_frame_number,
            last_seen_at_ns: self.last_seen_at_ns,
            is_stale: now_ns.saturating_sub(self.last_seen_at_ns) > stale_threshold_ns,
            image_width: self.image_width,
            image_height: self.image_height,
        }
    }
}

struct RouterInner {
    config: RouterConfig,
    clock: Arc<dyn Clock>,
    cameras: Mutex<HashMap<String, CameraState>>,
    /// Cameras with a drain in progress. Kept outside `CameraState` so a
    /// camera removed and re-added mid-callback still has one owner.
    /// Locked after `cameras`, never before.
    draining: Mutex<HashSet<String>>,
    frame_subscribers: RwLock<HashMap<String, Vec<Subscriber<FrameCallback>>>>,
    metadata_subscribers: RwLock<Vec<Subscriber<MetadataCallback>>>,
    watchers: Mutex<HashMap<String, watch::Sender<Option<Arc<FrameEnvelope>>>>>,
    ack_forwarder: RwLock<Option<Arc<dyn AckForwarder>>>,
    next_subscriber_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RouterInner {
    fn stale_threshold_ns(&self) -> u64 {
        self.config.stale_threshold.as_nanos().min(u64::MAX as u128) as u64
    }

    fn remove_subscriber(&self, id: u64, kind: &SubscriptionKind) {
        match kind {
            SubscriptionKind::Frames(camera_id) => {
                let mut subscribers = self
                    .frame_subscribers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(list) = subscribers.get_mut(camera_id) {
                    list.retain(|s| s.id != id);
                    if list.is_empty() {
                        subscribers.remove(camera_id);
                    }
                }
            }
            SubscriptionKind::Metadata => {
                self.metadata_subscribers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|s| s.id != id);
            }
        }
    }

    fn metadata_snapshot(&self) -> BTreeMap<String, CameraMetadata> {
        let now = self.clock.now_ns();
        let threshold = self.stale_threshold_ns();
        lock(&self.cameras)
            .iter()
            .map(|(id, state)| (id.clone(), state.metadata(id, now, threshold)))
            .collect()
    }

    fn frame_subscribers_for(&self, camera_id: &str) -> Vec<Subscriber<FrameCallback>> {
        self.frame_subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(camera_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drain the camera's latest slot until it stays empty
    fn deliver(&self, camera_id: &str) {
        loop {
            let update = {
                let mut cameras = lock(&self.cameras);
                let Some(state) = cameras.get_mut(camera_id) else {
                    lock(&self.draining).remove(camera_id);
                    return;
                };
                let Some(frame) = state.pending.take() else {
                    lock(&self.draining).remove(camera_id);
                    return;
                };
                FrameUpdate {
                    frame,
                    metadata: state.metadata(
                        camera_id,
                        self.clock.now_ns(),
                        self.stale_threshold_ns(),
                    ),
                    observation: state.observation.clone(),
                }
            };

            let subscribers = self.frame_subscribers_for(camera_id);
            let mut delivered = false;
            for subscriber in subscribers {
                if !subscriber.active.load(Ordering::SeqCst) {
                    continue;
                }
                delivered = true;
                let callback = subscriber.callback.clone();
                if catch_unwind(AssertUnwindSafe(|| callback(&update))).is_err() {
                    error!(
                        "Frame subscriber {} for camera {} panicked on frame {}",
                        subscriber.id, camera_id, update.frame.frame_number
                    );
                }
            }

            if delivered {
                if let Some(state) = lock(&self.cameras).get_mut(camera_id) {
                    state.stats.frames_delivered += 1;
                }
            }
        }
    }

    fn notify_metadata(&self) {
        let subscribers: Vec<_> = self
            .metadata_subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if subscribers.is_empty() {
            return;
        }

        let snapshot = self.metadata_snapshot();
        for subscriber in subscribers {
            call_metadata_subscriber(&subscriber, &snapshot);
        }
    }
}

fn call_metadata_subscriber(
    subscriber: &Subscriber<MetadataCallback>,
    snapshot: &BTreeMap<String, CameraMetadata>,
) {
    if !subscriber.active.load(Ordering::SeqCst) {
        return;
    }
    let callback = subscriber.callback.clone();
    if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
        error!("Metadata subscriber {} panicked", subscriber.id);
    }
}

/// Per-camera latest-value fan-out
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FrameRouter {
    inner: Arc<RouterInner>,
}

impl Default for FrameRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl std::fmt::Debug for FrameRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRouter")
            .field("config", &self.inner.config)
            .field("cameras", &lock(&self.inner.cameras).len())
            .finish()
    }
}

impl FrameRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RouterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                config,
                clock,
                cameras: Mutex::new(HashMap::new()),
                draining: Mutex::new(HashSet::new()),
                frame_subscribers: RwLock::new(HashMap::new()),
                metadata_subscribers: RwLock::new(Vec::new()),
                watchers: Mutex::new(HashMap::new()),
                ack_forwarder: RwLock::new(None),
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Where acknowledgements go when `forward_acks` is enabled
    pub fn set_ack_forwarder(&self, forwarder: Arc<dyn AckForwarder>) {
        *self
            .inner
            .ack_forwarder
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(forwarder);
    }

    fn next_id(&self) -> u64 {
        self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register `callback` for frames of one camera
    pub fn subscribe_to_frames<F>(&self, camera_id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&FrameUpdate) + Send + Sync + 'static,
    {
        let camera_id = camera_id.into();
        let id = self.next_id();
        let active = Arc::new(AtomicBool::new(true));

        self.inner
            .frame_subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(camera_id.clone())
            .or_default()
            .push(Subscriber {
                id,
                active: active.clone(),
                callback: Arc::new(callback),
            });
        debug!("Frame subscriber {} registered for camera {}", id, camera_id);

        Subscription {
            id,
            kind: SubscriptionKind::Frames(camera_id),
            active,
            router: Arc::downgrade(&self.inner),
        }
    }

    /// Register `callback` for the full metadata map
    ///
    /// The callback fires once immediately with the current map, then after
    /// every change.
    pub fn subscribe_to_metadata_changes<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&BTreeMap<String, CameraMetadata>) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let active = Arc::new(AtomicBool::new(true));
        let subscriber = Subscriber::<MetadataCallback> {
            id,
            active: active.clone(),
            callback: Arc::new(callback),
        };

        self.inner
            .metadata_subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber.clone());

        call_metadata_subscriber(&subscriber, &self.inner.metadata_snapshot());

        Subscription {
            id,
            kind: SubscriptionKind::Metadata,
            active,
            router: Arc::downgrade(&self.inner),
        }
    }

    /// Latest frame of one camera as a watch channel
    ///
    /// The channel only ever holds the newest frame, so an async consumer
    /// that falls behind skips straight to it.
    pub fn watch_frames(
        &self,
        camera_id: impl Into<String>,
    ) -> watch::Receiver<Option<Arc<FrameEnvelope>>> {
        lock(&self.inner.watchers)
            .entry(camera_id.into())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Apply one decoded frame
    pub fn ingest(&self, frame: FrameEnvelope) -> IngestOutcome {
        let camera_id = frame.camera_id.clone();
        let now = self.inner.clock.now_ns();
        let frame = Arc::new(frame);

        let (is_new, start_delivery) = {
            let mut cameras = lock(&self.inner.cameras);
            let is_new = !cameras.contains_key(&camera_id);
            let state = cameras.entry(camera_id.clone()).or_insert_with(|| {
                info!("New camera {} on stream", camera_id);
                CameraState {
                    fps: FpsWindow::new(
                        self.inner.config.fps_window_frames,
                        self.inner.config.fps_window,
                    ),
                    last_frame_number: 0,
                    last_seen_at_ns: now,
                    image_width: 0,
                    image_height: 0,
                    pending: None,
                    observation: None,
                    stats: CameraStats::default(),
                }
            });

            if !is_new {
                let previous = state.last_frame_number;
                if frame.frame_number == previous {
                    state.stats.duplicates += 1;
                    warn!(
                        "Duplicate frame {} from camera {}",
                        frame.frame_number, camera_id
                    );
                    return IngestOutcome::Duplicate;
                }
                if frame.frame_number < previous {
                    state.stats.out_of_order += 1;
                    warn!(
                        "Out-of-order frame {} from camera {} (last {})",
                        frame.frame_number, camera_id, previous
                    );
                    return IngestOutcome::OutOfOrder { previous };
                }
            }

            let timestamp = if frame.capture_timestamp_ns == 0 {
                now
            } else {
                frame.capture_timestamp_ns
            };
            state.fps.push(timestamp);
            state.last_frame_number = frame.frame_number;
            state.last_seen_at_ns = now;
            if frame.image_width > 0 && frame.image_height > 0 {
                state.image_width = frame.image_width;
                state.image_height = frame.image_height;
            }
            state.stats.frames_received += 1;

            if state.pending.replace(frame.clone()).is_some() {
                state.stats.frames_coalesced += 1;
                trace!("Coalesced pending frame for camera {}", camera_id);
            }

            let start_delivery = lock(&self.inner.draining).insert(camera_id.clone());
            (is_new, start_delivery)
        };

        if let Some(sender) = lock(&self.inner.watchers).get(&camera_id) {
            sender.send_replace(Some(frame));
        }

        if start_delivery {
            self.inner.deliver(&camera_id);
        }

        if is_new {
            debug!("Camera {} added to metadata map", camera_id);
        }
        self.inner.notify_metadata();

        IngestOutcome::Accepted
    }

    /// Apply every frame of a bundle, in bundle order
    pub fn ingest_bundle(&self, bundle: MultiFramePayload) -> Vec<IngestOutcome> {
        bundle.frames.into_iter().map(|f| self.ingest(f)).collect()
    }

    /// Replace the camera's current observation
    ///
    /// The observation rides along with subsequent frame updates. An
    /// observation for a camera that has never produced a frame is a
    /// protocol violation and is ignored.
    pub fn ingest_observation(&self, observation: &Observation) -> Result<()> {
        let camera_id = observation.camera_id();
        let mut cameras = lock(&self.inner.cameras);
        let state = cameras.get_mut(camera_id).ok_or_else(|| {
            StreamError::protocol_violation(format!(
                "{} observation for unknown camera {}",
                observation.kind(),
                camera_id
            ))
        })?;

        state.observation = Some(Arc::new(observation.to_points()));
        trace!(
            "Stored {} observation for camera {} frame {}",
            observation.kind(),
            camera_id,
            observation.frame_number()
        );
        Ok(())
    }

    /// Most recent observation for a camera
    pub fn latest_observation(&self, camera_id: &str) -> Option<Arc<PointObservation>> {
        lock(&self.inner.cameras)
            .get(camera_id)
            .and_then(|s| s.observation.clone())
    }

    /// Record that a renderer displayed `frame_number`
    ///
    /// Advisory only: delivery of later frames never waits on it.
    pub fn acknowledge_frame_rendered(&self, camera_id: &str, frame_number: u64) {
        {
            let mut cameras = lock(&self.inner.cameras);
            let Some(state) = cameras.get_mut(camera_id) else {
                debug!(
                    "Ignoring ack for unknown camera {} frame {}",
                    camera_id, frame_number
                );
                return;
            };
            state.stats.frames_acknowledged += 1;
            state.stats.last_acknowledged_frame =
                state.stats.last_acknowledged_frame.max(Some(frame_number));
        }

        if self.inner.config.forward_acks {
            let forwarder = self
                .inner
                .ack_forwarder
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(forwarder) = forwarder {
                forwarder.forward_ack(camera_id, frame_number);
            }
        }
    }

    pub fn get_camera_metadata(&self, camera_id: &str) -> Option<CameraMetadata> {
        let now = self.inner.clock.now_ns();
        lock(&self.inner.cameras)
            .get(camera_id)
            .map(|s| s.metadata(camera_id, now, self.inner.stale_threshold_ns()))
    }

    pub fn get_all_camera_metadata(&self) -> BTreeMap<String, CameraMetadata> {
        self.inner.metadata_snapshot()
    }

    /// Keep only the listed cameras
    ///
    /// Returns the ids that were removed.
    pub fn retain_cameras(&self, camera_ids: &[String]) -> Vec<String> {
        let keep: HashSet<&str> = camera_ids.iter().map(String::as_str).collect();
        let removed: Vec<String> = {
            let mut cameras = lock(&self.inner.cameras);
            let removed: Vec<String> = cameras
                .keys()
                .filter(|id| !keep.contains(id.as_str()))
                .cloned()
                .collect();
            for id in &removed {
                cameras.remove(id);
            }
            removed
        };

        if removed.is_empty() {
            return removed;
        }

        {
            let mut watchers = lock(&self.inner.watchers);
            for id in &removed {
                watchers.remove(id);
            }
        }
        info!("Cameras left the roster: {:?}", removed);
        self.inner.notify_metadata();
        removed
    }

    pub fn camera_stats(&self, camera_id: &str) -> Option<CameraStats> {
        lock(&self.inner.cameras)
            .get(camera_id)
            .map(|s| s.stats.clone())
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            cameras: lock(&self.inner.cameras)
                .iter()
                .map(|(id, s)| (id.clone(), s.stats.clone()))
                .collect(),
        }
    }

    pub fn camera_count(&self) -> usize {
        lock(&self.inner.cameras).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::clock::ManualClock;
    use std::sync::Mutex as StdMutex;

    const MS: u64 = 1_000_000;

    fn frame(camera: &str, n: u64) -> FrameEnvelope {
        FrameEnvelope::jpeg(camera, n, n * 100 * MS + 1, vec![0xFF, 0xD8])
    }

    fn router_with_clock() -> (FrameRouter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000 * MS));
        let router = FrameRouter::with_clock(RouterConfig::default(), clock.clone());
        (router, clock)
    }

    #[test]
    fn test_last_frame_number_is_max() {
        let router = FrameRouter::default();
        for n in [1, 2, 5, 9, 10, 42] {
            assert_eq!(router.ingest(frame("cam1", n)), IngestOutcome::Accepted);
        }
        let meta = router.get_camera_metadata("cam1").unwrap();
        assert_eq!(meta.last_frame_number, 42);
    }

    #[test]
    fn test_duplicate_and_out_of_order_reported() {
        let router = FrameRouter::default();
        router.ingest(frame("cam1", 5));

        assert_eq!(router.ingest(frame("cam1", 5)), IngestOutcome::Duplicate);
        assert_eq!(
            router.ingest(frame("cam1", 3)),
            IngestOutcome::OutOfOrder { previous: 5 }
        );

        let stats = router.camera_stats("cam1").unwrap();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(router.get_camera_metadata("cam1").unwrap().last_frame_number, 5);
    }

    #[test]
    fn test_subscribe_then_unsubscribe_sees_nothing() {
        let router = FrameRouter::default();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();

        let sub = router.subscribe_to_frames("cam1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        sub.unsubscribe();

        router.ingest(frame("cam1", 1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_only_matching_camera_notified() {
        let router = FrameRouter::default();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        router.subscribe_to_frames("cam2", move |u| {
            sink.lock().unwrap().push(u.frame.camera_id.clone());
        });

        router.ingest(frame("cam1", 1));
        router.ingest(frame("cam2", 1));

        assert_eq!(*seen.lock().unwrap(), vec!["cam2".to_string()]);
    }

    #[test]
    fn test_frames_arriving_during_callback_coalesce() {
        let router = FrameRouter::default();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let inner_router = router.clone();

        router.subscribe_to_frames("cam1", move |update| {
            sink.lock().unwrap().push(update.frame.frame_number);
            if update.frame.frame_number == 1 {
                // Two frames land before this callback returns
                inner_router.ingest(frame("cam1", 2));
                inner_router.ingest(frame("cam1", 3));
            }
        });

        router.ingest(frame("cam1", 1));

        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
        let stats = router.camera_stats("cam1").unwrap();
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.frames_coalesced, 1);
        assert_eq!(stats.frames_delivered, 2);
    }

    #[test]
    fn test_camera_readded_during_callback_has_one_drain() {
        let router = FrameRouter::default();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let depth = Arc::new(AtomicU64::new(0));
        let max_depth = Arc::new(AtomicU64::new(0));
        let (sink, current, deepest) = (seen.clone(), depth.clone(), max_depth.clone());
        let inner_router = router.clone();

        router.subscribe_to_frames("cam1", move |update| {
            let level = current.fetch_add(1, Ordering::SeqCst) + 1;
            deepest.fetch_max(level, Ordering::SeqCst);
            sink.lock().unwrap().push(update.frame.frame_number);
            if update.frame.frame_number == 1 {
                // Camera leaves the roster and comes straight back
                inner_router.retain_cameras(&[]);
                inner_router.ingest(frame("cam1", 5));
            }
            current.fetch_sub(1, Ordering::SeqCst);
        });

        router.ingest(frame("cam1", 1));

        assert_eq!(*seen.lock().unwrap(), vec![1, 5]);
        assert_eq!(max_depth.load(Ordering::SeqCst), 1);

        // Ownership was released, so later frames still get delivered
        router.ingest(frame("cam1", 6));
        assert_eq!(*seen.lock().unwrap(), vec![1, 5, 6]);
    }

    #[test]
    fn test_unsubscribe_from_own_callback() {
        let router = FrameRouter::default();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let slot: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));
        let slot_in_callback = slot.clone();

        let sub = router.subscribe_to_frames("cam1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = slot_in_callback.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        router.ingest(frame("cam1", 1));
        router.ingest(frame("cam1", 2));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let router = FrameRouter::default();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();

        router.subscribe_to_frames("cam1", |_| panic!("renderer exploded"));
        router.subscribe_to_frames("cam1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        router.ingest(frame("cam1", 1));
        router.ingest(frame("cam1", 2));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fps_from_capture_timestamps() {
        let router = FrameRouter::default();
        for n in 0..10 {
            router.ingest(FrameEnvelope::jpeg("cam1", n, 1 + n * 100 * MS, vec![1]));
        }
        let fps = router.get_camera_metadata("cam1").unwrap().fps;
        assert!((fps - 10.0).abs() < 0.01, "fps was {}", fps);
    }

    #[test]
    fn test_staleness_is_derived_on_read() {
        let (router, clock) = router_with_clock();
        router.ingest(frame("cam1", 1));
        assert!(!router.get_camera_metadata("cam1").unwrap().is_stale);

        clock.advance(DEFAULT_STALE_THRESHOLD + Duration::from_millis(1));

        let meta = router.get_camera_metadata("cam1").unwrap();
        assert!(meta.is_stale);
        assert_eq!(router.get_all_camera_metadata().len(), 1);

        router.ingest(frame("cam1", 2));
        assert!(!router.get_camera_metadata("cam1").unwrap().is_stale);
    }

    #[test]
    fn test_metadata_subscriber_fires_immediately_and_on_change() {
        let router = FrameRouter::default();
        router.ingest(frame("cam1", 1));

        let sizes = Arc::new(StdMutex::new(Vec::new()));
        let sink = sizes.clone();
        let sub = router.subscribe_to_metadata_changes(move |map| {
            sink.lock().unwrap().push(map.len());
        });

        router.ingest(frame("cam2", 1));
        sub.unsubscribe();
        router.ingest(frame("cam3", 1));

        assert_eq!(*sizes.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_roster_removes_cameras() {
        let router = FrameRouter::default();
        router.ingest(frame("cam1", 1));
        router.ingest(frame("cam2", 1));

        let removed = router.retain_cameras(&["cam2".to_string()]);

        assert_eq!(removed, vec!["cam1".to_string()]);
        assert!(router.get_camera_metadata("cam1").is_none());
        assert!(router.get_camera_metadata("cam2").is_some());
    }

    #[test]
    fn test_observation_for_unknown_camera_is_violation() {
        let router = FrameRouter::default();
        let observation: Observation = serde_json::from_value(serde_json::json!({
            "message_type": "mediapipe_overlay",
            "camera_id": "ghost",
            "frame_number": 1,
            "metadata": {"image_width": 10, "image_height": 10}
        }))
        .unwrap();

        assert!(matches!(
            router.ingest_observation(&observation),
            Err(StreamError::ProtocolViolation(_))
        ));
        assert!(router.latest_observation("ghost").is_none());
    }

    #[test]
    fn test_observation_rides_with_next_frame() {
        let router = FrameRouter::default();
        router.ingest(frame("0", 1));
        let observation: Observation = serde_json::from_value(serde_json::json!({
            "message_type": "mediapipe_overlay",
            "camera_id": "0",
            "frame_number": 1,
            "body_points": [{"name": "nose", "x": 3.0, "y": 4.0}],
            "metadata": {"image_width": 10, "image_height": 10}
        }))
        .unwrap();
        router.ingest_observation(&observation).unwrap();

        let got = Arc::new(StdMutex::new(None));
        let sink = got.clone();
        router.subscribe_to_frames("0", move |u| {
            *sink.lock().unwrap() = u.observation.clone();
        });
        router.ingest(frame("0", 2));

        let observation = got.lock().unwrap().clone().unwrap();
        assert!(observation.get("nose").is_some());
    }

    struct RecordingForwarder(StdMutex<Vec<(String, u64)>>);

    impl AckForwarder for RecordingForwarder {
        fn forward_ack(&self, camera_id: &str, frame_number: u64) {
            self.0.lock().unwrap().push((camera_id.to_string(), frame_number));
        }
    }

    #[test]
    fn test_ack_is_advisory_and_forwarded() {
        let router = FrameRouter::new(RouterConfig {
            forward_acks: true,
            ..RouterConfig::default()
        });
        let forwarder = Arc::new(RecordingForwarder(StdMutex::new(Vec::new())));
        router.set_ack_forwarder(forwarder.clone());
        router.subscribe_to_frames("cam1", |_| {});

        router.ingest(frame("cam1", 1));
        router.ingest(frame("cam1", 2));
        router.acknowledge_frame_rendered("cam1", 2);
        router.acknowledge_frame_rendered("nope", 1);

        let stats = router.camera_stats("cam1").unwrap();
        assert_eq!(stats.frames_delivered, 2);
        assert_eq!(stats.frames_acknowledged, 1);
        assert_eq!(stats.last_acknowledged_frame, Some(2));
        assert!((stats.drop_rate() - 0.5).abs() < 1e-9);
        assert_eq!(
            *forwarder.0.lock().unwrap(),
            vec![("cam1".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_watch_holds_latest_only() {
        let router = FrameRouter::default();
        let mut rx = router.watch_frames("cam1");
        assert!(rx.borrow().is_none());

        router.ingest(frame("cam1", 1));
        router.ingest(frame("cam1", 2));

        rx.changed().await.unwrap();
        let latest = rx.borrow_and_update().clone().unwrap();
        assert_eq!(latest.frame_number, 2);
    }
}
