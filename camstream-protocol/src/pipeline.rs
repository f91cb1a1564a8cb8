//! Frame Pipeline
//!
//! Consumes [`ConnectionEvent`]s, decodes every received message and applies
//! the result to a [`FrameRouter`]. Malformed messages and protocol
//! violations are logged, counted and dropped; they never stop the
//! pipeline.

use crate::connection::ConnectionEvent;
use crate::protocol::{
    ControlMessage, DecodedMessage, FrameDecoder, FramerateUpdate, LogRecord, RawMessage,
};
use crate::router::{FrameRouter, IngestOutcome};
use crate::{Result, StreamError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub messages: u64,
    pub frames: u64,
    pub observations: u64,
    pub control_messages: u64,
    pub decode_errors: u64,
    pub protocol_violations: u64,
    pub roster_updates: u64,
}

#[derive(Default)]
struct Counters {
    messages: AtomicU64,
    frames: AtomicU64,
    observations: AtomicU64,
    control_messages: AtomicU64,
    decode_errors: AtomicU64,
    protocol_violations: AtomicU64,
    roster_updates: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Decoder plus router, driven by connection events
pub struct FramePipeline {
    decoder: FrameDecoder,
    router: FrameRouter,
    counters: Counters,
    framerate: Mutex<Option<FramerateUpdate>>,
}

impl FramePipeline {
    pub fn new(decoder: FrameDecoder, router: FrameRouter) -> Self {
        Self {
            decoder,
            router,
            counters: Counters::default(),
            framerate: Mutex::new(None),
        }
    }

    pub fn router(&self) -> &FrameRouter {
        &self.router
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    /// Latest server-side framerate summary
    pub fn last_framerate(&self) -> Option<FramerateUpdate> {
        self.framerate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            messages: c.messages.load(Ordering::Relaxed),
            frames: c.frames.load(Ordering::Relaxed),
            observations: c.observations.load(Ordering::Relaxed),
            control_messages: c.control_messages.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            protocol_violations: c.protocol_violations.load(Ordering::Relaxed),
            roster_updates: c.roster_updates.load(Ordering::Relaxed),
        }
    }

    /// Run until the event channel closes
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(&event);
        }
        debug!("Connection event channel closed, pipeline stopping");
    }

    /// Spawn [`run`](Self::run) on the current runtime
    pub fn spawn(
        self: Arc<Self>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(events).await })
    }

    pub fn handle_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::MessageReceived(raw) => {
                if let Err(e) = self.handle_message(raw) {
                    match e {
                        StreamError::ProtocolViolation(_) => {
                            Counters::incr(&self.counters.protocol_violations, 1);
                            warn!("Dropping message: {}", e);
                        }
                        StreamError::Decode(_) => {
                            Counters::incr(&self.counters.decode_errors, 1);
                            warn!("Dropping malformed {} byte message: {}", raw.len(), e);
                        }
                        other => warn!("Failed to handle message: {}", other),
                    }
                }
            }
            ConnectionEvent::Connected { url } => info!("Stream connected: {}", url),
            ConnectionEvent::Disconnected {
                reason,
                will_reconnect,
            } => info!(
                "Stream disconnected ({}), reconnect: {}",
                reason.as_deref().unwrap_or("no reason"),
                will_reconnect
            ),
            ConnectionEvent::ReconnectGaveUp { attempts } => {
                error!("Stream lost after {} reconnect attempts", attempts)
            }
            _ => trace!("Connection event: {:?}", event),
        }
    }

    /// Decode one message and apply it to the router
    ///
    /// Every observation in a bundle is applied; if some name cameras the
    /// router has never seen, the first such violation is returned once the
    /// rest of the bundle is stored.
    pub fn handle_message(&self, raw: &RawMessage) -> Result<()> {
        Counters::incr(&self.counters.messages, 1);
        let decoded = self.decoder.decode(raw)?;

        match decoded {
            DecodedMessage::Frame(frame) => {
                Counters::incr(&self.counters.frames, 1);
                let camera_id = frame.camera_id.clone();
                let frame_number = frame.frame_number;
                log_outcome(&camera_id, frame_number, self.router.ingest(frame));
            }
            DecodedMessage::Frames(bundle) => {
                let ids: Vec<(String, u64)> = bundle
                    .frames
                    .iter()
                    .map(|f| (f.camera_id.clone(), f.frame_number))
                    .collect();
                Counters::incr(&self.counters.frames, ids.len() as u64);
                for ((camera_id, frame_number), outcome) in
                    ids.iter().zip(self.router.ingest_bundle(bundle))
                {
                    log_outcome(camera_id, *frame_number, outcome);
                }
            }
            DecodedMessage::Observations(bundle) => {
                let mut first_violation = None;
                for observation in bundle.values() {
                    Counters::incr(&self.counters.observations, 1);
                    if let Err(e) = self.router.ingest_observation(observation) {
                        if first_violation.is_none() {
                            first_violation = Some(e);
                        } else {
                            Counters::incr(&self.counters.protocol_violations, 1);
                            warn!("Dropping observation: {}", e);
                        }
                    }
                }
                if let Some(e) = first_violation {
                    return Err(e);
                }
            }
            DecodedMessage::Control(control) => {
                Counters::incr(&self.counters.control_messages, 1);
                self.handle_control(control);
            }
        }
        Ok(())
    }

    fn handle_control(&self, control: ControlMessage) {
        match control {
            ControlMessage::Ping | ControlMessage::Pong => {}
            ControlMessage::FramerateUpdate(update) => {
                trace!("Framerate update for group {:?}", update.camera_group_id);
                *self
                    .framerate
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(update);
            }
            ControlMessage::LogRecord(record) => relay_log(&record),
            ControlMessage::CameraRoster { camera_ids } => {
                Counters::incr(&self.counters.roster_updates, 1);
                let removed = self.router.retain_cameras(&camera_ids);
                debug!(
                    "Roster update: {} cameras, {} removed",
                    camera_ids.len(),
                    removed.len()
                );
            }
            ControlMessage::Unknown { message_type, .. } => {
                debug!("Ignoring message_type {}", message_type)
            }
        }
    }
}

fn log_outcome(camera_id: &str, frame_number: u64, outcome: IngestOutcome) {
    match outcome {
        IngestOutcome::Accepted => {}
        IngestOutcome::Duplicate => {
            debug!("Duplicate frame {} from camera {}", frame_number, camera_id)
        }
        IngestOutcome::OutOfOrder { previous } => debug!(
            "Out-of-order frame {} from camera {} (last {})",
            frame_number, camera_id, previous
        ),
    }
}

/// Re-emit a server log line at its own level
fn relay_log(record: &LogRecord) {
    match record.levelname.to_ascii_uppercase().as_str() {
        "ERROR" | "CRITICAL" => error!(target: "camstream::server", "{}: {}", record.name, record.message),
        "WARNING" | "WARN" => warn!(target: "camstream::server", "{}: {}", record.name, record.message),
        "INFO" => info!(target: "camstream::server", "{}: {}", record.name, record.message),
        _ => debug!(target: "camstream::server", "{}: {}", record.name, record.message),
    }
}
