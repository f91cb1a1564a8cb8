//! Live stream monitor
//!
//! Backs `camstream watch`: connects, routes frames, and prints a
//! per-camera liveness table at a fixed interval.

use crate::config::Config;
use anyhow::{Context, Result};
use camstream_protocol::overlay::OverlayCompiler;
use camstream_protocol::points::PointObservation;
use camstream_protocol::router::{CameraMetadata, FrameUpdate, RouterStats};
use camstream_protocol::{
    ConnectionManager, FrameDecoder, FramePipeline, FrameRouter, Subscription,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace};

/// Delivered frames waiting for the monitor loop
const DELIVERY_QUEUE: usize = 64;

/// Options for one `watch` run
pub struct WatchOptions {
    pub interval: Duration,
    /// Tables to print before exiting; 0 runs until Ctrl+C
    pub count: usize,
    pub overlay: Option<OverlayCompiler>,
    /// Acknowledge every delivered frame
    pub ack: bool,
}

/// Running overlay compile totals for one camera
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayTally {
    pub compiled: u64,
    pub last_primitives: usize,
    pub last_gaps: usize,
}

struct Delivered {
    camera_id: String,
    frame_number: u64,
    observation: Option<Arc<PointObservation>>,
}

/// Hand a delivered frame to the monitor loop without blocking the router
///
/// A full queue drops the frame; the router keeps delivering newer ones.
fn forward_delivered(tx: &mpsc::Sender<Delivered>, update: &FrameUpdate) -> bool {
    let delivered = Delivered {
        camera_id: update.frame.camera_id.clone(),
        frame_number: update.frame.frame_number,
        observation: update.observation.clone(),
    };
    match tx.try_send(delivered) {
        Ok(()) => true,
        Err(TrySendError::Full(d)) => {
            trace!("Monitor busy, skipping frame {} of {}", d.frame_number, d.camera_id);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

pub async fn watch(config: &Config, ws_url: &str, options: WatchOptions) -> Result<()> {
    let manager = ConnectionManager::new(config.connection_config());
    let router = FrameRouter::new(config.router_config());
    router.set_ack_forwarder(Arc::new(manager.handle()));

    let pipeline = Arc::new(FramePipeline::new(
        FrameDecoder::new(config.decoder_config()),
        router.clone(),
    ));
    let pipeline_task = pipeline.clone().spawn(manager.subscribe());

    manager
        .connect(ws_url)
        .await
        .context("Failed to start connection")?;

    let (delivered_tx, mut delivered_rx) = mpsc::channel::<Delivered>(DELIVERY_QUEUE);
    let mut subscriptions: BTreeMap<String, Subscription> = BTreeMap::new();
    let mut overlay_tally: BTreeMap<String, OverlayTally> = BTreeMap::new();

    let mut ticker = tokio::time::interval(options.interval);
    let mut printed = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }

            _ = ticker.tick() => {
                for camera_id in router.get_all_camera_metadata().into_keys() {
                    if subscriptions.contains_key(&camera_id) {
                        continue;
                    }
                    debug!("Subscribing to camera {}", camera_id);
                    let tx = delivered_tx.clone();
                    let subscription = router.subscribe_to_frames(camera_id.clone(), move |update| {
                        forward_delivered(&tx, update);
                    });
                    subscriptions.insert(camera_id, subscription);
                }

                println!(
                    "[{}] {} | pipeline: {:?}",
                    chrono::Local::now().format("%H:%M:%S"),
                    manager.state(),
                    pipeline.stats()
                );
                print!(
                    "{}",
                    render_table(&router.get_all_camera_metadata(), &router.stats(), &overlay_tally)
                );

                printed += 1;
                if options.count > 0 && printed >= options.count {
                    break;
                }
            }

            Some(delivered) = delivered_rx.recv() => {
                if options.ack {
                    router.acknowledge_frame_rendered(&delivered.camera_id, delivered.frame_number);
                }
                if let (Some(compiler), Some(points)) = (&options.overlay, &delivered.observation) {
                    let report = compiler.compile_with_report(points, Some(&points.metadata));
                    let tally = overlay_tally.entry(delivered.camera_id).or_default();
                    tally.compiled += 1;
                    tally.last_primitives = report.primitives.len();
                    tally.last_gaps = report.gaps.len();
                }
            }
        }
    }

    for subscription in subscriptions.values() {
        subscription.unsubscribe();
    }
    manager.disconnect(false).await;
    pipeline_task.abort();

    let stats = manager.stats();
    info!(
        "Received {} binary / {} text messages ({} bytes), {} reconnect attempts",
        stats.binary_messages, stats.text_messages, stats.bytes_received, stats.reconnect_attempts
    );
    Ok(())
}

/// Per-camera status table
pub fn render_table(
    metadata: &BTreeMap<String, CameraMetadata>,
    stats: &RouterStats,
    overlay: &BTreeMap<String, OverlayTally>,
) -> String {
    let mut out = String::new();
    if metadata.is_empty() {
        out.push_str("  (no cameras yet)\n");
        return out;
    }

    let _ = writeln!(
        out,
        "  {:<10} {:>7} {:>10} {:>6} {:>11} {:>9} {:>9} {:>6} {:>9}",
        "CAMERA", "FPS", "FRAME", "STALE", "SIZE", "RECEIVED", "COALESCED", "DROP%", "OVERLAY"
    );
    for (camera_id, meta) in metadata {
        let camera_stats = stats.cameras.get(camera_id).cloned().unwrap_or_default();
        let overlay = overlay
            .get(camera_id)
            .map(|t| format!("{}/{}", t.last_primitives, t.last_gaps))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  {:<10} {:>7.1} {:>10} {:>6} {:>11} {:>9} {:>9} {:>6.1} {:>9}",
            camera_id,
            meta.fps,
            meta.last_frame_number,
            if meta.is_stale { "yes" } else { "no" },
            format!("{}x{}", meta.image_width, meta.image_height),
            camera_stats.frames_received,
            camera_stats.frames_coalesced,
            camera_stats.drop_rate() * 100.0,
            overlay
        );
    }
    out
}
