//! Vigil: resilient video-analytics pipeline
//!
//! This crate watches a live video feed, tracks occupancy and dwell time in
//! named zones, raises fall-risk alerts and republishes an annotated feed to
//! an external re-encoder and any number of HTTP subscribers.
//!
//! # Architecture
//!
//! One `Pipeline` per video source owns every piece of mutable state
//! (stream state, occupancy sets, dwell sessions) and runs on a single
//! worker:
//!
//! 1. **Ingest**: `IngestionSupervisor` reads frames and reconnects with a
//!    bounded number of fixed-delay attempts.
//! 2. **Detect**: an external `DetectorBackend` yields detections.
//! 3. **Resolve**: `TrackIdentity` maps detections to identities.
//! 4. **Classify**: `ZoneRegistry` places identities into zones.
//! 5. **Track**: `OccupancyTracker` and `DwellTimeMonitor` update state.
//! 6. **Arbitrate**: `FallArbiter` makes one fall/no-fall decision.
//! 7. **Alert**: `AlertDispatcher` dedupes and hands alerts to sinks.
//! 8. **Publish**: `StreamPublisher` fans out the annotated frame.
//!
//! Everything outside the ingestion loop (HTTP health, MJPEG subscribers,
//! sink delivery) reads snapshots or channels and never blocks it.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub mod alert;
pub mod api;
pub mod config;
pub mod detect;
pub mod dwell;
pub mod fall;
pub mod frame;
pub mod identity;
pub mod ingest;
pub mod notify;
pub mod occupancy;
pub mod pipeline;
pub mod publish;
pub mod status;
pub mod storage;
pub mod zone;

pub use alert::{Alert, AlertDispatcher, AlertKind, DispatchPolicy, Severity};
pub use config::VigilConfig;
pub use detect::{BBox, Detection, DetectorBackend, FallModel, FallSignal, StubBackend};
pub use dwell::{DwellSession, DwellTimeMonitor};
pub use fall::{FallArbiter, FallSource, FallVerdict};
pub use frame::Frame;
pub use identity::{Identity, TrackIdentity};
pub use ingest::{FrameSource, IngestState, IngestionSupervisor, RtspConfig, RtspSource};
pub use notify::{LogNotifier, MqttNotifier, Notifier};
pub use occupancy::OccupancyTracker;
pub use pipeline::Pipeline;
pub use publish::{FfmpegReencoder, ReencoderPipe, StreamPublisher, SubscriberHub};
pub use status::{StatusBoard, StatusSnapshot, StreamState};
pub use storage::{AlertStore, MemoryAlertStore, Record, SqliteAlertStore};
pub use zone::{NormRect, Zone, ZoneKind, ZoneRegistry};

// -------------------- Timestamps --------------------

/// Wall-clock instant in milliseconds since the Unix epoch.
///
/// Pipeline components take `now` as an argument rather than reading the
/// clock, so state machines can be driven deterministically in tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    pub fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`; zero if `earlier` is in the future.
    pub fn since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

// -------------------- Cancellation --------------------

/// Cooperative cancellation flag shared between the daemon and the pipeline.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `false` if cancelled before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLICE));
        }
    }
}

/// Install a Ctrl-C / SIGTERM handler that cancels `token`.
pub fn cancel_on_signal(token: &CancelToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        token.cancel();
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_since_saturates() {
        let early = Timestamp::from_secs(10);
        let late = Timestamp::from_secs(25);
        assert_eq!(late.since(early), Duration::from_secs(15));
        assert_eq!(early.since(late), Duration::ZERO);
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn uncancelled_sleep_completes() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(10)));
    }
}
