//! Read-only status snapshots for health and monitoring callers.
//!
//! The ingestion loop is the only writer. It swaps in a fresh
//! `Arc<StatusSnapshot>` under a short write lock; readers clone the `Arc`
//! and never hold the lock while serializing, so a slow HTTP client can not
//! stall the pipeline.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::alert::{Alert, AlertKind};
use crate::ingest::IngestState;
use crate::Timestamp;

/// Capture-side state, owned by the ingestion supervisor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamState {
    pub state: IngestState,
    pub connected: bool,
    pub consecutive_frame_errors: u32,
    pub consecutive_reconnect_attempts: u32,
    pub last_frame_at: Option<Timestamp>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            state: IngestState::Connecting,
            connected: false,
            consecutive_frame_errors: 0,
            consecutive_reconnect_attempts: 0,
            last_frame_at: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Connecting,
    Streaming,
    Reconnecting,
    Fatal,
    Stopped,
}

impl From<IngestState> for PipelineState {
    fn from(state: IngestState) -> Self {
        match state {
            IngestState::Connecting => PipelineState::Connecting,
            IngestState::Streaming => PipelineState::Streaming,
            IngestState::Reconnecting => PipelineState::Reconnecting,
            IngestState::Fatal => PipelineState::Fatal,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DwellEntry {
    pub identity: String,
    pub elapsed_secs: u64,
    pub alerted: bool,
}

/// A condition currently in effect (as opposed to a forwarded alert).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActiveAlert {
    pub kind: AlertKind,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    pub since: Timestamp,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub source: String,
    pub pipeline_state: PipelineState,
    #[serde(flatten)]
    pub stream: StreamState,
    pub occupancy_by_zone: BTreeMap<String, usize>,
    pub dwell_sessions_by_zone: BTreeMap<String, Vec<DwellEntry>>,
    pub active_alerts: Vec<ActiveAlert>,
    pub recent_alerts: Vec<Alert>,
    pub fall_detected: bool,
    pub frames_processed: u64,
    pub subscribers: usize,
    pub updated_at: Timestamp,
}

impl StatusSnapshot {
    pub fn initial(source: &str) -> Self {
        Self {
            source: source.to_string(),
            pipeline_state: PipelineState::Connecting,
            stream: StreamState::default(),
            occupancy_by_zone: BTreeMap::new(),
            dwell_sessions_by_zone: BTreeMap::new(),
            active_alerts: Vec::new(),
            recent_alerts: Vec::new(),
            fall_detected: false,
            frames_processed: 0,
            subscribers: 0,
            updated_at: Timestamp::now(),
        }
    }

    /// Healthy means a live capture and a pipeline that is still running.
    pub fn is_healthy(&self) -> bool {
        self.stream.connected
            && self.stream.state != IngestState::Fatal
            && self.pipeline_state != PipelineState::Stopped
    }
}

#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<RwLock<Arc<StatusSnapshot>>>,
}

impl StatusBoard {
    pub fn new(source: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(StatusSnapshot::initial(source)))),
        }
    }

    pub fn snapshot(&self) -> Arc<StatusSnapshot> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.inner.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// Replace only the capture-side fields, keeping the rest of the last snapshot.
    pub fn update_stream(&self, stream: &StreamState) {
        self.modify(|snap| {
            snap.stream = stream.clone();
            snap.pipeline_state = stream.state.into();
        });
    }

    pub fn is_healthy(&self) -> bool {
        self.snapshot().is_healthy()
    }

    fn modify(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let mut next = (*self.snapshot()).clone();
        f(&mut next);
        next.updated_at = Timestamp::now();
        self.publish(next);
    }
}
