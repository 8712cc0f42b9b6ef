//! The per-source pipeline.
//!
//! `Pipeline` owns every piece of mutable analytics state and is driven by
//! one thread. Other threads only see it through the `StatusBoard` and the
//! subscriber hub.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::alert::{Alert, AlertDispatcher, AlertKind, Severity};
use crate::detect::{
    Detection, DetectionCapability, DetectorBackend, FallModel, FallSignal, PERSON_CLASS_ID,
};
use crate::dwell::{DwellSettings, DwellTimeMonitor};
use crate::fall::{FallArbiter, FallSettings, FallVerdict};
use crate::frame::{annotate, Frame, Overlay};
use crate::identity::{Identity, TrackIdentity};
use crate::ingest::{FrameRead, FrameSource, IngestState, IngestionSupervisor, SupervisorSettings};
use crate::occupancy::OccupancyTracker;
use crate::publish::{StreamPublisher, SubscriberHub};
use crate::status::{ActiveAlert, DwellEntry, PipelineState, StatusBoard, StatusSnapshot};
use crate::storage::MetricSample;
use crate::zone::ZoneRegistry;
use crate::{CancelToken, Timestamp};

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.4;
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the pipeline needs besides its collaborators.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Subject used for stream-scoped alerts (`fall`, `stream_error`).
    pub stream_id: String,
    pub zones: ZoneRegistry,
    pub identity: TrackIdentity,
    pub dwell: DwellSettings,
    pub fall: FallSettings,
    pub supervisor: SupervisorSettings,
    pub person_class_id: u32,
    pub min_confidence: f32,
    pub target_fps: u32,
    pub metrics_interval: Duration,
}

impl PipelineSettings {
    pub fn new(stream_id: &str, zones: ZoneRegistry) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            zones,
            identity: TrackIdentity::default(),
            dwell: DwellSettings::default(),
            fall: FallSettings::default(),
            supervisor: SupervisorSettings::default(),
            person_class_id: PERSON_CLASS_ID,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            target_fps: 20,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
        }
    }

    fn frame_budget(&self) -> Duration {
        Duration::from_secs(1) / self.target_fps.max(1)
    }
}

/// Result of one processed frame.
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    pub persons: usize,
    pub occupancy: BTreeMap<String, usize>,
    pub alerts_forwarded: Vec<Alert>,
    pub fall: FallVerdict,
    pub delivered: usize,
}

pub struct Pipeline {
    settings: PipelineSettings,
    supervisor: IngestionSupervisor<Box<dyn FrameSource>>,
    detector: Box<dyn DetectorBackend>,
    fall_model: Option<Box<dyn FallModel>>,
    occupancy: OccupancyTracker,
    dwell: DwellTimeMonitor,
    arbiter: FallArbiter,
    dispatcher: AlertDispatcher,
    publisher: StreamPublisher,
    status: StatusBoard,
    frames_processed: u64,
    fall_since: Option<Timestamp>,
    last_metrics: Option<Timestamp>,
    stopped: bool,
}

impl Pipeline {
    pub fn new(
        mut settings: PipelineSettings,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        dispatcher: AlertDispatcher,
        publisher: StreamPublisher,
    ) -> Self {
        if settings.identity.tracking_enabled() && !detector.supports(DetectionCapability::Tracking) {
            log::info!(
                "detector {} has no tracker; identities fall back to grid positions",
                detector.name()
            );
            settings.identity = settings.identity.clone().without_tracking();
        }
        settings.identity = settings.identity.clone().for_source(&settings.stream_id);
        let status = StatusBoard::new(&settings.stream_id);
        let supervisor = IngestionSupervisor::new(source, settings.supervisor).with_status(status.clone());
        let occupancy = OccupancyTracker::new(settings.zones.zones().iter().map(|z| z.id.as_str()));
        Self {
            supervisor,
            detector,
            fall_model: None,
            occupancy,
            dwell: DwellTimeMonitor::new(settings.dwell),
            arbiter: FallArbiter::new(settings.fall),
            dispatcher,
            publisher,
            status,
            frames_processed: 0,
            fall_since: None,
            last_metrics: None,
            stopped: false,
            settings,
        }
    }

    pub fn with_fall_model(mut self, model: Box<dyn FallModel>) -> Self {
        log::info!("fall model enabled: {}", model.name());
        self.fall_model = Some(model);
        self
    }

    pub fn status(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn hub(&self) -> SubscriberHub {
        self.publisher.hub().clone()
    }

    pub fn state(&self) -> IngestState {
        self.supervisor.state()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn occupancy(&self) -> &OccupancyTracker {
        &self.occupancy
    }

    pub fn dwell(&self) -> &DwellTimeMonitor {
        &self.dwell
    }

    pub fn dispatcher(&self) -> &AlertDispatcher {
        &self.dispatcher
    }

    /// Run until cancelled or FATAL, then shut down. Returns the final
    /// ingest state.
    pub fn run(&mut self, cancel: &CancelToken) -> IngestState {
        log::info!(
            "pipeline {} starting: {} zones, target {} fps, detector {}",
            self.settings.stream_id,
            self.settings.zones.zones().len(),
            self.settings.target_fps,
            self.detector.name()
        );
        if let Err(e) = self.detector.warm_up() {
            log::warn!("detector warm-up failed: {:#}", e);
        }

        if self.supervisor.start() == IngestState::Reconnecting {
            self.recover(cancel, "initial connect failed");
        }

        let budget = self.settings.frame_budget();
        let mut progress = Progress::new();

        while !cancel.is_cancelled() {
            let cycle_start = Instant::now();
            match self.supervisor.next_frame() {
                FrameRead::Frame(frame) => {
                    match self.process_frame(&frame) {
                        Ok(_) => self.supervisor.confirm_delivery(),
                        Err(e) => {
                            log::error!("{:#}", e);
                            self.recover(cancel, &format!("{:#}", e));
                        }
                    }
                    progress.frame();
                }
                FrameRead::Failed => {}
                FrameRead::Reconnect => self.recover(cancel, "consecutive frame read failures"),
                FrameRead::Fatal => break,
            }
            if self.supervisor.state() == IngestState::Fatal {
                break;
            }

            if progress.due() {
                progress.log(self);
            }

            let spent = cycle_start.elapsed();
            if spent < budget {
                cancel.sleep(budget - spent);
            }
        }

        let state = self.supervisor.state();
        self.shutdown();
        state
    }

    /// Run one frame through detect, track, arbitrate, alert, annotate and
    /// publish. Errors only when the re-encoder pipe fails.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<CycleReport> {
        let now = frame.captured_at;
        let (width, height) = (frame.width(), frame.height());
        let mut report = CycleReport::default();

        let detections = match self.detector.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("frame {}: detector failed: {:#}", frame.sequence, e);
                // nothing is known about who is present; drop stale occupancy
                for zone in self.settings.zones.zones() {
                    self.occupancy.update(&zone.id, HashSet::new());
                }
                report.occupancy = self.occupancy.counts();
                return self.finish_frame(frame, &Overlay::default(), report);
            }
        };

        let persons: Vec<Detection> = detections
            .into_iter()
            .filter(|d| {
                d.class_id == self.settings.person_class_id
                    && d.confidence >= self.settings.min_confidence
            })
            .collect();
        report.persons = persons.len();

        let mut present: HashMap<&str, HashSet<Identity>> = self
            .settings
            .zones
            .zones()
            .iter()
            .map(|z| (z.id.as_str(), HashSet::new()))
            .collect();
        for det in &persons {
            let identity = self.settings.identity.resolve(det, width, height);
            let (cx, cy) = det.bbox.center();
            for zone_id in self.settings.zones.classify(cx, cy) {
                if let Some(set) = present.get_mut(zone_id) {
                    set.insert(identity.clone());
                }
            }
        }
        for (zone_id, identities) in present {
            self.occupancy.update(zone_id, identities);
        }
        report.occupancy = self.occupancy.counts();

        let occupancy = &self.occupancy;
        let dwell_present: Vec<(&str, &HashSet<Identity>)> = self
            .settings
            .zones
            .dwell_zones()
            .filter_map(|z| occupancy.members(&z.id).map(|m| (z.id.as_str(), m)))
            .collect();
        let mut alerts = self.dwell.observe(now, dwell_present);

        let signal = self.fall_signal(frame);
        report.fall = self.arbiter.evaluate(&persons, signal.as_ref(), width, height);
        if report.fall.fall_detected {
            self.fall_since.get_or_insert(now);
            alerts.push(self.fall_alert(&report.fall, now));
        } else {
            self.fall_since = None;
        }

        for alert in alerts {
            if self.dispatcher.dispatch(alert.clone()) {
                report.alerts_forwarded.push(alert);
            }
        }

        let overlay = Overlay {
            persons: persons
                .iter()
                .map(|d| (d.bbox, report.fall.bbox == Some(d.bbox)))
                .collect(),
            alert_active: report.fall.fall_detected || self.dwell.sessions().any(|s| s.alerted),
        };

        self.finish_frame(frame, &overlay, report)
    }

    fn finish_frame(
        &mut self,
        frame: &Frame,
        overlay: &Overlay,
        mut report: CycleReport,
    ) -> Result<CycleReport> {
        self.frames_processed += 1;
        self.sample_metrics(frame.captured_at);

        let annotated = annotate(frame, self.settings.zones.zones(), overlay);
        let published = self.publisher.publish(&annotated);
        self.publish_status(report.fall.fall_detected);
        report.delivered = published?;
        Ok(report)
    }

    fn fall_signal(&mut self, frame: &Frame) -> Option<FallSignal> {
        let model = self.fall_model.as_mut()?;
        match model.detect(frame) {
            Ok(signal) => Some(signal),
            Err(e) => {
                log::warn!("frame {}: fall model {} failed: {:#}", frame.sequence, model.name(), e);
                None
            }
        }
    }

    fn fall_alert(&self, verdict: &FallVerdict, now: Timestamp) -> Alert {
        let mut alert = Alert::new(AlertKind::Fall, self.settings.stream_id.as_str(), Severity::Critical, now)
            .with_meta("confidence", f64::from(verdict.confidence))
            .with_meta("source", verdict.source.map_or("unknown", |s| s.as_str()));
        if let Some(bbox) = verdict.bbox {
            alert = alert.with_meta(
                "bbox",
                vec![
                    f64::from(bbox.x1),
                    f64::from(bbox.y1),
                    f64::from(bbox.x2),
                    f64::from(bbox.y2),
                ],
            );
        }
        alert
    }

    /// Drive the supervisor through RECONNECTING, alerting on entry and on FATAL.
    fn recover(&mut self, cancel: &CancelToken, reason: &str) {
        let now = Timestamp::now();
        let attempts = self.settings.supervisor.max_reconnect_attempts;
        self.dispatcher.dispatch(
            Alert::new(AlertKind::StreamError, self.settings.stream_id.as_str(), Severity::Warning, now)
                .with_meta("state", IngestState::Reconnecting.as_str())
                .with_meta("reason", reason),
        );

        match self.supervisor.reconnect(cancel) {
            IngestState::Streaming => self.publisher.restart_reencoder(),
            IngestState::Fatal => {
                self.dispatcher.dispatch(
                    Alert::new(
                        AlertKind::StreamError,
                        self.settings.stream_id.as_str(),
                        Severity::Critical,
                        Timestamp::now(),
                    )
                    .with_meta("state", IngestState::Fatal.as_str())
                    .with_meta("reason", format!("reconnection failed after {} attempts", attempts)),
                );
            }
            IngestState::Connecting | IngestState::Reconnecting => {}
        }
        self.publish_status(false);
    }

    fn sample_metrics(&mut self, now: Timestamp) {
        let due = self
            .last_metrics
            .map_or(true, |last| now.since(last) >= self.settings.metrics_interval);
        if !due {
            return;
        }
        self.last_metrics = Some(now);
        let mut dwell_counts: HashMap<&str, usize> = HashMap::new();
        for session in self.dwell.sessions() {
            *dwell_counts.entry(session.zone_id.as_str()).or_default() += 1;
        }
        for (zone_id, occupancy) in self.occupancy.counts() {
            let dwell_sessions = dwell_counts.get(zone_id.as_str()).copied().unwrap_or(0);
            self.dispatcher.record_metric(MetricSample {
                zone_id,
                occupancy,
                dwell_sessions,
                timestamp: now,
            });
        }
    }

    fn publish_status(&self, fall_detected: bool) {
        let now = Timestamp::now();
        let mut dwell_sessions_by_zone: BTreeMap<String, Vec<DwellEntry>> = self
            .settings
            .zones
            .dwell_zones()
            .map(|z| (z.id.clone(), Vec::new()))
            .collect();
        let mut active_alerts = Vec::new();
        for session in self.dwell.sessions() {
            dwell_sessions_by_zone
                .entry(session.zone_id.clone())
                .or_default()
                .push(DwellEntry {
                    identity: session.identity.to_string(),
                    elapsed_secs: session.dwell(now).as_secs(),
                    alerted: session.alerted,
                });
            if session.alerted {
                active_alerts.push(ActiveAlert {
                    kind: AlertKind::DwellExceeded,
                    subject: session.identity.to_string(),
                    zone_id: Some(session.zone_id.clone()),
                    since: session.entry,
                });
            }
        }
        for entries in dwell_sessions_by_zone.values_mut() {
            entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        }
        if let (true, Some(since)) = (fall_detected, self.fall_since) {
            active_alerts.push(ActiveAlert {
                kind: AlertKind::Fall,
                subject: self.settings.stream_id.clone(),
                zone_id: None,
                since,
            });
        }

        let stream = self.supervisor.stream().clone();
        let pipeline_state = if self.stopped && stream.state != IngestState::Fatal {
            PipelineState::Stopped
        } else {
            stream.state.into()
        };
        self.status.publish(StatusSnapshot {
            source: self.settings.stream_id.clone(),
            pipeline_state,
            stream,
            occupancy_by_zone: self.occupancy.counts(),
            dwell_sessions_by_zone,
            active_alerts,
            recent_alerts: self.dispatcher.recent().cloned().collect(),
            fall_detected,
            frames_processed: self.frames_processed,
            subscribers: self.publisher.subscribers(),
            updated_at: now,
        });
    }

    /// Release the source, close the re-encoder, disconnect subscribers and
    /// drain the sinks. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.supervisor.release();
        self.publisher.close();
        self.dispatcher.close();
        self.stopped = true;
        self.publish_status(false);
        log::info!(
            "pipeline {} stopped after {} frames",
            self.settings.stream_id,
            self.frames_processed
        );
    }
}

struct Progress {
    started: Instant,
    last_log: Instant,
    frames_since_log: u64,
}

impl Progress {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_log: now,
            frames_since_log: 0,
        }
    }

    fn frame(&mut self) {
        self.frames_since_log += 1;
    }

    fn due(&self) -> bool {
        self.last_log.elapsed() >= PROGRESS_INTERVAL
    }

    fn log(&mut self, pipeline: &Pipeline) {
        let fps = self.frames_since_log as f64 / self.last_log.elapsed().as_secs_f64().max(1e-3);
        let occupancy: Vec<String> = pipeline
            .occupancy
            .counts()
            .iter()
            .map(|(zone, n)| format!("{}={}", zone, n))
            .collect();
        log::info!(
            "frames={} fps={:.1} uptime={}s occupancy[{}] dwell_sessions={} subscribers={} state={}",
            pipeline.frames_processed,
            fps,
            self.started.elapsed().as_secs(),
            occupancy.join(" "),
            pipeline.dwell.len(),
            pipeline.publisher.subscribers(),
            pipeline.supervisor.state().as_str()
        );
        self.last_log = Instant::now();
        self.frames_since_log = 0;
    }
}
