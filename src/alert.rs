//! Alerts and the dispatcher that rate-limits them before the sinks.
//!
//! The dispatcher decides *whether* an alert goes out. Delivery runs on a
//! background sink worker so notifier or database latency never reaches the
//! ingestion loop, and sink failures are logged and dropped there.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Sender};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::notify::Notifier;
use crate::storage::{AlertStore, MetricSample, Record};
use crate::Timestamp;

pub const DEFAULT_FALL_RENOTIFY: Duration = Duration::from_secs(300);
pub const DEFAULT_STREAM_ERROR_RENOTIFY: Duration = Duration::from_secs(300);
pub const RECENT_ALERTS: usize = 50;
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Fall,
    DwellExceeded,
    StreamError,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Fall => "fall",
            AlertKind::DwellExceeded => "dwell_exceeded",
            AlertKind::StreamError => "stream_error",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    /// Identity (dwell) or stream id (fall, stream_error).
    pub subject: String,
    pub severity: Severity,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Alert {
    pub fn new(kind: AlertKind, subject: impl Into<String>, severity: Severity, timestamp: Timestamp) -> Self {
        Self {
            kind,
            subject: subject.into(),
            severity,
            timestamp,
            metadata: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Which alerts are forwarded, and how often per `(kind, subject)`.
#[derive(Clone, Debug)]
pub struct DispatchPolicy {
    pub fall_renotify: Duration,
    pub dwell_renotify: Duration,
    pub stream_error_renotify: Duration,
    pub alert_falls: bool,
    pub alert_dwell: bool,
    /// Non-critical `stream_error` alerts are forwarded only when set.
    pub alert_system: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            fall_renotify: DEFAULT_FALL_RENOTIFY,
            dwell_renotify: crate::dwell::DEFAULT_RENOTIFY_INTERVAL,
            stream_error_renotify: DEFAULT_STREAM_ERROR_RENOTIFY,
            alert_falls: true,
            alert_dwell: true,
            alert_system: false,
        }
    }
}

impl DispatchPolicy {
    fn interval(&self, kind: AlertKind) -> Duration {
        match kind {
            AlertKind::Fall => self.fall_renotify,
            AlertKind::DwellExceeded => self.dwell_renotify,
            AlertKind::StreamError => self.stream_error_renotify,
        }
    }

    fn enabled(&self, alert: &Alert) -> bool {
        match alert.kind {
            AlertKind::Fall => self.alert_falls,
            AlertKind::DwellExceeded => self.alert_dwell,
            AlertKind::StreamError => self.alert_system || alert.severity == Severity::Critical,
        }
    }
}

pub struct AlertDispatcher {
    policy: DispatchPolicy,
    last_forwarded: HashMap<(AlertKind, String), Timestamp>,
    recent: VecDeque<Alert>,
    tx: Option<Sender<Record>>,
    worker: Option<JoinHandle<()>>,
}

impl AlertDispatcher {
    /// Start the sink worker and return a dispatcher feeding it.
    pub fn spawn(
        policy: DispatchPolicy,
        notifiers: Vec<Box<dyn Notifier>>,
        store: Option<Box<dyn AlertStore>>,
    ) -> Result<Self> {
        let (tx, rx) = unbounded::<Record>();
        let worker = std::thread::Builder::new()
            .name("vigil-sinks".to_string())
            .spawn(move || run_sinks(rx, notifiers, store))
            .context("spawn sink worker")?;
        Ok(Self {
            policy,
            last_forwarded: HashMap::new(),
            recent: VecDeque::with_capacity(RECENT_ALERTS),
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Forward the alert to the sinks unless disabled or within its renotify window.
    pub fn dispatch(&mut self, alert: Alert) -> bool {
        if !self.policy.enabled(&alert) {
            log::debug!("alert {} for {} disabled by policy", alert.kind, alert.subject);
            return false;
        }

        let key = (alert.kind, alert.subject.clone());
        let bypass = alert.kind == AlertKind::StreamError && alert.severity == Severity::Critical;
        if !bypass {
            if let Some(last) = self.last_forwarded.get(&key) {
                let interval = self.policy.interval(alert.kind);
                if alert.timestamp.since(*last) <= interval {
                    log::debug!(
                        "alert {} for {} suppressed ({}s since last)",
                        alert.kind,
                        alert.subject,
                        alert.timestamp.since(*last).as_secs()
                    );
                    return false;
                }
            }
        }

        self.last_forwarded.insert(key, alert.timestamp);
        if self.last_forwarded.len() > PRUNE_THRESHOLD {
            self.prune(alert.timestamp);
        }

        log::warn!(
            "alert {} [{}] subject={}",
            alert.kind,
            alert.severity.as_str(),
            alert.subject
        );
        if self.recent.len() == RECENT_ALERTS {
            self.recent.pop_front();
        }
        self.recent.push_back(alert.clone());
        self.send(Record::Alert(alert));
        true
    }

    /// Queue a metric sample for the persistence sink.
    pub fn record_metric(&mut self, sample: MetricSample) {
        self.send(Record::Metric(sample));
    }

    /// Forwarded alerts, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &Alert> {
        self.recent.iter()
    }

    /// Stop accepting records and wait for the worker to drain its queue.
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("sink worker panicked");
            }
        }
    }

    fn send(&self, record: Record) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(record).is_err() {
            log::error!("sink worker is gone; record dropped");
        }
    }

    fn prune(&mut self, now: Timestamp) {
        let policy = &self.policy;
        self.last_forwarded
            .retain(|(kind, _), last| now.since(*last) <= policy.interval(*kind));
    }
}

impl Drop for AlertDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_sinks(
    rx: crossbeam_channel::Receiver<Record>,
    mut notifiers: Vec<Box<dyn Notifier>>,
    mut store: Option<Box<dyn AlertStore>>,
) {
    for record in rx {
        if let Record::Alert(alert) = &record {
            for notifier in notifiers.iter_mut() {
                if let Err(e) = notifier.notify(alert) {
                    log::error!("notifier {} failed: {:#}", notifier.name(), e);
                }
            }
        }
        if let Some(store) = store.as_mut() {
            if let Err(e) = store.record(&record) {
                log::error!("persistence sink failed: {:#}", e);
            }
        }
    }
    log::debug!("sink worker drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAlertStore;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};

    struct Recording(Arc<Mutex<Vec<Alert>>>);

    impl Notifier for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }
        fn notify(&mut self, alert: &Alert) -> Result<()> {
            self.0.lock().map_err(|_| anyhow!("poisoned"))?.push(alert.clone());
            Ok(())
        }
    }

    struct Failing;

    impl Notifier for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn notify(&mut self, _alert: &Alert) -> Result<()> {
            Err(anyhow!("smtp unreachable"))
        }
    }

    fn fall(t_s: u64) -> Alert {
        Alert::new(AlertKind::Fall, "stream:cam", Severity::Critical, Timestamp::from_secs(t_s))
    }

    #[test]
    fn fall_forwarded_at_most_once_per_interval() -> Result<()> {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut d = AlertDispatcher::spawn(
            DispatchPolicy::default(),
            vec![Box::new(Recording(sent.clone()))],
            None,
        )?;
        assert!(d.dispatch(fall(0)));
        assert!(!d.dispatch(fall(1)));
        assert!(!d.dispatch(fall(300)));
        assert!(d.dispatch(fall(301)));
        d.close();
        assert_eq!(sent.lock().unwrap().len(), 2);
        Ok(())
    }

    #[test]
    fn dedupe_is_keyed_by_kind_and_subject() -> Result<()> {
        let mut d = AlertDispatcher::spawn(DispatchPolicy::default(), vec![], None)?;
        let t = Timestamp::from_secs(5);
        assert!(d.dispatch(Alert::new(AlertKind::DwellExceeded, "track:1", Severity::Warning, t)));
        assert!(d.dispatch(Alert::new(AlertKind::DwellExceeded, "track:2", Severity::Warning, t)));
        assert!(d.dispatch(Alert::new(AlertKind::Fall, "track:1", Severity::Critical, t)));
        assert!(!d.dispatch(Alert::new(AlertKind::DwellExceeded, "track:1", Severity::Warning, t)));
        Ok(())
    }

    #[test]
    fn failing_sink_does_not_block_others() -> Result<()> {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let store = MemoryAlertStore::new();
        let records = store.handle();
        let mut d = AlertDispatcher::spawn(
            DispatchPolicy::default(),
            vec![Box::new(Failing), Box::new(Recording(sent.clone()))],
            Some(Box::new(store)),
        )?;
        assert!(d.dispatch(fall(0)));
        d.close();
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(records.lock().unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn disabled_kinds_are_not_forwarded() -> Result<()> {
        let policy = DispatchPolicy {
            alert_falls: false,
            ..DispatchPolicy::default()
        };
        let mut d = AlertDispatcher::spawn(policy, vec![], None)?;
        assert!(!d.dispatch(fall(0)));
        let warn = Alert::new(AlertKind::StreamError, "stream:cam", Severity::Warning, Timestamp(0));
        assert!(!d.dispatch(warn));
        let fatal = Alert::new(AlertKind::StreamError, "stream:cam", Severity::Critical, Timestamp(0));
        assert!(d.dispatch(fatal.clone()));
        // critical stream errors bypass dedupe
        assert!(d.dispatch(fatal));
        assert_eq!(d.recent().count(), 2);
        Ok(())
    }

    #[test]
    fn recent_history_is_bounded() -> Result<()> {
        let mut d = AlertDispatcher::spawn(DispatchPolicy::default(), vec![], None)?;
        for i in 0..(RECENT_ALERTS as u64 + 10) {
            let a = Alert::new(AlertKind::DwellExceeded, format!("track:{}", i), Severity::Warning, Timestamp(i));
            assert!(d.dispatch(a));
        }
        assert_eq!(d.recent().count(), RECENT_ALERTS);
        assert_eq!(d.recent().next().map(|a| a.subject.as_str()), Some("track:10"));
        Ok(())
    }
}
