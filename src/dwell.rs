//! Dwell-time sessions for dwell-monitored zones.
//!
//! One session per `(identity, zone)`:
//!
//! ```text
//!  ABSENT --seen--> PRESENT --dwell > threshold / alert--> ALERTING
//!     ^                |                                     |
//!     +----- not seen this frame ----------------------------+
//! ```
//!
//! While ALERTING the alert repeats only after `renotify_interval` has
//! passed since the last one. A single frame without the identity ends the
//! session; there is no grace period, so a missed detection restarts the
//! dwell timer from zero.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::alert::{Alert, AlertKind, Severity};
use crate::identity::Identity;
use crate::Timestamp;

pub const DEFAULT_DWELL_THRESHOLD: Duration = Duration::from_secs(600);
pub const DEFAULT_RENOTIFY_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Clone, Copy, Debug)]
pub struct DwellSettings {
    pub threshold: Duration,
    pub renotify_interval: Duration,
}

impl Default for DwellSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DWELL_THRESHOLD,
            renotify_interval: DEFAULT_RENOTIFY_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DwellState {
    Present,
    Alerting,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DwellSession {
    pub identity: Identity,
    pub zone_id: String,
    pub entry: Timestamp,
    pub last_seen: Timestamp,
    pub alerted: bool,
    pub last_alert: Option<Timestamp>,
}

impl DwellSession {
    fn open(identity: Identity, zone_id: &str, now: Timestamp) -> Self {
        Self {
            identity,
            zone_id: zone_id.to_string(),
            entry: now,
            last_seen: now,
            alerted: false,
            last_alert: None,
        }
    }

    pub fn state(&self) -> DwellState {
        if self.alerted {
            DwellState::Alerting
        } else {
            DwellState::Present
        }
    }

    pub fn dwell(&self, now: Timestamp) -> Duration {
        now.since(self.entry)
    }
}

type SessionKey = (Identity, String);

#[derive(Debug, Default)]
pub struct DwellTimeMonitor {
    settings: DwellSettings,
    sessions: HashMap<SessionKey, DwellSession>,
}

impl DwellTimeMonitor {
    pub fn new(settings: DwellSettings) -> Self {
        Self {
            settings,
            sessions: HashMap::new(),
        }
    }

    pub fn settings(&self) -> DwellSettings {
        self.settings
    }

    /// Advance every session by one frame.
    ///
    /// `present` lists, for each dwell-monitored zone, the identities
    /// observed in it this frame. Sessions not observed this frame are
    /// discarded. Returns the `dwell_exceeded` alerts due now.
    pub fn observe<'a, I>(&mut self, now: Timestamp, present: I) -> Vec<Alert>
    where
        I: IntoIterator<Item = (&'a str, &'a HashSet<Identity>)>,
    {
        let mut seen: HashSet<SessionKey> = HashSet::new();
        let mut alerts = Vec::new();

        for (zone_id, identities) in present {
            for identity in identities {
                let key = (identity.clone(), zone_id.to_string());
                let session = self.sessions.entry(key.clone()).or_insert_with(|| {
                    log::info!("dwell: {} entered {}", identity, zone_id);
                    DwellSession::open(identity.clone(), zone_id, now)
                });
                session.last_seen = now;
                if let Some(alert) = self.step(&key, now) {
                    alerts.push(alert);
                }
                seen.insert(key);
            }
        }

        self.sessions.retain(|key, session| {
            let keep = seen.contains(key);
            if !keep {
                log::info!(
                    "dwell: {} left {} after {:.1}s",
                    session.identity,
                    session.zone_id,
                    session.dwell(now).as_secs_f64()
                );
            }
            keep
        });

        alerts
    }

    fn step(&mut self, key: &SessionKey, now: Timestamp) -> Option<Alert> {
        let settings = self.settings;
        let session = self.sessions.get_mut(key)?;
        let dwell = session.dwell(now);

        let due = match session.last_alert {
            None => dwell > settings.threshold,
            Some(last) => now.since(last) > settings.renotify_interval,
        };
        if !due {
            return None;
        }

        session.alerted = true;
        session.last_alert = Some(now);
        log::warn!(
            "dwell: {} in {} for {}s (limit {}s)",
            session.identity,
            session.zone_id,
            dwell.as_secs(),
            settings.threshold.as_secs()
        );
        Some(dwell_alert(session, dwell, settings.threshold, now))
    }

    pub fn session(&self, identity: &Identity, zone_id: &str) -> Option<&DwellSession> {
        self.sessions.get(&(identity.clone(), zone_id.to_string()))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &DwellSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

fn dwell_alert(session: &DwellSession, dwell: Duration, threshold: Duration, now: Timestamp) -> Alert {
    let secs = dwell.as_secs();
    Alert::new(AlertKind::DwellExceeded, session.identity.to_string(), Severity::Warning, now)
        .with_meta("zone_id", session.zone_id.as_str())
        .with_meta("dwell_secs", secs)
        .with_meta("dwell_minutes", secs / 60)
        .with_meta("threshold_secs", threshold.as_secs())
        .with_meta("entry_ms", session.entry.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: &str = "bathroom";

    fn settings(threshold_s: u64, renotify_s: u64) -> DwellSettings {
        DwellSettings {
            threshold: Duration::from_secs(threshold_s),
            renotify_interval: Duration::from_secs(renotify_s),
        }
    }

    fn person(id: u64) -> Identity {
        Identity::tracked("", id)
    }

    fn frame(monitor: &mut DwellTimeMonitor, t_ms: u64, ids: &[u64]) -> Vec<Alert> {
        let set: HashSet<Identity> = ids.iter().map(|&i| person(i)).collect();
        monitor.observe(Timestamp(t_ms), [(ZONE, &set)])
    }

    #[test]
    fn no_alert_until_threshold_then_exactly_one() {
        let mut m = DwellTimeMonitor::new(settings(10, 600));
        let mut alerts = Vec::new();
        // 1 frame per 500ms for 15s
        for step in 0..=30u64 {
            let t = step * 500;
            let out = frame(&mut m, t, &[1]);
            if t <= 10_000 {
                assert!(out.is_empty(), "alert at {}ms before threshold", t);
            }
            alerts.extend(out.into_iter().map(|a| (t, a)));
        }
        assert_eq!(alerts.len(), 1);
        let (t, alert) = &alerts[0];
        assert_eq!(*t, 10_500);
        assert_eq!(alert.kind, AlertKind::DwellExceeded);
        assert_eq!(alert.subject, "track:1");
        assert_eq!(m.session(&person(1), ZONE).map(|s| s.state()), Some(DwellState::Alerting));
    }

    #[test]
    fn renotify_waits_for_interval() {
        let mut m = DwellTimeMonitor::new(settings(10, 60));
        let mut times = Vec::new();
        for step in 0..=200u64 {
            let t = step * 1000;
            if !frame(&mut m, t, &[1]).is_empty() {
                times.push(t);
            }
        }
        // first at 11s, then every >60s since last alert
        assert_eq!(times, vec![11_000, 72_000, 133_000, 194_000]);
    }

    #[test]
    fn single_frame_gap_ends_session_and_restarts_timer() {
        // Preserved behaviour: one missed detection discards the session.
        let mut m = DwellTimeMonitor::new(settings(10, 600));
        for step in 0..=8u64 {
            assert!(frame(&mut m, step * 1000, &[1]).is_empty());
        }
        assert!(frame(&mut m, 9_000, &[]).is_empty());
        assert!(m.session(&person(1), ZONE).is_none());

        // Back again: new session, entry reset, no carry-over of the 8s.
        assert!(frame(&mut m, 10_000, &[1]).is_empty());
        assert_eq!(m.session(&person(1), ZONE).map(|s| s.entry), Some(Timestamp(10_000)));
        assert!(frame(&mut m, 19_000, &[1]).is_empty());
        assert_eq!(frame(&mut m, 20_001, &[1]).len(), 1);
    }

    #[test]
    fn alerting_session_exit_emits_nothing() {
        let mut m = DwellTimeMonitor::new(settings(1, 600));
        frame(&mut m, 0, &[1]);
        assert_eq!(frame(&mut m, 2_000, &[1]).len(), 1);
        assert!(frame(&mut m, 3_000, &[]).is_empty());
        assert!(m.is_empty());
    }

    #[test]
    fn identities_are_independent() {
        let mut m = DwellTimeMonitor::new(settings(5, 600));
        frame(&mut m, 0, &[1]);
        frame(&mut m, 3_000, &[1, 2]);
        let out = frame(&mut m, 6_000, &[1, 2]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].subject, "track:1");
        let out = frame(&mut m, 9_000, &[1, 2]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].subject, "track:2");
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn same_identity_in_two_zones_has_two_sessions() {
        let mut m = DwellTimeMonitor::new(settings(5, 600));
        let set: HashSet<Identity> = [person(1)].into_iter().collect();
        m.observe(Timestamp(0), [("a", &set), ("b", &set)]);
        assert_eq!(m.len(), 2);
        m.observe(Timestamp(1000), [("a", &set)]);
        assert_eq!(m.len(), 1);
        assert!(m.session(&person(1), "b").is_none());
    }
}
