//! Notifier sinks.
//!
//! The dispatcher decides when to notify; these only deliver. Every notifier
//! runs on the sink worker and must return quickly: MQTT queues without
//! blocking, and the webhook has a short timeout.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::alert::{Alert, Severity};

#[cfg(feature = "notify-webhook")]
mod webhook;
#[cfg(feature = "notify-webhook")]
pub use webhook::WebhookNotifier;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_TOPIC_PREFIX: &str = "vigil";

pub trait Notifier: Send {
    fn name(&self) -> &'static str;
    fn notify(&mut self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log. Always installed so alerts are visible even
/// without any external channel.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&mut self, alert: &Alert) -> Result<()> {
        let meta = serde_json::to_string(&alert.metadata)?;
        match alert.severity {
            Severity::Critical => log::error!("ALERT {} {} {}", alert.kind, alert.subject, meta),
            Severity::Warning => log::warn!("ALERT {} {} {}", alert.kind, alert.subject, meta),
            Severity::Info => log::info!("ALERT {} {} {}", alert.kind, alert.subject, meta),
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
}

/// Parse `host`, `host:port` or `mqtt://host:port`.
pub fn parse_mqtt_endpoint(raw: &str) -> Result<MqttEndpoint> {
    let trimmed = raw.trim();
    let rest = trimmed.strip_prefix("mqtt://").unwrap_or(trimmed);
    if rest.is_empty() || rest.contains('/') {
        return Err(anyhow!("invalid MQTT broker address: {:?}", raw));
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid MQTT port in {:?}", raw))?;
            (host, port)
        }
        None => (rest, DEFAULT_MQTT_PORT),
    };
    if host.is_empty() {
        return Err(anyhow!("MQTT broker host is empty"));
    }
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
    })
}

pub fn alert_topic(prefix: &str, alert: &Alert) -> String {
    format!("{}/alerts/{}", prefix.trim_end_matches('/'), alert.kind)
}

/// Publishes each alert as JSON to `<prefix>/alerts/<kind>` with QoS 1.
///
/// Publishing uses `try_publish`, so a broker that is down or slow makes
/// `notify` fail fast instead of stalling the sink worker.
pub struct MqttNotifier {
    client: Client,
    topic_prefix: String,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttNotifier {
    pub fn connect(broker: &str, client_id: &str, topic_prefix: &str) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(broker)?;
        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);

        let (client, connection) = Client::new(options, 32);
        let connection_handle = std::thread::Builder::new()
            .name("vigil-mqtt".to_string())
            .spawn(move || drive_connection(connection))
            .context("spawn MQTT connection thread")?;
        log::info!(
            "MQTT notifier -> {}:{} (topic prefix {})",
            endpoint.host,
            endpoint.port,
            topic_prefix
        );
        Ok(Self {
            client,
            topic_prefix: topic_prefix.to_string(),
            connection_handle: Some(connection_handle),
        })
    }
}

fn drive_connection(mut connection: Connection) {
    let mut last_error: Option<String> = None;
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {
                last_error = None;
            }
            Err(e) => {
                let msg = e.to_string();
                if last_error.as_deref() != Some(msg.as_str()) {
                    log::warn!("MQTT connection error: {}", msg);
                }
                last_error = Some(msg);
                // rumqttc reconnects on the next poll
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

impl Notifier for MqttNotifier {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn notify(&mut self, alert: &Alert) -> Result<()> {
        let payload = serde_json::to_vec(alert)?;
        let topic = alert_topic(&self.topic_prefix, alert);
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("MQTT publish: {}", e))?;
        Ok(())
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect: {}", e);
        }
        // The connection thread exits once the event loop reports the
        // disconnect; it is not joined so shutdown never waits on the broker.
        self.connection_handle.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertKind;
    use crate::Timestamp;

    #[test]
    fn parses_broker_addresses() -> Result<()> {
        assert_eq!(
            parse_mqtt_endpoint("mqtt://broker.local:1884")?,
            MqttEndpoint {
                host: "broker.local".into(),
                port: 1884
            }
        );
        assert_eq!(parse_mqtt_endpoint("10.0.0.2")?.port, DEFAULT_MQTT_PORT);
        assert!(parse_mqtt_endpoint("").is_err());
        assert!(parse_mqtt_endpoint("host:notaport").is_err());
        assert!(parse_mqtt_endpoint("mqtt://host/path").is_err());
        Ok(())
    }

    #[test]
    fn topic_is_scoped_by_kind() {
        let alert = Alert::new(AlertKind::DwellExceeded, "track:1", Severity::Warning, Timestamp(0));
        assert_eq!(alert_topic("home/cam1/", &alert), "home/cam1/alerts/dwell_exceeded");
    }

    #[test]
    fn log_notifier_accepts_every_severity() -> Result<()> {
        let mut n = LogNotifier;
        for severity in [Severity::Info, Severity::Warning, Severity::Critical] {
            n.notify(&Alert::new(AlertKind::StreamError, "stream:cam", severity, Timestamp(0)))?;
        }
        Ok(())
    }
}
