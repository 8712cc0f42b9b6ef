//! vigild - video analytics daemon
//!
//! This daemon:
//! 1. Loads zones and thresholds from the config file and environment
//! 2. Reads frames from the configured source, reconnecting on failure
//! 3. Tracks zone occupancy and dwell time, arbitrates fall alerts
//! 4. Delivers alerts to the log, MQTT, a webhook and the alert database
//! 5. Serves /health, /status and an annotated MJPEG feed over HTTP
//! 6. Pushes the annotated feed to an external re-encoder when configured

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use vigil::api::{ApiConfig, ApiServer};
use vigil::config::VigilConfig;
use vigil::detect::open_backend;
use vigil::pipeline::Pipeline;
use vigil::{
    cancel_on_signal, AlertDispatcher, AlertStore, CancelToken, FfmpegReencoder, IngestState,
    LogNotifier, MqttNotifier, Notifier, ReencoderPipe, RtspSource, SqliteAlertStore,
    StreamPublisher, SubscriberHub,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Zone occupancy, dwell-time and fall alerts for a live video feed")]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = VigilConfig::load_from(args.config.as_deref())?;
    log::info!(
        "vigild {} starting: source {} ({} zones)",
        env!("CARGO_PKG_VERSION"),
        cfg.source.id,
        cfg.zones.len()
    );

    let source = RtspSource::new(cfg.rtsp_config())?;
    let backend = cfg.backend_settings()?;
    let detector = open_backend(&backend)?;
    log::info!("detector backend: {}", backend.kind.as_str());

    let dispatcher = AlertDispatcher::spawn(cfg.alerts.clone(), build_notifiers(&cfg), build_store(&cfg)?)?;

    let reencoder = cfg
        .publish
        .reencoder
        .clone()
        .map(|settings| Box::new(FfmpegReencoder::new(settings)) as Box<dyn ReencoderPipe>);
    let hub = SubscriberHub::new(cfg.publish.subscriber_queue);
    let publisher = StreamPublisher::new(reencoder, hub, cfg.publish.jpeg_quality);

    let mut pipeline = Pipeline::new(
        cfg.pipeline_settings()?,
        Box::new(source),
        detector,
        dispatcher,
        publisher,
    );

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        pipeline.status(),
        pipeline.hub(),
    )
    .spawn()?;

    let cancel = CancelToken::new();
    cancel_on_signal(&cancel)?;

    let final_state = pipeline.run(&cancel);
    if final_state == IngestState::Fatal {
        log::error!("ingestion stopped after exhausting reconnect attempts; serving health until shutdown");
        while cancel.sleep(std::time::Duration::from_secs(1)) {}
    }
    pipeline.shutdown();

    api_handle.stop()?;
    log::info!("vigild stopped");
    Ok(())
}

fn build_notifiers(cfg: &VigilConfig) -> Vec<Box<dyn Notifier>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
    if let Some(mqtt) = &cfg.mqtt {
        match MqttNotifier::connect(&mqtt.broker, &mqtt.client_id, &mqtt.topic_prefix) {
            Ok(notifier) => notifiers.push(Box::new(notifier)),
            Err(err) => log::warn!("mqtt notifier disabled: {:#}", err),
        }
    }
    if let Some(url) = &cfg.webhook_url {
        add_webhook(&mut notifiers, url);
    }
    notifiers
}

#[cfg(feature = "notify-webhook")]
fn add_webhook(notifiers: &mut Vec<Box<dyn Notifier>>, url: &str) {
    match vigil::notify::WebhookNotifier::new(url) {
        Ok(notifier) => notifiers.push(Box::new(notifier)),
        Err(err) => log::warn!("webhook notifier disabled: {:#}", err),
    }
}

#[cfg(not(feature = "notify-webhook"))]
fn add_webhook(_notifiers: &mut Vec<Box<dyn Notifier>>, _url: &str) {
    log::warn!("webhook configured but vigild was built without the notify-webhook feature");
}

fn build_store(cfg: &VigilConfig) -> Result<Option<Box<dyn AlertStore>>> {
    match &cfg.db_path {
        Some(path) => {
            let store = SqliteAlertStore::open(path)?;
            log::info!("alert database: {}", path);
            Ok(Some(Box::new(store)))
        }
        None => Ok(None),
    }
}
