use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::{DispatchPolicy, DEFAULT_FALL_RENOTIFY, DEFAULT_STREAM_ERROR_RENOTIFY};
use crate::dwell::{DwellSettings, DEFAULT_DWELL_THRESHOLD, DEFAULT_RENOTIFY_INTERVAL};
use crate::fall::{FallSettings, DEFAULT_ASPECT_RATIO_MAX, DEFAULT_MODEL_CONFIDENCE_FLOOR};
use crate::identity::{TrackIdentity, DEFAULT_GRID_PX};
use crate::ingest::supervisor::{
    DEFAULT_MAX_FRAME_ERRORS, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY,
};
use crate::ingest::{RtspConfig, SupervisorSettings};
use crate::pipeline::{PipelineSettings, DEFAULT_METRICS_INTERVAL, DEFAULT_MIN_CONFIDENCE};
use crate::publish::{FfmpegSettings, DEFAULT_JPEG_QUALITY, DEFAULT_SUBSCRIBER_QUEUE};
use crate::zone::{NormRect, Zone, ZoneKind, ZoneRegistry};
use crate::detect::{BackendKind, BackendSettings, DEFAULT_MODEL_INPUT, PERSON_CLASS_ID};
use crate::notify::DEFAULT_TOPIC_PREFIX;

const DEFAULT_STREAM_ID: &str = "camera";
const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_TARGET_FPS: u32 = 20;
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_API_ADDR: &str = "0.0.0.0:8888";
const DEFAULT_DB_PATH: &str = "vigil.db";
const DEFAULT_MQTT_CLIENT_ID: &str = "vigild";

#[derive(Debug, Deserialize, Default)]
struct VigilConfigFile {
    source: Option<SourceConfigFile>,
    zones: Option<Vec<ZoneConfigFile>>,
    detection: Option<DetectionConfigFile>,
    dwell: Option<DwellConfigFile>,
    fall: Option<FallConfigFile>,
    alerts: Option<AlertsConfigFile>,
    ingest: Option<IngestConfigFile>,
    publish: Option<PublishConfigFile>,
    api: Option<ApiConfigFile>,
    storage: Option<StorageConfigFile>,
    mqtt: Option<MqttConfigFile>,
    webhook: Option<WebhookConfigFile>,
    metrics_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    id: Option<String>,
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ZoneConfigFile {
    id: String,
    name: Option<String>,
    rect: [f32; 4],
    kind: Option<ZoneKind>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<BackendKind>,
    model_path: Option<String>,
    input_size: Option<u32>,
    min_confidence: Option<f32>,
    person_class_id: Option<u32>,
    tracking_enabled: Option<bool>,
    grid_px: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DwellConfigFile {
    threshold_secs: Option<u64>,
    renotify_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FallConfigFile {
    enabled: Option<bool>,
    model_confidence_floor: Option<f32>,
    aspect_ratio_max: Option<f32>,
    renotify_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    falls: Option<bool>,
    dwell: Option<bool>,
    system: Option<bool>,
    stream_error_renotify_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    max_frame_errors: Option<u32>,
    max_reconnect_attempts: Option<u32>,
    reconnect_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PublishConfigFile {
    subscriber_queue: Option<usize>,
    jpeg_quality: Option<u8>,
    reencoder_url: Option<String>,
    ffmpeg_path: Option<String>,
    preset: Option<String>,
    tune: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WebhookConfigFile {
    url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Stable id used as the subject of stream-scoped alerts.
    pub id: String,
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// `None` picks the stub for `stub://` sources and tract otherwise.
    pub backend: Option<BackendKind>,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub min_confidence: f32,
    pub person_class_id: u32,
    pub tracking_enabled: bool,
    pub grid_px: u32,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub subscriber_queue: usize,
    pub jpeg_quality: u8,
    pub reencoder: Option<FfmpegSettings>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub client_id: String,
    pub topic_prefix: String,
}

#[derive(Debug, Clone)]
pub struct VigilConfig {
    pub source: SourceSettings,
    pub zones: Vec<Zone>,
    pub detection: DetectionSettings,
    pub dwell: DwellSettings,
    pub fall: FallSettings,
    pub alerts: DispatchPolicy,
    pub ingest: SupervisorSettings,
    pub publish: PublishSettings,
    pub api_addr: String,
    /// `None` disables persistence.
    pub db_path: Option<String>,
    pub mqtt: Option<MqttSettings>,
    pub webhook_url: Option<String>,
    pub metrics_interval: Duration,
}

impl VigilConfig {
    /// Defaults, then the file named by `$VIGIL_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("VIGIL_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Like `load`, with an explicit config file taking precedence over `$VIGIL_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("VIGIL_CONFIG").ok().map(PathBuf::from);
        let file_cfg = match path.or(env_path.as_deref()) {
            Some(path) => read_config_file(path)?,
            None => VigilConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VigilConfigFile) -> Result<Self> {
        let source_file = file.source.unwrap_or_default();
        let source = SourceSettings {
            id: source_file.id.unwrap_or_else(|| DEFAULT_STREAM_ID.to_string()),
            url: source_file.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            target_fps: source_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            width: source_file.width.unwrap_or(DEFAULT_WIDTH),
            height: source_file.height.unwrap_or(DEFAULT_HEIGHT),
        };

        let zones = match file.zones {
            Some(zones) => zones
                .into_iter()
                .map(|z| {
                    let [x1, y1, x2, y2] = z.rect;
                    Zone {
                        name: z.name.unwrap_or_else(|| z.id.clone()),
                        id: z.id,
                        rect: NormRect { x1, y1, x2, y2 },
                        kind: z.kind.unwrap_or(ZoneKind::Count),
                    }
                })
                .collect(),
            None => default_zones(),
        };

        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            backend: detection_file.backend,
            model_path: detection_file
                .model_path
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            input_size: detection_file.input_size.unwrap_or(DEFAULT_MODEL_INPUT),
            min_confidence: detection_file.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
            person_class_id: detection_file.person_class_id.unwrap_or(PERSON_CLASS_ID),
            tracking_enabled: detection_file.tracking_enabled.unwrap_or(true),
            grid_px: detection_file.grid_px.unwrap_or(DEFAULT_GRID_PX),
        };

        let dwell_file = file.dwell.unwrap_or_default();
        let dwell = DwellSettings {
            threshold: dwell_file
                .threshold_secs
                .map_or(DEFAULT_DWELL_THRESHOLD, Duration::from_secs),
            renotify_interval: dwell_file
                .renotify_secs
                .map_or(DEFAULT_RENOTIFY_INTERVAL, Duration::from_secs),
        };

        let fall_file = file.fall.unwrap_or_default();
        let fall = FallSettings {
            enabled: fall_file.enabled.unwrap_or(true),
            model_confidence_floor: fall_file
                .model_confidence_floor
                .unwrap_or(DEFAULT_MODEL_CONFIDENCE_FLOOR),
            aspect_ratio_max: fall_file.aspect_ratio_max.unwrap_or(DEFAULT_ASPECT_RATIO_MAX),
        };

        let alerts_file = file.alerts.unwrap_or_default();
        let alerts = DispatchPolicy {
            fall_renotify: fall_file
                .renotify_secs
                .map_or(DEFAULT_FALL_RENOTIFY, Duration::from_secs),
            dwell_renotify: dwell.renotify_interval,
            stream_error_renotify: alerts_file
                .stream_error_renotify_secs
                .map_or(DEFAULT_STREAM_ERROR_RENOTIFY, Duration::from_secs),
            alert_falls: alerts_file.falls.unwrap_or(true),
            alert_dwell: alerts_file.dwell.unwrap_or(true),
            alert_system: alerts_file.system.unwrap_or(false),
        };

        let ingest_file = file.ingest.unwrap_or_default();
        let ingest = SupervisorSettings {
            max_frame_errors: ingest_file.max_frame_errors.unwrap_or(DEFAULT_MAX_FRAME_ERRORS),
            max_reconnect_attempts: ingest_file
                .max_reconnect_attempts
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            reconnect_delay: ingest_file
                .reconnect_delay_secs
                .map_or(DEFAULT_RECONNECT_DELAY, Duration::from_secs),
        };

        let publish_file = file.publish.unwrap_or_default();
        let reencoder = publish_file
            .reencoder_url
            .filter(|url| !url.trim().is_empty())
            .map(|url| {
                let mut ffmpeg = FfmpegSettings::new(&url, source.target_fps);
                if let Some(program) = publish_file.ffmpeg_path {
                    ffmpeg.program = program;
                }
                if let Some(preset) = publish_file.preset {
                    ffmpeg.preset = preset;
                }
                if let Some(tune) = publish_file.tune {
                    ffmpeg.tune = tune;
                }
                ffmpeg
            });
        let publish = PublishSettings {
            subscriber_queue: publish_file.subscriber_queue.unwrap_or(DEFAULT_SUBSCRIBER_QUEUE),
            jpeg_quality: publish_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            reencoder,
        };

        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let db_path = match file.storage.and_then(|s| s.db_path) {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(path),
            None => Some(DEFAULT_DB_PATH.to_string()),
        };
        let mqtt = file.mqtt.and_then(|m| {
            let broker = m.broker.filter(|b| !b.trim().is_empty())?;
            Some(MqttSettings {
                broker,
                client_id: m.client_id.unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                topic_prefix: m.topic_prefix.unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            })
        });
        let webhook_url = file
            .webhook
            .and_then(|w| w.url)
            .filter(|u| !u.trim().is_empty());
        let metrics_interval = file
            .metrics_interval_secs
            .map_or(DEFAULT_METRICS_INTERVAL, Duration::from_secs);

        Ok(Self {
            source,
            zones,
            detection,
            dwell,
            fall,
            alerts,
            ingest,
            publish,
            api_addr,
            db_path,
            mqtt,
            webhook_url,
            metrics_interval,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("VIGIL_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(addr) = env_string("VIGIL_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(path) = env_string("VIGIL_DB_PATH") {
            self.db_path = Some(path);
        }
        if let Some(secs) = env_number::<u64>("VIGIL_DWELL_THRESHOLD_SECS")? {
            self.dwell.threshold = Duration::from_secs(secs);
        }
        if let Some(fps) = env_number::<u32>("VIGIL_TARGET_FPS")? {
            self.source.target_fps = fps;
            if let Some(reencoder) = self.publish.reencoder.as_mut() {
                reencoder.fps = fps;
            }
        }
        if let Some(url) = env_string("VIGIL_REENCODER_URL") {
            let mut ffmpeg = self
                .publish
                .reencoder
                .take()
                .unwrap_or_else(|| FfmpegSettings::new(&url, self.source.target_fps));
            ffmpeg.output_url = url;
            self.publish.reencoder = Some(ffmpeg);
        }
        if let Some(broker) = env_string("VIGIL_MQTT_BROKER") {
            match self.mqtt.as_mut() {
                Some(mqtt) => mqtt.broker = broker,
                None => {
                    self.mqtt = Some(MqttSettings {
                        broker,
                        client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                        topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
                    })
                }
            }
        }
        if let Some(path) = env_string("VIGIL_MODEL_PATH") {
            self.detection.model_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env_string("VIGIL_WEBHOOK_URL") {
            self.webhook_url = Some(url);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        // zone ids, rects, uniqueness and non-emptiness
        self.zone_registry()?;

        if self.source.url.trim().is_empty() {
            bail!("source url must not be empty");
        }
        if self.source.target_fps == 0 {
            bail!("source target_fps must be greater than zero");
        }
        if self.ingest.max_frame_errors == 0 {
            bail!("ingest max_frame_errors must be greater than zero");
        }
        if self.ingest.max_reconnect_attempts == 0 {
            bail!("ingest max_reconnect_attempts must be greater than zero");
        }
        if self.dwell.threshold.is_zero() {
            bail!("dwell threshold must be greater than zero");
        }
        if self.publish.subscriber_queue == 0 {
            bail!("publish subscriber_queue must be greater than zero");
        }
        if !(1..=100).contains(&self.publish.jpeg_quality) {
            bail!("publish jpeg_quality must be within 1..=100");
        }
        for (name, value) in [
            ("detection min_confidence", self.detection.min_confidence),
            ("fall model_confidence_floor", self.fall.model_confidence_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.fall.aspect_ratio_max.is_nan() || self.fall.aspect_ratio_max <= 0.0 {
            bail!("fall aspect_ratio_max must be positive");
        }
        if self.detection.grid_px == 0 {
            bail!("detection grid_px must be greater than zero");
        }
        self.backend_settings()?;
        Ok(())
    }

    /// Detector choice for the configured source.
    pub fn backend_settings(&self) -> Result<BackendSettings> {
        BackendSettings::resolve(
            &self.source.url,
            self.detection.backend,
            self.detection.model_path.clone(),
            self.detection.input_size,
            self.detection.min_confidence,
        )
    }

    pub fn zone_registry(&self) -> Result<ZoneRegistry> {
        ZoneRegistry::new(self.zones.clone())
    }

    pub fn rtsp_config(&self) -> RtspConfig {
        RtspConfig {
            url: self.source.url.clone(),
            target_fps: self.source.target_fps,
            width: self.source.width,
            height: self.source.height,
        }
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings> {
        let mut settings = PipelineSettings::new(&self.source.id, self.zone_registry()?);
        settings.identity = TrackIdentity::new(self.detection.tracking_enabled, self.detection.grid_px);
        settings.dwell = self.dwell;
        settings.fall = self.fall;
        settings.supervisor = self.ingest;
        settings.person_class_id = self.detection.person_class_id;
        settings.min_confidence = self.detection.min_confidence;
        settings.target_fps = self.source.target_fps;
        settings.metrics_interval = self.metrics_interval;
        Ok(settings)
    }
}

fn default_zones() -> Vec<Zone> {
    vec![
        Zone {
            id: "room".to_string(),
            name: "Room".to_string(),
            rect: NormRect {
                x1: 0.0,
                y1: 0.0,
                x2: 1.0,
                y2: 1.0,
            },
            kind: ZoneKind::Count,
        },
        Zone {
            id: "bathroom".to_string(),
            name: "Bathroom".to_string(),
            rect: NormRect {
                x1: 0.6,
                y1: 0.0,
                x2: 1.0,
                y2: 1.0,
            },
            kind: ZoneKind::Dwell,
        },
    ]
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer, got {:?}", key, raw)),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<VigilConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
