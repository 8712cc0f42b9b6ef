use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use vigil::config::VigilConfig;
use vigil::detect::BackendKind;
use vigil::zone::ZoneKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VIGIL_CONFIG",
        "VIGIL_SOURCE_URL",
        "VIGIL_API_ADDR",
        "VIGIL_DB_PATH",
        "VIGIL_DWELL_THRESHOLD_SECS",
        "VIGIL_TARGET_FPS",
        "VIGIL_REENCODER_URL",
        "VIGIL_MQTT_BROKER",
        "VIGIL_WEBHOOK_URL",
        "VIGIL_MODEL_PATH",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().expect("temp config");
    std::io::Write::write_all(&mut file, body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = VigilConfig::load().expect("load defaults");
    assert_eq!(cfg.source.url, "stub://camera");
    assert_eq!(cfg.source.target_fps, 20);
    assert_eq!((cfg.source.width, cfg.source.height), (1280, 720));
    assert_eq!(cfg.api_addr, "0.0.0.0:8888");
    assert_eq!(cfg.db_path.as_deref(), Some("vigil.db"));
    assert_eq!(cfg.dwell.threshold, Duration::from_secs(600));
    assert_eq!(cfg.ingest.max_reconnect_attempts, 10);
    assert_eq!(cfg.ingest.reconnect_delay, Duration::from_secs(5));
    assert!(cfg.publish.reencoder.is_none());
    assert!(cfg.mqtt.is_none());

    let ids: Vec<_> = cfg.zones.iter().map(|z| z.id.as_str()).collect();
    assert_eq!(ids, vec!["room", "bathroom"]);
    let registry = cfg.zone_registry().expect("default zones valid");
    assert_eq!(registry.dwell_zones().count(), 1);
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "source": { "id": "ward-3", "url": "rtsp://camera-1/stream", "target_fps": 12 },
            "detection": { "model_path": "models/person.onnx", "input_size": 320 },
            "zones": [
                { "id": "bed", "rect": [0.0, 0.0, 0.5, 1.0] },
                { "id": "wc", "name": "Washroom", "rect": [0.5, 0.0, 1.0, 1.0], "kind": "dwell" }
            ],
            "dwell": { "threshold_secs": 300 },
            "api": { "addr": "127.0.0.1:9000" },
            "storage": { "db_path": "" },
            "mqtt": { "broker": "mqtt://broker.local:1884", "topic_prefix": "ward3" }
        }"#,
    );

    std::env::set_var("VIGIL_CONFIG", file.path());
    std::env::set_var("VIGIL_DWELL_THRESHOLD_SECS", "120");
    std::env::set_var("VIGIL_REENCODER_URL", "rtsp://127.0.0.1:8554/annotated");

    let cfg = VigilConfig::load().expect("load config");

    assert_eq!(cfg.source.id, "ward-3");
    assert_eq!(cfg.source.url, "rtsp://camera-1/stream");
    assert_eq!(cfg.source.target_fps, 12);
    assert_eq!(cfg.api_addr, "127.0.0.1:9000");
    assert_eq!(cfg.db_path, None);
    assert_eq!(cfg.dwell.threshold, Duration::from_secs(120));

    assert_eq!(cfg.zones.len(), 2);
    assert_eq!(cfg.zones[0].name, "bed");
    assert_eq!(cfg.zones[0].kind, ZoneKind::Count);
    assert_eq!(cfg.zones[1].name, "Washroom");
    assert_eq!(cfg.zones[1].kind, ZoneKind::Dwell);

    let reencoder = cfg.publish.reencoder.as_ref().expect("reencoder from env");
    assert_eq!(reencoder.output_url, "rtsp://127.0.0.1:8554/annotated");
    assert_eq!(reencoder.fps, 12);

    let mqtt = cfg.mqtt.as_ref().expect("mqtt configured");
    assert_eq!(mqtt.broker, "mqtt://broker.local:1884");
    assert_eq!(mqtt.topic_prefix, "ward3");

    let backend = cfg.backend_settings().expect("backend settings");
    assert_eq!(backend.kind, BackendKind::Tract);
    assert_eq!(backend.input_size, 320);

    let settings = cfg.pipeline_settings().expect("pipeline settings");
    assert_eq!(settings.stream_id, "ward-3");
    assert_eq!(settings.target_fps, 12);

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
metrics_interval_secs = 30

[source]
url = "rtsp://camera-2/live"

[detection]
backend = "tract"

[[zones]]
id = "lobby"
rect = [0.0, 0.0, 1.0, 1.0]

[ingest]
max_reconnect_attempts = 3
reconnect_delay_secs = 1

[alerts]
system = true
"#,
    );

    std::env::set_var("VIGIL_MODEL_PATH", "/opt/models/person.onnx");
    let cfg = VigilConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(
        cfg.detection.model_path.as_deref(),
        Some(std::path::Path::new("/opt/models/person.onnx"))
    );
    assert_eq!(cfg.source.url, "rtsp://camera-2/live");
    assert_eq!(cfg.zones.len(), 1);
    assert_eq!(cfg.ingest.max_reconnect_attempts, 3);
    assert_eq!(cfg.ingest.reconnect_delay, Duration::from_secs(1));
    assert_eq!(cfg.metrics_interval, Duration::from_secs(30));
    assert!(cfg.alerts.alert_system);

    clear_env();
}

#[test]
fn rejects_invalid_zone_rect() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{ "zones": [ { "id": "bad", "rect": [0.8, 0.0, 0.2, 1.0] } ] }"#,
    );
    assert!(VigilConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn rejects_duplicate_zone_ids() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{ "zones": [
            { "id": "a", "rect": [0.0, 0.0, 0.5, 0.5] },
            { "id": "a", "rect": [0.5, 0.5, 1.0, 1.0] }
        ] }"#,
    );
    assert!(VigilConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn rejects_malformed_numeric_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_DWELL_THRESHOLD_SECS", "ten minutes");
    let err = VigilConfig::load().unwrap_err();
    assert!(err.to_string().contains("VIGIL_DWELL_THRESHOLD_SECS"));

    clear_env();
}

#[test]
fn rejects_zero_target_fps() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_TARGET_FPS", "0");
    assert!(VigilConfig::load().is_err());

    clear_env();
}

#[test]
fn camera_source_without_model_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_SOURCE_URL", "rtsp://camera-1/stream");
    let err = VigilConfig::load().unwrap_err();
    assert!(err.to_string().contains("model_path"), "{}", err);

    let file = write_config(".json", r#"{ "detection": { "backend": "stub" } }"#);
    let err = VigilConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("stub://"), "{}", err);

    std::env::remove_var("VIGIL_SOURCE_URL");
    let cfg = VigilConfig::load_from(Some(file.path())).expect("stub source keeps the stub");
    assert_eq!(cfg.backend_settings().expect("backend").kind, BackendKind::Stub);

    clear_env();
}
