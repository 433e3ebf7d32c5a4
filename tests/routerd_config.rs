use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use mentat_router::config::RouterdConfig;
use mentat_router::ExpertKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ROUTER_CONFIG",
        "ROUTER_LISTEN_ADDR",
        "ROUTER_HEARTBEAT_TIMEOUT_SECS",
        "ROUTER_EVICTION_SECS",
        "ROUTER_PROCESSING_SCALE",
        "ROUTER_DISABLED_EXPERTS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_temp(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RouterdConfig::load().expect("load defaults");
    assert_eq!(cfg.listen_addr, "127.0.0.1:8765");
    assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(10));
    assert_eq!(cfg.eviction_after, Some(Duration::from_secs(3600)));
    assert_eq!(cfg.processing_scale, 0.5);
    let names: Vec<&str> = cfg.experts.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["motion", "frame_info"]);
    assert_eq!(cfg.experts[0].interval, Duration::from_millis(200));
    assert_eq!(cfg.experts[1].interval, Duration::from_secs(3));

    let registry = cfg.build_registry().expect("registry");
    assert_eq!(registry.len(), 2);
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".json",
        r#"{
            "listen_addr": "0.0.0.0:9100",
            "heartbeat_timeout_secs": 4,
            "eviction_secs": 600,
            "subscriber_queue": 16,
            "processing_scale": 0.75,
            "experts": [
                { "name": "detect", "kind": "motion", "interval_ms": 100, "timeout_ms": 50 },
                { "name": "caption", "kind": "frame_info", "interval_ms": 3000, "enabled": false }
            ]
        }"#,
    );
    std::env::set_var("ROUTER_CONFIG", file.path());
    std::env::set_var("ROUTER_EVICTION_SECS", "0");
    std::env::set_var("ROUTER_DISABLED_EXPERTS", "detect");

    let cfg = RouterdConfig::load().expect("load config");
    assert_eq!(cfg.listen_addr, "0.0.0.0:9100");
    assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(4));
    assert_eq!(cfg.eviction_after, None);
    assert_eq!(cfg.subscriber_queue, 16);
    assert_eq!(cfg.processing_scale, 0.75);
    assert_eq!(cfg.experts[0].name, "detect");
    assert_eq!(cfg.experts[0].kind, ExpertKind::Motion);
    assert_eq!(cfg.experts[0].timeout, Some(Duration::from_millis(50)));
    assert!(!cfg.experts[0].enabled);
    assert!(!cfg.experts[1].enabled);

    let settings = cfg.router_settings();
    assert_eq!(settings.liveness.heartbeat_timeout, Duration::from_secs(4));
    assert_eq!(settings.subscriber_queue, 16);

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".toml",
        r#"
listen_addr = "127.0.0.1:0"
processing_scale = 3.0

[[experts]]
name = "motion"
kind = "motion"
interval_ms = 200
"#,
    );
    std::env::set_var("ROUTER_CONFIG", file.path());

    let cfg = RouterdConfig::load().expect("load toml");
    assert_eq!(cfg.listen_addr, "127.0.0.1:0");
    // Out-of-range scale is clamped, not rejected.
    assert_eq!(cfg.processing_scale, 1.0);
    assert_eq!(cfg.experts.len(), 1);

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let duplicate = write_temp(
        ".json",
        r#"{ "experts": [
            { "name": "a", "kind": "motion" },
            { "name": "a", "kind": "frame_info" }
        ] }"#,
    );
    std::env::set_var("ROUTER_CONFIG", duplicate.path());
    let err = RouterdConfig::load().unwrap_err();
    assert!(err.to_string().contains("duplicate expert"));

    let zero_interval = write_temp(
        ".json",
        r#"{ "experts": [ { "name": "a", "kind": "motion", "interval_ms": 0 } ] }"#,
    );
    std::env::set_var("ROUTER_CONFIG", zero_interval.path());
    assert!(RouterdConfig::load().is_err());

    let unknown_field = write_temp(".json", r#"{ "listen": "127.0.0.1:1" }"#);
    std::env::set_var("ROUTER_CONFIG", unknown_field.path());
    assert!(RouterdConfig::load().is_err());

    clear_env();
    std::env::set_var("ROUTER_DISABLED_EXPERTS", "nonexistent");
    assert!(RouterdConfig::load().is_err());

    clear_env();
    std::env::set_var("ROUTER_HEARTBEAT_TIMEOUT_SECS", "soon");
    assert!(RouterdConfig::load().is_err());

    clear_env();
    std::env::set_var("ROUTER_HEARTBEAT_TIMEOUT_SECS", "0");
    assert!(RouterdConfig::load().is_err());

    clear_env();
}
