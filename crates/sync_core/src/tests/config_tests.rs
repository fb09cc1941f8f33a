use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_settings_path(tag: &str) -> std::path::PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    env::temp_dir().join(format!("sync_core_{tag}_{suffix}.toml"))
}

#[test]
fn defaults_match_reconnect_policy() {
    let settings = SyncSettings::default();
    let policy = settings.backoff_policy();
    assert_eq!(policy.base, Duration::from_secs(1));
    assert_eq!(policy.max, Duration::from_secs(30));
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(settings.connect_timeout, Duration::from_secs(10));
    assert_eq!(settings.write_timeout, Duration::from_secs(15));
}

#[test]
fn file_values_override_defaults() {
    let path = temp_settings_path("file");
    fs::write(
        &path,
        "server_url = \"https://sync.example\"\nreconnect_base_delay_ms = 250\nreconnect_max_attempts = 8\n",
    )
    .expect("write settings");

    let settings = load_settings_from(&path).expect("load");
    assert_eq!(settings.server_url, "https://sync.example");
    assert_eq!(settings.reconnect_base_delay, Duration::from_millis(250));
    assert_eq!(settings.reconnect_max_attempts, 8);
    assert_eq!(settings.reconnect_max_delay, Duration::from_secs(30));

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn missing_file_is_an_error_for_explicit_path() {
    let path = temp_settings_path("missing");
    let err = load_settings_from(&path).expect_err("must fail");
    assert!(err.to_string().contains("not found"));
}

#[test]
fn malformed_file_reports_path() {
    let path = temp_settings_path("bad");
    fs::write(&path, "reconnect_max_attempts = \"many\"").expect("write settings");

    let err = load_settings_from(&path).expect_err("must fail");
    assert!(err.to_string().contains("failed to parse"));

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn env_overrides_win_and_bad_numbers_are_ignored() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("SYNC_SERVER_URL", "http://legacy"),
        ("APP__SERVER_URL", "http://preferred"),
        ("APP__RECONNECT_MAX_DELAY_MS", "5000"),
        ("APP__RECONNECT_MAX_ATTEMPTS", "lots"),
        ("APP__EVENT_BUFFER", "0"),
    ]);
    let mut settings = SyncSettings::default();
    apply_env(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.server_url, "http://preferred");
    assert_eq!(settings.reconnect_max_delay, Duration::from_secs(5));
    assert_eq!(settings.reconnect_max_attempts, 5);
    assert_eq!(settings.event_buffer, 1);
}

#[test]
fn timeouts_come_from_file_then_env() {
    let path = temp_settings_path("timeouts");
    fs::write(
        &path,
        "connect_timeout_ms = 2500\nwrite_timeout_ms = 4000\nkeepalive_interval_ms = 9000\n",
    )
    .expect("write settings");

    let mut settings = load_settings_from(&path).expect("load");
    assert_eq!(settings.connect_timeout, Duration::from_millis(2500));
    assert_eq!(settings.write_timeout, Duration::from_secs(4));
    assert_eq!(settings.keepalive_interval, Duration::from_secs(9));

    let vars: HashMap<&str, &str> = HashMap::from([
        ("APP__CONNECT_TIMEOUT_MS", "750"),
        ("APP__WRITE_TIMEOUT_MS", "soon"),
    ]);
    apply_env(&mut settings, |key| vars.get(key).map(|v| v.to_string()));
    assert_eq!(settings.connect_timeout, Duration::from_millis(750));
    assert_eq!(settings.write_timeout, Duration::from_secs(4));

    fs::remove_file(path).expect("cleanup");
}
