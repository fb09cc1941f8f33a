use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::backoff::BackoffPolicy;

pub const SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub server_url: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,
    /// Maximum distance between a pending write and its echo's timestamp.
    /// Also how long an acknowledged write waits for its echo.
    pub echo_window: Duration,
    pub event_buffer: usize,
    /// Upper bound for one connect attempt, handshake included.
    pub connect_timeout: Duration,
    /// Upper bound for one HTTP write or history fetch.
    pub write_timeout: Duration,
    /// Silence on the link before a ping is sent; twice this drops the link.
    pub keepalive_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            reconnect_base_delay: Duration::from_millis(1_000),
            reconnect_max_delay: Duration::from_millis(30_000),
            reconnect_max_attempts: 5,
            echo_window: Duration::from_secs(10),
            event_buffer: 1024,
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

impl SyncSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.reconnect_base_delay,
            max: self.reconnect_max_delay,
            max_attempts: self.reconnect_max_attempts,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    echo_window_ms: Option<u64>,
    event_buffer: Option<usize>,
    connect_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    keepalive_interval_ms: Option<u64>,
}

impl FileSettings {
    fn apply(self, settings: &mut SyncSettings) {
        if let Some(v) = self.server_url {
            settings.server_url = v;
        }
        if let Some(v) = self.reconnect_base_delay_ms {
            settings.reconnect_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.reconnect_max_delay_ms {
            settings.reconnect_max_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.reconnect_max_attempts {
            settings.reconnect_max_attempts = v;
        }
        if let Some(v) = self.echo_window_ms {
            settings.echo_window = Duration::from_millis(v);
        }
        if let Some(v) = self.event_buffer {
            settings.event_buffer = v.max(1);
        }
        if let Some(v) = self.connect_timeout_ms {
            settings.connect_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.write_timeout_ms {
            settings.write_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.keepalive_interval_ms {
            settings.keepalive_interval = Duration::from_millis(v);
        }
    }
}

/// Defaults, then `sync.toml` in the working directory, then `APP__*` env vars.
pub fn load_settings() -> SyncSettings {
    let mut settings = SyncSettings::default();

    match load_file_settings(Path::new(SETTINGS_FILE)) {
        Ok(Some(file_cfg)) => file_cfg.apply(&mut settings),
        Ok(None) => {}
        Err(err) => tracing::warn!("config: ignoring {SETTINGS_FILE}: {err:#}"),
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<SyncSettings> {
    let mut settings = SyncSettings::default();
    let file_cfg = load_file_settings(path)?
        .with_context(|| format!("settings file '{}' not found", path.display()))?;
    file_cfg.apply(&mut settings);
    Ok(settings)
}

fn load_file_settings(path: &Path) -> anyhow::Result<Option<FileSettings>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    };
    let parsed = toml::from_str::<FileSettings>(&raw)
        .with_context(|| format!("failed to parse '{}'", path.display()))?;
    Ok(Some(parsed))
}

fn apply_env(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SYNC_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = lookup("APP__RECONNECT_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_base_delay = Duration::from_millis(v);
    }
    if let Some(v) = lookup("APP__RECONNECT_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_max_delay = Duration::from_millis(v);
    }
    if let Some(v) = lookup("APP__RECONNECT_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.reconnect_max_attempts = v;
    }
    if let Some(v) = lookup("APP__ECHO_WINDOW_MS").and_then(|v| v.parse().ok()) {
        settings.echo_window = Duration::from_millis(v);
    }
    if let Some(v) = lookup("APP__EVENT_BUFFER").and_then(|v| v.parse::<usize>().ok()) {
        settings.event_buffer = v.max(1);
    }
    if let Some(v) = lookup("APP__CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.connect_timeout = Duration::from_millis(v);
    }
    if let Some(v) = lookup("APP__WRITE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.write_timeout = Duration::from_millis(v);
    }
    if let Some(v) = lookup("APP__KEEPALIVE_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.keepalive_interval = Duration::from_millis(v);
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
