use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub flush_interval_ms: u64,
    pub min_cached_message_size: usize,
    pub cache_expiry_runs: u64,
    pub compute_max_entries: usize,
    /// 0 disables TTL eviction.
    pub compute_ttl_seconds: u64,
    pub compute_cache_dir: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8501".into(),
            flush_interval_ms: 100,
            min_cached_message_size: 10 * 1024,
            cache_expiry_runs: 4,
            compute_max_entries: 128,
            compute_ttl_seconds: 0,
            compute_cache_dir: None,
        }
    }
}

impl Settings {
    pub fn compute_ttl(&self) -> Option<Duration> {
        (self.compute_ttl_seconds > 0).then(|| Duration::from_secs(self.compute_ttl_seconds))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    flush_interval_ms: Option<u64>,
    min_cached_message_size: Option<usize>,
    cache_expiry_runs: Option<u64>,
    compute_max_entries: Option<usize>,
    compute_ttl_seconds: Option<u64>,
    compute_cache_dir: Option<String>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new("streamboard.toml"))
}

pub fn load_settings_from(path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file) => apply_file_settings(&mut settings, file),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "ignoring malformed config file");
            }
        }
    }

    if let Ok(value) = std::env::var("STREAMBOARD__BIND_ADDR") {
        settings.bind_addr = value;
    }
    if let Some(value) = env_parse("STREAMBOARD__FLUSH_INTERVAL_MS") {
        settings.flush_interval_ms = value;
    }
    if let Some(value) = env_parse("STREAMBOARD__MIN_CACHED_MESSAGE_SIZE") {
        settings.min_cached_message_size = value;
    }
    if let Some(value) = env_parse("STREAMBOARD__CACHE_EXPIRY_RUNS") {
        settings.cache_expiry_runs = value;
    }
    if let Some(value) = env_parse("STREAMBOARD__COMPUTE_MAX_ENTRIES") {
        settings.compute_max_entries = value;
    }
    if let Some(value) = env_parse("STREAMBOARD__COMPUTE_TTL_SECONDS") {
        settings.compute_ttl_seconds = value;
    }
    if let Ok(value) = std::env::var("STREAMBOARD__COMPUTE_CACHE_DIR") {
        settings.compute_cache_dir = Some(value);
    }

    settings
}

fn apply_file_settings(settings: &mut Settings, file: FileSettings) {
    if let Some(value) = file.bind_addr {
        settings.bind_addr = value;
    }
    if let Some(value) = file.flush_interval_ms {
        settings.flush_interval_ms = value;
    }
    if let Some(value) = file.min_cached_message_size {
        settings.min_cached_message_size = value;
    }
    if let Some(value) = file.cache_expiry_runs {
        settings.cache_expiry_runs = value;
    }
    if let Some(value) = file.compute_max_entries {
        settings.compute_max_entries = value;
    }
    if let Some(value) = file.compute_ttl_seconds {
        settings.compute_ttl_seconds = value;
    }
    if let Some(value) = file.compute_cache_dir {
        settings.compute_cache_dir = Some(value);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
