//! Configuration management
//!
//! Settings are layered: built-in defaults, then an optional `relay.{toml,json,yaml}`
//! in the config directory, then `RELAY_*` environment variables.
//! The station catalog itself is a separate JSON document (see [`crate::catalog`]).

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Data-plane port the playback device connects to
    #[serde(default = "default_audio_port")]
    pub audio_port: u16,

    /// HTTP control API port
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,

    #[serde(default = "default_state_path")]
    pub state_path: String,

    #[serde(default = "default_transcoder")]
    pub transcoder: String,

    #[serde(default)]
    pub transcoder_stderr: bool,

    #[serde(default = "default_reap_timeout_secs")]
    pub reap_timeout_secs: u64,

    /// 0 disables the pause after failed runs
    #[serde(default)]
    pub failure_backoff_ms: u64,

    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,

    /// Directory relative paths are resolved against (not read from sources)
    #[serde(skip)]
    pub config_dir: PathBuf,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_audio_port() -> u16 {
    8888
}

fn default_control_port() -> u16 {
    8889
}

fn default_catalog_path() -> String {
    "config.json".to_string()
}

fn default_state_path() -> String {
    "state.txt".to_string()
}

fn default_transcoder() -> String {
    "ffmpeg".to_string()
}

fn default_reap_timeout_secs() -> u64 {
    10
}

fn default_metadata_timeout_secs() -> u64 {
    10
}

impl Config {
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.resolve(&self.catalog_path)
    }

    pub fn state_file(&self) -> PathBuf {
        self.resolve(&self.state_path)
    }

    pub fn audio_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.audio_port)
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.control_port)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_secs(self.reap_timeout_secs)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}

/// Config directory: RELAY_CONFIG_DIR, or the working directory
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RELAY_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let builder = ::config::Config::builder()
        .set_default("bind_host", default_bind_host())?
        .set_default("audio_port", default_audio_port() as i64)?
        .set_default("control_port", default_control_port() as i64)?
        // Load from settings file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("relay").to_string_lossy()).required(false),
        )
        // Override with environment variables (RELAY_AUDIO_PORT, RELAY_TRANSCODER, etc.)
        .add_source(
            ::config::Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .try_parsing(true),
        );

    let mut config: Config = builder.build()?.try_deserialize()?;
    config.config_dir = config_dir;
    Ok(config)
}
