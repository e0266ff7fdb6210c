//! Configuration loading.
//!
//! Settings come from three layers, later layers winning:
//!
//! 1. Built-in defaults (see [`crate::constants`])
//! 2. `config.json` in the config directory
//! 3. `TIGERTUNES_*` environment variables
//!
//! CLI flags are applied on top by `main`.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::pipeline::PipelineConfig;

/// Runtime configuration for the relay server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Interface both listeners bind to.
    pub host: String,
    /// TCP port for the raw PCM stream.
    pub audio_port: u16,
    /// TCP port for the newline-delimited event stream.
    pub metadata_port: u16,
    /// WebSocket URL of the producer's event feed.
    pub upstream_events_url: String,
    /// Path to the audio producer executable.
    pub producer_path: PathBuf,
    /// Path to the transformer (resampler) executable.
    pub transformer_path: PathBuf,
    /// Working/config directory handed to the producer.
    pub producer_config_dir: PathBuf,
    /// Seconds to wait for the producer to authenticate at startup.
    pub ready_timeout_secs: u64,
    /// Seconds between upstream event source reconnect attempts.
    pub relay_retry_secs: u64,
    /// Bytes read from the pipeline per drain iteration.
    pub chunk_size: usize,
    /// `SO_SNDBUF` for audio client sockets.
    pub send_buffer_size: usize,
    /// Seconds a single audio write may take before the client is evicted.
    pub client_timeout_secs: u64,
    /// Chunks buffered per audio client.
    pub client_queue_depth: usize,
    /// PCM sample rate.
    pub sample_rate: u32,
    /// PCM channel count.
    pub channels: u16,
}

impl Default for Config {
    fn default() -> Self {
        // Bundled binaries and the producer state live next to our executable.
        let base_dir = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            host: constants::DEFAULT_HOST.to_string(),
            audio_port: constants::DEFAULT_AUDIO_PORT,
            metadata_port: constants::DEFAULT_METADATA_PORT,
            upstream_events_url: constants::DEFAULT_UPSTREAM_EVENTS_URL.to_string(),
            producer_path: base_dir.join("go-librespot"),
            transformer_path: base_dir.join("ffmpeg"),
            producer_config_dir: base_dir,
            ready_timeout_secs: constants::READY_TIMEOUT.as_secs(),
            relay_retry_secs: constants::RELAY_RETRY_DELAY.as_secs(),
            chunk_size: constants::DRAIN_CHUNK_SIZE,
            send_buffer_size: constants::AUDIO_SEND_BUFFER_SIZE,
            client_timeout_secs: constants::AUDIO_CLIENT_TIMEOUT.as_secs(),
            client_queue_depth: constants::AUDIO_CLIENT_QUEUE_DEPTH,
            sample_rate: constants::SAMPLE_RATE,
            channels: constants::CHANNELS,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `TIGERTUNES_CONFIG_DIR` overrides the platform config directory
    /// (`~/.config/tigertunes` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = env::var("TIGERTUNES_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("tigertunes")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read `path` if it exists, falling back to defaults otherwise.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("[Config] No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with("TIGERTUNES_"))
            .collect();
        self.apply_overrides(&vars);
    }

    /// Apply `TIGERTUNES_*` overrides from `vars`.
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn apply_overrides(&mut self, vars: &HashMap<String, String>) {
        fn parsed<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str) -> Option<T> {
            let raw = vars.get(key)?;
            let value = raw.parse().ok();
            if value.is_none() {
                log::warn!("[Config] Ignoring {}={:?}: not a valid number", key, raw);
            }
            value
        }

        if let Some(host) = vars.get("TIGERTUNES_HOST") {
            self.host.clone_from(host);
        }
        if let Some(url) = vars.get("TIGERTUNES_UPSTREAM_URL") {
            self.upstream_events_url.clone_from(url);
        }
        if let Some(path) = vars.get("TIGERTUNES_PRODUCER") {
            self.producer_path = PathBuf::from(path);
        }
        if let Some(path) = vars.get("TIGERTUNES_TRANSFORMER") {
            self.transformer_path = PathBuf::from(path);
        }
        if let Some(path) = vars.get("TIGERTUNES_PRODUCER_CONFIG_DIR") {
            self.producer_config_dir = PathBuf::from(path);
        }
        if let Some(port) = parsed(vars, "TIGERTUNES_AUDIO_PORT") {
            self.audio_port = port;
        }
        if let Some(port) = parsed(vars, "TIGERTUNES_METADATA_PORT") {
            self.metadata_port = port;
        }
        if let Some(secs) = parsed(vars, "TIGERTUNES_READY_TIMEOUT") {
            self.ready_timeout_secs = secs;
        }
        if let Some(secs) = parsed(vars, "TIGERTUNES_RELAY_RETRY") {
            self.relay_retry_secs = secs;
        }
    }

    /// Socket address for the audio listener.
    pub fn audio_addr(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.audio_port)
    }

    /// Socket address for the metadata listener.
    pub fn metadata_addr(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.metadata_port)
    }

    /// Startup readiness wait.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Delay between upstream reconnect attempts.
    pub fn relay_retry_delay(&self) -> Duration {
        Duration::from_secs(self.relay_retry_secs)
    }

    /// Per-write timeout for audio clients.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    /// Pipeline launch parameters derived from this config.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new(
            self.producer_path.clone(),
            self.transformer_path.clone(),
            self.producer_config_dir.clone(),
        )
        .with_format(self.sample_rate, self.channels)
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Invalid listen address {host}:{port}"))?
        .next()
        .with_context(|| format!("No address resolved for {host}:{port}"))
}
