//! Agent configuration loaded from a TOML file, following the same
//! `load(path) -> Result<Config>` pattern used throughout this
//! workspace's other daemons: a default per section, missing file
//! falls back to defaults entirely, present-but-unparsable file is an
//! error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub connection: ConnectionConfig,
    pub capture: CaptureConfig,
    pub buffer: BufferConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Base WebSocket URL of the backend (topics are appended per channel).
    pub backend_url: String,
    pub heartbeat_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub fps: u32,
    pub bitrate_bps: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Path to the persisted device token file (see [`crate::device`]).
    pub token_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            capture: CaptureConfig::default(),
            buffer: BufferConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backend_url: "wss://localhost:4000/socket/websocket".to_string(),
            heartbeat_secs: 30,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_width: rc_capture::dimensions::MAX_WIDTH,
            max_height: rc_capture::dimensions::MAX_HEIGHT,
            fps: 15,
            bitrate_bps: 2_000_000,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: rc_buffer::DEFAULT_CAPACITY,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            token_path: default_token_path(),
        }
    }
}

fn default_token_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rc-agent")
        .join("device_token.json")
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rc-agent")
        .join("config.toml")
}

/// Load the agent configuration from a TOML file.
///
/// Returns the default configuration if the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load(path: Option<&Path>) -> Result<AgentConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path(),
    };

    if !path.exists() {
        tracing::debug!(?path, "agent config not found, using defaults");
        return Ok(AgentConfig::default());
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read agent config: {}", path.display()))?;

    let config: AgentConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse agent config: {}", path.display()))?;

    tracing::info!(?path, "agent configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = AgentConfig::default();
        assert_eq!(config.capture.fps, 15);
        assert_eq!(config.capture.bitrate_bps, 2_000_000);
        assert_eq!(config.buffer.capacity, 30);
        assert_eq!(config.connection.heartbeat_secs, 30);
        assert_eq!(config.connection.backoff_initial_ms, 1_000);
        assert_eq!(config.connection.backoff_max_ms, 60_000);
    }

    #[test]
    fn missing_file_returns_defaults() {
        let path = Path::new("/nonexistent/rc-agent/config.toml");
        let config = load(Some(path)).expect("missing file should yield defaults, not an error");
        assert_eq!(config.capture.fps, AgentConfig::default().capture.fps);
    }

    #[test]
    fn parses_a_partial_toml_file_over_defaults() {
        let dir = std::env::temp_dir().join(format!("rc-agent-config-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[connection]\nbackend_url = \"wss://example.test/socket\"\n").unwrap();

        let config = load(Some(&path)).expect("valid TOML should parse");
        assert_eq!(config.connection.backend_url, "wss://example.test/socket");
        // Untouched sections keep their defaults.
        assert_eq!(config.capture.fps, 15);

        std::fs::remove_dir_all(&dir).ok();
    }
}
