//! Client Configuration
//!
//! TOML configuration for the camstream client. Every field has a default,
//! so a partial file (or none at all) is valid.

use anyhow::{Context, Result};
use camstream_protocol::connection::ConnectionConfig;
use camstream_protocol::overlay::VisibilityPolicy;
use camstream_protocol::protocol::{DecoderConfig, DEFAULT_MAX_PAYLOAD_BYTES};
use camstream_protocol::router::RouterConfig;
use camstream_protocol::ServerEndpoints;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub router: RouterSection,

    #[serde(default)]
    pub decoder: DecoderSection,

    #[serde(default)]
    pub keep_alive: KeepAliveConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,
}

/// Capture server location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the streaming endpoint
    #[serde(default = "default_websocket_path")]
    pub websocket_path: String,

    /// Prefix for the HTTP control API (empty for the server root)
    #[serde(default)]
    pub http_base_path: String,

    /// Use https/wss
    #[serde(default = "default_false")]
    pub use_tls: bool,
}

/// Reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Frame router tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSection {
    /// Capture timestamps kept for the FPS estimate
    #[serde(default = "default_fps_window_frames")]
    pub fps_window_frames: usize,

    /// Maximum span of the FPS window
    #[serde(default = "default_fps_window_ms")]
    pub fps_window_ms: u64,

    /// A camera with no frame for this long is reported stale
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,

    /// Send `frame_ack` messages upstream
    #[serde(default = "default_false")]
    pub forward_acks: bool,
}

/// Decoder limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderSection {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Accept the older base64 JSON frame payload
    #[serde(default = "default_false")]
    pub accept_legacy_json_frames: bool,
}

/// Keep-alive ping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// Seconds between pings; 0 disables
    #[serde(default = "default_keep_alive_secs")]
    pub interval_secs: u64,
}

/// Overlay used by `watch --overlay`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Built-in topology name or a path to a TOML/JSON topology file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<String>,

    #[serde(default)]
    pub visibility: VisibilityPolicy,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    camstream_protocol::control::DEFAULT_PORT
}

fn default_websocket_path() -> String {
    camstream_protocol::control::WEBSOCKET_PATH.to_string()
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_fps_window_frames() -> usize {
    30
}

fn default_fps_window_ms() -> u64 {
    2000
}

fn default_stale_threshold_ms() -> u64 {
    2000
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

fn default_keep_alive_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_websocket_path(),
            http_base_path: String::new(),
            use_tls: false,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            fps_window_frames: default_fps_window_frames(),
            fps_window_ms: default_fps_window_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
            forward_acks: false,
        }
    }
}

impl Default for DecoderSection {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            accept_legacy_json_frames: false,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_keep_alive_secs(),
        }
    }
}

impl ServerConfig {
    /// HTTP endpoints of the control API
    pub fn endpoints(&self) -> Result<ServerEndpoints> {
        let scheme = if self.use_tls { "https" } else { "http" };
        let base = format!(
            "{}://{}:{}{}",
            scheme,
            self.host,
            self.port,
            self.http_base_path.trim_end_matches('/')
        );
        ServerEndpoints::new(base).context("Invalid server address")
    }

    /// Streaming URL
    pub fn ws_url(&self) -> Result<String> {
        Ok(self.endpoints()?.ws_url_with_path(&self.websocket_path))
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("camstream")
            .join("client.toml")
    }

    /// Load configuration
    ///
    /// An explicit path must exist. Without one the default location is
    /// used, and a default file is written there if none exists yet.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::read(&path)
                } else {
                    let config = Config::default();
                    config.save(&path)?;
                    Ok(config)
                }
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = self.to_toml()?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect: self.reconnect.enabled,
            reconnect_base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_reconnect_attempts: self.reconnect.max_attempts,
            keep_alive_interval: match self.keep_alive.interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            ..ConnectionConfig::default()
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            fps_window_frames: self.router.fps_window_frames,
            fps_window: Duration::from_millis(self.router.fps_window_ms),
            stale_threshold: Duration::from_millis(self.router.stale_threshold_ms),
            forward_acks: self.router.forward_acks,
        }
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            max_payload_bytes: self.decoder.max_payload_bytes,
            accept_legacy_json_frames: self.decoder.accept_legacy_json_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8006);
        assert!(config.reconnect.enabled);
        assert_eq!(config.router.stale_threshold_ms, 2000);
        assert!(!config.decoder.accept_legacy_json_frames);
        assert!(config.overlay.topology.is_none());
    }

    #[test]
    fn test_urls() {
        let config = Config::default();
        assert_eq!(
            config.server.ws_url().unwrap(),
            "ws://localhost:8006/skellycam/websocket/connect"
        );

        let tls = ServerConfig {
            host: "capture.lan".to_string(),
            port: 9000,
            use_tls: true,
            ..ServerConfig::default()
        };
        assert_eq!(
            tls.endpoints().unwrap().health(),
            "https://capture.lan:9000/health"
        );
        assert!(tls.ws_url().unwrap().starts_with("wss://capture.lan:9000/"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.toml");
        fs::write(
            &path,
            "[server]\nport = 9100\n\n[keep_alive]\ninterval_secs = 0\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.connection_config().keep_alive_interval, None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("client.toml");

        let mut config = Config::default();
        config.router.forward_acks = true;
        config.overlay.topology = Some("charuco".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_library_config_conversion() {
        let mut config = Config::default();
        config.reconnect.base_delay_ms = 250;
        config.router.fps_window_ms = 500;
        config.decoder.max_payload_bytes = 1024;

        assert_eq!(
            config.connection_config().reconnect_base_delay,
            Duration::from_millis(250)
        );
        assert_eq!(config.router_config().fps_window, Duration::from_millis(500));
        assert_eq!(config.decoder_config().max_payload_bytes, 1024);
    }
}
