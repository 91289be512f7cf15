use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted for the instance token when none is configured.
pub const TOKEN_ENV: &str = "DROIDLINK_TOKEN";
/// Environment variable consulted for the region API key.
pub const API_TOKEN_ENV: &str = "DROIDLINK_API_TOKEN";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebRTC signaling WebSocket URL of the instance
    pub webrtc_url: Option<String>,
    /// WebSocket URL forwarding to the instance's ADB port
    pub adb_url: Option<String>,
    /// Instance bearer token (prefer the DROIDLINK_TOKEN env var)
    pub token: Option<String>,
    /// PEM certificate to trust in addition to system roots
    pub tls_cert: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Signaling socket connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Wait for the rtcConfiguration reply, in seconds
    #[serde(default = "default_rtc_config_timeout")]
    pub rtc_config_timeout: u64,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval: u64,
    /// Screenshot request timeout in seconds
    #[serde(default = "default_screenshot_timeout")]
    pub screenshot_timeout: u64,
    /// Channel that carries screenshot requests
    #[serde(default)]
    pub screenshot_transport: ScreenshotTransport,
    /// Put H.264 first in the video codec list
    #[serde(default = "default_true")]
    pub prefer_h264: bool,
    /// URL to open on the device once the control channel opens
    pub open_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenshotTransport {
    #[default]
    Signaling,
    DataChannel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Local bind address for the ADB tunnel listener
    #[serde(default = "default_tunnel_bind")]
    pub bind: String,
    /// Local port (0 = ephemeral)
    #[serde(default)]
    pub port: u16,
    /// WebSocket ping interval in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// adb executable
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

/// Region API access, used by the CLI to look instances up by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    /// e.g. https://eu-north1.limbar.net
    pub base_url: Option<String>,
    pub organization_id: Option<String>,
    /// Organization API key (prefer the DROIDLINK_API_TOKEN env var)
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// `EnvFilter` directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(LogLevel::None),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!(
                "unknown log level '{other}' (expected none, error, warn, info or debug)"
            )),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            rtc_config_timeout: default_rtc_config_timeout(),
            keep_alive_interval: default_keep_alive_interval(),
            screenshot_timeout: default_screenshot_timeout(),
            screenshot_transport: ScreenshotTransport::default(),
            prefer_h264: true,
            open_url: None,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind: default_tunnel_bind(),
            port: 0,
            ping_interval: default_ping_interval(),
            adb_path: default_adb_path(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn rtc_config_timeout(&self) -> Duration {
        Duration::from_secs(self.rtc_config_timeout)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval)
    }

    pub fn screenshot_timeout(&self) -> Duration {
        Duration::from_secs(self.screenshot_timeout)
    }
}

impl TunnelConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }
}

impl ClientConfig {
    /// Load from a TOML file. The token falls back to `DROIDLINK_TOKEN`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: ClientConfig = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Fill unset values from the environment.
    pub fn apply_env(&mut self) {
        if self.connection.token.is_none() {
            self.connection.token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
        }
        if self.api.token.is_none() {
            self.api.token = std::env::var(API_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        }
    }

    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- URLs ---
        if let Some(url) = &self.connection.webrtc_url
            && !is_ws_url(url)
        {
            issues.push(format!(
                "ERROR: connection.webrtc_url '{url}' must start with 'ws://' or 'wss://'."
            ));
        }
        if let Some(url) = &self.connection.adb_url
            && !is_ws_url(url)
        {
            issues.push(format!(
                "ERROR: connection.adb_url '{url}' must start with 'ws://' or 'wss://'."
            ));
        }
        if let Some(url) = &self.api.base_url
            && !url.starts_with("http://")
            && !url.starts_with("https://")
        {
            issues.push(format!(
                "ERROR: api.base_url '{url}' must start with 'http://' or 'https://'."
            ));
        }

        // --- TLS cert ---
        if let Some(cert) = &self.connection.tls_cert
            && !Path::new(cert).exists()
        {
            issues.push(format!("ERROR: connection.tls_cert '{cert}' does not exist."));
        }

        // --- Timeouts ---
        for (name, value) in [
            ("session.connect_timeout", self.session.connect_timeout),
            ("session.rtc_config_timeout", self.session.rtc_config_timeout),
            ("session.screenshot_timeout", self.session.screenshot_timeout),
        ] {
            if value == 0 {
                issues.push(format!("ERROR: {name} must be at least 1 second, got 0."));
            }
        }
        if self.session.keep_alive_interval == 0 {
            issues.push(
                "ERROR: session.keep_alive_interval must be at least 1 second, got 0.".to_string(),
            );
        } else if self.session.keep_alive_interval > 60 {
            issues.push(format!(
                "WARNING: session.keep_alive_interval is {}s. Instances may drop idle \
                 sessions before a keep-alive is sent.",
                self.session.keep_alive_interval
            ));
        }

        // --- Tunnel ---
        if self.tunnel.bind.parse::<std::net::IpAddr>().is_err() && self.tunnel.bind != "localhost"
        {
            issues.push(format!(
                "ERROR: tunnel.bind '{}' is not an IP address.",
                self.tunnel.bind
            ));
        }
        if self.tunnel.ping_interval == 0 {
            issues.push(
                "ERROR: tunnel.ping_interval must be at least 1 second, got 0.".to_string(),
            );
        }
        if self.tunnel.adb_path.trim().is_empty() {
            issues.push("ERROR: tunnel.adb_path must not be empty.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn is_ws_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

fn default_connect_timeout() -> u64 {
    5
}
fn default_rtc_config_timeout() -> u64 {
    5
}
fn default_keep_alive_interval() -> u64 {
    10
}
fn default_screenshot_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_tunnel_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_ping_interval() -> u64 {
    30
}
fn default_adb_path() -> String {
    "adb".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: ClientConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert!(config.connection.webrtc_url.is_none());
        assert!(config.connection.adb_url.is_none());
        assert!(config.connection.token.is_none());

        assert_eq!(config.session.connect_timeout, 5);
        assert_eq!(config.session.rtc_config_timeout, 5);
        assert_eq!(config.session.keep_alive_interval, 10);
        assert_eq!(config.session.screenshot_timeout, 30);
        assert_eq!(
            config.session.screenshot_transport,
            ScreenshotTransport::Signaling
        );
        assert!(config.session.prefer_h264);
        assert!(config.session.open_url.is_none());

        assert_eq!(config.tunnel.bind, "127.0.0.1");
        assert_eq!(config.tunnel.port, 0);
        assert_eq!(config.tunnel.ping_interval, 30);
        assert_eq!(config.tunnel.adb_path, "adb");

        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_config_only_session_section() {
        let toml_str = r#"
[session]
screenshot_timeout = 10
screenshot_transport = "data_channel"
"#;
        let config: ClientConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");
        assert_eq!(config.session.screenshot_timeout, 10);
        assert_eq!(
            config.session.screenshot_transport,
            ScreenshotTransport::DataChannel
        );
        assert_eq!(config.session.keep_alive_interval, 10);
        assert_eq!(config.tunnel.ping_interval, 30);
    }

    #[test]
    fn log_level_parsing() {
        let config: ClientConfig = toml::from_str("[log]\nlevel = \"debug\"").unwrap();
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!("none".parse::<LogLevel>().unwrap().directive(), "off");
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn validate_rejects_http_signaling_url() {
        let mut config = ClientConfig::default();
        config.connection.webrtc_url = Some("https://example.com/signaling".to_string());
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("ERROR:"));
        assert!(issues[0].contains("webrtc_url"));
    }

    #[test]
    fn validate_zero_timeouts() {
        let mut config = ClientConfig::default();
        config.session.screenshot_timeout = 0;
        config.session.keep_alive_interval = 0;
        config.tunnel.ping_interval = 0;
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 3);
        assert!(issues.iter().all(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_warns_on_long_keep_alive() {
        let mut config = ClientConfig::default();
        config.session.keep_alive_interval = 120;
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("WARNING:"));
    }

    #[test]
    fn validate_bad_bind_address() {
        let mut config = ClientConfig::default();
        config.tunnel.bind = "not an ip".to_string();
        let issues = config.validate().unwrap_err();
        assert!(issues[0].contains("tunnel.bind"));
    }
}
