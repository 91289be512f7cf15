use std::path::PathBuf;

use clap::{Parser, Subcommand};
use droidlink_client::config::{ClientConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "droidlink",
    version,
    about = "Remote control for cloud Android instances"
)]
pub(crate) struct Cli {
    /// TOML config file
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// none, error, warn, info or debug (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Signaling WebSocket URL of the instance
    #[arg(long, global = true)]
    pub webrtc_url: Option<String>,

    /// WebSocket URL of the instance's ADB endpoint
    #[arg(long, global = true)]
    pub adb_url: Option<String>,

    /// Instance token (prefer DROIDLINK_TOKEN)
    #[arg(long, global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Capture the device screen to a PNG file
    Screenshot {
        #[arg(long, short, default_value = "screenshot.png")]
        out: PathBuf,
    },
    /// Forward a local port to the instance's ADB endpoint and run `adb connect`
    Tunnel {
        /// Local port, 0 for any
        #[arg(long)]
        port: Option<u16>,
    },
    /// Open a URL on the device
    OpenUrl { url: String },
    /// Press and release a key, by DOM code (Enter, KeyA, ArrowUp, ...)
    Key { code: String },
    /// Type text on the device
    Type {
        text: String,
        /// Paste through the clipboard instead of injecting characters
        #[arg(long)]
        paste: bool,
    },
    /// Reuse a ready instance with this name or create one, then print it as JSON
    Create {
        name: String,
        #[arg(long)]
        org: Option<String>,
        /// Return only once the instance is ready
        #[arg(long)]
        wait: bool,
    },
    /// Delete an instance
    Delete {
        name: String,
        #[arg(long)]
        org: Option<String>,
    },
}

impl Cli {
    /// Flags win over the config file.
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(url) = &self.webrtc_url {
            config.connection.webrtc_url = Some(url.clone());
        }
        if let Some(url) = &self.adb_url {
            config.connection.adb_url = Some(url.clone());
        }
        if let Some(token) = &self.token {
            config.connection.token = Some(token.clone());
        }
        if let Command::Tunnel { port: Some(port) } = self.command {
            config.tunnel.port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "droidlink",
            "--log-level",
            "debug",
            "--token",
            "cli-token",
            "tunnel",
            "--port",
            "5555",
        ])
        .unwrap();
        let mut config = ClientConfig::default();
        config.connection.token = Some("file-token".to_string());
        cli.apply(&mut config);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.connection.token.as_deref(), Some("cli-token"));
        assert_eq!(config.tunnel.port, 5555);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "droidlink",
            "screenshot",
            "--out",
            "a.png",
            "--webrtc-url",
            "wss://x/s",
        ])
        .unwrap();
        assert_eq!(cli.webrtc_url.as_deref(), Some("wss://x/s"));
        assert!(matches!(
            cli.command,
            Command::Screenshot { ref out } if out == &PathBuf::from("a.png")
        ));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        assert!(Cli::try_parse_from(["droidlink", "--log-level", "loud", "key", "Enter"]).is_err());
    }
}
