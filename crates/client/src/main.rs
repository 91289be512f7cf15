mod cli;

use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use cli::{Cli, Command};
use droidlink_client::api::{InstanceCreate, RegionClient};
use droidlink_client::config::{API_TOKEN_ENV, ClientConfig, LogLevel};
use droidlink_client::session::{Session, SessionOptions, create_instance_client};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Data-channel sends are queued; give them a moment before closing.
const FLUSH_DELAY: Duration = Duration::from_millis(250);

fn init_tracing(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive())),
        )
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => {
            let mut config = ClientConfig::default();
            config.apply_env();
            config
        }
    };
    cli.apply(&mut config);
    Ok(config)
}

/// Log every issue; exit on errors.
fn check_config(config: &ClientConfig) {
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{}", issue);
            } else {
                warn!("{}", issue);
            }
        }
        if has_errors {
            error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and retry.",
                issues.len()
            );
            std::process::exit(1);
        }
    }
}

fn region_client(
    config: &ClientConfig,
    org: Option<String>,
) -> anyhow::Result<(RegionClient, String)> {
    let base_url = config
        .api
        .base_url
        .clone()
        .context("api.base_url is not set")?;
    let token = config
        .api
        .token
        .clone()
        .with_context(|| format!("no API key: set api.token or {API_TOKEN_ENV}"))?;
    let org = org
        .or_else(|| config.api.organization_id.clone())
        .context("no organization: pass --org or set api.organization_id")?;
    Ok((RegionClient::new(base_url, token), org))
}

async fn connect(config: &ClientConfig, wait_ready: bool) -> anyhow::Result<Session> {
    let options = SessionOptions::from_config(config)?;
    let session = create_instance_client(options)
        .await
        .context("Failed to connect to instance")?;
    if wait_ready {
        session.wait_ready(READY_TIMEOUT).await?;
    }
    Ok(session)
}

async fn run(command: Command, config: ClientConfig) -> anyhow::Result<()> {
    match command {
        Command::Create { name, org, wait } => {
            let (client, org) = region_client(&config, org)?;
            let instance = client
                .get_or_create_instance(&org, InstanceCreate::named(name), Some(wait))
                .await?;
            println!("{}", serde_json::to_string_pretty(&instance)?);
        }
        Command::Delete { name, org } => {
            let (client, org) = region_client(&config, org)?;
            client.delete_instance(&org, &name).await?;
        }
        Command::Screenshot { out } => {
            let session = connect(&config, true).await?;
            let result = session.screenshot().await;
            session.disconnect().await;
            let png = result?.png_bytes()?;
            tokio::fs::write(&out, &png)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            info!(path = %out.display(), bytes = png.len(), "Screenshot saved");
        }
        Command::OpenUrl { url } => {
            let session = connect(&config, true).await?;
            let result = session.open_url(&url).await;
            session.disconnect().await;
            result?;
        }
        Command::Key { code } => {
            if droidlink_protocol::android_keycode(&code).is_none() {
                bail!("unknown key code '{code}'");
            }
            let session = connect(&config, true).await?;
            session.press_key(&code).await;
            tokio::time::sleep(FLUSH_DELAY).await;
            session.disconnect().await;
        }
        Command::Type { text, paste } => {
            let session = connect(&config, true).await?;
            if paste {
                session.paste_text(&text).await;
            } else {
                session.inject_text(&text).await;
            }
            tokio::time::sleep(FLUSH_DELAY).await;
            session.disconnect().await;
        }
        Command::Tunnel { .. } => {
            let session = connect(&config, false).await?;
            let tunnel = session.start_adb_tunnel().await;
            let tunnel = match tunnel {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    session.disconnect().await;
                    return Err(e.into());
                }
            };
            println!("{}", tunnel.address());
            info!(address = %tunnel.address(), "ADB tunnel up, Ctrl-C to stop");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                _ = tunnel.closed() => warn!("Tunnel closed"),
            }
            tunnel.close();
            session.disconnect().await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(config.log.level);

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    check_config(&config);
    run(cli.command, config).await
}
