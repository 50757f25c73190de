// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : valuation_sync: real-time portfolio valuation over STOMP
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Fetches a portfolio valuation snapshot, keeps one price
          subscription per held symbol on a STOMP/WebSocket channel,
          re-values holdings on every price event, relays user
          notifications, and exposes Prometheus metrics.
=============================================================================
*/
use clap::Parser;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::connection::ConnectionConfig;
use crate::error::ConfigError;
use crate::session::SessionConfig;

/// Command-line overrides; anything unset falls back to the environment.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "valuation_sync", version, about = "Live portfolio valuation over STOMP")]
pub struct Cli {
    /// Portfolio to watch (env: PORTFOLIO_ID)
    #[arg(long)]
    pub portfolio_id: Option<String>,
    /// REST base URL (env: API_BASE_URL)
    #[arg(long)]
    pub api_base_url: Option<String>,
    /// STOMP WebSocket URL (env: CHANNEL_URL)
    #[arg(long)]
    pub channel_url: Option<String>,
    /// Prometheus port, 0 disables (env: METRICS_PORT)
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// Skip the notification topics
    #[arg(long)]
    pub no_notifications: bool,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub api_base: Url,
    pub channel_url: Url,
    pub portfolio_id: String,
    pub token_file: PathBuf,
    pub auth_token: Option<String>,
    pub reconnect_delay: Duration,
    pub heartbeat_out: Duration,
    pub heartbeat_in: Duration,
    pub metrics_port: u16,
    pub notifications: bool,
}

impl Settings {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            channel_url: self.channel_url.clone(),
            reconnect_delay: self.reconnect_delay,
            heartbeat_out: self.heartbeat_out,
            heartbeat_in: self.heartbeat_in,
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            portfolio_id: self.portfolio_id.clone(),
            connection: self.connection(),
            notifications: self.notifications,
        }
    }
}

/// `.env` + process environment + CLI.
pub fn load(cli: &Cli) -> Result<Settings, ConfigError> {
    let _ = dotenv();
    from_lookup(|k| env::var(k).ok(), cli)
}

pub fn from_lookup(get: impl Fn(&str) -> Option<String>, cli: &Cli) -> Result<Settings, ConfigError> {
    let get = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let api_raw = cli
        .api_base_url
        .clone()
        .or_else(|| get("API_BASE_URL"))
        .unwrap_or_else(|| "http://localhost:8000".to_string());
    let api_base = Url::parse(&api_raw).map_err(|source| ConfigError::Url { key: "API_BASE_URL", source })?;

    let channel_url = match cli.channel_url.clone().or_else(|| get("CHANNEL_URL")) {
        Some(raw) => Url::parse(&raw).map_err(|source| ConfigError::Url { key: "CHANNEL_URL", source })?,
        None => default_channel_url(&api_base)?,
    };

    let portfolio_id = cli
        .portfolio_id
        .clone()
        .or_else(|| get("PORTFOLIO_ID"))
        .ok_or(ConfigError::MissingPortfolio)?;

    let millis = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
        match get(key) {
            Some(v) => v
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::Number { key, value: v }),
            None => Ok(Duration::from_millis(default)),
        }
    };

    let metrics_port = match cli.metrics_port {
        Some(p) => p,
        None => match get("METRICS_PORT") {
            Some(v) => v.parse().map_err(|_| ConfigError::Number { key: "METRICS_PORT", value: v })?,
            None => 9899,
        },
    };

    let notifications = !cli.no_notifications
        && !matches!(
            get("NOTIFICATIONS").map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("0" | "off" | "false" | "no")
        );

    Ok(Settings {
        api_base,
        channel_url,
        portfolio_id,
        token_file: get("TOKEN_FILE").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".tradewise/token")),
        auth_token: get("AUTH_TOKEN"),
        reconnect_delay: millis("RECONNECT_DELAY_MS", 5000)?,
        heartbeat_out: millis("HEARTBEAT_OUT_MS", 10_000)?,
        heartbeat_in: millis("HEARTBEAT_IN_MS", 10_000)?,
        metrics_port,
        notifications,
    })
}

// http://host:8000 -> ws://host:8000/ws (https -> wss)
fn default_channel_url(api_base: &Url) -> Result<Url, ConfigError> {
    let scheme = if api_base.scheme() == "https" { "wss" } else { "ws" };
    let host = api_base.host_str().unwrap_or("localhost");
    let raw = match api_base.port() {
        Some(port) => format!("{scheme}://{host}:{port}/ws"),
        None => format!("{scheme}://{host}/ws"),
    };
    Url::parse(&raw).map_err(|source| ConfigError::Url { key: "CHANNEL_URL", source })
}
