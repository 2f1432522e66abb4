use crate::connection::WsOptions;
use crate::error::{Error, Result};
use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// WebSocket endpoint of the chat server
    #[arg(long, env = "SOCKET_URL")]
    pub socket_url: Option<String>,

    /// Base URL of the chat REST API
    #[arg(long, env = "API_URL")]
    pub api_url: Option<String>,

    /// Bearer token of the signed-in user
    #[arg(long, env = "AUTH_TOKEN")]
    pub token: Option<String>,

    /// Re-send joins after the socket reconnects
    #[arg(long, env = "REJOIN_ON_RECONNECT")]
    pub rejoin_on_reconnect: Option<bool>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub api: ApiConfig,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    pub socket_url: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
}

impl ConnectionConfig {
    #[must_use]
    pub fn ws_options(&self) -> WsOptions {
        WsOptions {
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(
                self.max_reconnect_delay_ms.max(self.reconnect_delay_ms),
            ),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub token: Option<String>,
}

impl ApiConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// HS256 secret. Without it the token's claims are read unverified.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    pub rejoin_on_reconnect: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    pub json: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_args(std::env::args())
    }

    /// Layering, lowest first: defaults, YAML file, `LIVE_*` environment,
    /// command line (flags or their plain env vars).
    pub fn load_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        let mut builder = Config::builder()
            .set_default("connection.socket_url", "ws://127.0.0.1:3000")?
            .set_default("connection.reconnect_delay_ms", 500)?
            .set_default("connection.max_reconnect_delay_ms", 30_000)?
            .set_default("api.base_url", "http://127.0.0.1:3000/api")?
            .set_default("api.request_timeout_ms", 10_000)?
            .set_default("session.rejoin_on_reconnect", true)?
            .set_default("telemetry.json", false)?;

        match &cli.config {
            Some(path) => {
                builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder
                    .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));
            }
            None => {}
        }

        // E.g. LIVE_CONNECTION__SOCKET_URL=wss://chat.example.com
        builder = builder.add_source(
            Environment::with_prefix("LIVE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(url) = cli.socket_url {
            builder = builder.set_override("connection.socket_url", url)?;
        }
        if let Some(url) = cli.api_url {
            builder = builder.set_override("api.base_url", url)?;
        }
        if let Some(token) = cli.token {
            builder = builder.set_override("api.token", token)?;
        }
        if let Some(rejoin) = cli.rejoin_on_reconnect {
            builder = builder.set_override("session.rejoin_on_reconnect", rejoin)?;
        }
        if let Some(json) = cli.log_json {
            builder = builder.set_override("telemetry.json", json)?;
        }

        let cfg = builder.build()?;
        let mut app: Self = cfg.try_deserialize()?;
        app.api.token = app.api.token.filter(|t| !t.trim().is_empty());
        app.auth.jwt_secret = app.auth.jwt_secret.filter(|s| !s.trim().is_empty());
        Ok(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_options_clamps_max_delay() {
        let conn = ConnectionConfig {
            socket_url: "ws://x".into(),
            reconnect_delay_ms: 2_000,
            max_reconnect_delay_ms: 100,
        };
        let options = conn.ws_options();
        assert_eq!(options.reconnect_delay, Duration::from_secs(2));
        assert_eq!(options.max_reconnect_delay, Duration::from_secs(2));
    }
}
