//! Process configuration: a TOML file plus environment overrides, loaded
//! once at startup and injected into the places that need it.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "PALAVER";

/// Placeholder secret so a bare `palaver serve` works on a dev machine.
pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub ws: WsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret used to validate bearer tokens.
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
        }
    }
}

/// Socket-path tuning, fixed for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    /// Origin allowed to open upgrades; browser requests from anywhere
    /// else are rejected before the upgrade completes.
    pub allowed_origin: String,
    /// Maximum inbound frame size in bytes.
    pub max_frame_bytes: usize,
    /// Outbound queue capacity per connection.
    pub outbound_queue: usize,
    /// Seconds without any inbound frame before a connection is torn down.
    pub read_deadline_secs: u64,
    /// Seconds between liveness pings. Must stay below the read deadline
    /// or healthy-but-quiet clients would be reaped between probes.
    pub heartbeat_secs: u64,
    /// Seconds an empty room lingers before its task and broker
    /// subscription are retired.
    pub idle_room_grace_secs: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            allowed_origin: "http://localhost:3000".to_string(),
            max_frame_bytes: 10_000,
            outbound_queue: 256,
            read_deadline_secs: 60,
            heartbeat_secs: 54,
            idle_room_grace_secs: 60,
        }
    }
}

impl WsConfig {
    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn idle_room_grace(&self) -> Duration {
        Duration::from_secs(self.idle_room_grace_secs)
    }
}

impl AppConfig {
    /// Load from the given file (or `palaver.toml` in the working
    /// directory if present), then apply `PALAVER__`-prefixed environment
    /// overrides such as `PALAVER__SERVER__PORT=4001`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            ),
            None => builder.add_source(File::with_name("palaver").required(false)),
        };

        let built = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("reading configuration")?;

        let config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ws.heartbeat_secs >= self.ws.read_deadline_secs {
            bail!(
                "ws.heartbeat_secs ({}) must be less than ws.read_deadline_secs ({})",
                self.ws.heartbeat_secs,
                self.ws.read_deadline_secs
            );
        }
        if self.ws.outbound_queue == 0 {
            bail!("ws.outbound_queue must be at least 1");
        }
        if self.ws.max_frame_bytes == 0 {
            bail!("ws.max_frame_bytes must be at least 1");
        }
        if self.ws.allowed_origin.is_empty() || !self.ws.allowed_origin.is_ascii() {
            bail!("ws.allowed_origin must be a plain ASCII origin");
        }
        Ok(())
    }
}
