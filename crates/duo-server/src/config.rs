use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use duo_gateway::GatewayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub environment: Environment,
    /// Hosts allowed to open a chat socket in production.
    pub allowed_origins: Vec<String>,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());
        let secs = |key: &str, default: u64| -> anyhow::Result<Duration> {
            let secs = match lookup(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .with_context(|| format!("{} must be a whole number of seconds", key))?,
                None => default,
            };
            anyhow::ensure!(secs > 0, "{} must be at least 1 second", key);
            Ok(Duration::from_secs(secs))
        };

        let environment = match var("DUO_ENV", "development").as_str() {
            "development" => Environment::Development,
            "production" => Environment::Production,
            other => anyhow::bail!("DUO_ENV must be 'development' or 'production', got '{}'", other),
        };

        let port = var("DUO_PORT", "3000")
            .parse()
            .context("DUO_PORT must be a port number")?;

        let allowed_origins = lookup("DUO_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|host| host.trim().to_ascii_lowercase())
                    .filter(|host| !host.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            host: var("DUO_HOST", "0.0.0.0"),
            port,
            db_path: PathBuf::from(var("DUO_DB_PATH", "duo.db")),
            environment,
            allowed_origins,
            gateway: GatewayConfig {
                heartbeat_interval: secs("DUO_HEARTBEAT_SECS", 30)?,
                ping_timeout: secs("DUO_PING_TIMEOUT_SECS", 10)?,
                handshake_timeout: secs("DUO_HANDSHAKE_TIMEOUT_SECS", 10)?,
            },
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    /// Development accepts any origin. Production requires an `Origin`
    /// header whose host, with or without its port, is on the allow list.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.environment == Environment::Development {
            return true;
        }
        let Some(origin) = origin else {
            return false;
        };
        let authority = origin
            .split_once("://")
            .map_or(origin, |(_, rest)| rest)
            .split('/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let host = authority
            .rsplit_once(':')
            .map_or(authority.as_str(), |(host, _)| host);

        self.allowed_origins
            .iter()
            .any(|allowed| *allowed == authority || allowed == host)
    }
}
