use std::{str::FromStr, time::Duration};

use anyhow::{Context, anyhow};

use crate::auth::StaticAuth;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("unknown log format {other:?}, expected pretty or json")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub database_url: String,

    /// External auth service. Without it tokens come from `static_tokens`.
    pub auth_url: Option<String>,
    pub static_tokens: String,
    pub static_members: Option<String>,

    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
    pub pong_wait: Duration,
    pub max_message_chars: usize,
    pub broker_capacity: usize,

    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_owned(),
            database_url: "sqlite://silentrooms.db?mode=rwc".to_owned(),
            auth_url: None,
            static_tokens: String::new(),
            static_members: None,
            outbound_queue: 256,
            max_frame_bytes: 64 * 1024,
            pong_wait: Duration::from_secs(60),
            max_message_chars: 4000,
            broker_capacity: 1024,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Reads the process environment, after loading `.env` if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let config = Self {
            listen_addr: text("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            database_url: text("DATABASE_URL").unwrap_or(defaults.database_url),
            auth_url: text("AUTH_URL"),
            static_tokens: text("STATIC_TOKENS").unwrap_or_default(),
            static_members: text("STATIC_MEMBERS"),
            outbound_queue: number(&lookup, "OUTBOUND_QUEUE", defaults.outbound_queue)?,
            max_frame_bytes: number(&lookup, "MAX_FRAME_BYTES", defaults.max_frame_bytes)?,
            pong_wait: Duration::from_secs(number(
                &lookup,
                "PONG_WAIT_SECS",
                defaults.pong_wait.as_secs(),
            )?),
            max_message_chars: number(&lookup, "MAX_MESSAGE_CHARS", defaults.max_message_chars)?,
            broker_capacity: number(&lookup, "BROKER_CAPACITY", defaults.broker_capacity)?,
            log_format: match text("LOG_FORMAT") {
                Some(raw) => raw.parse()?,
                None => defaults.log_format,
            },
        };

        if config.outbound_queue == 0 || config.broker_capacity == 0 {
            return Err(anyhow!("OUTBOUND_QUEUE and BROKER_CAPACITY must be positive"));
        }
        if config.pong_wait.is_zero() {
            return Err(anyhow!("PONG_WAIT_SECS must be positive"));
        }
        Ok(config)
    }

    /// Ping interval, inside the read deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }

    pub fn static_auth(&self) -> anyhow::Result<StaticAuth> {
        let auth = StaticAuth::new()
            .parse_tokens(&self.static_tokens)
            .context("STATIC_TOKENS")?;
        match &self.static_members {
            Some(members) => Ok(auth.parse_members(members).context("STATIC_MEMBERS")?),
            None => Ok(auth),
        }
    }
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty()) {
        Some(raw) => raw.parse().with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}
