/// Configuration management
use crate::error::{ChatError, Result};
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_BASE: &str = "http://localhost:8080";
const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws/chat";

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logged-in user (the viewpoint every conversation key is derived from)
    pub user_id: UserId,

    /// Base URL of the REST collaborators
    pub api_base: String,

    /// Duplex transport endpoint
    pub ws_url: String,

    /// Bearer token (three-segment structured token)
    pub token: Option<String>,

    /// Presence poll period
    pub presence_interval: Duration,

    /// Reconnect backoff base delay
    pub reconnect_base: Duration,

    /// Reconnect backoff ceiling
    pub reconnect_cap: Duration,

    /// Transport connect timeout
    pub connect_timeout: Duration,

    /// Timestamp window inside which equal messages collapse into one entry
    pub dedup_tolerance: Duration,

    /// Capacity of the session event broadcast channel
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: UserId(0),
            api_base: DEFAULT_API_BASE.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            token: None,
            presence_interval: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(10),
            dedup_tolerance: Duration::from_secs(2),
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <user_id> [--api <url>] [--ws <url>] [--presence-ms <n>] [--dedup-ms <n>]",
                args.first().map(String::as_str).unwrap_or("chat")
            )));
        }

        let user_id = args[1]
            .parse::<i64>()
            .map(UserId)
            .map_err(|_| ChatError::Config("user_id must be an integer".to_string()))?;

        let mut config = Self {
            user_id,
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = args.get(i + 1).ok_or_else(|| {
                ChatError::Config(format!("{} requires an argument", flag))
            })?;
            match flag {
                "--api" => config.api_base = value.trim_end_matches('/').to_string(),
                "--ws" => config.ws_url = value.clone(),
                "--presence-ms" => {
                    config.presence_interval = Duration::from_millis(parse_millis(flag, value)?)
                }
                "--dedup-ms" => {
                    config.dedup_tolerance = Duration::from_millis(parse_millis(flag, value)?)
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown flag: {}", other)));
                }
            }
            i += 2;
        }

        // Env overrides (nice for scripts)
        if let Ok(api) = std::env::var("MATCHCHAT_API") {
            config.api_base = api.trim_end_matches('/').to_string();
        }
        if let Ok(ws) = std::env::var("MATCHCHAT_WS") {
            config.ws_url = ws;
        }
        if let Ok(token) = std::env::var("MATCHCHAT_TOKEN") {
            config.token = Some(token);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the engine spin or never wake up
    pub fn validate(&self) -> Result<()> {
        if self.presence_interval.is_zero() {
            return Err(ChatError::Config("presence interval must be positive".to_string()));
        }
        if self.reconnect_base.is_zero() || self.reconnect_cap < self.reconnect_base {
            return Err(ChatError::Config(
                "reconnect cap must be >= a positive reconnect base".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ChatError::Config("event capacity must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_millis(flag: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| ChatError::Config(format!("{} must be a number of milliseconds", flag)))
}
