use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineKind {
    Echo,
    Remote,
}

/// Idle reaper timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReaperConfig {
    pub idle_threshold: Duration,
    pub sweep_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

pub struct Config {
    pub port: u16,
    pub engine: EngineKind,
    pub engine_url: Option<String>,
    pub echo_delay: Duration,
    pub reaper: ReaperConfig,
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let engine = match std::env::var("CHATLINK_ENGINE")
            .unwrap_or_else(|_| "echo".to_string())
            .to_lowercase()
            .as_str()
        {
            "remote" => EngineKind::Remote,
            _ => EngineKind::Echo,
        };

        let engine_url = if engine == EngineKind::Remote {
            Some(
                std::env::var("CHATLINK_ENGINE_URL")
                    .expect("CHATLINK_ENGINE_URL is required when CHATLINK_ENGINE=remote"),
            )
        } else {
            None
        };

        let defaults = ReaperConfig::default();
        let reaper = ReaperConfig {
            idle_threshold: env_u64("CHATLINK_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_threshold),
            sweep_interval: env_u64("CHATLINK_SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        };

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(39100),
            engine,
            engine_url,
            echo_delay: Duration::from_millis(env_u64("CHATLINK_ECHO_DELAY_MS").unwrap_or(30)),
            reaper,
        }
    }
}

/// Client-side connection parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the server, e.g. `ws://127.0.0.1:39100`.
    pub server_url: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_multiplier: u32,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub keepalive_interval: Duration,
    pub pong_timeout: Duration,
    /// Backstop for a cancel the server never acknowledges.
    pub cancel_timeout: Duration,
    /// How long to wait for the close handshake before dropping a socket.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:39100".to_string(),
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_multiplier: 2,
            reconnect_max_delay: Duration::from_secs(32),
            max_reconnect_attempts: 5,
            keepalive_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            cancel_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `CHATLINK_RECONNECT_BASE_MS`,
    /// `CHATLINK_RECONNECT_MAX_ATTEMPTS` and `CHATLINK_KEEPALIVE_SECS`.
    pub fn from_env(server_url: &str) -> Self {
        let mut config = Self::new(server_url);
        if let Some(ms) = env_u64("CHATLINK_RECONNECT_BASE_MS") {
            config.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(n) =
            env_u64("CHATLINK_RECONNECT_MAX_ATTEMPTS").and_then(|n| u32::try_from(n).ok())
        {
            config.max_reconnect_attempts = n;
        }
        if let Some(secs) = env_u64("CHATLINK_KEEPALIVE_SECS").filter(|secs| *secs > 0) {
            config.keepalive_interval = Duration::from_secs(secs);
        }
        config
    }
}
