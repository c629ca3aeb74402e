//! Application configuration from environment variables.

use std::time::Duration;

/// Server-level configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Optional API key; when set, all /api routes require X-API-Key.
    pub api_key: Option<String>,
    /// Default alignment tolerance for newly built sync engines.
    pub sync_tolerance: Duration,
    /// Status push cadence on /api/distribution/events.
    pub ws_heartbeat_interval: Duration,
    /// Base reconnect delay for simulator connectors.
    pub reconnect_delay: Duration,
    /// Connector connect timeout.
    pub connect_timeout: Duration,
    /// Consecutive send failures before a distributor is marked degraded.
    pub degraded_threshold: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let api_key = std::env::var("SYNOPTICON_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let sync_tolerance = std::env::var("SYNC_TOLERANCE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(50));

        let ws_heartbeat_interval = std::env::var("WS_HEARTBEAT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(2));

        let reconnect_delay = std::env::var("RECONNECT_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(3));

        let connect_timeout = std::env::var("CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        let degraded_threshold = std::env::var("DEGRADED_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(5);

        Ok(Self {
            port,
            api_key,
            sync_tolerance,
            ws_heartbeat_interval,
            reconnect_delay,
            connect_timeout,
            degraded_threshold,
        })
    }
}

/// Parse a boolean switch the way env vars usually spell them.
pub fn env_flag(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}
