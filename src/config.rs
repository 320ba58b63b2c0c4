//! Server configuration — all from environment variables.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the WebSocket endpoint.
    pub listen_addr: String,
    /// Server instance name, used as log context only.
    pub server_instance: String,
    /// Per-session outbound event queue depth. A session whose client
    /// stops draining events blocks here, not in the broker.
    pub event_buffer: usize,
    /// Log level filter.
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8686".into()),
            server_instance: env::var("SERVER_INSTANCE").unwrap_or_else(|_| hostname()),
            event_buffer: env::var("EVENT_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(64),
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "presenced=info,tower_http=info".into()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8686".into(),
            server_instance: hostname(),
            event_buffer: 64,
            log_level: "presenced=info".into(),
        }
    }
}

fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into())
}
