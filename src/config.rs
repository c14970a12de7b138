//! Environment configuration

use ipnet::IpNet;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatch::DEFAULT_SEND_TIMEOUT;
use crate::fetch::{FetchConfig, MAX_BODY_BYTES};

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// CORS origin for the HTTP endpoints (None = any origin)
    pub allowed_origin: Option<String>,
    /// Ranges the proxy may reach even though they are normally blocked
    pub proxy_allow: Vec<IpNet>,
    pub fetch: FetchConfig,
    pub task_send_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            allowed_origin: None,
            proxy_allow: Vec::new(),
            fetch: FetchConfig::default(),
            task_send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl AppConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let allowed_origin = std::env::var("ALLOWED_ORIGIN")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && s != "*");

        let proxy_allow = std::env::var("PROXY_ALLOW_CIDRS")
            .map(|v| parse_cidrs(&v))
            .unwrap_or_default();
        if !proxy_allow.is_empty() {
            tracing::warn!(
                ranges = ?proxy_allow,
                "Proxy may reach normally blocked address ranges"
            );
        }

        // The body cap can be lowered but never raised past MAX_BODY_BYTES
        let mut max_body_bytes = env_or("PROXY_MAX_BODY_BYTES", defaults.fetch.max_body_bytes);
        if max_body_bytes > MAX_BODY_BYTES {
            tracing::warn!(
                "PROXY_MAX_BODY_BYTES={} exceeds the {} byte ceiling, clamping",
                max_body_bytes,
                MAX_BODY_BYTES
            );
            max_body_bytes = MAX_BODY_BYTES;
        }

        let fetch = FetchConfig {
            max_body_bytes,
            max_redirects: defaults.fetch.max_redirects,
            request_timeout: env_secs_or("PROXY_TIMEOUT_SECS", defaults.fetch.request_timeout),
            handshake_timeout: env_secs_or(
                "PROXY_HANDSHAKE_TIMEOUT_SECS",
                defaults.fetch.handshake_timeout,
            ),
        };

        let config = Self {
            port: env_or("PORT", defaults.port),
            allowed_origin,
            proxy_allow,
            fetch,
            task_send_timeout: env_secs_or("TASK_SEND_TIMEOUT_SECS", defaults.task_send_timeout),
        };

        tracing::info!(
            port = config.port,
            allowed_origin = ?config.allowed_origin,
            max_body_bytes = config.fetch.max_body_bytes,
            "Config loaded"
        );

        config
    }
}

/// Parse a comma separated CIDR list, skipping entries that do not parse
fn parse_cidrs(raw: &str) -> Vec<IpNet> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(e) => {
                tracing::warn!("Ignoring invalid CIDR {:?} in PROXY_ALLOW_CIDRS: {}", s, e);
                None
            }
        })
        .collect()
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid value {:?} for {}, using default", raw, key);
            default
        }),
        Err(_) => default,
    }
}

fn env_secs_or(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}
