use std::time::Duration;

use crate::gateway::lifecycle::{SweepConfig, DEFAULT_MAX_INACTIVE, DEFAULT_SWEEP_INTERVAL};

const DEFAULT_MAX_PAYLOAD_SIZE_MB: usize = 10;

/// Relay configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Advertised host name, used in log output only.
    pub host: String,
    /// Port the publish (HTTP) listener binds to.
    pub port: u16,
    /// Port the subscriber (WebSocket) listener binds to.
    pub ws_port: u16,
    /// `http` or `https`; selects the advertised `ws`/`wss` scheme.
    pub protocol: String,
    /// Publisher origins allowed to broadcast. `*` allows everyone.
    pub allowed_ips: Vec<String>,
    /// Publisher origins always rejected, checked before `allowed_ips`.
    pub blacklisted_ips: Vec<String>,
    /// How often the eviction sweep runs.
    pub cleanup_interval: Duration,
    /// Subscriptions idle longer than this are evicted.
    pub max_inactive_time: Duration,
    /// Maximum publish body / WebSocket message size, in megabytes.
    pub max_payload_size_mb: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| panic!("{name} env var is required"))
        };

        Self {
            host: required("HOST"),
            port: required("PORT")
                .parse()
                .unwrap_or_else(|_| panic!("PORT must be a valid port number")),
            ws_port: required("WSPORT")
                .parse()
                .unwrap_or_else(|_| panic!("WSPORT must be a valid port number")),
            protocol: lookup("PROTOCOL")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "http".to_string()),
            allowed_ips: split_list(&required("ALLOWED_BROADCASTING_SERVER_IPS")),
            blacklisted_ips: lookup("BLACKLISTED_BROADCASTING_SERVER_IPS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            cleanup_interval: millis_or(
                lookup("CLEANUP_INTERVAL_MS"),
                DEFAULT_SWEEP_INTERVAL,
            ),
            max_inactive_time: millis_or(lookup("MAX_INACTIVE_TIME_MS"), DEFAULT_MAX_INACTIVE),
            max_payload_size_mb: lookup("MAX_PAYLOAD_SIZE_MB")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_PAYLOAD_SIZE_MB),
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: self.cleanup_interval,
            max_inactive: self.max_inactive_time,
        }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_size_mb * 1024 * 1024
    }

    pub fn http_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.protocol == "http" { "ws" } else { "wss" };
        format!("{scheme}://{}:{}", self.host, self.ws_port)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn millis_or(raw: Option<String>, default: Duration) -> Duration {
    raw.and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("HOST", "relay.local"),
        ("PORT", "8080"),
        ("WSPORT", "8081"),
        ("ALLOWED_BROADCASTING_SERVER_IPS", "10.0.0.1, 10.0.0.2"),
    ];

    #[test]
    fn defaults_apply_when_optional_vars_missing() {
        let config = Config::from_lookup(lookup_from(&REQUIRED));

        assert_eq!(config.port, 8080);
        assert_eq!(config.ws_port, 8081);
        assert_eq!(config.protocol, "http");
        assert_eq!(config.allowed_ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(config.blacklisted_ips.is_empty());
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.max_inactive_time, Duration::from_secs(3600));
        assert_eq!(config.max_payload_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.ws_url(), "ws://relay.local:8081");
    }

    #[test]
    fn optional_vars_override_defaults() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("PROTOCOL", "https"),
            ("BLACKLISTED_BROADCASTING_SERVER_IPS", "1.2.3.4"),
            ("CLEANUP_INTERVAL_MS", "500"),
            ("MAX_INACTIVE_TIME_MS", "2000"),
            ("MAX_PAYLOAD_SIZE_MB", "1"),
        ]);
        let config = Config::from_lookup(lookup_from(&pairs));

        assert_eq!(config.blacklisted_ips, vec!["1.2.3.4"]);
        assert_eq!(
            config.sweep_config(),
            SweepConfig {
                interval: Duration::from_millis(500),
                max_inactive: Duration::from_millis(2000),
            }
        );
        assert_eq!(config.max_payload_bytes(), 1024 * 1024);
        assert_eq!(config.ws_url(), "wss://relay.local:8081");
        assert_eq!(config.http_url(), "https://relay.local:8080");
    }

    #[test]
    fn unparsable_numbers_fall_back() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("CLEANUP_INTERVAL_MS", "soon"));
        let config = Config::from_lookup(lookup_from(&pairs));
        assert_eq!(config.cleanup_interval, DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    #[should_panic(expected = "ALLOWED_BROADCASTING_SERVER_IPS env var is required")]
    fn missing_allow_list_is_fatal() {
        Config::from_lookup(lookup_from(&REQUIRED[..3]));
    }
}
