//! Coarse allow/deny-list filtering of publisher origins.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::config::Config;
use crate::error::ApiError;
use crate::AppState;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AccessDenied {
    #[error("Connection is blacklisted!")]
    Blacklisted,
    #[error("Connection not whitelisted!")]
    NotWhitelisted,
}

impl IntoResponse for AccessDenied {
    fn into_response(self) -> Response {
        ApiError::unauthorized(self.to_string()).into_response()
    }
}

/// Stateless origin check built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    allow_all: bool,
    allowed: Vec<String>,
    denied: Vec<String>,
}

impl AccessControl {
    pub fn new(allowed: Vec<String>, denied: Vec<String>) -> Self {
        let allow_all = allowed.iter().any(|ip| ip == WILDCARD);
        Self {
            allow_all,
            allowed,
            denied,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.allowed_ips.clone(), config.blacklisted_ips.clone())
    }

    /// Deny-list first, then allow-list. An unknown origin only passes a
    /// wildcard allow-list.
    pub fn check(&self, origin: Option<&str>) -> Result<(), AccessDenied> {
        if let Some(ip) = origin {
            if self.denied.iter().any(|d| d == ip) {
                return Err(AccessDenied::Blacklisted);
            }
        }

        let allowed = self.allow_all
            || origin.is_some_and(|ip| self.allowed.iter().any(|a| a == ip));
        if allowed {
            Ok(())
        } else {
            Err(AccessDenied::NotWhitelisted)
        }
    }
}

/// Extractor that admits only permitted publisher origins. Put it first in a
/// handler's argument list so it runs before the body is read.
#[derive(Debug, Clone)]
pub struct PublisherOrigin {
    pub ip: Option<String>,
}

impl FromRequestParts<AppState> for PublisherOrigin {
    type Rejection = AccessDenied;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let ip = client_ip(&parts.headers, peer);

        if let Err(denied) = state.access.check(ip.as_deref()) {
            tracing::warn!(ip = ?ip, reason = %denied, "publisher rejected");
            return Err(denied);
        }

        Ok(Self { ip })
    }
}

/// Resolve the publisher's address: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the TCP peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(canonical_ip)
        .or_else(|| peer.map(|ip| canonical_ip(&ip.to_string())))
}

/// IPv4-mapped IPv6 addresses (`::ffff:10.0.0.1`) compare as plain IPv4.
fn canonical_ip(raw: &str) -> String {
    match raw.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(ip) => ip.to_string(),
        Err(_) => raw.to_string(),
    }
}
