//! Server discovery and client address detection.

use crate::config::Config;
use crate::Result;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// A speed-test server a client may connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub url: String,
    pub region: String,
    pub city: String,
    pub country: String,
}

/// Source of the server list returned by `GetServers`.
#[async_trait]
pub trait ServerProvider: Send + Sync {
    /// Returns at most `limit` servers; `limit <= 0` means no limit.
    async fn get_servers(&self, limit: i32) -> Result<Vec<ServerInfo>>;
}

/// Provider that only knows about the server it runs in.
pub struct SimpleServerProvider {
    info: ServerInfo,
}

impl SimpleServerProvider {
    pub fn new(config: &Config) -> Self {
        Self {
            info: ServerInfo {
                id: config.server_id.clone(),
                url: config.public_url.clone(),
                region: config.region.clone(),
                city: config.city.clone(),
                country: config.country.clone(),
            },
        }
    }
}

#[async_trait]
impl ServerProvider for SimpleServerProvider {
    async fn get_servers(&self, limit: i32) -> Result<Vec<ServerInfo>> {
        debug!("GetServers called with limit {}", limit);
        let mut servers = vec![self.info.clone()];
        if limit > 0 {
            servers.truncate(limit as usize);
        }
        Ok(servers)
    }
}

/// Where the server believes a client is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLocation {
    pub ip: String,
    pub city: String,
    pub country: String,
}

/// Resolves the client's public address for `GetClientIp`.
#[async_trait]
pub trait IpDetector: Send + Sync {
    /// `peer` is the transport-level address, `metadata` the request headers
    /// (keys are matched case-insensitively).
    async fn detect_client_ip(
        &self,
        peer: Option<SocketAddr>,
        metadata: &HashMap<String, String>,
    ) -> Result<ClientLocation>;
}

const UNKNOWN_IP: &str = "Unknown";
const UNKNOWN_CITY: &str = "Unknown";
const UNKNOWN_COUNTRY: &str = "XX";

/// Detector using the peer address, overridden by proxy headers.
///
/// Location is a placeholder; no geo-IP lookup is performed.
#[derive(Debug, Default)]
pub struct DefaultIpDetector;

impl DefaultIpDetector {
    pub fn new() -> Self {
        Self
    }
}

fn header<'a>(metadata: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    metadata
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[async_trait]
impl IpDetector for DefaultIpDetector {
    async fn detect_client_ip(
        &self,
        peer: Option<SocketAddr>,
        metadata: &HashMap<String, String>,
    ) -> Result<ClientLocation> {
        let mut ip = peer
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_IP.to_string());

        if let Some(forwarded) = header(metadata, "x-forwarded-for") {
            // The first entry is the originating client.
            if let Some(first) = forwarded.split(',').next() {
                ip = first.trim().to_string();
            }
        } else if let Some(real_ip) = header(metadata, "x-real-ip") {
            ip = real_ip.trim().to_string();
        }

        info!("Detected client IP: {}", ip);
        Ok(ClientLocation {
            ip,
            city: UNKNOWN_CITY.to_string(),
            country: UNKNOWN_COUNTRY.to_string(),
        })
    }
}
