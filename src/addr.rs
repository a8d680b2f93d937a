//! Address parsing for tracker host:port strings and storage-node URLs

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

pub const DEFAULT_TRACKER_PORT: u16 = 7001;

/// One tracker endpoint. The configured list order is the failover order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerAddress {
    pub host: String,
    pub port: u16,
}

impl TrackerAddress {
    /// Parse `host` or `host:port`, defaulting to the standard tracker port.
    pub fn parse(s: &str) -> Option<TrackerAddress> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let (host, port) = match s.rsplit_once(':') {
            Some((h, pr)) => (h, pr.parse().ok()?),
            None => (s, DEFAULT_TRACKER_PORT),
        };
        if host.is_empty() {
            return None;
        }
        Some(TrackerAddress {
            host: host.to_string(),
            port,
        })
    }

    pub fn to_socket_addrs(&self) -> std::io::Result<Vec<SocketAddr>> {
        Ok((self.host.as_str(), self.port).to_socket_addrs()?.collect())
    }
}

impl fmt::Display for TrackerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A replica location as handed out by the tracker: `http://host:port/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    raw: String,
}

impl DevUrl {
    pub fn parse(raw: &str) -> Result<DevUrl> {
        let s = raw.trim();
        let rest = s
            .strip_prefix("http://")
            .ok_or_else(|| Error::BadResponse(format!("unsupported replica url: {}", s)))?;
        let (hp, p) = rest.split_once('/').unwrap_or((rest, ""));
        if hp.is_empty() {
            return Err(Error::BadResponse(format!("replica url missing host: {}", s)));
        }
        let (host, port) = match hp.split_once(':') {
            Some((h, pr)) => (
                h.to_string(),
                pr.parse()
                    .map_err(|_| Error::BadResponse(format!("bad port in replica url: {}", s)))?,
            ),
            None => (hp.to_string(), 80),
        };
        Ok(DevUrl {
            host,
            port,
            path: format!("/{}", p),
            raw: s.to_string(),
        })
    }

    /// The URL exactly as the tracker sent it; `create_close` echoes this back.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for DevUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
