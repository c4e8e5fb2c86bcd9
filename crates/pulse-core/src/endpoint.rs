//! QoS server records as published by the regional discovery service.
//!
//! The discovery service is the authority for every field except
//! `backoff_until`, which the client stamps when a probe response carries
//! flow control. Probing is IPv4 only; the ipv6 field exists for display
//! and for keying statistics, never for the probe path.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// One regional QoS server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosServer {
    #[serde(default)]
    pub locationid: i64,
    pub regionid: String,
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: Option<String>,
    pub port: u16,

    /// Wall-clock time before which this server must not be probed.
    /// Client-side state, never on the wire.
    #[serde(skip)]
    pub backoff_until: Option<SystemTime>,
}

/// The discovery response body: `{"servers": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerList {
    pub servers: Vec<QosServer>,
}

/// Reasons a discovered server is dropped before probing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid ipv4 address: {0:?}")]
    BadAddress(String),

    #[error("port must be non-zero")]
    ZeroPort,

    #[error("regionid must be non-empty")]
    EmptyRegion,
}

impl QosServer {
    /// Construct a server record with only the fields the probe path needs.
    pub fn new(regionid: impl Into<String>, ipv4: impl Into<String>, port: u16) -> Self {
        QosServer {
            locationid: 0,
            regionid: regionid.into(),
            ipv4: ipv4.into(),
            ipv6: None,
            port,
            backoff_until: None,
        }
    }

    /// Check the invariants the discovery service promises. Servers failing
    /// any of these are dropped after discovery.
    pub fn validate(&self) -> Result<(), EndpointError> {
        self.parse_ipv4()?;
        if self.port == 0 {
            return Err(EndpointError::ZeroPort);
        }
        if self.regionid.is_empty() {
            return Err(EndpointError::EmptyRegion);
        }
        Ok(())
    }

    /// The normalized address probes are sent to. Two servers are the same
    /// probe target exactly when these compare equal.
    pub fn probe_addr(&self) -> Result<SocketAddrV4, EndpointError> {
        Ok(SocketAddrV4::new(self.parse_ipv4()?, self.port))
    }

    /// The key this server's results are stored under: `ipv6:port` when an
    /// IPv6 address is published, `ipv4:port` otherwise.
    pub fn stats_key(&self) -> String {
        match self.ipv6.as_deref() {
            Some(ipv6) if !ipv6.is_empty() => format!("{}:{}", ipv6, self.port),
            _ => format!("{}:{}", self.ipv4, self.port),
        }
    }

    /// Whether the server's back-off window is still open at `now`.
    pub fn is_backed_off(&self, now: SystemTime) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }

    fn parse_ipv4(&self) -> Result<Ipv4Addr, EndpointError> {
        self.ipv4
            .parse()
            .map_err(|_| EndpointError::BadAddress(self.ipv4.clone()))
    }
}
