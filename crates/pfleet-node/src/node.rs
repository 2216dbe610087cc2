//! Node Records
//!
//! A node is one third-party PPTP endpoint together with the tunnel and
//! proxy bindings it carries while it is online.

use crate::status::NodeStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Stable node identifier (assigned by the import pipeline)
pub type NodeId = u64;

/// Default PPTP control port
pub const DEFAULT_PPTP_PORT: u16 = 1723;

fn default_pptp_port() -> u16 {
    DEFAULT_PPTP_PORT
}

/// A candidate VPN endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier
    pub id: NodeId,
    /// Endpoint address
    pub ip: IpAddr,
    /// Control port
    #[serde(default = "default_pptp_port")]
    pub port: u16,
    /// PPTP login
    pub login: String,
    /// PPTP password
    pub password: String,
    /// Current verification stage
    #[serde(default)]
    pub status: NodeStatus,
    /// Status held right before the last promotion
    #[serde(default)]
    pub previous_status: Option<NodeStatus>,
    /// OS interface of the live tunnel (e.g. "ppp3")
    #[serde(default)]
    pub ppp_interface: Option<String>,
    /// Address clients use to reach the proxy
    #[serde(default)]
    pub socks_ip: Option<IpAddr>,
    /// Proxy listening port
    #[serde(default)]
    pub socks_port: Option<u16>,
    /// Generated proxy username
    #[serde(default)]
    pub socks_login: Option<String>,
    /// Generated proxy password
    #[serde(default)]
    pub socks_password: Option<String>,
    /// Last measured throughput (Mbps)
    #[serde(default)]
    pub speed: Option<f64>,
    /// Last handshake round-trip (ms)
    #[serde(default)]
    pub ping_ms: Option<u64>,
    /// Last protocol test
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    /// Last status change
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

impl Node {
    /// Create a freshly imported node
    pub fn new(id: NodeId, ip: IpAddr, login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id,
            ip,
            port: DEFAULT_PPTP_PORT,
            login: login.into(),
            password: password.into(),
            status: NodeStatus::NotTested,
            previous_status: None,
            ppp_interface: None,
            socks_ip: None,
            socks_port: None,
            socks_login: None,
            socks_password: None,
            speed: None,
            ping_ms: None,
            last_check: None,
            last_update: None,
        }
    }

    /// Override the control port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Current proxy binding, if every proxy field is present
    pub fn proxy(&self) -> Option<ProxyBinding> {
        Some(ProxyBinding {
            ip: self.socks_ip?,
            port: self.socks_port?,
            login: self.socks_login.clone()?,
            password: self.socks_password.clone()?,
        })
    }

    /// `ip:port:login:password` tuple for operational consumers
    pub fn proxy_tuple(&self) -> Option<String> {
        self.proxy().map(|p| p.to_string())
    }

    /// Whether any tunnel or proxy field is still populated
    pub fn has_bindings(&self) -> bool {
        self.ppp_interface.is_some()
            || self.socks_ip.is_some()
            || self.socks_port.is_some()
            || self.socks_login.is_some()
            || self.socks_password.is_some()
    }
}

/// Proxy exposure of an online node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyBinding {
    pub ip: IpAddr,
    pub port: u16,
    pub login: String,
    pub password: String,
}

impl std::fmt::Display for ProxyBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}:{}", self.ip, self.port, self.login, self.password)
    }
}

/// Partial update of a node record
///
/// Status fields can only be set from inside this crate, so every status
/// write goes through [`StatusMachine`](crate::StatusMachine).
/// `Some(None)` clears a nullable field, `None` leaves it untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    status: Option<NodeStatus>,
    previous_status: Option<Option<NodeStatus>>,
    ppp_interface: Option<Option<String>>,
    proxy: Option<Option<ProxyBinding>>,
    speed: Option<f64>,
    ping_ms: Option<u64>,
    last_check: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
}

impl NodePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn with_previous_status(mut self, previous: Option<NodeStatus>) -> Self {
        self.previous_status = Some(previous);
        self
    }

    /// Set or clear the tunnel interface
    pub fn ppp_interface(mut self, iface: Option<String>) -> Self {
        self.ppp_interface = Some(iface);
        self
    }

    /// Set or clear all proxy fields at once
    pub fn proxy(mut self, proxy: Option<ProxyBinding>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn speed(mut self, mbps: f64) -> Self {
        self.speed = Some(mbps);
        self
    }

    pub fn ping_ms(mut self, ms: u64) -> Self {
        self.ping_ms = Some(ms);
        self
    }

    pub fn last_check(mut self, at: DateTime<Utc>) -> Self {
        self.last_check = Some(at);
        self
    }

    pub fn last_update(mut self, at: DateTime<Utc>) -> Self {
        self.last_update = Some(at);
        self
    }

    /// Status carried by this patch
    pub fn status(&self) -> Option<NodeStatus> {
        self.status
    }

    /// Check if the patch changes nothing
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch to a record
    pub fn apply(&self, node: &mut Node) {
        if let Some(status) = self.status {
            node.status = status;
        }
        if let Some(previous) = self.previous_status {
            node.previous_status = previous;
        }
        if let Some(ref iface) = self.ppp_interface {
            node.ppp_interface = iface.clone();
        }
        if let Some(ref proxy) = self.proxy {
            match proxy {
                Some(p) => {
                    node.socks_ip = Some(p.ip);
                    node.socks_port = Some(p.port);
                    node.socks_login = Some(p.login.clone());
                    node.socks_password = Some(p.password.clone());
                }
                None => {
                    node.socks_ip = None;
                    node.socks_port = None;
                    node.socks_login = None;
                    node.socks_password = None;
                }
            }
        }
        if let Some(speed) = self.speed {
            node.speed = Some(speed);
        }
        if let Some(ms) = self.ping_ms {
            node.ping_ms = Some(ms);
        }
        if let Some(at) = self.last_check {
            node.last_check = Some(at);
        }
        if let Some(at) = self.last_update {
            node.last_update = Some(at);
        }
    }
}
