//! Fleet Configuration
//!
//! One TOML file, one section per component. Every section defaults, so
//! a partial file (or none at all) is valid:
//!
//! ```toml
//! [probe]
//! attempts = 2
//! slow_mbps_floor = 1.0
//!
//! [tunnel]
//! pppd_path = "/usr/sbin/pppd"
//! peers_dir = "/etc/ppp/peers"
//! startup_timeout_secs = 20
//!
//! [socks]
//! public_ip = "203.0.113.10"
//! port_range_start = 20000
//! port_range_end = 20999
//!
//! [watchdog]
//! interval_secs = 300
//! attempts = 3
//!
//! [fleet]
//! max_concurrent_tests = 32
//! nodes_file = "nodes.json"
//! ```

use pfleet_probe::{ProbeConfig, ProbeConfigError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// PPP daemon and policy routing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// PPP daemon binary
    pub pppd_path: PathBuf,
    /// PPTP helper used as the pppd `pty`
    pub pptp_path: PathBuf,
    /// Directory for generated peer files
    pub peers_dir: PathBuf,
    /// Time allowed for the interface to come up (seconds)
    pub startup_timeout_secs: u64,
    /// Delay between interface polls (milliseconds)
    pub poll_interval_ms: u64,
    /// Wait after SIGTERM before SIGKILL (milliseconds)
    pub stop_grace_ms: u64,
    /// Tunnels being brought up at once
    pub max_concurrent_launches: usize,
    /// Routing table for a proxy is `routing_table_base + port`
    pub routing_table_base: u32,
    /// iproute2 binary
    pub ip_path: PathBuf,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            pppd_path: PathBuf::from("/usr/sbin/pppd"),
            pptp_path: PathBuf::from("/usr/sbin/pptp"),
            peers_dir: PathBuf::from("/etc/ppp/peers"),
            startup_timeout_secs: 20,
            poll_interval_ms: 500,
            stop_grace_ms: 3_000,
            max_concurrent_launches: 4,
            routing_table_base: 10_000,
            ip_path: PathBuf::from("/usr/sbin/ip"),
        }
    }
}

impl TunnelConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.startup_timeout_secs == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("tunnel timeouts must be non-zero".into()));
        }
        if self.max_concurrent_launches == 0 {
            return Err(ConfigError::Invalid(
                "tunnel.max_concurrent_launches must be at least 1".into(),
            ));
        }
        if self.routing_table_base.checked_add(u16::MAX as u32).is_none() {
            return Err(ConfigError::Invalid("tunnel.routing_table_base too large".into()));
        }
        Ok(())
    }
}

/// SOCKS5 listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocksConfig {
    /// Address listeners bind to
    pub listen_ip: IpAddr,
    /// Address published in proxy tuples (defaults to `listen_ip`)
    pub public_ip: Option<IpAddr>,
    /// First port handed to a node
    pub port_range_start: u16,
    /// Last port handed to a node (inclusive)
    pub port_range_end: u16,
    /// Relay ends after this much silence in both directions (seconds)
    pub idle_timeout_secs: u64,
    /// Outbound connect timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Client negotiation timeout (seconds)
    pub handshake_timeout_secs: u64,
    /// Concurrent relayed connections per node
    pub max_connections_per_node: usize,
    /// Length of generated proxy username and password
    pub credential_length: usize,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_ip: None,
            port_range_start: 20_000,
            port_range_end: 20_999,
            idle_timeout_secs: 30,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            max_connections_per_node: 256,
            credential_length: 12,
        }
    }
}

impl SocksConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Address clients are told to use
    pub fn advertised_ip(&self) -> IpAddr {
        self.public_ip.unwrap_or(self.listen_ip)
    }

    /// Proxy tuples would carry a wildcard address no client can dial
    pub fn advertises_unspecified(&self) -> bool {
        self.advertised_ip().is_unspecified()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(ConfigError::Invalid(format!(
                "socks port range {}-{} is empty",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.idle_timeout_secs == 0
            || self.connect_timeout_secs == 0
            || self.handshake_timeout_secs == 0
        {
            return Err(ConfigError::Invalid("socks timeouts must be non-zero".into()));
        }
        if self.max_connections_per_node == 0 {
            return Err(ConfigError::Invalid(
                "socks.max_connections_per_node must be at least 1".into(),
            ));
        }
        if !(8..=255).contains(&self.credential_length) {
            return Err(ConfigError::Invalid(
                "socks.credential_length must be between 8 and 255".into(),
            ));
        }
        if self.advertises_unspecified() {
            warn!(
                listen_ip = %self.listen_ip,
                "socks.public_ip is not set; published proxies will carry the wildcard listen address"
            );
        }
        Ok(())
    }
}

/// Watchdog cadence and hysteresis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Time between cycles (seconds)
    pub interval_secs: u64,
    /// Failed checks in a row before a tunnel is declared down
    pub attempts: u32,
    /// Delay between checks of one node (seconds)
    pub attempt_delay_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            attempts: 3,
            attempt_delay_secs: 5,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn attempt_delay(&self) -> Duration {
        Duration::from_secs(self.attempt_delay_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Invalid("watchdog.interval_secs must be non-zero".into()));
        }
        if self.attempts == 0 {
            return Err(ConfigError::Invalid("watchdog.attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Batch operation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Probes in flight at once
    pub max_concurrent_tests: usize,
    /// JSON snapshot of node records
    pub nodes_file: PathBuf,
    /// Where the proxy list is written, if anywhere
    pub proxy_list_file: Option<PathBuf>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tests: 32,
            nodes_file: PathBuf::from("nodes.json"),
            proxy_list_file: Some(PathBuf::from("proxies.txt")),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub probe: ProbeConfig,
    pub tunnel: TunnelConfig,
    pub socks: SocksConfig,
    pub watchdog: WatchdogConfig,
    pub fleet: BatchConfig,
}

impl FleetConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.probe.validate()?;
        self.tunnel.validate()?;
        self.socks.validate()?;
        self.watchdog.validate()?;
        if self.fleet.max_concurrent_tests == 0 {
            return Err(ConfigError::Invalid(
                "fleet.max_concurrent_tests must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid probe configuration: {0}")]
    Probe(#[from] ProbeConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid() {
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let config = FleetConfig::from_toml(
            r#"
            [socks]
            public_ip = "203.0.113.10"
            port_range_start = 30000
            port_range_end = 30009

            [watchdog]
            attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.socks.port_range_start, 30000);
        assert_eq!(config.socks.advertised_ip().to_string(), "203.0.113.10");
        assert_eq!(config.watchdog.attempts, 5);
        assert_eq!(config.watchdog.interval_secs, 300);
        assert_eq!(config.tunnel.startup_timeout(), Duration::from_secs(20));
        assert_eq!(config.probe.attempts, 2);
    }

    #[test]
    fn test_wildcard_listen_needs_public_ip() {
        let mut socks = SocksConfig::default();
        assert!(socks.advertises_unspecified());
        assert!(socks.validate().is_ok());

        socks.public_ip = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)));
        assert!(!socks.advertises_unspecified());

        let bound = SocksConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
            ..Default::default()
        };
        assert!(!bound.advertises_unspecified());
        assert_eq!(bound.advertised_ip(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let result = FleetConfig::from_toml("[socks]\nport_range_start = 2000\nport_range_end = 1000");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_probe_section_validated() {
        let result = FleetConfig::from_toml("[probe]\nattempts = 0");
        assert!(matches!(result, Err(ConfigError::Probe(_))));
    }

    #[test]
    fn test_unknown_type_is_parse_error() {
        let result = FleetConfig::from_toml("[watchdog]\nattempts = \"many\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
