//! pfleet VPN - PPP tunnels exposed as per-node SOCKS5 proxies
//!
//! Turns verified PPTP nodes into live tunnels and puts an authenticated
//! SOCKS5 listener in front of each one.
//!
//! # Architecture
//!
//! ```text
//!   client ──SOCKS5──▶ :20000 ┌────────────┐ SO_BINDTODEVICE ppp0 ┌──────────┐
//!                             │ SocksRelay │ SO_MARK 20000 ──────▶│ pppd (0) │──▶ node 3
//!   client ──SOCKS5──▶ :20001 │            │ SO_BINDTODEVICE ppp1 ├──────────┤
//!                             └────────────┘ SO_MARK 20001 ──────▶│ pppd (1) │──▶ node 7
//!                                                                 └──────────┘
//!   ip rule fwmark 0x4e20 → table 30000 → default dev ppp0
//!   ip rule fwmark 0x4e21 → table 30001 → default dev ppp1
//! ```
//!
//! # Components
//!
//! - **TunnelManager**: pppd per node, interface discovery, policy routing
//! - **SocksRelay**: one listener per online node, RFC 1929 auth, CONNECT
//! - **NodeServices**: launch and teardown under the node lock
//! - **Watchdog**: periodic health check, demotion and routing repair
//! - **FleetManager**: bounded, cancellable batches over the fleet
//!
//! Egress sockets are pinned to their tunnel, so a client of one node's
//! port never leaves through another node or the host default route.

mod allocator;
mod config;
mod egress;
mod error;
mod iface;
mod manager;
mod ppp;
mod proxy;
mod routing;
mod services;
mod tunnel;
mod watchdog;

pub use allocator::{generate_credential, PortAllocator};
pub use config::{BatchConfig, ConfigError, FleetConfig, SocksConfig, TunnelConfig, WatchdogConfig};
pub use egress::{DeviceBoundDialer, EgressBinding, EgressDialer, TargetAddr};
pub use error::FleetError;
pub use iface::{InterfaceProbe, InterfaceState, StaticInterfaces, SystemInterfaces};
pub use manager::{FleetManager, NodeReport, RecoveryReport};
pub use ppp::{PeerFile, PppSpawner, PppdSpawner, PEER_FILE_PREFIX};
pub use proxy::{ListenerInfo, RelayError, SocksRelay};
pub use routing::{CommandOutput, CommandRunner, PolicyRouter, RoutingError, SystemCommandRunner};
pub use services::NodeServices;
pub use tunnel::{Tunnel, TunnelError, TunnelHealth, TunnelManager};
pub use watchdog::{CycleReport, Watchdog};
