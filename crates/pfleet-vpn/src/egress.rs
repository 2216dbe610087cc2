//! Egress Dialing
//!
//! Every outbound proxy connection is made through an [`EgressDialer`]
//! with the node's [`EgressBinding`]. The system dialer binds the socket
//! to the tunnel interface and stamps it with the node's routing mark
//! before `connect`, so the kernel never picks another path.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Destination requested by a SOCKS client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Where a node's egress traffic must go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressBinding {
    /// Tunnel interface (`pppN`)
    pub interface: String,
    /// Firewall mark selecting the node's routing table
    pub mark: u32,
}

/// Opens outbound connections pinned to a binding
#[async_trait]
pub trait EgressDialer: Send + Sync {
    async fn connect(
        &self,
        target: &TargetAddr,
        binding: &EgressBinding,
        connect_timeout: Duration,
    ) -> io::Result<TcpStream>;
}

/// Binds to the interface with `SO_BINDTODEVICE` and sets `SO_MARK`
///
/// Domain targets are resolved with the host resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceBoundDialer;

impl DeviceBoundDialer {
    async fn connect_one(
        addr: SocketAddr,
        binding: &EgressBinding,
        connect_timeout: Duration,
    ) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        pin_socket(&socket, binding)?;

        match timeout(connect_timeout, socket.connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn pin_socket(socket: &TcpSocket, binding: &EgressBinding) -> io::Result<()> {
    let sock = socket2::SockRef::from(socket);
    sock.bind_device(Some(binding.interface.as_bytes()))?;
    sock.set_mark(binding.mark)?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn pin_socket(_socket: &TcpSocket, _binding: &EgressBinding) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface-bound sockets need Linux",
    ))
}

#[async_trait]
impl EgressDialer for DeviceBoundDialer {
    async fn connect(
        &self,
        target: &TargetAddr,
        binding: &EgressBinding,
        connect_timeout: Duration,
    ) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = match target {
            TargetAddr::Ip(addr) => vec![*addr],
            TargetAddr::Domain(host, port) => {
                match timeout(connect_timeout, lookup_host((host.as_str(), *port))).await {
                    Ok(resolved) => resolved?.collect(),
                    Err(_) => {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "resolve timed out"));
                    }
                }
            }
        };

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for addr in addrs {
            match Self::connect_one(addr, binding, connect_timeout).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, interface = %binding.interface, error = %e, "Egress connect failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}
