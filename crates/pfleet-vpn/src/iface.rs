//! Interface state lookup

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Observed state of one network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceState {
    pub name: String,
    /// Administratively up
    pub up: bool,
    /// Local tunnel address
    pub local: Option<Ipv4Addr>,
    /// Point-to-point peer address
    pub peer: Option<Ipv4Addr>,
}

impl InterfaceState {
    /// Up with an assigned address; ready to carry traffic
    pub fn is_ready(&self) -> bool {
        self.up && self.local.is_some()
    }
}

/// Reads interface state by name
pub trait InterfaceProbe: Send + Sync {
    /// Current state, or `None` if no such interface exists
    fn lookup(&self, name: &str) -> Option<InterfaceState>;
}

/// Queries the kernel through `getifaddrs(3)`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceProbe for SystemInterfaces {
    fn lookup(&self, name: &str) -> Option<InterfaceState> {
        use nix::ifaddrs::getifaddrs;
        use nix::net::if_::InterfaceFlags;

        let addrs = match getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::warn!(error = %e, "getifaddrs failed");
                return None;
            }
        };

        let mut state: Option<InterfaceState> = None;
        for entry in addrs.filter(|a| a.interface_name == name) {
            let current = state.get_or_insert_with(|| InterfaceState {
                name: name.to_string(),
                up: false,
                local: None,
                peer: None,
            });
            current.up |= entry.flags.contains(InterfaceFlags::IFF_UP);

            if let Some(sin) = entry.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
                current.local = Some(Ipv4Addr::from(sin.ip()));
            }
            if let Some(sin) = entry.destination.as_ref().and_then(|a| a.as_sockaddr_in()) {
                current.peer = Some(Ipv4Addr::from(sin.ip()));
            }
        }
        state
    }
}

/// Interface table set by hand (tests, dry runs)
#[derive(Debug, Default)]
pub struct StaticInterfaces {
    table: Mutex<HashMap<String, InterfaceState>>,
}

impl StaticInterfaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an interface that is up with the given addresses
    pub fn set_up(&self, name: &str, local: Ipv4Addr, peer: Ipv4Addr) {
        self.set(InterfaceState {
            name: name.to_string(),
            up: true,
            local: Some(local),
            peer: Some(peer),
        });
    }

    /// Add or replace an interface
    pub fn set(&self, state: InterfaceState) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(state.name.clone(), state);
    }

    /// Mark an interface administratively down
    pub fn set_down(&self, name: &str) {
        if let Some(state) = self
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(name)
        {
            state.up = false;
        }
    }

    /// Remove an interface
    pub fn remove(&self, name: &str) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }
}

impl InterfaceProbe for StaticInterfaces {
    fn lookup(&self, name: &str) -> Option<InterfaceState> {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}
