//! Port and credential allocation for proxy listeners

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Hands out SOCKS ports from a fixed range
///
/// A port stays taken until released, so two online nodes never share
/// one. The lowest free port is always picked.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    taken: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Allocator over `start..=end`
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            taken: Mutex::new(BTreeSet::new()),
        }
    }

    /// Take the lowest free port
    pub fn allocate(&self) -> Option<u16> {
        let mut taken = self.taken.lock().unwrap_or_else(|e| e.into_inner());
        let port = (self.start..=self.end).find(|p| !taken.contains(p))?;
        taken.insert(port);
        Some(port)
    }

    /// Return a port to the pool
    pub fn release(&self, port: u16) -> bool {
        self.taken.lock().unwrap_or_else(|e| e.into_inner()).remove(&port)
    }

    /// Ports currently handed out
    pub fn in_use(&self) -> usize {
        self.taken.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Size of the range
    pub fn capacity(&self) -> usize {
        (self.end as usize + 1).saturating_sub(self.start as usize)
    }
}

/// Random alphanumeric credential
pub fn generate_credential(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_port() {
        let ports = PortAllocator::new(20000, 20002);

        assert_eq!(ports.allocate(), Some(20000));
        assert_eq!(ports.allocate(), Some(20001));
        assert!(ports.release(20000));
        assert_eq!(ports.allocate(), Some(20000));
        assert_eq!(ports.allocate(), Some(20002));
        assert_eq!(ports.allocate(), None);
        assert_eq!(ports.in_use(), ports.capacity());
        assert!(!ports.release(20005));
    }

    #[test]
    fn test_credentials() {
        let a = generate_credential(12);
        let b = generate_credential(12);

        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
