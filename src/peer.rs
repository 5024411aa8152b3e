//! Per-remote-address admission control.
//!
//! Tracks live connection counts keyed by remote IP. A record is created on
//! first sighting and removed once its count returns to zero, so the map
//! only holds addresses with at least one live connection.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;

/// Registry of live connection counts per remote address.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    counts: Mutex<HashMap<IpAddr, usize>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve one connection for `addr`. A `ceiling` of 0 means unlimited.
    /// Returns `false` without reserving when the address is already at the
    /// ceiling.
    pub fn try_acquire(&self, addr: IpAddr, ceiling: usize) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(addr).or_insert(0);
        if ceiling != 0 && *count >= ceiling {
            // don't keep an empty record around for a denied first sighting
            if *count == 0 {
                counts.remove(&addr);
            }
            return false;
        }
        *count += 1;
        true
    }

    /// Release one connection for `addr`, dropping the record at zero.
    pub fn release(&self, addr: IpAddr) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&addr);
            }
        }
    }

    /// Live connection count for `addr`.
    pub fn count(&self, addr: IpAddr) -> usize {
        self.counts.lock().get(&addr).copied().unwrap_or(0)
    }

    /// Number of addresses currently tracked.
    pub fn tracked(&self) -> usize {
        self.counts.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn acquire_and_release() {
        let peers = PeerRegistry::new();
        assert!(peers.try_acquire(addr(1), 0));
        assert_eq!(peers.count(addr(1)), 1);
        assert_eq!(peers.tracked(), 1);

        peers.release(addr(1));
        assert_eq!(peers.count(addr(1)), 0);
        assert_eq!(peers.tracked(), 0);
    }

    #[test]
    fn ceiling_enforced() {
        let peers = PeerRegistry::new();
        assert!(peers.try_acquire(addr(2), 2));
        assert!(peers.try_acquire(addr(2), 2));
        assert!(!peers.try_acquire(addr(2), 2));
        assert_eq!(peers.count(addr(2)), 2);

        // another address is unaffected
        assert!(peers.try_acquire(addr(3), 2));

        // releasing one frees a reservation
        peers.release(addr(2));
        assert!(peers.try_acquire(addr(2), 2));
    }

    #[test]
    fn zero_ceiling_is_unlimited() {
        let peers = PeerRegistry::new();
        for _ in 0..100 {
            assert!(peers.try_acquire(addr(4), 0));
        }
        assert_eq!(peers.count(addr(4)), 100);
    }

    #[test]
    fn denied_first_sighting_leaves_no_record() {
        let peers = PeerRegistry::new();
        // a ceiling of zero connections can't happen via config (0 means
        // unlimited), but a full release/deny cycle must not leak records
        assert!(peers.try_acquire(addr(5), 1));
        assert!(!peers.try_acquire(addr(5), 1));
        peers.release(addr(5));
        assert_eq!(peers.tracked(), 0);
    }
}
