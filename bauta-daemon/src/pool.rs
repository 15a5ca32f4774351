//! Per-connection IP address pool.
//!
//! The free set is ordered so allocation is deterministic (lowest address
//! first); the network address and the gateway are never handed out. Very
//! large IPv6 assignment networks are truncated rather than materialised.

use bauta_core::{ClientId, Error, Result};
use ipnet::IpNet;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;

/// Upper bound on materialised pool size (IPv6 prefixes can cover more
/// addresses than any deployment will assign).
const MAX_POOL: usize = 65_534;

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Addresses managed by the pool.
    pub total: usize,
    /// Currently allocated.
    pub allocated: usize,
    /// Currently free.
    pub available: usize,
}

struct PoolInner {
    free: BTreeSet<IpAddr>,
    allocated: HashMap<IpAddr, ClientId>,
}

/// Thread-safe allocator of host addresses from a VPN prefix.
pub struct IpPool {
    network: IpNet,
    gateway: IpAddr,
    inner: Mutex<PoolInner>,
}

impl IpPool {
    /// Build a pool covering every host address of `network` except the
    /// network address, the broadcast address, and `gateway`.
    pub fn new(network: IpNet, gateway: IpAddr) -> Result<Self> {
        if !network.contains(&gateway) {
            return Err(Error::config(format!(
                "gateway {gateway} outside assignment network {network}"
            )));
        }
        // IPv4 hosts() already skips the network and broadcast addresses;
        // IPv6 has no broadcast and hosts() starts at the network address,
        // so exclude it explicitly.
        let network_addr = network.network();
        let free: BTreeSet<IpAddr> = network
            .hosts()
            .filter(|addr| *addr != gateway && *addr != network_addr)
            .take(MAX_POOL)
            .collect();
        if free.is_empty() {
            return Err(Error::config(format!(
                "assignment network {network} has no assignable addresses"
            )));
        }
        Ok(Self {
            network,
            gateway,
            inner: Mutex::new(PoolInner {
                free,
                allocated: HashMap::new(),
            }),
        })
    }

    /// Allocate the lowest free host address as a /32 (or /128) prefix.
    pub fn allocate(&self, client: &ClientId) -> Result<IpNet> {
        let mut inner = self.lock()?;
        let addr = *inner
            .free
            .iter()
            .next()
            .ok_or_else(|| Error::resource("no available IP"))?;
        inner.free.remove(&addr);
        inner.allocated.insert(addr, client.clone());
        Ok(bauta_core::ip::host_prefix(addr))
    }

    /// Return an address to the free set. Releasing an address that is not
    /// allocated (including a second release) is a no-op.
    pub fn release(&self, addr: IpAddr) {
        if let Ok(mut inner) = self.lock() {
            if inner.allocated.remove(&addr).is_some() {
                inner.free.insert(addr);
            }
        }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        match self.lock() {
            Ok(inner) => PoolStats {
                total: inner.free.len() + inner.allocated.len(),
                allocated: inner.allocated.len(),
                available: inner.free.len(),
            },
            Err(_) => PoolStats {
                total: 0,
                allocated: 0,
                available: 0,
            },
        }
    }

    /// The covering assignment network.
    pub fn network(&self) -> IpNet {
        self.network
    }

    /// The gateway address, never assignable.
    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PoolInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::resource("ip pool poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(net: &str, gw: &str) -> IpPool {
        IpPool::new(net.parse().unwrap(), gw.parse().unwrap()).unwrap()
    }

    #[test]
    fn allocates_lowest_first() {
        let pool = pool("10.8.0.0/24", "10.8.0.1");
        let a = pool.allocate(&ClientId::new("a")).unwrap();
        let b = pool.allocate(&ClientId::new("b")).unwrap();
        assert_eq!(a.to_string(), "10.8.0.2/32");
        assert_eq!(b.to_string(), "10.8.0.3/32");
    }

    #[test]
    fn gateway_and_network_never_allocated() {
        let pool = pool("10.9.9.0/30", "10.9.9.1");
        let only = pool.allocate(&ClientId::new("a")).unwrap();
        assert_eq!(only.to_string(), "10.9.9.2/32");
        let err = pool.allocate(&ClientId::new("b")).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn release_returns_and_is_idempotent() {
        let pool = pool("10.8.0.0/29", "10.8.0.1");
        let start = pool.stats();
        let a = pool.allocate(&ClientId::new("a")).unwrap();

        pool.release(a.addr());
        pool.release(a.addr()); // second release: no-op
        pool.release("192.0.2.1".parse().unwrap()); // never allocated: no-op

        let end = pool.stats();
        assert_eq!(start, end);
    }

    #[test]
    fn released_address_is_reallocated_lowest_first() {
        let pool = pool("10.8.0.0/29", "10.8.0.1");
        let a = pool.allocate(&ClientId::new("a")).unwrap();
        let _b = pool.allocate(&ClientId::new("b")).unwrap();
        pool.release(a.addr());
        let c = pool.allocate(&ClientId::new("c")).unwrap();
        assert_eq!(c.addr(), a.addr());
    }

    #[test]
    fn stats_conservation() {
        let pool = pool("10.8.0.0/28", "10.8.0.1");
        let total = pool.stats().total;
        let mut held = Vec::new();
        for i in 0..5 {
            held.push(pool.allocate(&ClientId::new(format!("c{i}"))).unwrap());
        }
        let mid = pool.stats();
        assert_eq!(mid.allocated, 5);
        assert_eq!(mid.total, total);
        assert_eq!(mid.available, total - 5);
        for prefix in held {
            pool.release(prefix.addr());
        }
        assert_eq!(pool.stats().available, total);
    }

    #[test]
    fn gateway_outside_network_rejected() {
        assert!(IpPool::new(
            "10.8.0.0/24".parse().unwrap(),
            "192.0.2.1".parse().unwrap()
        )
        .is_err());
    }

    #[test]
    fn ipv6_pool_is_bounded() {
        let pool = pool("fd00::/64", "fd00::1");
        let stats = pool.stats();
        assert!(stats.total <= MAX_POOL);
        let first = pool.allocate(&ClientId::new("a")).unwrap();
        assert_eq!(first.to_string(), "fd00::2/128");
    }
}
