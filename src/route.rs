//! Route resolution for forwarded datagrams.
//!
//! The routing table itself lives outside this crate; the forwarder only
//! sees [`RouteResolver`]. Results are shared read-only handles so that a
//! per-interface [`RouteCache`] can hold on to the last one without copying.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

use spin::Mutex;

use crate::device::InterfaceId;

// ============================================================================
// Resolver Interface
// ============================================================================

/// Outcome of a route lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResult {
    /// Destination the lookup was made for.
    pub destination: Ipv4Addr,
    /// Interface the datagram leaves on.
    pub egress_interface: InterfaceId,
    /// Next hop: the gateway for indirect routes, else `destination`.
    pub next_hop: Ipv4Addr,
    /// Route goes through a gateway.
    pub is_gateway: bool,
    /// Route was created or modified by an ICMP redirect.
    pub is_modified_by_redirect: bool,
    /// Route is the default route.
    pub is_default: bool,
    /// Path MTU known for this route.
    pub mtu: Option<u16>,
}

impl RouteResult {
    /// Direct route to `destination` via `egress`.
    pub fn direct(destination: Ipv4Addr, egress: InterfaceId) -> Self {
        RouteResult {
            destination,
            egress_interface: egress,
            next_hop: destination,
            is_gateway: false,
            is_modified_by_redirect: false,
            is_default: false,
            mtu: None,
        }
    }

    /// Indirect route to `destination` through `gateway`.
    pub fn via(destination: Ipv4Addr, gateway: Ipv4Addr, egress: InterfaceId) -> Self {
        RouteResult {
            next_hop: gateway,
            is_gateway: true,
            ..RouteResult::direct(destination, egress)
        }
    }
}

/// External routing table lookup.
pub trait RouteResolver: Send + Sync {
    /// Resolve `destination`, or `None` if no route exists.
    fn resolve(&self, destination: Ipv4Addr) -> Option<Arc<RouteResult>>;

    /// Monotonic table generation. Cached results from an older generation
    /// are revalidated.
    fn generation(&self) -> u64 {
        0
    }
}

// ============================================================================
// Per-Interface Route Cache
// ============================================================================

#[derive(Debug)]
struct CachedRoute {
    destination: Ipv4Addr,
    generation: u64,
    route: Arc<RouteResult>,
}

/// One cached forwarding route per interface, each behind its own lock so
/// forwarding on different interfaces never contends.
#[derive(Debug)]
pub struct RouteCache {
    slots: Vec<Mutex<Option<CachedRoute>>>,
}

impl RouteCache {
    /// Cache with slots for interface ids `0..max_interfaces`.
    pub fn new(max_interfaces: usize) -> Self {
        RouteCache {
            slots: (0..max_interfaces).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Look up `destination` in `slot`'s cache, re-resolving through
    /// `resolver` on a destination or generation mismatch.
    ///
    /// The slot lock is only held for the compare-and-refill; the returned
    /// handle is used without it.
    pub fn lookup(
        &self,
        slot: InterfaceId,
        destination: Ipv4Addr,
        resolver: &dyn RouteResolver,
    ) -> Option<Arc<RouteResult>> {
        let generation = resolver.generation();
        let Some(cell) = self.slots.get(slot.index()) else {
            // Interfaces beyond the cache size are resolved every time.
            return resolver.resolve(destination);
        };

        let mut cached = cell.lock();
        if let Some(entry) = cached.as_ref() {
            if entry.destination == destination && entry.generation == generation {
                return Some(entry.route.clone());
            }
        }
        *cached = None;
        let route = resolver.resolve(destination)?;
        *cached = Some(CachedRoute {
            destination,
            generation,
            route: route.clone(),
        });
        Some(route)
    }

    /// Drop every cached route.
    pub fn flush(&self) {
        for slot in &self.slots {
            *slot.lock() = None;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct CountingResolver {
        lookups: AtomicUsize,
        generation: AtomicU64,
    }

    impl RouteResolver for CountingResolver {
        fn resolve(&self, destination: Ipv4Addr) -> Option<Arc<RouteResult>> {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            if destination.octets()[0] == 10 {
                Some(Arc::new(RouteResult::direct(destination, InterfaceId(2))))
            } else {
                None
            }
        }

        fn generation(&self) -> u64 {
            self.generation.load(Ordering::Relaxed)
        }
    }

    fn resolver() -> CountingResolver {
        CountingResolver {
            lookups: AtomicUsize::new(0),
            generation: AtomicU64::new(1),
        }
    }

    #[test]
    fn test_cache_hit_skips_resolver() {
        let cache = RouteCache::new(4);
        let r = resolver();
        let dst = Ipv4Addr::new(10, 0, 0, 9);
        let a = cache.lookup(InterfaceId(1), dst, &r).unwrap();
        let b = cache.lookup(InterfaceId(1), dst, &r).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(r.lookups.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cache_revalidates_on_destination_and_generation() {
        let cache = RouteCache::new(4);
        let r = resolver();
        cache.lookup(InterfaceId(1), Ipv4Addr::new(10, 0, 0, 9), &r);
        cache.lookup(InterfaceId(1), Ipv4Addr::new(10, 0, 0, 8), &r);
        assert_eq!(r.lookups.load(Ordering::Relaxed), 2);

        r.generation.store(2, Ordering::Relaxed);
        cache.lookup(InterfaceId(1), Ipv4Addr::new(10, 0, 0, 8), &r);
        assert_eq!(r.lookups.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_unresolvable_and_out_of_range_slots() {
        let cache = RouteCache::new(1);
        let r = resolver();
        assert!(cache
            .lookup(InterfaceId(0), Ipv4Addr::new(192, 0, 2, 1), &r)
            .is_none());
        assert!(cache
            .lookup(InterfaceId(7), Ipv4Addr::new(10, 1, 1, 1), &r)
            .is_some());
        assert!(cache
            .lookup(InterfaceId(7), Ipv4Addr::new(10, 1, 1, 1), &r)
            .is_some());
        assert_eq!(r.lookups.load(Ordering::Relaxed), 3);
    }
}
