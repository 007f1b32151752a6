//! Interface-facing collaborators of the receive path.
//!
//! The IPv4 layer does not own interfaces. It consults an
//! [`InterfaceTable`] for local addresses and group membership, and hands
//! forwarded datagrams to an [`Egress`] implementation.
//!
//! # Design Principles
//!
//! 1. **Non-blocking**: every call here is expected to return promptly; the
//!    receive path never waits on a collaborator.
//!
//! 2. **Buffer ownership**: [`Egress::send`] consumes the packet. The caller
//!    keeps nothing but the error snapshot it took beforehand.

use core::net::Ipv4Addr;

use thiserror::Error;

use crate::buffer::PacketBuf;
use crate::route::RouteResult;

// ============================================================================
// Interface Identity
// ============================================================================

/// Opaque interface index assigned by the integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct InterfaceId(pub u32);

impl InterfaceId {
    /// Index usable for per-interface arrays.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Interface family, as far as the receive path cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceKind {
    /// Broadcast-capable link (Ethernet, Wi-Fi).
    #[default]
    Broadcast,
    /// Point-to-point link.
    PointToPoint,
    /// Loopback interface.
    Loopback,
    /// Tunnel-like family (IPsec, utun, GRE).
    Tunnel,
}

/// An IPv4 address assigned to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfAddr {
    /// Local address.
    pub addr: Ipv4Addr,
    /// Subnet mask.
    pub netmask: Ipv4Addr,
    /// Directed broadcast address, if the link supports broadcast.
    pub broadcast: Option<Ipv4Addr>,
}

impl IfAddr {
    /// Address with a prefix length and the conventional directed broadcast.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let mask = prefix_mask(prefix_len);
        let bcast = (u32::from(addr) & mask) | !mask;
        IfAddr {
            addr,
            netmask: Ipv4Addr::from(mask),
            broadcast: (prefix_len < 31).then(|| Ipv4Addr::from(bcast)),
        }
    }

    /// Network number of this address.
    #[inline]
    pub fn subnet(&self) -> u32 {
        u32::from(self.addr) & u32::from(self.netmask)
    }

    /// Returns true if `other` is on this address's subnet.
    #[inline]
    pub fn contains(&self, other: Ipv4Addr) -> bool {
        u32::from(other) & u32::from(self.netmask) == self.subnet()
    }

    /// Returns true if `dst` is the directed broadcast or the all-zeros host
    /// of this subnet (the historical network broadcast).
    pub fn is_broadcast_for(&self, dst: Ipv4Addr) -> bool {
        match self.broadcast {
            Some(bcast) => dst == bcast || u32::from(dst) == self.subnet(),
            None => false,
        }
    }
}

/// Netmask for a prefix length (clamped to 32).
#[inline]
pub fn prefix_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => u32::MAX << (32 - n),
    }
}

// ============================================================================
// Local Address / Membership Table
// ============================================================================

/// Local address and group membership lookups.
pub trait InterfaceTable: Send + Sync {
    /// Interface owning `addr`, if it is one of ours.
    fn is_local(&self, addr: Ipv4Addr) -> Option<InterfaceId>;

    /// Returns true if `ifid` has joined multicast `group`.
    fn is_member(&self, group: Ipv4Addr, ifid: InterfaceId) -> bool;

    /// Interface family of `ifid`.
    fn kind(&self, ifid: InterfaceId) -> InterfaceKind;

    /// Primary address of `ifid`.
    fn primary_address(&self, ifid: InterfaceId) -> Option<IfAddr>;

    /// Returns true if `dst` is a broadcast address configured on `ifid`.
    fn is_broadcast(&self, dst: Ipv4Addr, ifid: InterfaceId) -> bool;

    /// Local address of a directly attached network (or point-to-point peer)
    /// containing `addr`.
    fn on_link(&self, addr: Ipv4Addr) -> Option<IfAddr>;
}

// ============================================================================
// Egress
// ============================================================================

/// Errors from the transmit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxError {
    /// Next hop is unreachable (link down, neighbor resolution failed).
    #[error("next hop unreachable")]
    Unreachable,
    /// No usable route at transmit time.
    #[error("no route")]
    NoRoute,
    /// Datagram exceeds the egress MTU and may not be fragmented.
    #[error("fragmentation needed (mtu {mtu})")]
    NeedsFragmentation { mtu: u16 },
    /// Transmit queue or buffer exhausted.
    #[error("transmit resources exhausted")]
    ResourceExhausted,
}

/// Transmit side used for forwarded datagrams.
pub trait Egress: Send + Sync {
    /// Queue `pkt` towards `route`. Must not block.
    fn send(&self, pkt: PacketBuf, route: &RouteResult) -> Result<(), TxError>;
}

// ============================================================================
// Tests
// ============================================================================
