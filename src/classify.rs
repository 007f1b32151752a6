//! Destination classification.
//!
//! Decides whether a validated, complete datagram is for this host, must be
//! forwarded, or is dropped. The decision needs the local address table,
//! the receive interface and the configured end-system policy.

use log::trace;

use core::net::Ipv4Addr;

use crate::buffer::{PacketBuf, PacketFlags};
use crate::config::{EsPolicy, IpConfig};
use crate::device::{InterfaceKind, InterfaceTable};
use crate::ipv4::{Ipv4Header, Ipv4Proto, IPV4_HEADER_MIN_LEN};
use crate::stats::IpStats;

/// BOOTP/DHCP client port
pub const IPPORT_BOOTPC: u16 = 68;

/// Why a datagram was classified as a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyDrop {
    /// Destination owned by another interface under strict checking.
    InterfaceMismatch,
    /// Multicast group not joined on the receive interface.
    NotMember,
    /// Not for us and forwarding is disabled.
    NotForwarding,
}

/// Where a datagram goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Ours,
    Forward,
    Drop(ClassifyDrop),
}

/// Classify `pkt`.
///
/// `from_loopback` is true if the packet was received on a loopback
/// interface or produced by the local output path. Sets
/// [`PacketFlags::BROADCAST`] when the destination is a broadcast address.
pub fn classify(
    pkt: &mut PacketBuf,
    hdr: &Ipv4Header,
    ifaces: &dyn InterfaceTable,
    config: &IpConfig,
    from_loopback: bool,
    stats: &IpStats,
) -> Classification {
    let dst = hdr.dst;
    let rcvif = pkt.rcvif;

    if dst == Ipv4Addr::UNSPECIFIED || dst == Ipv4Addr::BROADCAST {
        if dst == Ipv4Addr::BROADCAST {
            pkt.flags |= PacketFlags::BROADCAST;
        }
        return Classification::Ours;
    }

    if let Some(owner) = ifaces.is_local(dst) {
        if owner == rcvif || from_loopback {
            return Classification::Ours;
        }
        let strict = match config.interface_check {
            EsPolicy::Strict => true,
            EsPolicy::Hybrid => ifaces.kind(owner) == InterfaceKind::Tunnel,
            EsPolicy::Weak => false,
        };
        if strict && !config.forwarding {
            trace!("ipv4: {} owned by {:?}, arrived on {:?}", dst, owner, rcvif);
            return Classification::Drop(ClassifyDrop::InterfaceMismatch);
        }
        stats.inc_weak_match();
        return Classification::Ours;
    }

    if ifaces.is_broadcast(dst, rcvif) {
        pkt.flags |= PacketFlags::BROADCAST;
        return Classification::Ours;
    }

    if dst.is_multicast() {
        if ifaces.is_member(dst, rcvif) {
            return Classification::Ours;
        }
        stats.inc_notmember();
        return Classification::Drop(ClassifyDrop::NotMember);
    }

    if is_bootp_client(pkt, hdr) {
        return Classification::Ours;
    }

    if config.forwarding {
        Classification::Forward
    } else {
        Classification::Drop(ClassifyDrop::NotForwarding)
    }
}

/// UDP without options to the BOOTP client port, accepted before the host
/// has an address.
fn is_bootp_client(pkt: &PacketBuf, hdr: &Ipv4Header) -> bool {
    hdr.proto() == Some(Ipv4Proto::Udp)
        && hdr.header_len() == IPV4_HEADER_MIN_LEN
        && pkt.read_u16(IPV4_HEADER_MIN_LEN + 2) == Some(IPPORT_BOOTPC)
}
