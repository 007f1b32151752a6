//! ICMP error signalling.
//!
//! The receive path decides *that* an ICMP error is owed and *which* one;
//! building and sending the message belongs to the [`ErrorReporter`]
//! collaborator. Reports are fire-and-forget.
//!
//! # References
//! - RFC 792: Internet Control Message Protocol
//! - RFC 1812 §4.3.2.6: Source Quench must not be originated by routers

use alloc::vec::Vec;

use crate::buffer::PacketBuf;
use crate::ipv4::Ipv4Header;

/// ICMP Destination Unreachable message type
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;

/// ICMP Source Quench message type
pub const ICMP_TYPE_SOURCE_QUENCH: u8 = 4;

/// ICMP Redirect message type
pub const ICMP_TYPE_REDIRECT: u8 = 5;

/// ICMP Time Exceeded message type
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;

/// ICMP Parameter Problem message type
pub const ICMP_TYPE_PARAMETER_PROBLEM: u8 = 12;

/// Destination unreachable: host unreachable
pub const ICMP_CODE_HOST_UNREACHABLE: u8 = 1;

/// Destination unreachable: fragmentation needed and DF set
pub const ICMP_CODE_FRAG_NEEDED: u8 = 4;

/// Destination unreachable: source route failed
pub const ICMP_CODE_SOURCE_ROUTE_FAILED: u8 = 5;

/// Redirect for host
pub const ICMP_CODE_REDIRECT_HOST: u8 = 1;

/// Time exceeded in transit
pub const ICMP_CODE_TTL_EXCEEDED: u8 = 0;

/// Parameter problem: pointer indicates the error
pub const ICMP_CODE_POINTER: u8 = 0;

/// Payload bytes beyond the IP header quoted in an ICMP error (RFC 792).
pub const ICMP_ERROR_PAYLOAD: usize = 8;

/// ICMP error kinds the receive path can request.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpKind {
    DestUnreachable = ICMP_TYPE_DEST_UNREACHABLE,
    SourceQuench = ICMP_TYPE_SOURCE_QUENCH,
    Redirect = ICMP_TYPE_REDIRECT,
    TimeExceeded = ICMP_TYPE_TIME_EXCEEDED,
    ParameterProblem = ICMP_TYPE_PARAMETER_PROBLEM,
}

impl IcmpKind {
    /// Wire type number.
    #[inline]
    pub fn to_raw(self) -> u8 {
        self as u8
    }
}

/// Sink for ICMP error requests.
pub trait ErrorReporter: Send + Sync {
    /// Request an ICMP error.
    ///
    /// `extra` is the type-specific word: the gateway address for redirects,
    /// the next-hop MTU for fragmentation-needed, the byte pointer for
    /// parameter problems, zero otherwise. `original` is the quoted prefix
    /// of the offending datagram.
    fn report(&self, kind: IcmpKind, code: u8, extra: u32, original: &[u8]);
}

/// Copy the part of `pkt` an ICMP error quotes: the IP header plus
/// [`ICMP_ERROR_PAYLOAD`] bytes, bounded by the datagram length.
pub fn error_snapshot(pkt: &PacketBuf, hdr: &Ipv4Header) -> Vec<u8> {
    let want = hdr.header_len() + ICMP_ERROR_PAYLOAD;
    pkt.copy_prefix(want.min(hdr.total_len as usize))
}
