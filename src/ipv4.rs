//! IPv4 header view and receive validation.
//!
//! [`validate`] is the first stage of the receive path. It runs the header
//! checks in a fixed order, each with its own [`Malformed`] reason, and
//! returns a host-order [`Ipv4Header`] only once every length field has been
//! proven consistent with the buffer.
//!
//! # Security Features
//! - Header length is checked against the captured buffer before any access
//! - Checksum verification (skipped only when the device already did it)
//! - Loopback martians rejected off the loopback path
//! - Link-local TTL enforcement (RFC 3927 §2.5), policy-gated
//! - Captured padding beyond the total length is trimmed with checksum
//!   offload state kept consistent
//!
//! # References
//! - RFC 791: Internet Protocol
//! - RFC 1812 §5.3.7: Martian address filtering
//! - RFC 3168: ECN field

use core::net::Ipv4Addr;

use thiserror::Error;

use crate::buffer::{PacketBuf, PacketFlags};
use crate::checksum::{self, ChecksumEngine};

/// Minimum IPv4 header length in bytes (IHL == 5)
pub const IPV4_HEADER_MIN_LEN: usize = 20;

/// Maximum IPv4 header length in bytes (IHL == 15)
pub const IPV4_HEADER_MAX_LEN: usize = 60;

/// Maximum datagram size
pub const IP_MAXPACKET: usize = 65535;

/// Don't Fragment flag
pub const IP_DF: u16 = 0x4000;

/// More Fragments flag
pub const IP_MF: u16 = 0x2000;

/// Fragment offset mask (8-byte units)
pub const IP_OFFMASK: u16 = 0x1fff;

/// TTL required on link-local traffic, and the maximum TTL
pub const MAXTTL: u8 = 255;

/// TTL decrement applied when forwarding
pub const IPTTLDEC: u8 = 1;

/// ECN field mask in the TOS byte
pub const IPTOS_ECN_MASK: u8 = 0x03;
/// Not ECN-capable transport
pub const IPTOS_ECN_NOTECT: u8 = 0x00;
/// ECN-capable transport (1)
pub const IPTOS_ECN_ECT1: u8 = 0x01;
/// ECN-capable transport (0)
pub const IPTOS_ECN_ECT0: u8 = 0x02;
/// Congestion experienced
pub const IPTOS_ECN_CE: u8 = 0x03;

// Field offsets within the header.
const OFF_TOTAL_LEN: usize = 2;
const OFF_FRAG: usize = 6;
const OFF_TTL: usize = 8;
const OFF_CHECKSUM: usize = 10;
const OFF_DST: usize = 16;

// ============================================================================
// IPv4 Protocol Numbers
// ============================================================================

/// IPv4 protocol numbers the receive path inspects
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Proto {
    /// ICMP (Internet Control Message Protocol)
    Icmp = 1,
    /// TCP (Transmission Control Protocol)
    Tcp = 6,
    /// UDP (User Datagram Protocol)
    Udp = 17,
}

impl Ipv4Proto {
    /// Try to convert from raw protocol number
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            1 => Some(Ipv4Proto::Icmp),
            6 => Some(Ipv4Proto::Tcp),
            17 => Some(Ipv4Proto::Udp),
            _ => None,
        }
    }
}

// ============================================================================
// IPv4 Header
// ============================================================================

/// Host-order copy of the fixed IPv4 header fields.
///
/// Only produced by [`Ipv4Header::parse`] or [`validate`], so `header_len()`
/// bytes are always present at the front of the packet it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// IP version (always 4)
    pub version: u8,
    /// Internet Header Length (in 32-bit words, minimum 5)
    pub ihl: u8,
    /// Type of Service / DSCP + ECN
    pub tos: u8,
    /// Total length of the datagram (header + payload)
    pub total_len: u16,
    /// Identification for fragmentation
    pub identification: u16,
    /// Flags (3 bits) + Fragment offset (13 bits)
    pub flags_fragment: u16,
    /// Time to Live
    pub ttl: u8,
    /// Protocol number
    pub protocol: u8,
    /// Header checksum as received
    pub checksum: u16,
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Read the fixed header from `buf`, checking version and header length
    /// against the slice. Lengths beyond the header are not checked.
    pub fn parse(buf: &[u8]) -> Result<Self, Malformed> {
        if buf.len() < IPV4_HEADER_MIN_LEN {
            return Err(Malformed::TooShort);
        }
        let version = buf[0] >> 4;
        if version != 4 {
            return Err(Malformed::BadVersion);
        }
        let ihl = buf[0] & 0x0f;
        let hlen = ihl as usize * 4;
        if hlen < IPV4_HEADER_MIN_LEN {
            return Err(Malformed::BadHeaderLen);
        }
        if hlen > buf.len() {
            return Err(Malformed::HeaderExceedsBuffer);
        }

        Ok(Ipv4Header {
            version,
            ihl,
            tos: buf[1],
            total_len: u16::from_be_bytes([buf[2], buf[3]]),
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            flags_fragment: u16::from_be_bytes([buf[6], buf[7]]),
            ttl: buf[8],
            protocol: buf[9],
            checksum: u16::from_be_bytes([buf[10], buf[11]]),
            src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
        })
    }

    /// Get the header length in bytes
    #[inline]
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// Get the payload length in bytes
    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len())
    }

    /// Length of the options region in bytes
    #[inline]
    pub fn options_len(&self) -> usize {
        self.header_len() - IPV4_HEADER_MIN_LEN
    }

    /// Check if this packet has the "Don't Fragment" flag set
    #[inline]
    pub fn dont_fragment(&self) -> bool {
        self.flags_fragment & IP_DF != 0
    }

    /// Check if this packet has the "More Fragments" flag set
    #[inline]
    pub fn more_fragments(&self) -> bool {
        self.flags_fragment & IP_MF != 0
    }

    /// Get the fragment offset (in 8-byte units)
    #[inline]
    pub fn fragment_offset(&self) -> u16 {
        self.flags_fragment & IP_OFFMASK
    }

    /// Fragment offset in bytes
    #[inline]
    pub fn fragment_byte_offset(&self) -> usize {
        self.fragment_offset() as usize * 8
    }

    /// Check if this is a fragment
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    /// ECN codepoint
    #[inline]
    pub fn ecn(&self) -> u8 {
        self.tos & IPTOS_ECN_MASK
    }

    /// Get the protocol as enum if known
    #[inline]
    pub fn proto(&self) -> Option<Ipv4Proto> {
        Ipv4Proto::from_raw(self.protocol)
    }
}

// ============================================================================
// Validation Errors
// ============================================================================

/// Reasons a datagram is rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Malformed {
    /// Buffer shorter than a minimal header
    #[error("packet shorter than minimal header")]
    TooShort,
    /// IP version is not 4
    #[error("bad IP version")]
    BadVersion,
    /// Internet Header Length is less than 5
    #[error("header length below minimum")]
    BadHeaderLen,
    /// Declared header length exceeds the captured buffer
    #[error("header length exceeds buffer")]
    HeaderExceedsBuffer,
    /// Header checksum is incorrect
    #[error("header checksum mismatch")]
    BadChecksum,
    /// Loopback address seen off the loopback path
    #[error("martian loopback address")]
    Martian,
    /// Link-local traffic with TTL other than 255
    #[error("link-local datagram with bad TTL")]
    LinkLocalTtl,
    /// Total length smaller than header length
    #[error("total length smaller than header")]
    BadTotalLen,
    /// Captured buffer shorter than declared total length
    #[error("captured length shorter than total length")]
    Truncated,
    /// Non-final fragment whose payload is empty or not a multiple of 8
    #[error("bad fragment length")]
    BadFragmentLength,
    /// Option encoding error at `pointer` bytes from the start of the header
    #[error("bad option at byte {pointer}")]
    BadOption { pointer: u8 },
}

// ============================================================================
// Validation
// ============================================================================

/// Per-packet context for [`validate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Packet came from the loopback interface or the local output path.
    pub from_loopback: bool,
    /// Accept link-local traffic whose TTL is not 255.
    pub allow_linklocal_bad_ttl: bool,
}

/// Returns true if `src` or `dst` is link-local (169.254/16).
#[inline]
pub fn is_linklocal_pair(src: Ipv4Addr, dst: Ipv4Addr) -> bool {
    src.is_link_local() || dst.is_link_local()
}

/// Validate a received datagram.
///
/// Checks, in order: minimal length, version, header length, header within
/// the buffer (pulling it into the first segment), checksum, loopback
/// martians, link-local TTL, total length against header length, captured
/// length against total length. Trailing bytes beyond the total length are
/// trimmed.
pub fn validate(
    pkt: &mut PacketBuf,
    engine: &dyn ChecksumEngine,
    opts: ValidateOptions,
) -> Result<Ipv4Header, Malformed> {
    if !pkt.pullup(IPV4_HEADER_MIN_LEN) {
        return Err(Malformed::TooShort);
    }
    let head = pkt.head();
    if head[0] >> 4 != 4 {
        return Err(Malformed::BadVersion);
    }
    let hlen = (head[0] & 0x0f) as usize * 4;
    if hlen < IPV4_HEADER_MIN_LEN {
        return Err(Malformed::BadHeaderLen);
    }
    if !pkt.pullup(hlen) {
        return Err(Malformed::HeaderExceedsBuffer);
    }

    let head = pkt.head();
    if !pkt.flags.contains(PacketFlags::HEADER_CSUM_VALID) && !engine.verify(&head[..hlen]) {
        return Err(Malformed::BadChecksum);
    }
    let hdr = Ipv4Header::parse(head)?;

    if (hdr.src.is_loopback() || hdr.dst.is_loopback()) && !opts.from_loopback {
        return Err(Malformed::Martian);
    }
    if is_linklocal_pair(hdr.src, hdr.dst) && hdr.ttl != MAXTTL && !opts.allow_linklocal_bad_ttl
    {
        return Err(Malformed::LinkLocalTtl);
    }

    let total = hdr.total_len as usize;
    if total < hlen {
        return Err(Malformed::BadTotalLen);
    }
    if pkt.len() < total {
        return Err(Malformed::Truncated);
    }
    if pkt.len() > total {
        pkt.truncate(engine, total);
    }

    Ok(hdr)
}

/// Returns true if `addr` may be used as a forwarding destination.
///
/// Multicast, class E, net 0 and loopback are never forwarded.
pub fn in_canforward(addr: Ipv4Addr) -> bool {
    let first = addr.octets()[0];
    !(addr.is_multicast() || first >= 240 || first == 0 || first == 127)
}

// ============================================================================
// In-Place Header Updates
// ============================================================================

/// Recompute and store the header checksum over `head[..hlen]`.
pub fn write_checksum(head: &mut [u8], hlen: usize) {
    let Some(hdr) = head.get_mut(..hlen) else {
        return;
    };
    hdr[OFF_CHECKSUM] = 0;
    hdr[OFF_CHECKSUM + 1] = 0;
    let csum = checksum::compute_checksum(hdr, hlen);
    hdr[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
}

/// Decrement the TTL by [`IPTTLDEC`], updating the checksum incrementally.
pub fn decrement_ttl(head: &mut [u8]) {
    if head.len() < IPV4_HEADER_MIN_LEN {
        return;
    }
    let old = u16::from_be_bytes([head[OFF_TTL], head[OFF_TTL + 1]]);
    head[OFF_TTL] = head[OFF_TTL].saturating_sub(IPTTLDEC);
    let new = u16::from_be_bytes([head[OFF_TTL], head[OFF_TTL + 1]]);
    let csum = u16::from_be_bytes([head[OFF_CHECKSUM], head[OFF_CHECKSUM + 1]]);
    let csum = checksum::update_word(csum, old, new);
    head[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
}

/// Overwrite the destination address. The checksum is left stale.
pub fn set_dst(head: &mut [u8], dst: Ipv4Addr) {
    if let Some(field) = head.get_mut(OFF_DST..OFF_DST + 4) {
        field.copy_from_slice(&dst.octets());
    }
}

/// Overwrite total length and flags/offset. The checksum is left stale.
pub fn set_length_and_fragment(head: &mut [u8], total_len: u16, flags_fragment: u16) {
    if head.len() < IPV4_HEADER_MIN_LEN {
        return;
    }
    head[OFF_TOTAL_LEN..OFF_TOTAL_LEN + 2].copy_from_slice(&total_len.to_be_bytes());
    head[OFF_FRAG..OFF_FRAG + 2].copy_from_slice(&flags_fragment.to_be_bytes());
}

/// Overwrite the ECN bits of the TOS byte. The checksum is left stale.
pub fn set_ecn(head: &mut [u8], ecn: u8) {
    if let Some(tos) = head.get_mut(1) {
        *tos = (*tos & !IPTOS_ECN_MASK) | (ecn & IPTOS_ECN_MASK);
    }
}

// ============================================================================
// Tests
// ============================================================================
