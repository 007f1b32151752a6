//! Internet checksum engine.
//!
//! The receive path never computes checksums directly; it goes through a
//! [`ChecksumEngine`] so that an integrator can plug in an accelerated
//! implementation. [`InternetChecksum`] is the portable default.
//!
//! All partial sums are 32-bit accumulators of 16-bit big-endian words and
//! are only meaningful after [`fold`]. A sum over a byte range that starts at
//! an odd distance from the start of another sum must be byte-swapped before
//! the two are combined (RFC 1071 §2(B)).
//!
//! # References
//! - RFC 1071: Computing the Internet Checksum
//! - RFC 1624: Computation of the Internet Checksum via Incremental Update

use crate::buffer::PacketBuf;

// ============================================================================
// Engine Trait
// ============================================================================

/// Checksum primitives consumed by the receive path.
pub trait ChecksumEngine: Send + Sync {
    /// Returns true if the one's-complement sum over `buf` is all ones,
    /// i.e. the embedded checksum field is correct.
    fn verify(&self, buf: &[u8]) -> bool;

    /// Adds `buf[start..start + len]` to `seed` and returns the unfolded sum.
    ///
    /// Out-of-range requests are clamped to the buffer.
    fn compute_partial(&self, buf: &[u8], start: usize, len: usize, seed: u32) -> u32;
}

/// Portable RFC 1071 implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct InternetChecksum;

impl ChecksumEngine for InternetChecksum {
    fn verify(&self, buf: &[u8]) -> bool {
        fold(sum_bytes(buf, 0)) == 0xffff
    }

    fn compute_partial(&self, buf: &[u8], start: usize, len: usize, seed: u32) -> u32 {
        let start = start.min(buf.len());
        let end = start.saturating_add(len).min(buf.len());
        sum_bytes(&buf[start..end], seed)
    }
}

// ============================================================================
// Arithmetic Helpers
// ============================================================================

/// Accumulate `data` as big-endian 16-bit words onto `acc`.
///
/// An odd trailing byte is padded with zero on the right.
pub fn sum_bytes(data: &[u8], acc: u32) -> u32 {
    let mut sum = acc as u64;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    // Fold the carries back so the accumulator never overflows 32 bits.
    while sum >> 32 != 0 {
        sum = (sum & 0xffff_ffff) + (sum >> 32);
    }
    sum as u32
}

/// Fold a 32-bit accumulator into a 16-bit one's-complement sum.
#[inline]
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// One's-complement addition of two folded sums.
#[inline]
pub fn add(a: u16, b: u16) -> u16 {
    fold(a as u32 + b as u32)
}

/// One's-complement subtraction: the sum that, added to `b`, yields `a`.
#[inline]
pub fn sub(a: u16, b: u16) -> u16 {
    add(a, !b)
}

/// Compute the header checksum value to store in a header whose checksum
/// field is zero.
pub fn compute_checksum(data: &[u8], len: usize) -> u16 {
    let capped = core::cmp::min(data.len(), len);
    !fold(sum_bytes(&data[..capped], 0))
}

/// RFC 1624 incremental update of a stored checksum when one 16-bit word of
/// the covered data changes from `old` to `new`.
#[inline]
pub fn update_word(checksum: u16, old: u16, new: u16) -> u16 {
    // HC' = ~(~HC + ~m + m')
    !add(add(!checksum, !old), new)
}

/// Folded sum of `pkt[start..start + len]` through `engine`, walking the
/// segment chain. Word alignment is relative to `start`.
///
/// Returns `None` if the range extends past the end of the packet.
pub fn packet_range_sum(
    engine: &dyn ChecksumEngine,
    pkt: &PacketBuf,
    start: usize,
    len: usize,
) -> Option<u16> {
    let end = start.checked_add(len)?;
    if end > pkt.len() {
        return None;
    }

    let mut total: u16 = 0;
    let mut consumed = 0usize;
    let mut seg_base = 0usize;
    for seg in pkt.segments() {
        let seg_end = seg_base + seg.len();
        let lo = start.max(seg_base);
        let hi = end.min(seg_end);
        if lo < hi {
            let part = fold(engine.compute_partial(seg, lo - seg_base, hi - lo, 0));
            let part = if consumed % 2 == 1 {
                part.swap_bytes()
            } else {
                part
            };
            total = add(total, part);
            consumed += hi - lo;
        }
        if seg_end >= end {
            break;
        }
        seg_base = seg_end;
    }
    Some(total)
}

// ============================================================================
// Tests
// ============================================================================
