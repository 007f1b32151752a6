//! Received packet buffer.
//!
//! A [`PacketBuf`] is an owned chain of byte segments plus the receive-side
//! metadata the IPv4 layer needs. Drivers usually hand in a single segment;
//! reassembly produces multi-segment packets by chaining fragment payloads
//! instead of copying them.
//!
//! # Memory Layout
//!
//! ```text
//! segs[0]               segs[1]          segs[n]
//! +--------+---------+  +-------------+  +-----------+
//! | IP hdr | payload |->|   payload   |->|  payload  |
//! +--------+---------+  +-------------+  +-----------+
//! ^ pullup(hlen) guarantees the header is here
//! ```
//!
//! Ownership moves with the buffer: the pipeline stage holding a `PacketBuf`
//! is its only owner.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::checksum::{self, ChecksumEngine};
use crate::device::InterfaceId;
use crate::options::SavedRoute;

// ============================================================================
// Packet Metadata
// ============================================================================

bitflags! {
    /// Per-packet receive flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u16 {
        /// Link-layer broadcast, or IP destination matched a broadcast address.
        const BROADCAST = 1 << 0;
        /// Link-layer multicast.
        const MULTICAST = 1 << 1;
        /// Looped back from the local transmit path.
        const LOOPBACK = 1 << 2;
        /// Already forwarded by this host.
        const FORWARDED = 1 << 3;
        /// Woke the host from sleep.
        const WAKE_PKT = 1 << 4;
        /// Produced by reassembly.
        const REASSEMBLED = 1 << 5;
        /// Device verified the IPv4 header checksum.
        const HEADER_CSUM_VALID = 1 << 6;
    }
}

/// Receive checksum offload state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RxChecksum {
    /// No device-provided sum; the protocol layer verifies in software.
    #[default]
    None,
    /// Folded one's-complement sum of bytes `[start, len)` of the packet,
    /// with word alignment relative to `start`.
    Partial { start: usize, sum: u16 },
}

// ============================================================================
// PacketBuf
// ============================================================================

/// An owned, possibly multi-segment packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBuf {
    /// Non-empty segments in wire order.
    segs: Vec<Vec<u8>>,
    /// Total bytes across all segments.
    len: usize,
    /// Receiving interface.
    pub rcvif: InterfaceId,
    /// Receive flags.
    pub flags: PacketFlags,
    /// Offload checksum state.
    pub csum: RxChecksum,
    /// Return route recorded when a source route ended at this host.
    pub srcroute: Option<SavedRoute>,
}

impl PacketBuf {
    /// Wrap a single contiguous buffer.
    pub fn from_vec(data: Vec<u8>, rcvif: InterfaceId) -> Self {
        Self::from_segments(alloc::vec![data], rcvif)
    }

    /// Wrap a segment chain. Empty segments are discarded.
    pub fn from_segments(segs: Vec<Vec<u8>>, rcvif: InterfaceId) -> Self {
        let segs: Vec<Vec<u8>> = segs.into_iter().filter(|s| !s.is_empty()).collect();
        let len = segs.iter().map(Vec::len).sum();
        PacketBuf {
            segs,
            len,
            rcvif,
            flags: PacketFlags::empty(),
            csum: RxChecksum::None,
            srcroute: None,
        }
    }

    /// Total packet length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the packet holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of segments in the chain.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    /// Iterate over segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(Vec::as_slice)
    }

    /// Make the first `n` bytes contiguous in the first segment.
    ///
    /// Returns false (leaving the packet unchanged) if it is shorter than `n`.
    pub fn pullup(&mut self, n: usize) -> bool {
        if n > self.len {
            return false;
        }
        if self.segs.first().map_or(0, Vec::len) >= n {
            return true;
        }
        let mut merged = Vec::with_capacity(n);
        let mut take = 0;
        while merged.len() < n && take < self.segs.len() {
            merged.extend_from_slice(&self.segs[take]);
            take += 1;
        }
        let rest = self.segs.split_off(take);
        self.segs.clear();
        self.segs.push(merged);
        self.segs.extend(rest);
        true
    }

    /// Contiguous bytes at the front of the packet.
    #[inline]
    pub fn head(&self) -> &[u8] {
        self.segs.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mutable contiguous bytes at the front of the packet.
    #[inline]
    pub fn head_mut(&mut self) -> &mut [u8] {
        self.segs.first_mut().map(Vec::as_mut_slice).unwrap_or(&mut [])
    }

    /// Copy `out.len()` bytes starting at `offset`, crossing segments.
    ///
    /// Returns false if the range is out of bounds.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> bool {
        let Some(end) = offset.checked_add(out.len()) else {
            return false;
        };
        if end > self.len {
            return false;
        }
        let mut seg_base = 0;
        let mut written = 0;
        for seg in &self.segs {
            let seg_end = seg_base + seg.len();
            let lo = offset.max(seg_base);
            let hi = end.min(seg_end);
            if lo < hi {
                out[written..written + (hi - lo)]
                    .copy_from_slice(&seg[lo - seg_base..hi - seg_base]);
                written += hi - lo;
            }
            if seg_end >= end {
                break;
            }
            seg_base = seg_end;
        }
        true
    }

    /// Read a big-endian u16 at `offset`.
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let mut b = [0u8; 2];
        self.read_at(offset, &mut b).then(|| u16::from_be_bytes(b))
    }

    /// Copy out up to the first `n` bytes.
    pub fn copy_prefix(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.len);
        let mut out = alloc::vec![0u8; n];
        self.read_at(0, &mut out);
        out
    }

    /// Flatten the whole chain into one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.copy_prefix(self.len)
    }

    /// Remove `n` bytes from the front (clamped to the packet length).
    ///
    /// A `Partial` checksum whose start lies inside the removed region is
    /// dropped; use [`PacketBuf::strip_front`] to keep it.
    pub fn trim_front(&mut self, n: usize) {
        let n = n.min(self.len);
        let mut remaining = n;
        self.len -= n;
        while remaining > 0 {
            let Some(first) = self.segs.first_mut() else {
                break;
            };
            if first.len() <= remaining {
                remaining -= first.len();
                self.segs.remove(0);
            } else {
                first.drain(..remaining);
                remaining = 0;
            }
        }
        if let RxChecksum::Partial { start, sum } = self.csum {
            self.csum = if start >= n {
                RxChecksum::Partial {
                    start: start - n,
                    sum,
                }
            } else {
                RxChecksum::None
            };
        }
    }

    /// Remove `n` leading bytes and rebase a `Partial` checksum so that it
    /// covers exactly the remaining bytes.
    pub fn strip_front(&mut self, engine: &dyn ChecksumEngine, n: usize) {
        let n = n.min(self.len);
        if let RxChecksum::Partial { start, sum } = self.csum {
            if start < n {
                // Subtract the covered bytes that are about to go away.
                self.csum = match checksum::packet_range_sum(engine, self, start, n - start) {
                    Some(head) => {
                        let rest = checksum::sub(sum, head);
                        let rest = if (n - start) % 2 == 1 {
                            rest.swap_bytes()
                        } else {
                            rest
                        };
                        RxChecksum::Partial { start: n, sum: rest }
                    }
                    None => RxChecksum::None,
                };
            }
        }
        self.trim_front(n);
    }

    /// Shrink the packet to `new_len` bytes, adjusting a `Partial` checksum
    /// for the trailing bytes removed.
    pub fn truncate(&mut self, engine: &dyn ChecksumEngine, new_len: usize) {
        if new_len >= self.len {
            return;
        }
        if let RxChecksum::Partial { start, sum } = self.csum {
            self.csum = if start <= new_len {
                match checksum::packet_range_sum(engine, self, new_len, self.len - new_len) {
                    Some(tail) => {
                        let tail = if (new_len - start) % 2 == 1 {
                            tail.swap_bytes()
                        } else {
                            tail
                        };
                        RxChecksum::Partial {
                            start,
                            sum: checksum::sub(sum, tail),
                        }
                    }
                    None => RxChecksum::None,
                }
            } else {
                RxChecksum::None
            };
        }

        let mut keep = new_len;
        let mut cut = self.segs.len();
        for (i, seg) in self.segs.iter_mut().enumerate() {
            if keep <= seg.len() {
                seg.truncate(keep);
                cut = if keep == 0 { i } else { i + 1 };
                break;
            }
            keep -= seg.len();
        }
        self.segs.truncate(cut);
        self.len = new_len;
    }

    /// Chain `other`'s segments after this packet's. Metadata of `other` is
    /// discarded.
    pub fn append(&mut self, other: PacketBuf) {
        self.len += other.len;
        self.segs.extend(other.segs);
    }

    /// Prepend a contiguous segment (typically a rebuilt header).
    pub fn prepend(&mut self, seg: Vec<u8>) {
        if seg.is_empty() {
            return;
        }
        self.len += seg.len();
        self.segs.insert(0, seg);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{fold, sum_bytes, InternetChecksum};
    use alloc::vec;

    fn chain() -> PacketBuf {
        PacketBuf::from_segments(
            vec![vec![1, 2, 3], vec![], vec![4, 5, 6, 7], vec![8, 9]],
            InterfaceId(3),
        )
    }

    #[test]
    fn test_from_segments_drops_empty() {
        let pkt = chain();
        assert_eq!(pkt.len(), 9);
        assert_eq!(pkt.segment_count(), 3);
        assert_eq!(pkt.to_vec(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_pullup_merges_leading_segments() {
        let mut pkt = chain();
        assert!(pkt.pullup(5));
        assert_eq!(pkt.head(), &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(pkt.segment_count(), 2);
        assert_eq!(pkt.to_vec(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(!pkt.pullup(10));
        assert_eq!(pkt.segment_count(), 2);
    }

    #[test]
    fn test_trim_front_and_read() {
        let mut pkt = chain();
        pkt.trim_front(4);
        assert_eq!(pkt.to_vec(), vec![5, 6, 7, 8, 9]);
        assert_eq!(pkt.read_u16(3), Some(0x0809));
        assert_eq!(pkt.read_u16(4), None);
    }

    #[test]
    fn test_truncate_adjusts_partial_checksum() {
        let data: Vec<u8> = (10u8..40).collect();
        let mut pkt = PacketBuf::from_segments(
            vec![data[..11].to_vec(), data[11..].to_vec()],
            InterfaceId(1),
        );
        pkt.csum = RxChecksum::Partial {
            start: 3,
            sum: fold(sum_bytes(&data[3..], 0)),
        };
        pkt.truncate(&InternetChecksum, 18);
        assert_eq!(pkt.to_vec(), data[..18].to_vec());
        assert_eq!(
            pkt.csum,
            RxChecksum::Partial {
                start: 3,
                sum: fold(sum_bytes(&data[3..18], 0)),
            }
        );
    }

    #[test]
    fn test_strip_front_rebases_checksum() {
        let data: Vec<u8> = (1u8..=24).collect();
        let mut pkt = PacketBuf::from_vec(data.clone(), InterfaceId(1));
        pkt.csum = RxChecksum::Partial {
            start: 0,
            sum: fold(sum_bytes(&data, 0)),
        };
        pkt.strip_front(&InternetChecksum, 5);
        assert_eq!(pkt.to_vec(), data[5..].to_vec());
        assert_eq!(
            pkt.csum,
            RxChecksum::Partial {
                start: 0,
                sum: fold(sum_bytes(&data[5..], 0)),
            }
        );
    }

    #[test]
    fn test_append_chains_without_copy() {
        let mut a = PacketBuf::from_vec(vec![1, 2], InterfaceId(1));
        let b = PacketBuf::from_vec(vec![3], InterfaceId(2));
        a.append(b);
        a.prepend(vec![0]);
        assert_eq!(a.segment_count(), 3);
        assert_eq!(a.to_vec(), vec![0, 1, 2, 3]);
        assert_eq!(a.rcvif, InterfaceId(1));
    }
}
