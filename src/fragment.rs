//! IPv4 fragment reassembly.
//!
//! Fragments are collected in per-datagram reassembly queues held in a fixed
//! hash table behind one lock. Each queue stores its fragments in a slab
//! arena with a separate offset-ordered index, so overlap trimming and
//! removal never chase links between fragments.
//!
//! # Security Features
//! - Overlapping data is trimmed so every byte comes from exactly one
//!   fragment (the earliest-offset fragment already queued wins)
//! - Per-datagram fragment ceiling, enforced whenever the datagram is still
//!   incomplete
//! - Global queue budget with eviction of the oldest queue under pressure
//! - Reassembled size bounded by the IPv4 maximum
//! - Queue lifetime counted in sweep ticks, not refreshed by new fragments
//! - CE / Not-ECT mixing rejected (RFC 3168 §5.3)
//!
//! # References
//! - RFC 791: Internet Protocol (fragmentation)
//! - RFC 815: IP Datagram Reassembly Algorithms
//! - RFC 3168 §5.3: Fragmentation and ECN

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace, warn};
use slab::Slab;
use spin::Mutex;
use thiserror::Error;

use crate::buffer::{PacketBuf, PacketFlags, RxChecksum};
use crate::checksum::{self, ChecksumEngine};
use crate::config::{IpConfig, QueueLimit};
use crate::device::InterfaceId;
use crate::ipv4::{
    self, Ipv4Header, IPTOS_ECN_CE, IPTOS_ECN_NOTECT, IP_DF, IP_MAXPACKET,
};
use crate::stats::IpStats;

// ============================================================================
// Constants
// ============================================================================

/// Number of hash buckets (power of two)
pub const IPREASS_NHASH: usize = 64;

const IPREASS_HMASK: usize = IPREASS_NHASH - 1;

// ============================================================================
// Drop Reasons
// ============================================================================

/// Reason a fragment (or its whole queue) was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FragmentDropReason {
    /// Non-final fragment with empty or non-8-byte-multiple payload
    #[error("bad fragment length")]
    BadLength,
    /// Reassembly disabled by configuration
    #[error("reassembly disabled")]
    Disabled,
    /// Fragment entirely covered by data already queued
    #[error("duplicate fragment")]
    Duplicate,
    /// CE and Not-ECT marks mixed within one datagram
    #[error("ECN codepoint mismatch")]
    EcnMismatch,
    /// Datagram exceeded the per-datagram fragment ceiling
    #[error("too many fragments")]
    TooManyFragments,
    /// Reassembled datagram would exceed the IPv4 maximum
    #[error("reassembled datagram too large")]
    TooLarge,
    /// Queue allocation failed
    #[error("out of memory")]
    NoMemory,
}

/// Result of offering a fragment to the table
#[derive(Debug)]
pub enum ReassemblyOutcome {
    /// The datagram is complete.
    Completed(PacketBuf),
    /// The fragment was queued.
    Pending,
    /// The fragment was dropped.
    Dropped(FragmentDropReason),
}

// ============================================================================
// Fragment Key
// ============================================================================

/// Identity of a datagram under reassembly (RFC 791).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
}

impl FragmentKey {
    /// Create key from IPv4 header
    pub fn from_header(hdr: &Ipv4Header) -> Self {
        FragmentKey {
            src: hdr.src,
            dst: hdr.dst,
            protocol: hdr.protocol,
            identification: hdr.identification,
        }
    }

    /// Hash bucket: low nibbles of the two low source octets mixed with the
    /// identification.
    #[inline]
    pub fn bucket(&self) -> usize {
        let s = u32::from(self.src);
        let x = (s & 0xf) | (((s >> 8) & 0xf) << 4);
        ((x ^ self.identification as u32) as usize) & IPREASS_HMASK
    }
}

// ============================================================================
// Limits
// ============================================================================

/// Tunables pushed into the table from [`IpConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    pub max_queues: QueueLimit,
    pub max_frags_per_datagram: usize,
    pub ttl_ticks: u8,
}

impl ReassemblyLimits {
    pub fn from_config(cfg: &IpConfig) -> Self {
        ReassemblyLimits {
            max_queues: cfg.max_reass_queues,
            max_frags_per_datagram: cfg.max_frags_per_datagram,
            ttl_ticks: cfg.frag_ttl_ticks.max(1),
        }
    }
}

// ============================================================================
// Reassembly Queue
// ============================================================================

/// One queued fragment.
#[derive(Debug)]
struct Fragment {
    /// IP payload bytes, header stripped.
    payload: PacketBuf,
    /// Byte offset in the datagram.
    off: usize,
    /// Payload length.
    len: usize,
    /// More Fragments flag.
    more: bool,
    /// Device checksum of the payload, `None` once invalidated.
    csum: Option<u16>,
    /// Header bytes, kept on a fragment that arrived at offset 0.
    header: Option<Vec<u8>>,
}

/// In-progress reassembly of one datagram.
#[derive(Debug)]
struct ReassemblyQueue {
    key: FragmentKey,
    /// Sweep ticks left.
    ttl: u8,
    /// Accumulated ECN codepoint.
    ecn: u8,
    frags: Slab<Fragment>,
    /// Slab keys ordered by offset.
    order: Vec<usize>,
}

impl ReassemblyQueue {
    /// Queue holding `first` as its only fragment.
    fn with_first(key: FragmentKey, ttl: u8, ecn: u8, first: Fragment) -> Self {
        let mut frags = Slab::new();
        let slot = frags.insert(first);
        ReassemblyQueue {
            key,
            ttl,
            ecn,
            frags,
            order: vec![slot],
        }
    }

    fn nfrags(&self) -> usize {
        self.frags.len()
    }

    /// Merge the incoming ECN codepoint. Returns false if the fragment must
    /// be dropped.
    fn merge_ecn(&mut self, ecn: u8) -> bool {
        if ecn == IPTOS_ECN_CE {
            if self.ecn == IPTOS_ECN_NOTECT {
                return false;
            }
            self.ecn = IPTOS_ECN_CE;
        }
        !(ecn == IPTOS_ECN_NOTECT && self.ecn != IPTOS_ECN_NOTECT)
    }

    /// Insert `frag` at its offset, trimming overlaps. Returns the number of
    /// queued fragments removed because the new one covers them, or
    /// `Err(Duplicate)` if the new fragment adds nothing.
    fn insert(&mut self, mut frag: Fragment) -> Result<usize, FragmentDropReason> {
        let idx = self
            .order
            .partition_point(|&k| self.frags[k].off <= frag.off);

        // The preceding fragment may already hold our leading bytes.
        if let Some(&pk) = idx.checked_sub(1).and_then(|i| self.order.get(i)) {
            let prev = &self.frags[pk];
            let prev_end = prev.off + prev.len;
            if prev_end > frag.off {
                let overlap = prev_end - frag.off;
                if overlap >= frag.len {
                    return Err(FragmentDropReason::Duplicate);
                }
                frag.payload.trim_front(overlap);
                frag.off += overlap;
                frag.len -= overlap;
                frag.csum = None;
                frag.header = None;
            }
        }

        // Trim or dequeue following fragments we now cover.
        let end = frag.off + frag.len;
        let mut removed = 0;
        while let Some(&nk) = self.order.get(idx) {
            let next = &mut self.frags[nk];
            if end <= next.off {
                break;
            }
            let overlap = end - next.off;
            if overlap < next.len {
                next.payload.trim_front(overlap);
                next.off += overlap;
                next.len -= overlap;
                next.csum = None;
                break;
            }
            self.order.remove(idx);
            self.frags.remove(nk);
            removed += 1;
        }

        let key = self.frags.insert(frag);
        self.order.insert(idx, key);
        Ok(removed)
    }

    /// Payload length if the queued fragments form one contiguous run from
    /// offset zero ending with a final fragment.
    fn complete_len(&self) -> Option<usize> {
        let mut next = 0;
        let mut more = true;
        for &k in &self.order {
            let f = &self.frags[k];
            if f.off != next {
                return None;
            }
            next += f.len;
            more = f.more;
        }
        (!self.order.is_empty() && !more).then_some(next)
    }

    /// Turn a complete queue into one datagram.
    fn reassemble(mut self, payload_len: usize) -> Option<PacketBuf> {
        let mut order = core::mem::take(&mut self.order).into_iter();
        let first = self.frags.remove(order.next()?);
        let mut header = first.header?;
        let hlen = header.len();
        let total = u16::try_from(hlen + payload_len).ok()?;

        let flags_fragment = u16::from_be_bytes([header[6], header[7]]) & IP_DF;
        ipv4::set_length_and_fragment(&mut header, total, flags_fragment);
        ipv4::set_ecn(&mut header, self.ecn);
        ipv4::write_checksum(&mut header, hlen);

        let rcvif: InterfaceId = first.payload.rcvif;
        let flags = first.payload.flags;
        let mut sum = first.csum;
        let mut pkt = first.payload;
        for k in order {
            let frag = self.frags.remove(k);
            sum = match (sum, frag.csum) {
                (Some(acc), Some(part)) => Some(checksum::add(acc, part)),
                _ => None,
            };
            pkt.append(frag.payload);
        }
        pkt.prepend(header);
        pkt.rcvif = rcvif;
        pkt.flags = (flags | PacketFlags::REASSEMBLED) - PacketFlags::HEADER_CSUM_VALID;
        pkt.csum = match sum {
            Some(sum) => RxChecksum::Partial { start: hlen, sum },
            None => RxChecksum::None,
        };
        Some(pkt)
    }
}

// ============================================================================
// Reassembly Table
// ============================================================================

struct TableInner {
    buckets: Vec<VecDeque<ReassemblyQueue>>,
    count: usize,
    limits: ReassemblyLimits,
}

impl TableInner {
    /// Unlink the queue at `pos` of `bucket`.
    fn unlink(&mut self, bucket: usize, pos: usize) -> Option<ReassemblyQueue> {
        let q = self.buckets.get_mut(bucket)?.remove(pos)?;
        self.count -= 1;
        Some(q)
    }

    /// Evict the oldest queue of `bucket`, or of the first non-empty bucket
    /// if that one is empty. Returns the number of fragments freed.
    fn evict_oldest(&mut self, bucket: usize) -> Option<usize> {
        let victim = if self.buckets[bucket].is_empty() {
            self.buckets.iter().position(|b| !b.is_empty())?
        } else {
            bucket
        };
        let q = self.buckets[victim].pop_back()?;
        self.count -= 1;
        Some(q.nfrags())
    }
}

/// Hash table of reassembly queues.
pub struct ReassemblyTable {
    inner: Mutex<TableInner>,
    /// Mirror of the queue count for lock-free reads.
    live: AtomicUsize,
    stats: Arc<IpStats>,
}

impl ReassemblyTable {
    pub fn new(limits: ReassemblyLimits, stats: Arc<IpStats>) -> Self {
        ReassemblyTable {
            inner: Mutex::new(TableInner {
                buckets: (0..IPREASS_NHASH).map(|_| VecDeque::new()).collect(),
                count: 0,
                limits,
            }),
            live: AtomicUsize::new(0),
            stats,
        }
    }

    /// Number of live reassembly queues.
    #[inline]
    pub fn live_queues(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Replace the limits. A lowered queue limit takes effect on the next
    /// sweep; the TTL applies to queues created afterwards.
    pub fn set_limits(&self, limits: ReassemblyLimits) {
        self.inner.lock().limits = limits;
    }

    /// Offer a validated fragment. `pkt` holds the header followed by
    /// exactly `hdr.payload_len()` payload bytes.
    pub fn insert(
        &self,
        mut pkt: PacketBuf,
        hdr: &Ipv4Header,
        engine: &dyn ChecksumEngine,
    ) -> ReassemblyOutcome {
        self.stats.inc_fragments();

        let len = hdr.payload_len();
        let more = hdr.more_fragments();
        if more && (len == 0 || len % 8 != 0) {
            return ReassemblyOutcome::Dropped(FragmentDropReason::BadLength);
        }

        // Per-fragment work that needs no table state.
        let hlen = hdr.header_len();
        let off = hdr.fragment_byte_offset();
        let header = (off == 0).then(|| pkt.copy_prefix(hlen));
        pkt.strip_front(engine, hlen);
        let csum = match pkt.csum {
            RxChecksum::Partial { start: 0, sum } => Some(sum),
            _ => None,
        };
        pkt.csum = RxChecksum::None;
        let frag = Fragment {
            payload: pkt,
            off,
            len,
            more,
            csum,
            header,
        };

        let key = FragmentKey::from_header(hdr);
        let bucket = key.bucket();

        let (outcome, done) = {
            let mut inner = self.inner.lock();
            let limits = inner.limits;
            if limits.max_queues == QueueLimit::Limit(0) {
                self.stats.inc_fragdropped();
                return ReassemblyOutcome::Dropped(FragmentDropReason::Disabled);
            }

            let pos = match inner.buckets[bucket].iter().position(|q| q.key == key) {
                Some(pos) => {
                    let q = &mut inner.buckets[bucket][pos];
                    if !q.merge_ecn(hdr.ecn()) {
                        self.stats.inc_fragdropped();
                        return ReassemblyOutcome::Dropped(FragmentDropReason::EcnMismatch);
                    }
                    match q.insert(frag) {
                        Ok(removed) => self.stats.add_fragdropped(removed as u64),
                        Err(reason) => {
                            self.stats.inc_fragdropped();
                            return ReassemblyOutcome::Dropped(reason);
                        }
                    }
                    pos
                }
                None => {
                    if limits.max_queues.is_full(inner.count) {
                        if let Some(freed) = inner.evict_oldest(bucket) {
                            warn!("ipv4: reassembly queue limit reached, evicting oldest queue");
                            self.stats.add_fragtimeout(freed as u64);
                        }
                    }
                    if inner.buckets[bucket].try_reserve(1).is_err() {
                        self.live.store(inner.count, Ordering::Relaxed);
                        self.stats.inc_fragdropped();
                        return ReassemblyOutcome::Dropped(FragmentDropReason::NoMemory);
                    }
                    let q = ReassemblyQueue::with_first(key, limits.ttl_ticks, hdr.ecn(), frag);
                    inner.buckets[bucket].push_front(q);
                    inner.count += 1;
                    trace!(
                        "ipv4: new reassembly queue {} -> {} id {:#06x}",
                        key.src,
                        key.dst,
                        key.identification
                    );
                    0
                }
            };

            let q = &inner.buckets[bucket][pos];
            let result = match q.complete_len() {
                None if q.nfrags() > limits.max_frags_per_datagram => {
                    let n = q.nfrags();
                    inner.unlink(bucket, pos);
                    self.stats.add_fragdropped(n as u64);
                    debug!("ipv4: fragment ceiling exceeded, dropped {} fragments", n);
                    (ReassemblyOutcome::Dropped(FragmentDropReason::TooManyFragments), None)
                }
                None => (ReassemblyOutcome::Pending, None),
                Some(payload_len) => {
                    let hlen = q
                        .order
                        .first()
                        .and_then(|&k| q.frags[k].header.as_ref())
                        .map_or(0, Vec::len);
                    let n = q.nfrags();
                    match inner.unlink(bucket, pos) {
                        Some(q) if hlen + payload_len <= IP_MAXPACKET => {
                            (ReassemblyOutcome::Pending, Some((q, payload_len)))
                        }
                        _ => {
                            self.stats.add_fragdropped(n as u64);
                            (ReassemblyOutcome::Dropped(FragmentDropReason::TooLarge), None)
                        }
                    }
                }
            };
            self.live.store(inner.count, Ordering::Relaxed);
            result
        };

        // Build the datagram outside the lock; the queue is already unlinked.
        match done {
            Some((q, payload_len)) => {
                let n = q.nfrags();
                match q.reassemble(payload_len) {
                    Some(pkt) => {
                        self.stats.inc_reassembled();
                        ReassemblyOutcome::Completed(pkt)
                    }
                    None => {
                        self.stats.add_fragdropped(n as u64);
                        ReassemblyOutcome::Dropped(FragmentDropReason::TooLarge)
                    }
                }
            }
            None => outcome,
        }
    }

    /// Age every queue by one tick, destroying those that expire. While the
    /// live count still exceeds a lowered limit, drop the oldest queue of
    /// each bucket in turn, starting from bucket 0.
    ///
    /// Returns the number of queues still live.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut expired = 0usize;
        let mut timed_out_frags = 0usize;

        for bucket in inner.buckets.iter_mut() {
            bucket.retain_mut(|q| {
                q.ttl = q.ttl.saturating_sub(1);
                if q.ttl == 0 {
                    expired += 1;
                    timed_out_frags += q.nfrags();
                    false
                } else {
                    true
                }
            });
        }
        inner.count -= expired;
        self.stats.add_fragtimeout(timed_out_frags as u64);

        let limit = inner.limits.max_queues;
        let mut bucket = 0;
        while limit.is_exceeded(inner.count) && bucket < IPREASS_NHASH {
            match inner.buckets[bucket].pop_back() {
                Some(q) => {
                    inner.count -= 1;
                    self.stats.add_fragdropped(q.nfrags() as u64);
                }
                None => bucket += 1,
            }
        }

        if expired > 0 {
            debug!(
                "ipv4: reassembly sweep at {} ms expired {} queues ({} fragments)",
                now_ms, expired, timed_out_frags
            );
        }
        self.live.store(inner.count, Ordering::Relaxed);
        inner.count
    }

    /// Destroy every queue.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        for bucket in inner.buckets.iter_mut() {
            freed += bucket.drain(..).map(|q| q.nfrags()).sum::<usize>();
        }
        inner.count = 0;
        self.live.store(0, Ordering::Relaxed);
        self.stats.add_fragdropped(freed as u64);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{fold, sum_bytes, InternetChecksum};
    use crate::ipv4::{IPTOS_ECN_ECT0, IP_MF};
    use crate::testutil::PacketBuilder;
    use alloc::vec;
    use proptest::prelude::*;

    const SRC: [u8; 4] = [10, 0, 0, 1];
    const DST: [u8; 4] = [10, 0, 0, 2];

    fn table(max_frags: usize) -> (ReassemblyTable, Arc<IpStats>) {
        let stats = Arc::new(IpStats::new());
        let limits = ReassemblyLimits {
            max_queues: QueueLimit::Limit(16),
            max_frags_per_datagram: max_frags,
            ttl_ticks: 3,
        };
        (ReassemblyTable::new(limits, stats.clone()), stats)
    }

    /// Fragment of `datagram` payload bytes `[off, off + len)`.
    fn frag_of(
        datagram: &[u8],
        id: u16,
        off: usize,
        len: usize,
        mf: bool,
    ) -> (PacketBuf, Ipv4Header) {
        let ff = (off / 8) as u16 | if mf { IP_MF } else { 0 };
        let bytes = PacketBuilder::udp(SRC, DST, &datagram[off..off + len])
            .id(id)
            .flags_fragment(ff)
            .build();
        let hdr = Ipv4Header::parse(&bytes).unwrap();
        (PacketBuf::from_vec(bytes, InterfaceId(1)), hdr)
    }

    fn offer(
        t: &ReassemblyTable,
        datagram: &[u8],
        id: u16,
        off: usize,
        len: usize,
        mf: bool,
    ) -> ReassemblyOutcome {
        let (pkt, hdr) = frag_of(datagram, id, off, len, mf);
        t.insert(pkt, &hdr, &InternetChecksum)
    }

    fn payload_of(pkt: &PacketBuf) -> Vec<u8> {
        let bytes = pkt.to_vec();
        let hdr = Ipv4Header::parse(&bytes).unwrap();
        bytes[hdr.header_len()..].to_vec()
    }

    #[test]
    fn test_fragment_key() {
        let bytes = PacketBuilder::udp(SRC, DST, &[]).id(0x1234).build();
        let hdr = Ipv4Header::parse(&bytes).unwrap();
        let key = FragmentKey::from_header(&hdr);
        assert_eq!(key.src, Ipv4Addr::from(SRC));
        assert_eq!(key.identification, 0x1234);
        assert!(key.bucket() < IPREASS_NHASH);
    }

    #[test]
    fn test_simple_reassembly_out_of_order() {
        let (t, stats) = table(16);
        let data: Vec<u8> = (0u8..28).collect();

        // B (offset 20, final) then A (offset 0, 20 bytes).
        assert!(matches!(offer(&t, &data, 7, 16, 12, false), ReassemblyOutcome::Pending));
        assert_eq!(t.live_queues(), 1);
        let out = offer(&t, &data, 7, 0, 16, true);
        let ReassemblyOutcome::Completed(pkt) = out else {
            panic!("expected completion, got {:?}", out);
        };
        assert_eq!(payload_of(&pkt), data);
        assert!(pkt.flags.contains(PacketFlags::REASSEMBLED));
        assert_eq!(t.live_queues(), 0);

        let bytes = pkt.to_vec();
        let hdr = Ipv4Header::parse(&bytes).unwrap();
        assert_eq!(hdr.total_len as usize, 20 + 28);
        assert!(!hdr.is_fragment());
        assert!(InternetChecksum.verify(&bytes[..20]));
        assert_eq!(stats.snapshot().reassembled, 1);
        assert_eq!(stats.snapshot().fragments, 2);
    }

    #[test]
    fn test_non_final_fragment_length_must_be_multiple_of_eight() {
        let (t, _) = table(16);
        let data: Vec<u8> = (100u8..128).collect();
        // A 20-byte non-final piece of a 28-byte payload is refused; the
        // wire-legal split of the same payload is 24 + 4.
        assert!(matches!(
            offer(&t, &data, 9, 0, 20, true),
            ReassemblyOutcome::Dropped(FragmentDropReason::BadLength)
        ));
        assert!(matches!(
            offer(&t, &data, 9, 0, 0, true),
            ReassemblyOutcome::Dropped(FragmentDropReason::BadLength)
        ));
        assert!(matches!(offer(&t, &data, 9, 24, 4, false), ReassemblyOutcome::Pending));
        let ReassemblyOutcome::Completed(pkt) = offer(&t, &data, 9, 0, 24, true) else {
            panic!("expected completion");
        };
        assert_eq!(payload_of(&pkt), data);
    }

    #[test]
    fn test_duplicate_and_overlap_trim() {
        let (t, stats) = table(16);
        let data: Vec<u8> = (0u8..48).collect();
        assert!(matches!(offer(&t, &data, 1, 0, 16, true), ReassemblyOutcome::Pending));
        assert!(matches!(
            offer(&t, &data, 1, 8, 8, true),
            ReassemblyOutcome::Dropped(FragmentDropReason::Duplicate)
        ));
        // Overlaps [8, 16) of the first fragment and is trimmed.
        assert!(matches!(offer(&t, &data, 1, 8, 24, true), ReassemblyOutcome::Pending));
        let ReassemblyOutcome::Completed(pkt) = offer(&t, &data, 1, 32, 16, false) else {
            panic!("expected completion");
        };
        assert_eq!(payload_of(&pkt), data);
        assert_eq!(stats.snapshot().fragdropped, 1);
    }

    #[test]
    fn test_new_fragment_covers_following() {
        let (t, stats) = table(16);
        let data: Vec<u8> = (0u8..40).collect();
        assert!(matches!(offer(&t, &data, 2, 8, 8, true), ReassemblyOutcome::Pending));
        assert!(matches!(offer(&t, &data, 2, 16, 8, true), ReassemblyOutcome::Pending));
        assert!(matches!(offer(&t, &data, 2, 32, 8, false), ReassemblyOutcome::Pending));
        // [0, 32) swallows [8, 16) and [16, 24) and completes the datagram.
        let ReassemblyOutcome::Completed(pkt) = offer(&t, &data, 2, 0, 32, true) else {
            panic!("expected completion");
        };
        assert_eq!(stats.snapshot().fragdropped, 2);
        assert_eq!(payload_of(&pkt), data);
    }

    #[test]
    fn test_fragment_count_limit_destroys_queue() {
        let (t, stats) = table(2);
        let data = [0u8; 64];
        assert!(matches!(offer(&t, &data, 3, 8, 8, true), ReassemblyOutcome::Pending));
        assert!(matches!(offer(&t, &data, 3, 24, 8, true), ReassemblyOutcome::Pending));
        assert!(matches!(
            offer(&t, &data, 3, 40, 8, true),
            ReassemblyOutcome::Dropped(FragmentDropReason::TooManyFragments)
        ));
        assert_eq!(t.live_queues(), 0);
        assert_eq!(stats.snapshot().fragdropped, 3);
        // The remaining fragments start a fresh queue and never complete it.
        assert!(matches!(offer(&t, &data, 3, 0, 8, true), ReassemblyOutcome::Pending));
    }

    #[test]
    fn test_completing_fragment_beats_ceiling() {
        let (t, _) = table(2);
        let data = [5u8; 24];
        assert!(matches!(offer(&t, &data, 4, 0, 8, true), ReassemblyOutcome::Pending));
        assert!(matches!(offer(&t, &data, 4, 16, 8, false), ReassemblyOutcome::Pending));
        assert!(matches!(offer(&t, &data, 4, 8, 8, true), ReassemblyOutcome::Completed(_)));
    }

    #[test]
    fn test_ttl_expiry_then_fresh_queue() {
        let (t, stats) = table(16);
        let data = [1u8; 16];
        assert!(matches!(offer(&t, &data, 5, 0, 8, true), ReassemblyOutcome::Pending));
        assert_eq!(t.sweep(500), 1);
        assert_eq!(t.sweep(1000), 1);
        assert_eq!(t.sweep(1500), 0);
        assert_eq!(stats.snapshot().fragtimeout, 1);

        // The tail alone now starts a new queue rather than completing.
        assert!(matches!(offer(&t, &data, 5, 8, 8, false), ReassemblyOutcome::Pending));
        assert_eq!(t.live_queues(), 1);
    }

    #[test]
    fn test_queue_pressure_evicts_oldest() {
        let stats = Arc::new(IpStats::new());
        let limits = ReassemblyLimits {
            max_queues: QueueLimit::Limit(2),
            max_frags_per_datagram: 16,
            ttl_ticks: 60,
        };
        let t = ReassemblyTable::new(limits, stats.clone());
        let data = [0u8; 16];
        for id in 0..3u16 {
            assert!(matches!(offer(&t, &data, id, 0, 8, true), ReassemblyOutcome::Pending));
        }
        assert_eq!(t.live_queues(), 2);
        assert_eq!(stats.snapshot().fragtimeout, 1);
    }

    #[test]
    fn test_lowered_limit_enforced_on_sweep() {
        let (t, _) = table(16);
        let data = [0u8; 16];
        for id in 0..5u16 {
            offer(&t, &data, id, 0, 8, true);
        }
        t.set_limits(ReassemblyLimits {
            max_queues: QueueLimit::Limit(2),
            max_frags_per_datagram: 16,
            ttl_ticks: 3,
        });
        assert_eq!(t.sweep(0), 2);
    }

    #[test]
    fn test_disabled_and_drain() {
        let (t, _) = table(16);
        let data = [0u8; 16];
        offer(&t, &data, 1, 0, 8, true);
        t.drain();
        assert_eq!(t.live_queues(), 0);

        t.set_limits(ReassemblyLimits {
            max_queues: QueueLimit::Limit(0),
            max_frags_per_datagram: 16,
            ttl_ticks: 3,
        });
        assert!(matches!(
            offer(&t, &data, 1, 0, 8, true),
            ReassemblyOutcome::Dropped(FragmentDropReason::Disabled)
        ));
    }

    #[test]
    fn test_ecn_merge() {
        let (t, _) = table(16);
        let data = [0u8; 24];
        let ecn_frag = |off: usize, mf: bool, ecn: u8| {
            let ff = (off / 8) as u16 | if mf { IP_MF } else { 0 };
            let bytes = PacketBuilder::udp(SRC, DST, &data[off..off + 8])
                .id(11)
                .tos(ecn)
                .flags_fragment(ff)
                .build();
            let hdr = Ipv4Header::parse(&bytes).unwrap();
            (PacketBuf::from_vec(bytes, InterfaceId(1)), hdr)
        };

        let (p, h) = ecn_frag(0, true, IPTOS_ECN_ECT0);
        assert!(matches!(t.insert(p, &h, &InternetChecksum), ReassemblyOutcome::Pending));
        let (p, h) = ecn_frag(8, true, IPTOS_ECN_NOTECT);
        assert!(matches!(
            t.insert(p, &h, &InternetChecksum),
            ReassemblyOutcome::Dropped(FragmentDropReason::EcnMismatch)
        ));
        let (p, h) = ecn_frag(8, true, IPTOS_ECN_CE);
        assert!(matches!(t.insert(p, &h, &InternetChecksum), ReassemblyOutcome::Pending));
        let (p, h) = ecn_frag(16, false, IPTOS_ECN_ECT0);
        let ReassemblyOutcome::Completed(pkt) = t.insert(p, &h, &InternetChecksum) else {
            panic!("expected completion");
        };
        let hdr = Ipv4Header::parse(pkt.head()).unwrap();
        assert_eq!(hdr.ecn(), IPTOS_ECN_CE);
    }

    #[test]
    fn test_ce_fragment_into_not_ect_queue_dropped() {
        let (t, stats) = table(16);
        let data = [7u8; 16];
        let frag = |off: usize, mf: bool, ecn: u8| {
            let ff = (off / 8) as u16 | if mf { IP_MF } else { 0 };
            let bytes = PacketBuilder::udp(SRC, DST, &data[off..off + 8])
                .id(12)
                .tos(ecn)
                .flags_fragment(ff)
                .build();
            let hdr = Ipv4Header::parse(&bytes).unwrap();
            (PacketBuf::from_vec(bytes, InterfaceId(1)), hdr)
        };

        let (p, h) = frag(0, true, IPTOS_ECN_NOTECT);
        assert!(matches!(t.insert(p, &h, &InternetChecksum), ReassemblyOutcome::Pending));
        let (p, h) = frag(8, false, IPTOS_ECN_CE);
        assert!(matches!(
            t.insert(p, &h, &InternetChecksum),
            ReassemblyOutcome::Dropped(FragmentDropReason::EcnMismatch)
        ));
        assert_eq!(stats.snapshot().fragdropped, 1);
        assert_eq!(t.live_queues(), 1);

        // The queue stays Not-ECT and completes with a Not-ECT tail.
        let (p, h) = frag(8, false, IPTOS_ECN_NOTECT);
        let ReassemblyOutcome::Completed(pkt) = t.insert(p, &h, &InternetChecksum) else {
            panic!("expected completion");
        };
        let hdr = Ipv4Header::parse(pkt.head()).unwrap();
        assert_eq!(hdr.ecn(), IPTOS_ECN_NOTECT);
        assert_eq!(&pkt.to_vec()[20..], &data[..]);
    }

    #[test]
    fn test_partial_checksum_accumulated() {
        let (t, _) = table(16);
        let data: Vec<u8> = (1u8..=32).collect();
        for (off, len, mf) in [(16, 16, false), (0, 16, true)] {
            let (mut pkt, hdr) = frag_of(&data, 21, off, len, mf);
            pkt.csum = RxChecksum::Partial {
                start: 0,
                sum: fold(sum_bytes(&pkt.to_vec(), 0)),
            };
            if let ReassemblyOutcome::Completed(done) = t.insert(pkt, &hdr, &InternetChecksum) {
                assert_eq!(
                    done.csum,
                    RxChecksum::Partial {
                        start: 20,
                        sum: fold(sum_bytes(&data, 0)),
                    }
                );
                return;
            }
        }
        panic!("datagram did not complete");
    }

    #[test]
    fn test_trim_invalidates_checksum() {
        let (t, _) = table(16);
        let data: Vec<u8> = (1u8..=32).collect();
        let mut last = None;
        for (off, len, mf) in [(0, 16, true), (8, 24, false)] {
            let (mut pkt, hdr) = frag_of(&data, 22, off, len, mf);
            pkt.csum = RxChecksum::Partial {
                start: 20,
                sum: fold(sum_bytes(&pkt.to_vec()[20..], 0)),
            };
            last = Some(t.insert(pkt, &hdr, &InternetChecksum));
        }
        let Some(ReassemblyOutcome::Completed(pkt)) = last else {
            panic!("expected completion");
        };
        assert_eq!(pkt.csum, RxChecksum::None);
        assert_eq!(payload_of(&pkt), data);
    }

    #[test]
    fn test_oversized_datagram_dropped() {
        let (t, stats) = table(16);
        // 64600 + 1000 payload bytes plus the header exceed 65535.
        let off = 64_600usize;
        let data = vec![0u8; off + 1000];
        assert!(matches!(offer(&t, &data, 30, off, 1000, false), ReassemblyOutcome::Pending));
        assert!(matches!(
            offer(&t, &data, 30, 0, off, true),
            ReassemblyOutcome::Dropped(FragmentDropReason::TooLarge)
        ));
        assert_eq!(t.live_queues(), 0);
        assert_eq!(stats.snapshot().fragdropped, 2);
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    /// Split `len` payload bytes at 8-byte aligned cut points.
    fn partition(len: usize, cuts: &[usize]) -> Vec<(usize, usize)> {
        let mut points: Vec<usize> = cuts
            .iter()
            .map(|c| (c % len) / 8 * 8)
            .filter(|&c| c > 0)
            .collect();
        points.push(0);
        points.push(len);
        points.sort_unstable();
        points.dedup();
        points.windows(2).map(|w| (w[0], w[1] - w[0])).collect()
    }

    proptest! {
        #[test]
        fn prop_reordering_invariance(
            data in proptest::collection::vec(any::<u8>(), 1..600),
            cuts in proptest::collection::vec(any::<usize>(), 0..8),
            seed in any::<u64>(),
        ) {
            let parts = partition(data.len(), &cuts);
            let mut order: Vec<usize> = (0..parts.len()).collect();
            // Deterministic shuffle from the generated seed.
            let mut s = seed | 1;
            for i in (1..order.len()).rev() {
                s ^= s << 13; s ^= s >> 7; s ^= s << 17;
                order.swap(i, (s as usize) % (i + 1));
            }

            let (t, _) = table(64);
            let mut completed = None;
            for &i in &order {
                let (off, len) = parts[i];
                let mf = off + len < data.len();
                if let ReassemblyOutcome::Completed(pkt) = offer(&t, &data, 99, off, len, mf) {
                    completed = Some(pkt);
                }
            }
            let pkt = completed.expect("all fragments delivered");
            prop_assert_eq!(payload_of(&pkt), data);
        }

        #[test]
        fn prop_overlap_resolution(
            data in proptest::collection::vec(any::<u8>(), 8..400),
            extra in proptest::collection::vec((any::<usize>(), 1usize..12), 0..6),
        ) {
            let len = data.len();
            let (t, _) = table(64);
            // Overlapping middle pieces first, then a covering partition.
            for (start, blocks) in extra {
                let off = (start % len) / 8 * 8;
                let flen = (blocks * 8).min(len - off);
                let mf = off + flen < len;
                if mf && flen % 8 != 0 {
                    continue;
                }
                if let ReassemblyOutcome::Completed(pkt) = offer(&t, &data, 77, off, flen, mf) {
                    prop_assert_eq!(payload_of(&pkt), data.clone());
                    return Ok(());
                }
            }
            let mut completed = None;
            for (off, flen) in partition(len, &[len / 2, len / 3]) {
                let mf = off + flen < len;
                if let ReassemblyOutcome::Completed(pkt) = offer(&t, &data, 77, off, flen, mf) {
                    completed = Some(pkt);
                }
            }
            let pkt = completed.expect("covering partition completes");
            prop_assert_eq!(payload_of(&pkt), data);
        }
    }
}
