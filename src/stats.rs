//! IPv4 receive path statistics.
//!
//! Counters are relaxed atomics: they are diagnostics, never used for
//! control decisions. [`IpStats::snapshot`] copies them into a plain struct.

use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! ip_stats {
    ($( $(#[$doc:meta])* $name:ident => $inc:ident; )*) => {
        /// IPv4 receive path statistics
        #[derive(Debug, Default)]
        pub struct IpStats {
            $( $(#[$doc])* pub $name: AtomicU64, )*
        }

        /// Point-in-time copy of [`IpStats`].
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct IpStatsSnapshot {
            $( $(#[$doc])* pub $name: u64, )*
        }

        impl IpStats {
            pub const fn new() -> Self {
                IpStats {
                    $( $name: AtomicU64::new(0), )*
                }
            }

            $(
                #[inline]
                pub fn $inc(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Copy every counter.
            pub fn snapshot(&self) -> IpStatsSnapshot {
                IpStatsSnapshot {
                    $( $name: self.$name.load(Ordering::Relaxed), )*
                }
            }
        }
    };
}

ip_stats! {
    /// Datagrams received
    total => inc_total;
    /// Header checksum errors
    badsum => inc_badsum;
    /// Captured length shorter than total length
    tooshort => inc_tooshort;
    /// Buffer smaller than a minimal header
    toosmall => inc_toosmall;
    /// Header length below minimum or beyond the buffer
    badhlen => inc_badhlen;
    /// Total length smaller than header length
    badlen => inc_badlen;
    /// Version not 4
    badvers => inc_badvers;
    /// Loopback addresses seen off loopback
    martian => inc_martian;
    /// Link-local traffic with TTL other than 255
    linklocal_badttl => inc_linklocal_badttl;
    /// Fragments received
    fragments => inc_fragments;
    /// Fragments dropped (duplicates, malformed, limits)
    fragdropped => inc_fragdropped;
    /// Fragments dropped by reassembly timeout or eviction
    fragtimeout => inc_fragtimeout;
    /// Datagrams reassembled
    reassembled => inc_reassembled;
    /// Datagrams handed to protocol dispatch
    delivered => inc_delivered;
    /// Datagrams forwarded
    forward => inc_forward;
    /// Datagrams not forwardable
    cantforward => inc_cantforward;
    /// Forwarding failures for lack of a route
    noroute => inc_noroute;
    /// Forwarding failures needing fragmentation with DF set
    cantfrag => inc_cantfrag;
    /// Redirects requested
    redirectsent => inc_redirectsent;
    /// Option processing errors
    badoptions => inc_badoptions;
    /// Multicast datagrams for groups not joined
    notmember => inc_notmember;
    /// Datagrams accepted on a different interface than the address owner
    weak_match => inc_weak_match;
    /// Datagrams dropped by policy or resource limits
    odropped => inc_odropped;
    /// Transmit exhaustion reports suppressed
    source_quench_suppressed => inc_source_quench_suppressed;
    /// Same-flow batches processed
    batches => inc_batches;
}

impl IpStats {
    /// Add `n` received datagrams at once (one update per batch).
    #[inline]
    pub fn add_total(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    /// Add `n` fragments dropped together (a whole queue).
    #[inline]
    pub fn add_fragdropped(&self, n: u64) {
        self.fragdropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Add `n` fragments discarded by timeout or eviction.
    #[inline]
    pub fn add_fragtimeout(&self, n: u64) {
        self.fragtimeout.fetch_add(n, Ordering::Relaxed);
    }
}
