//! Forwarding of datagrams not addressed to this host.
//!
//! RFC 1812 router behavior: TTL decrement with incremental checksum
//! update, host redirects for traffic that leaves on the interface it came
//! in on, and ICMP errors for failures the egress path reports.

use log::{debug, trace};

use thiserror::Error;

use crate::buffer::{PacketBuf, PacketFlags};
use crate::config::IpConfig;
use crate::device::{Egress, InterfaceTable, TxError};
use crate::icmp::{
    error_snapshot, ErrorReporter, IcmpKind, ICMP_CODE_FRAG_NEEDED, ICMP_CODE_HOST_UNREACHABLE,
    ICMP_CODE_REDIRECT_HOST, ICMP_CODE_TTL_EXCEEDED,
};
use crate::ipv4::{decrement_ttl, in_canforward, Ipv4Header, IPTTLDEC};
use crate::route::{RouteCache, RouteResolver, RouteResult};
use crate::stats::IpStats;

/// Forwarding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ForwardFailure {
    /// Link-layer broadcast/multicast, or a destination never forwarded.
    #[error("destination not forwardable")]
    NotForwardable,
    /// TTL would reach zero.
    #[error("ttl exceeded in transit")]
    TtlExceeded,
    /// No route to the destination.
    #[error("no route to destination")]
    NoRoute,
    /// Egress reported the next hop unreachable.
    #[error("next hop unreachable")]
    Unreachable,
    /// Datagram too large for the egress MTU with DF set.
    #[error("fragmentation needed (mtu {mtu})")]
    NeedsFragmentation { mtu: u16 },
    /// Egress out of buffers.
    #[error("transmit resources exhausted")]
    ResourceExhausted,
}

/// Collaborators and settings one forwarding decision needs.
pub struct ForwardEnv<'a> {
    pub routes: &'a dyn RouteResolver,
    pub ifaces: &'a dyn InterfaceTable,
    pub egress: &'a dyn Egress,
    pub icmp: &'a dyn ErrorReporter,
    pub config: &'a IpConfig,
    pub stats: &'a IpStats,
}

/// Redirect owed once the datagram has been sent.
struct PendingRedirect {
    gateway: u32,
}

/// Forwards datagrams, caching the last route per receive interface.
#[derive(Debug)]
pub struct Forwarder {
    cache: RouteCache,
}

impl Forwarder {
    pub fn new(max_interfaces: usize) -> Self {
        Forwarder {
            cache: RouteCache::new(max_interfaces),
        }
    }

    /// Drop every cached route.
    pub fn flush(&self) {
        self.cache.flush();
    }

    /// Forward `pkt` whose header is `hdr` (as received, before the TTL
    /// decrement).
    ///
    /// `srcrt` is set when a source route option chose the next
    /// destination; such datagrams never trigger redirects.
    pub fn forward(
        &self,
        mut pkt: PacketBuf,
        hdr: &Ipv4Header,
        srcrt: bool,
        env: &ForwardEnv<'_>,
    ) -> Result<(), ForwardFailure> {
        let dst = hdr.dst;

        if pkt
            .flags
            .intersects(PacketFlags::BROADCAST | PacketFlags::MULTICAST)
            || !in_canforward(dst)
        {
            env.stats.inc_cantforward();
            trace!("ipv4: {} not forwardable", dst);
            return Err(ForwardFailure::NotForwardable);
        }

        let snapshot = error_snapshot(&pkt, hdr);

        if hdr.ttl <= IPTTLDEC {
            env.icmp.report(
                IcmpKind::TimeExceeded,
                ICMP_CODE_TTL_EXCEEDED,
                0,
                &snapshot,
            );
            return Err(ForwardFailure::TtlExceeded);
        }

        decrement_ttl(pkt.head_mut());

        let Some(route) = self.cache.lookup(pkt.rcvif, dst, env.routes) else {
            env.stats.inc_noroute();
            env.icmp.report(
                IcmpKind::DestUnreachable,
                ICMP_CODE_HOST_UNREACHABLE,
                0,
                &snapshot,
            );
            return Err(ForwardFailure::NoRoute);
        };

        let redirect = self.redirect_for(&pkt, hdr, &route, srcrt, env);

        pkt.flags |= PacketFlags::FORWARDED;
        match env.egress.send(pkt, &route) {
            Ok(()) => {
                env.stats.inc_forward();
                if let Some(r) = redirect {
                    env.stats.inc_redirectsent();
                    env.icmp.report(
                        IcmpKind::Redirect,
                        ICMP_CODE_REDIRECT_HOST,
                        r.gateway,
                        &snapshot,
                    );
                }
                Ok(())
            }
            Err(e) => {
                env.stats.inc_cantforward();
                debug!(
                    "ipv4: forward to {} via {:?} failed: {}",
                    dst, route.egress_interface, e
                );
                Err(self.report_tx_error(e, &snapshot, env))
            }
        }
    }

    /// A host redirect is owed when the datagram leaves on the interface it
    /// arrived on, towards a sender on that interface's subnet, over a
    /// route that is neither default nor itself learned from a redirect.
    fn redirect_for(
        &self,
        pkt: &PacketBuf,
        hdr: &Ipv4Header,
        route: &RouteResult,
        srcrt: bool,
        env: &ForwardEnv<'_>,
    ) -> Option<PendingRedirect> {
        if route.egress_interface != pkt.rcvif
            || route.is_modified_by_redirect
            || route.is_default
            || !env.config.send_redirects
            || srcrt
        {
            return None;
        }
        let ia = env.ifaces.primary_address(route.egress_interface)?;
        if !ia.contains(hdr.src) {
            return None;
        }
        let gateway = if route.is_gateway {
            route.next_hop
        } else {
            hdr.dst
        };
        Some(PendingRedirect {
            gateway: u32::from(gateway),
        })
    }

    fn report_tx_error(
        &self,
        err: TxError,
        snapshot: &[u8],
        env: &ForwardEnv<'_>,
    ) -> ForwardFailure {
        match err {
            TxError::Unreachable | TxError::NoRoute => {
                env.icmp.report(
                    IcmpKind::DestUnreachable,
                    ICMP_CODE_HOST_UNREACHABLE,
                    0,
                    snapshot,
                );
                ForwardFailure::Unreachable
            }
            TxError::NeedsFragmentation { mtu } => {
                env.stats.inc_cantfrag();
                env.icmp.report(
                    IcmpKind::DestUnreachable,
                    ICMP_CODE_FRAG_NEEDED,
                    u32::from(mtu),
                    snapshot,
                );
                ForwardFailure::NeedsFragmentation { mtu }
            }
            TxError::ResourceExhausted => {
                if env.config.send_source_quench {
                    env.icmp.report(IcmpKind::SourceQuench, 0, 0, snapshot);
                } else {
                    env.stats.inc_source_quench_suppressed();
                }
                ForwardFailure::ResourceExhausted
            }
        }
    }
}
