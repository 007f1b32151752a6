//! IPv4 option processing.
//!
//! [`process_options`] walks the option region of a datagram that has
//! already passed validation, updating source route, record route and
//! timestamp options in place. Any other option is skipped by its length
//! byte. The header checksum is recomputed whenever an option was written.
//!
//! # Security Features
//! - Every length and pointer byte is bounds-checked against the header
//! - Source routing through this host is off unless explicitly enabled
//! - Attempted source routes are logged
//!
//! # References
//! - RFC 791 §3.1: Options
//! - RFC 1812 §5.2.4: Source route and record route handling

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use log::{trace, warn};

use crate::buffer::PacketBuf;
use crate::config::IpConfig;
use crate::device::InterfaceTable;
use crate::icmp::{
    IcmpKind, ICMP_CODE_HOST_UNREACHABLE, ICMP_CODE_POINTER, ICMP_CODE_SOURCE_ROUTE_FAILED,
};
use crate::ipv4::{self, Ipv4Header, IPV4_HEADER_MIN_LEN};
use crate::route::RouteResolver;

/// End of option list
pub const IPOPT_EOL: u8 = 0;
/// No operation
pub const IPOPT_NOP: u8 = 1;
/// Record route
pub const IPOPT_RR: u8 = 7;
/// Timestamp
pub const IPOPT_TS: u8 = 68;
/// Loose source and record route
pub const IPOPT_LSRR: u8 = 131;
/// Strict source and record route
pub const IPOPT_SSRR: u8 = 137;

/// Offset of the length byte within an option
pub const IPOPT_OLEN: usize = 1;
/// Offset of the pointer byte within an option
pub const IPOPT_OFFSET: usize = 2;
/// Smallest legal pointer value
pub const IPOPT_MINOFF: u8 = 4;

/// Timestamp flag: timestamps only
pub const IPOPT_TS_TSONLY: u8 = 0;
/// Timestamp flag: address and timestamp pairs
pub const IPOPT_TS_TSANDADDR: u8 = 1;
/// Timestamp flag: prespecified addresses
pub const IPOPT_TS_PRESPEC: u8 = 3;

/// Largest timestamp option
const IPOPT_TS_MAXLEN: usize = 40;

// ============================================================================
// Results
// ============================================================================

/// Outcome of option processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionVerdict {
    /// Continue normal processing.
    Continue,
    /// A source route names a next hop; the datagram must be forwarded.
    MustForward,
    /// Drop and report an ICMP error. `pointer` is the byte offset from the
    /// start of the header for parameter problems, zero otherwise.
    Reject { kind: IcmpKind, code: u8, pointer: u8 },
    /// Drop without a report.
    Drop,
}

/// Collaborators and per-packet values used while processing options.
pub struct OptionEnv<'a> {
    pub ifaces: &'a dyn InterfaceTable,
    pub routes: &'a dyn RouteResolver,
    pub config: &'a IpConfig,
    /// Milliseconds since midnight UT for timestamp options.
    pub timestamp_ms: u32,
}

// ============================================================================
// Saved Source Route
// ============================================================================

/// A source route that ended at this host, kept for the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRoute {
    /// `IPOPT_LSRR` or `IPOPT_SSRR`.
    pub opt_type: u8,
    /// Recorded route addresses in option order.
    pub hops: Vec<Ipv4Addr>,
    /// Source of the datagram the route arrived on.
    pub src: Ipv4Addr,
}

/// Return route derived from a [`SavedRoute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnRoute {
    /// Where the reply is sent first.
    pub first_hop: Ipv4Addr,
    /// Option bytes: a NOP pad followed by the reversed source route
    /// ending at the original source.
    pub option: Vec<u8>,
}

impl SavedRoute {
    /// Build the return route: the last recorded hop becomes the first hop,
    /// the remaining hops are listed in reverse, and the original source is
    /// the final destination.
    pub fn reverse(&self) -> Option<ReturnRoute> {
        let (&first_hop, rest) = self.hops.split_last()?;
        let olen = 3 + 4 * self.hops.len();
        let olen = u8::try_from(olen).ok()?;

        let mut option = Vec::with_capacity(1 + olen as usize);
        option.extend_from_slice(&[IPOPT_NOP, self.opt_type, olen, IPOPT_MINOFF]);
        for hop in rest.iter().rev() {
            option.extend_from_slice(&hop.octets());
        }
        option.extend_from_slice(&self.src.octets());
        Some(ReturnRoute { first_hop, option })
    }
}

// ============================================================================
// Option Processing
// ============================================================================

#[inline]
fn param_problem(pointer: usize) -> OptionVerdict {
    OptionVerdict::Reject {
        kind: IcmpKind::ParameterProblem,
        code: ICMP_CODE_POINTER,
        // Options end at byte 60, so the offset always fits.
        pointer: pointer as u8,
    }
}

#[inline]
fn unreachable(code: u8) -> OptionVerdict {
    OptionVerdict::Reject {
        kind: IcmpKind::DestUnreachable,
        code,
        pointer: 0,
    }
}

fn read_addr(head: &[u8], at: usize) -> Option<Ipv4Addr> {
    let b = head.get(at..at + 4)?;
    Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
}

fn write_addr(head: &mut [u8], at: usize, addr: Ipv4Addr) {
    if let Some(slot) = head.get_mut(at..at + 4) {
        slot.copy_from_slice(&addr.octets());
    }
}

/// Local address of the interface a route to `dst` leaves on.
fn route_source(env: &OptionEnv<'_>, dst: Ipv4Addr) -> Option<Ipv4Addr> {
    let route = env.routes.resolve(dst)?;
    env.ifaces
        .primary_address(route.egress_interface)
        .map(|ia| ia.addr)
}

/// Process the options of `pkt`, whose header is described by `hdr`.
///
/// On return `hdr` reflects any destination rewrite. The header bytes must
/// already be contiguous in the first segment.
pub fn process_options(
    pkt: &mut PacketBuf,
    hdr: &mut Ipv4Header,
    env: &OptionEnv<'_>,
) -> OptionVerdict {
    let hlen = hdr.header_len();
    let rcvif = pkt.rcvif;
    let mut dst = hdr.dst;
    let mut forward = false;
    let mut modified = false;
    let mut saved: Option<SavedRoute> = None;

    let verdict = {
        let head = pkt.head_mut();
        let mut pos = IPV4_HEADER_MIN_LEN;
        let mut verdict = OptionVerdict::Continue;

        while pos < hlen && pos < head.len() {
            let cnt = hlen - pos;
            let opt = head[pos];
            if opt == IPOPT_EOL {
                break;
            }
            let optlen = if opt == IPOPT_NOP {
                1
            } else {
                if cnt < IPOPT_OLEN + 1 {
                    verdict = param_problem(pos + IPOPT_OLEN);
                    break;
                }
                let optlen = head[pos + IPOPT_OLEN] as usize;
                if optlen < IPOPT_OLEN + 1 || optlen > cnt {
                    verdict = param_problem(pos + IPOPT_OLEN);
                    break;
                }
                optlen
            };

            match opt {
                IPOPT_LSRR | IPOPT_SSRR => {
                    if optlen < IPOPT_OFFSET + 1 {
                        verdict = param_problem(pos + IPOPT_OLEN);
                        break;
                    }
                    let off = head[pos + IPOPT_OFFSET];
                    if off < IPOPT_MINOFF {
                        verdict = param_problem(pos + IPOPT_OFFSET);
                        break;
                    }

                    if env.ifaces.is_local(dst).is_none() {
                        if opt == IPOPT_SSRR {
                            verdict = unreachable(ICMP_CODE_SOURCE_ROUTE_FAILED);
                            break;
                        }
                        if !env.config.forward_source_routed {
                            warn!("ipv4: attempted source route from {} to {}", hdr.src, dst);
                            verdict = unreachable(ICMP_CODE_SOURCE_ROUTE_FAILED);
                            break;
                        }
                        // Loose route, not at the next listed hop yet.
                        pos += optlen;
                        continue;
                    }

                    // 0-origin slot offset within the option.
                    let slot = off as usize - 1;
                    if slot + 4 > optlen {
                        // Route exhausted: the datagram is for us.
                        if !env.config.accept_source_routed {
                            warn!("ipv4: attempted source route from {} to {}", hdr.src, dst);
                            verdict = unreachable(ICMP_CODE_SOURCE_ROUTE_FAILED);
                            break;
                        }
                        let hops = (pos + IPOPT_OFFSET + 1..pos + optlen)
                            .step_by(4)
                            .filter_map(|at| {
                                (at + 4 <= pos + optlen)
                                    .then(|| read_addr(head, at))
                                    .flatten()
                            })
                            .collect();
                        saved = Some(SavedRoute {
                            opt_type: opt,
                            hops,
                            src: hdr.src,
                        });
                        pos += optlen;
                        continue;
                    }

                    if !env.config.forward_source_routed {
                        if env.config.forwarding {
                            warn!("ipv4: attempted source route from {} to {}", hdr.src, dst);
                            verdict = unreachable(ICMP_CODE_SOURCE_ROUTE_FAILED);
                        } else {
                            verdict = OptionVerdict::Drop;
                        }
                        break;
                    }

                    let Some(next) = read_addr(head, pos + slot) else {
                        verdict = param_problem(pos + IPOPT_OFFSET);
                        break;
                    };
                    let local = if opt == IPOPT_SSRR {
                        env.ifaces.on_link(next).map(|ia| ia.addr)
                    } else {
                        route_source(env, next)
                    };
                    let Some(local) = local else {
                        verdict = unreachable(ICMP_CODE_SOURCE_ROUTE_FAILED);
                        break;
                    };

                    trace!("ipv4: source route {} -> next hop {}", dst, next);
                    dst = next;
                    ipv4::set_dst(head, next);
                    write_addr(head, pos + slot, local);
                    head[pos + IPOPT_OFFSET] = off + 4;
                    modified = true;
                    forward = !next.is_multicast();
                }

                IPOPT_RR => {
                    if optlen < IPOPT_OFFSET + 1 {
                        verdict = param_problem(pos + IPOPT_OFFSET);
                        break;
                    }
                    let off = head[pos + IPOPT_OFFSET];
                    if off < IPOPT_MINOFF {
                        verdict = param_problem(pos + IPOPT_OFFSET);
                        break;
                    }
                    let slot = off as usize - 1;
                    if slot + 4 <= optlen {
                        let local = if env.ifaces.is_local(dst).is_some() {
                            Some(dst)
                        } else {
                            route_source(env, dst)
                        };
                        let Some(local) = local else {
                            verdict = unreachable(ICMP_CODE_HOST_UNREACHABLE);
                            break;
                        };
                        write_addr(head, pos + slot, local);
                        head[pos + IPOPT_OFFSET] = off + 4;
                        modified = true;
                    }
                }

                IPOPT_TS => {
                    if !(4..=IPOPT_TS_MAXLEN).contains(&optlen) {
                        verdict = param_problem(pos + IPOPT_OLEN);
                        break;
                    }
                    let off = head[pos + IPOPT_OFFSET] as usize;
                    if off < 5 {
                        verdict = param_problem(pos + IPOPT_OLEN);
                        break;
                    }
                    let oflw_flag = pos + IPOPT_OFFSET + 1;
                    if off + 3 > optlen {
                        // No room: bump the 4-bit overflow counter.
                        head[oflw_flag] = head[oflw_flag].wrapping_add(1 << 4);
                        modified = true;
                        if head[oflw_flag] & 0xf0 == 0 {
                            verdict = param_problem(pos + IPOPT_OFFSET);
                            break;
                        }
                        pos += optlen;
                        continue;
                    }

                    let mut slot = off - 1;
                    match head[oflw_flag] & 0x0f {
                        IPOPT_TS_TSONLY => {}
                        IPOPT_TS_TSANDADDR => {
                            if slot + 8 > optlen {
                                verdict = param_problem(pos + IPOPT_OFFSET);
                                break;
                            }
                            let Some(ia) = env.ifaces.primary_address(rcvif) else {
                                pos += optlen;
                                continue;
                            };
                            write_addr(head, pos + slot, ia.addr);
                            head[pos + IPOPT_OFFSET] += 4;
                            slot += 4;
                        }
                        IPOPT_TS_PRESPEC => {
                            if slot + 8 > optlen {
                                verdict = param_problem(pos + IPOPT_OFFSET);
                                break;
                            }
                            let listed = read_addr(head, pos + slot);
                            if listed.and_then(|a| env.ifaces.is_local(a)).is_none() {
                                pos += optlen;
                                continue;
                            }
                            head[pos + IPOPT_OFFSET] += 4;
                            slot += 4;
                        }
                        _ => {
                            verdict = param_problem(oflw_flag);
                            break;
                        }
                    }
                    if let Some(field) = head.get_mut(pos + slot..pos + slot + 4) {
                        field.copy_from_slice(&env.timestamp_ms.to_be_bytes());
                    }
                    head[pos + IPOPT_OFFSET] += 4;
                    modified = true;
                }

                _ => {}
            }
            pos += optlen;
        }

        if modified {
            ipv4::write_checksum(head, hlen);
        }
        verdict
    };

    if let Some(route) = saved {
        pkt.srcroute = Some(route);
    }
    if modified {
        if let Ok(updated) = Ipv4Header::parse(pkt.head()) {
            *hdr = updated;
        }
    }

    match verdict {
        OptionVerdict::Continue if forward => OptionVerdict::MustForward,
        other => other,
    }
}

// ============================================================================
// Tests
// ============================================================================
