//! Test doubles for the collaborator traits and a datagram builder.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::buffer::PacketBuf;
use crate::device::{
    prefix_mask, Egress, IfAddr, InterfaceId, InterfaceKind, InterfaceTable, TxError,
};
use crate::icmp::{ErrorReporter, IcmpKind};
use crate::ipv4::{self, Ipv4Header, IPV4_HEADER_MIN_LEN};
use crate::route::{RouteResolver, RouteResult};
use crate::stack::{Clock, ProtocolDispatch, TimerScheduler};

// ============================================================================
// Packet Builder
// ============================================================================

/// Builds a wire-format IPv4 datagram with a valid header checksum.
///
/// The payload is used as-is; no transport header is added.
pub struct PacketBuilder {
    src: [u8; 4],
    dst: [u8; 4],
    protocol: u8,
    payload: Vec<u8>,
    id: u16,
    tos: u8,
    ttl: u8,
    flags_fragment: u16,
    total_len: Option<u16>,
    options: Vec<u8>,
}

impl PacketBuilder {
    pub fn udp(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Self {
        PacketBuilder {
            src,
            dst,
            protocol: 17,
            payload: payload.to_vec(),
            id: 0,
            tos: 0,
            ttl: 64,
            flags_fragment: 0,
            total_len: None,
            options: Vec::new(),
        }
    }

    pub fn id(mut self, id: u16) -> Self {
        self.id = id;
        self
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn flags_fragment(mut self, ff: u16) -> Self {
        self.flags_fragment = ff;
        self
    }

    /// Override the total length field.
    pub fn total_len(mut self, len: u16) -> Self {
        self.total_len = Some(len);
        self
    }

    /// Option bytes, zero padded to a 4-byte boundary.
    pub fn options(mut self, opts: &[u8]) -> Self {
        self.options = opts.to_vec();
        while self.options.len() % 4 != 0 {
            self.options.push(0);
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        let hlen = IPV4_HEADER_MIN_LEN + self.options.len();
        let total = self
            .total_len
            .unwrap_or((hlen + self.payload.len()) as u16);

        let mut b = Vec::with_capacity(hlen + self.payload.len());
        b.push(0x40 | (hlen / 4) as u8);
        b.push(self.tos);
        b.extend_from_slice(&total.to_be_bytes());
        b.extend_from_slice(&self.id.to_be_bytes());
        b.extend_from_slice(&self.flags_fragment.to_be_bytes());
        b.push(self.ttl);
        b.push(self.protocol);
        b.extend_from_slice(&[0, 0]);
        b.extend_from_slice(&self.src);
        b.extend_from_slice(&self.dst);
        b.extend_from_slice(&self.options);
        ipv4::write_checksum(&mut b, hlen);
        b.extend_from_slice(&self.payload);
        b
    }
}

// ============================================================================
// Interfaces
// ============================================================================

/// Table-driven [`InterfaceTable`].
#[derive(Default)]
pub struct FakeInterfaces {
    ifaces: Vec<(InterfaceId, IfAddr, InterfaceKind)>,
    groups: Vec<(Ipv4Addr, InterfaceId)>,
}

impl FakeInterfaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ifid: InterfaceId, addr: IfAddr) {
        self.add_with_kind(ifid, addr, InterfaceKind::Broadcast);
    }

    pub fn add_with_kind(&mut self, ifid: InterfaceId, addr: IfAddr, kind: InterfaceKind) {
        self.ifaces.push((ifid, addr, kind));
    }

    pub fn join(&mut self, group: Ipv4Addr, ifid: InterfaceId) {
        self.groups.push((group, ifid));
    }
}

impl InterfaceTable for FakeInterfaces {
    fn is_local(&self, addr: Ipv4Addr) -> Option<InterfaceId> {
        self.ifaces
            .iter()
            .find(|(_, ia, _)| ia.addr == addr)
            .map(|(id, _, _)| *id)
    }

    fn is_member(&self, group: Ipv4Addr, ifid: InterfaceId) -> bool {
        self.groups.contains(&(group, ifid))
    }

    fn kind(&self, ifid: InterfaceId) -> InterfaceKind {
        self.ifaces
            .iter()
            .find(|(id, _, _)| *id == ifid)
            .map(|(_, _, kind)| *kind)
            .unwrap_or_default()
    }

    fn primary_address(&self, ifid: InterfaceId) -> Option<IfAddr> {
        self.ifaces
            .iter()
            .find(|(id, _, _)| *id == ifid)
            .map(|(_, ia, _)| *ia)
    }

    fn is_broadcast(&self, dst: Ipv4Addr, ifid: InterfaceId) -> bool {
        self.primary_address(ifid)
            .is_some_and(|ia| ia.is_broadcast_for(dst))
    }

    fn on_link(&self, addr: Ipv4Addr) -> Option<IfAddr> {
        self.ifaces
            .iter()
            .find(|(_, ia, _)| ia.contains(addr))
            .map(|(_, ia, _)| *ia)
    }
}

// ============================================================================
// Routes
// ============================================================================

struct FakeRoute {
    prefix: u32,
    mask: u32,
    len: u8,
    gateway: Option<Ipv4Addr>,
    egress: InterfaceId,
    redirected: bool,
}

/// Longest-prefix-match [`RouteResolver`] over a small list.
#[derive(Default)]
pub struct FakeRoutes {
    routes: Vec<FakeRoute>,
    generation: AtomicU64,
}

impl FakeRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_direct(&mut self, prefix: [u8; 4], len: u8, egress: InterfaceId) {
        self.push(prefix, len, None, egress);
    }

    pub fn add_via(&mut self, prefix: [u8; 4], len: u8, gateway: [u8; 4], egress: InterfaceId) {
        self.push(prefix, len, Some(Ipv4Addr::from(gateway)), egress);
    }

    /// Gateway route as installed by an ICMP redirect.
    pub fn add_redirected(
        &mut self,
        prefix: [u8; 4],
        len: u8,
        gateway: [u8; 4],
        egress: InterfaceId,
    ) {
        self.push(prefix, len, Some(Ipv4Addr::from(gateway)), egress);
        if let Some(route) = self.routes.last_mut() {
            route.redirected = true;
        }
    }

    /// Invalidate cached lookups.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    fn push(&mut self, prefix: [u8; 4], len: u8, gateway: Option<Ipv4Addr>, egress: InterfaceId) {
        let mask = prefix_mask(len);
        self.routes.push(FakeRoute {
            prefix: u32::from_be_bytes(prefix) & mask,
            mask,
            len,
            gateway,
            egress,
            redirected: false,
        });
        self.bump_generation();
    }
}

impl RouteResolver for FakeRoutes {
    fn resolve(&self, destination: Ipv4Addr) -> Option<Arc<RouteResult>> {
        let dst = u32::from(destination);
        let best = self
            .routes
            .iter()
            .filter(|r| dst & r.mask == r.prefix)
            .max_by_key(|r| r.len)?;
        let mut route = match best.gateway {
            Some(gw) => RouteResult::via(destination, gw, best.egress),
            None => RouteResult::direct(destination, best.egress),
        };
        route.is_default = best.len == 0;
        route.is_modified_by_redirect = best.redirected;
        Some(Arc::new(route))
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Recorders
// ============================================================================

/// One ICMP error request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub kind: IcmpKind,
    pub code: u8,
    pub extra: u32,
    pub original: Vec<u8>,
}

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<Report>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, kind: IcmpKind, code: u8, extra: u32, original: &[u8]) {
        self.reports.lock().push(Report {
            kind,
            code,
            extra,
            original: original.to_vec(),
        });
    }
}

/// [`Egress`] that keeps what it was given, optionally failing once.
#[derive(Default)]
pub struct RecordingEgress {
    sent: Mutex<Vec<(PacketBuf, RouteResult)>>,
    fail: Mutex<Option<TxError>>,
}

impl RecordingEgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next send with `err`.
    pub fn fail_next(&self, err: TxError) {
        *self.fail.lock() = Some(err);
    }

    pub fn sent(&self) -> Vec<(PacketBuf, RouteResult)> {
        self.sent.lock().clone()
    }
}

impl Egress for RecordingEgress {
    fn send(&self, pkt: PacketBuf, route: &RouteResult) -> Result<(), TxError> {
        if let Some(err) = self.fail.lock().take() {
            return Err(err);
        }
        self.sent.lock().push((pkt, route.clone()));
        Ok(())
    }
}

/// [`ProtocolDispatch`] recording `(protocol, payload bytes)`.
#[derive(Default)]
pub struct RecordingDispatch {
    delivered: Mutex<Vec<(u8, Vec<u8>)>>,
}

impl RecordingDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<(u8, Vec<u8>)> {
        self.delivered.lock().clone()
    }
}

impl ProtocolDispatch for RecordingDispatch {
    fn deliver(&self, protocol: u8, _hdr: &Ipv4Header, payload: PacketBuf) {
        self.delivered.lock().push((protocol, payload.to_vec()));
    }
}

/// [`TimerScheduler`] that only records requests.
#[derive(Default)]
pub struct ManualTimer {
    scheduled: Mutex<Vec<u64>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<u64> {
        self.scheduled.lock().clone()
    }
}

impl TimerScheduler for ManualTimer {
    fn schedule(&self, after_ms: u64) {
        self.scheduled.lock().push(after_ms);
    }
}

pub struct FixedClock {
    now_ms: u64,
    midnight_ms: u32,
}

impl FixedClock {
    pub fn new(now_ms: u64, midnight_ms: u32) -> Self {
        FixedClock {
            now_ms,
            midnight_ms,
        }
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn ms_since_midnight_utc(&self) -> u32 {
        self.midnight_ms
    }
}
