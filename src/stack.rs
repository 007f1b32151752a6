//! IPv4 input pipeline.
//!
//! [`IpInput`] sequences one datagram through validation, reassembly,
//! classification, option processing and either local delivery or
//! forwarding. Batches are an outer loop over the same per-packet path.
//!
//! All state lives in the instance: the reassembly table, the forwarding
//! route cache and the counters. Collaborators are injected at
//! construction.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, trace};
use spin::RwLock;
use thiserror::Error;

use crate::buffer::{PacketBuf, PacketFlags};
use crate::checksum::ChecksumEngine;
use crate::classify::{classify, Classification, ClassifyDrop};
use crate::config::IpConfig;
use crate::device::{Egress, InterfaceId, InterfaceKind, InterfaceTable};
use crate::forward::{ForwardEnv, ForwardFailure, Forwarder};
use crate::fragment::{
    FragmentDropReason, ReassemblyLimits, ReassemblyOutcome, ReassemblyTable,
};
use crate::icmp::{error_snapshot, ErrorReporter, IcmpKind, ICMP_CODE_SOURCE_ROUTE_FAILED};
use crate::ipv4::{self, is_linklocal_pair, Ipv4Header, Malformed, ValidateOptions, MAXTTL};
use crate::options::{process_options, OptionEnv, OptionVerdict};
use crate::route::RouteResolver;
use crate::stats::{IpStats, IpStatsSnapshot};

// ============================================================================
// Collaborators
// ============================================================================

/// Upper-layer protocol input.
pub trait ProtocolDispatch: Send + Sync {
    /// Hand a complete datagram to the protocol `protocol`. `payload` starts
    /// at the transport header; `hdr` is the IP header it arrived with.
    fn deliver(&self, protocol: u8, hdr: &Ipv4Header, payload: PacketBuf);
}

/// One-shot timer used for the reassembly sweep.
pub trait TimerScheduler: Send + Sync {
    /// Call [`IpInput::handle_timer_tick`] once, `after_ms` from now.
    fn schedule(&self, after_ms: u64);
}

/// Time source.
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64;

    /// Milliseconds since midnight UT, for timestamp options.
    fn ms_since_midnight_utc(&self) -> u32;
}

/// Everything the pipeline calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub routes: Arc<dyn RouteResolver>,
    pub checksum: Arc<dyn ChecksumEngine>,
    pub icmp: Arc<dyn ErrorReporter>,
    pub ifaces: Arc<dyn InterfaceTable>,
    pub egress: Arc<dyn Egress>,
    pub dispatch: Arc<dyn ProtocolDispatch>,
    pub timer: Arc<dyn TimerScheduler>,
    pub clock: Arc<dyn Clock>,
}

// ============================================================================
// Results
// ============================================================================

/// Datagrams refused by policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolicyReason {
    #[error("destination owned by another interface")]
    InterfaceMismatch,
    #[error("multicast group not joined")]
    NotMember,
    #[error("forwarding disabled")]
    ForwardingDisabled,
    #[error("source routing refused")]
    SourceRouteRefused,
    #[error("input stopped")]
    Stopped,
}

/// Why a datagram was dropped.
///
/// Reassembly timeouts are not listed: they happen on the timer, away from
/// any submitted packet, and are only counted (`fragtimeout`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("malformed: {0}")]
    Malformed(Malformed),
    #[error("policy: {0}")]
    PolicyDenied(PolicyReason),
    #[error("resources exhausted: {0}")]
    ResourceExhausted(FragmentDropReason),
    #[error("reassembly: {0}")]
    Reassembly(FragmentDropReason),
    #[error("forwarding failed: {0}")]
    ForwardingFailure(ForwardFailure),
}

/// What happened to a submitted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Handed to protocol dispatch.
    Delivered,
    /// Handed to egress.
    Forwarded,
    /// Queued for reassembly.
    Pending,
    Dropped(DropReason),
}

// ============================================================================
// Pipeline
// ============================================================================

/// Values shared by every packet of one flow batch.
struct FlowCtx {
    config: IpConfig,
    loopback_if: bool,
    timestamp_ms: u32,
}

type FlowKey = (Ipv4Addr, Ipv4Addr, u8);

/// Peek `(src, dst, protocol)` without validating anything.
fn flow_key(pkt: &PacketBuf) -> Option<FlowKey> {
    let mut raw = [0u8; 11];
    if !pkt.read_at(9, &mut raw) {
        return None;
    }
    let src = Ipv4Addr::new(raw[3], raw[4], raw[5], raw[6]);
    let dst = Ipv4Addr::new(raw[7], raw[8], raw[9], raw[10]);
    Some((src, dst, raw[0]))
}

/// IPv4 receive engine.
pub struct IpInput {
    config: RwLock<IpConfig>,
    reass: ReassemblyTable,
    forwarder: Forwarder,
    stats: Arc<IpStats>,
    deps: Collaborators,
    timer_armed: AtomicBool,
    sweep_running: AtomicBool,
    stopped: AtomicBool,
}

impl IpInput {
    pub fn new(config: IpConfig, deps: Collaborators) -> Self {
        let stats = Arc::new(IpStats::new());
        IpInput {
            reass: ReassemblyTable::new(ReassemblyLimits::from_config(&config), stats.clone()),
            forwarder: Forwarder::new(config.max_interfaces),
            config: RwLock::new(config),
            stats,
            deps,
            timer_armed: AtomicBool::new(false),
            sweep_running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Process one received packet.
    pub fn submit(&self, mut pkt: PacketBuf, rcvif: InterfaceId) -> ProcessResult {
        self.stats.inc_total();
        pkt.rcvif = rcvif;
        let ctx = self.flow_ctx(rcvif);
        self.process(pkt, &ctx)
    }

    /// Process packets received together on `rcvif`.
    ///
    /// Consecutive packets with the same source, destination and protocol
    /// share one configuration snapshot and clock read. Results are in
    /// input order.
    pub fn submit_batch(&self, pkts: Vec<PacketBuf>, rcvif: InterfaceId) -> Vec<ProcessResult> {
        let mut results = Vec::with_capacity(pkts.len());
        let mut pkts = pkts.into_iter().peekable();

        while let Some(first) = pkts.next() {
            let key = flow_key(&first);
            let mut group = vec![first];
            if key.is_some() {
                while let Some(next) = pkts.next_if(|p| flow_key(p) == key) {
                    group.push(next);
                }
            }

            self.stats.inc_batches();
            self.stats.add_total(group.len() as u64);
            let ctx = self.flow_ctx(rcvif);
            for mut pkt in group {
                pkt.rcvif = rcvif;
                results.push(self.process(pkt, &ctx));
            }
        }
        results
    }

    /// Run one reassembly sweep. Called by the [`TimerScheduler`].
    pub fn handle_timer_tick(&self) {
        if self.sweep_running.swap(true, Ordering::Acquire) {
            // This tick was the outstanding timer; replace it.
            self.timer_armed.store(false, Ordering::Release);
            self.arm_timer();
            return;
        }
        self.timer_armed.store(false, Ordering::Release);
        let live = self.reass.sweep(self.deps.clock.now_ms());
        self.sweep_running.store(false, Ordering::Release);

        if live > 0 {
            self.arm_timer();
        }
    }

    /// Change the configuration. Reassembly limits apply from the next
    /// fragment; a lowered queue limit is enforced by the next sweep.
    pub fn update_config<F: FnOnce(&mut IpConfig)>(&self, f: F) {
        let cfg = {
            let mut guard = self.config.write();
            f(&mut guard);
            *guard
        };
        self.reass.set_limits(ReassemblyLimits::from_config(&cfg));
        info!(
            "ipv4: config updated: forwarding={} es_policy={:?} reass_queues={:?}",
            cfg.forwarding, cfg.interface_check, cfg.max_reass_queues
        );
    }

    /// Current configuration.
    pub fn config(&self) -> IpConfig {
        *self.config.read()
    }

    pub fn stats(&self) -> IpStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of datagrams waiting for fragments.
    pub fn pending_reassemblies(&self) -> usize {
        self.reass.live_queues()
    }

    /// Stop accepting packets and drop all reassembly and route state.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.reass.drain();
        self.forwarder.flush();
        info!("ipv4: input stopped");
    }

    fn flow_ctx(&self, rcvif: InterfaceId) -> FlowCtx {
        FlowCtx {
            config: *self.config.read(),
            loopback_if: self.deps.ifaces.kind(rcvif) == InterfaceKind::Loopback,
            timestamp_ms: self.deps.clock.ms_since_midnight_utc(),
        }
    }

    fn arm_timer(&self) {
        if self.stopped.load(Ordering::Acquire) || self.reass.live_queues() == 0 {
            return;
        }
        if !self.timer_armed.swap(true, Ordering::AcqRel) {
            self.deps.timer.schedule(self.config.read().sweep_period_ms);
        }
    }

    fn process(&self, mut pkt: PacketBuf, ctx: &FlowCtx) -> ProcessResult {
        if self.stopped.load(Ordering::Acquire) {
            self.stats.inc_odropped();
            return ProcessResult::Dropped(DropReason::PolicyDenied(PolicyReason::Stopped));
        }

        let from_loopback = ctx.loopback_if || pkt.flags.contains(PacketFlags::LOOPBACK);
        let opts = ValidateOptions {
            from_loopback,
            allow_linklocal_bad_ttl: ctx.config.allow_linklocal_bad_ttl,
        };
        let hdr = match ipv4::validate(&mut pkt, &*self.deps.checksum, opts) {
            Ok(hdr) => hdr,
            Err(e) => return self.malformed(e),
        };
        if hdr.ttl != MAXTTL && is_linklocal_pair(hdr.src, hdr.dst) {
            self.stats.inc_linklocal_badttl();
        }

        let (mut pkt, hdr) = if hdr.is_fragment() {
            match self.reassemble(pkt, &hdr) {
                Ok(done) => done,
                Err(result) => return result,
            }
        } else {
            (pkt, hdr)
        };

        let class = classify(
            &mut pkt,
            &hdr,
            &*self.deps.ifaces,
            &ctx.config,
            from_loopback,
            &self.stats,
        );
        trace!("ipv4: {} -> {} proto {} {:?}", hdr.src, hdr.dst, hdr.protocol, class);
        match class {
            Classification::Ours => self.input_local(pkt, hdr, ctx),
            Classification::Forward => self.input_forward(pkt, hdr, ctx),
            Classification::Drop(d) => self.policy_drop(d),
        }
    }

    fn reassemble(
        &self,
        pkt: PacketBuf,
        hdr: &Ipv4Header,
    ) -> Result<(PacketBuf, Ipv4Header), ProcessResult> {
        let outcome = self.reass.insert(pkt, hdr, &*self.deps.checksum);
        self.arm_timer();

        match outcome {
            ReassemblyOutcome::Completed(pkt) => match Ipv4Header::parse(pkt.head()) {
                Ok(hdr) => Ok((pkt, hdr)),
                Err(e) => Err(self.malformed(e)),
            },
            ReassemblyOutcome::Pending => Err(ProcessResult::Pending),
            ReassemblyOutcome::Dropped(FragmentDropReason::BadLength) => {
                Err(self.malformed(Malformed::BadFragmentLength))
            }
            ReassemblyOutcome::Dropped(reason) => {
                debug!(
                    "ipv4: fragment {} -> {} id {:#06x} dropped: {}",
                    hdr.src, hdr.dst, hdr.identification, reason
                );
                let reason = match reason {
                    FragmentDropReason::Disabled
                    | FragmentDropReason::NoMemory
                    | FragmentDropReason::TooManyFragments => {
                        DropReason::ResourceExhausted(reason)
                    }
                    _ => DropReason::Reassembly(reason),
                };
                Err(ProcessResult::Dropped(reason))
            }
        }
    }

    fn input_local(
        &self,
        mut pkt: PacketBuf,
        mut hdr: Ipv4Header,
        ctx: &FlowCtx,
    ) -> ProcessResult {
        match self.run_options(&mut pkt, &mut hdr, ctx) {
            Ok(false) => self.deliver(pkt, hdr),
            Ok(true) => self.forward(pkt, &hdr, true, ctx),
            Err(result) => result,
        }
    }

    fn input_forward(
        &self,
        mut pkt: PacketBuf,
        mut hdr: Ipv4Header,
        ctx: &FlowCtx,
    ) -> ProcessResult {
        match self.run_options(&mut pkt, &mut hdr, ctx) {
            Ok(srcrt) => self.forward(pkt, &hdr, srcrt, ctx),
            Err(result) => result,
        }
    }

    /// Process options if present. `Ok(true)` means a source route requires
    /// forwarding.
    fn run_options(
        &self,
        pkt: &mut PacketBuf,
        hdr: &mut Ipv4Header,
        ctx: &FlowCtx,
    ) -> Result<bool, ProcessResult> {
        if hdr.options_len() == 0 {
            return Ok(false);
        }
        let env = OptionEnv {
            ifaces: &*self.deps.ifaces,
            routes: &*self.deps.routes,
            config: &ctx.config,
            timestamp_ms: ctx.timestamp_ms,
        };
        match process_options(pkt, hdr, &env) {
            OptionVerdict::Continue => Ok(false),
            OptionVerdict::MustForward => Ok(true),
            OptionVerdict::Reject {
                kind,
                code,
                pointer,
            } => {
                self.stats.inc_badoptions();
                let snapshot = error_snapshot(pkt, hdr);
                self.deps.icmp.report(kind, code, u32::from(pointer), &snapshot);
                let reason = match kind {
                    IcmpKind::ParameterProblem => {
                        DropReason::Malformed(Malformed::BadOption { pointer })
                    }
                    _ if code == ICMP_CODE_SOURCE_ROUTE_FAILED => {
                        DropReason::PolicyDenied(PolicyReason::SourceRouteRefused)
                    }
                    _ => DropReason::ForwardingFailure(ForwardFailure::NoRoute),
                };
                debug!(
                    "ipv4: options from {} rejected: {} (icmp {}/{})",
                    hdr.src,
                    reason,
                    kind.to_raw(),
                    code
                );
                Err(ProcessResult::Dropped(reason))
            }
            OptionVerdict::Drop => {
                self.stats.inc_cantforward();
                Err(ProcessResult::Dropped(DropReason::PolicyDenied(
                    PolicyReason::SourceRouteRefused,
                )))
            }
        }
    }

    fn deliver(&self, mut pkt: PacketBuf, hdr: Ipv4Header) -> ProcessResult {
        pkt.strip_front(&*self.deps.checksum, hdr.header_len());
        self.stats.inc_delivered();
        self.deps.dispatch.deliver(hdr.protocol, &hdr, pkt);
        ProcessResult::Delivered
    }

    fn forward(
        &self,
        pkt: PacketBuf,
        hdr: &Ipv4Header,
        srcrt: bool,
        ctx: &FlowCtx,
    ) -> ProcessResult {
        if !ctx.config.forwarding {
            self.stats.inc_cantforward();
            return ProcessResult::Dropped(DropReason::PolicyDenied(
                PolicyReason::ForwardingDisabled,
            ));
        }
        let env = ForwardEnv {
            routes: &*self.deps.routes,
            ifaces: &*self.deps.ifaces,
            egress: &*self.deps.egress,
            icmp: &*self.deps.icmp,
            config: &ctx.config,
            stats: &self.stats,
        };
        match self.forwarder.forward(pkt, hdr, srcrt, &env) {
            Ok(()) => ProcessResult::Forwarded,
            Err(e) => ProcessResult::Dropped(DropReason::ForwardingFailure(e)),
        }
    }

    fn policy_drop(&self, d: ClassifyDrop) -> ProcessResult {
        let reason = match d {
            ClassifyDrop::InterfaceMismatch => {
                self.stats.inc_odropped();
                PolicyReason::InterfaceMismatch
            }
            // counted by the classifier
            ClassifyDrop::NotMember => PolicyReason::NotMember,
            ClassifyDrop::NotForwarding => {
                self.stats.inc_cantforward();
                PolicyReason::ForwardingDisabled
            }
        };
        ProcessResult::Dropped(DropReason::PolicyDenied(reason))
    }

    fn malformed(&self, e: Malformed) -> ProcessResult {
        match e {
            Malformed::TooShort | Malformed::BadFragmentLength => self.stats.inc_toosmall(),
            Malformed::BadVersion => self.stats.inc_badvers(),
            Malformed::BadHeaderLen | Malformed::HeaderExceedsBuffer => self.stats.inc_badhlen(),
            Malformed::BadChecksum => self.stats.inc_badsum(),
            Malformed::Martian => self.stats.inc_martian(),
            Malformed::LinkLocalTtl => self.stats.inc_linklocal_badttl(),
            Malformed::BadTotalLen => self.stats.inc_badlen(),
            Malformed::Truncated => self.stats.inc_tooshort(),
            Malformed::BadOption { .. } => self.stats.inc_badoptions(),
        }
        debug!("ipv4: malformed datagram dropped: {}", e);
        ProcessResult::Dropped(DropReason::Malformed(e))
    }
}

// ============================================================================
// Tests
// ============================================================================
