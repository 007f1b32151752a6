//! IPv4 receive path
//!
//! This crate implements the input side of an IPv4 stack:
//! - Header validation (length, version, checksum, martians)
//! - Fragment reassembly with overlap trimming and timed expiry
//! - Destination classification with weak/hybrid/strict end-system policy
//! - IP option processing (record route, timestamp, source routing)
//! - Forwarding with TTL handling, redirects and ICMP error signalling
//!
//! # Design
//!
//! Everything outside the IP layer is a collaborator trait: the interface
//! table, route resolver, checksum engine, ICMP reporter, egress path,
//! protocol dispatch, timer and clock. [`IpInput`] owns the reassembly
//! table and forwarding route cache and is driven by [`IpInput::submit`]
//! and [`IpInput::handle_timer_tick`].
//!
//! # Example
//!
//! ```ignore
//! let input = IpInput::new(IpConfig::default(), collaborators);
//! match input.submit(PacketBuf::from_vec(frame_payload, ifid), ifid) {
//!     ProcessResult::Dropped(reason) => log::debug!("dropped: {}", reason),
//!     _ => {}
//! }
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buffer;
pub mod checksum;
pub mod classify;
pub mod config;
pub mod device;
pub mod forward;
pub mod fragment;
pub mod icmp;
pub mod ipv4;
pub mod options;
pub mod route;
pub mod stack;
pub mod stats;

#[cfg(test)]
mod testutil;

pub use buffer::{PacketBuf, PacketFlags, RxChecksum};
pub use checksum::{ChecksumEngine, InternetChecksum};
pub use classify::{classify, Classification, ClassifyDrop};
pub use config::{EsPolicy, IpConfig, IpConfigBuilder, QueueLimit};
pub use device::{Egress, IfAddr, InterfaceId, InterfaceKind, InterfaceTable, TxError};
pub use forward::{ForwardEnv, ForwardFailure, Forwarder};
pub use fragment::{
    FragmentDropReason, FragmentKey, ReassemblyLimits, ReassemblyOutcome, ReassemblyTable,
};
pub use icmp::{error_snapshot, ErrorReporter, IcmpKind};
pub use ipv4::{validate, Ipv4Header, Ipv4Proto, Malformed, ValidateOptions};
pub use options::{process_options, OptionEnv, OptionVerdict, ReturnRoute, SavedRoute};
pub use route::{RouteCache, RouteResolver, RouteResult};
pub use stack::{
    Clock, Collaborators, DropReason, IpInput, PolicyReason, ProcessResult, ProtocolDispatch,
    TimerScheduler,
};
pub use stats::{IpStats, IpStatsSnapshot};
