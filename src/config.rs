//! Receive path configuration.
//!
//! Every knob has an integrator default (see [`IpConfig::default`]); a
//! running [`IpInput`](crate::stack::IpInput) accepts updates through
//! `update_config`.

/// Default reassembly queue budget.
pub const DEFAULT_MAX_REASS_QUEUES: usize = 1024;

/// Default ceiling on fragments held for one datagram.
pub const DEFAULT_MAX_FRAGS_PER_DATAGRAM: usize = 128;

/// Default reassembly lifetime in sweep ticks.
pub const DEFAULT_FRAG_TTL_TICKS: u8 = 60;

/// Default sweep period in milliseconds (60 ticks = 30 seconds).
pub const DEFAULT_SWEEP_PERIOD_MS: u64 = 500;

/// Default number of per-interface route cache slots.
pub const DEFAULT_MAX_INTERFACES: usize = 64;

/// Limit on live reassembly queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLimit {
    /// No limit.
    Unlimited,
    /// At most this many queues; `Limit(0)` disables reassembly.
    Limit(usize),
}

impl QueueLimit {
    /// Returns true if `count` live queues leave no room for another.
    #[inline]
    pub fn is_full(self, count: usize) -> bool {
        match self {
            QueueLimit::Unlimited => false,
            QueueLimit::Limit(max) => count >= max,
        }
    }

    /// Returns true if `count` live queues exceed the limit.
    #[inline]
    pub fn is_exceeded(self, count: usize) -> bool {
        match self {
            QueueLimit::Unlimited => false,
            QueueLimit::Limit(max) => count > max,
        }
    }
}

/// End-system model applied to unicast datagrams that name a local address
/// owned by a different interface than the one they arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EsPolicy {
    /// Accept on any interface (RFC 1122 weak end-system).
    #[default]
    Weak,
    /// Strict only when the owning interface is a tunnel.
    Hybrid,
    /// Require the arrival interface to own the address.
    Strict,
}

/// Receive path configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpConfig {
    /// Live reassembly queue budget.
    pub max_reass_queues: QueueLimit,
    /// Fragments one datagram may hold before it is abandoned.
    pub max_frags_per_datagram: usize,
    /// Act as a router.
    pub forwarding: bool,
    /// Interface match policy.
    pub interface_check: EsPolicy,
    /// Send ICMP host redirects.
    pub send_redirects: bool,
    /// Forward datagrams along a source route through this host.
    pub forward_source_routed: bool,
    /// Accept datagrams whose source route ends at this host.
    pub accept_source_routed: bool,
    /// Accept link-local traffic whose TTL is not 255.
    pub allow_linklocal_bad_ttl: bool,
    /// Report transmit resource exhaustion with Source Quench.
    pub send_source_quench: bool,
    /// Reassembly lifetime in sweep ticks.
    pub frag_ttl_ticks: u8,
    /// Sweep period in milliseconds.
    pub sweep_period_ms: u64,
    /// Number of per-interface route cache slots.
    pub max_interfaces: usize,
}

impl Default for IpConfig {
    fn default() -> Self {
        IpConfig {
            max_reass_queues: QueueLimit::Limit(DEFAULT_MAX_REASS_QUEUES),
            max_frags_per_datagram: DEFAULT_MAX_FRAGS_PER_DATAGRAM,
            forwarding: false,
            interface_check: EsPolicy::Weak,
            send_redirects: true,
            forward_source_routed: false,
            accept_source_routed: false,
            allow_linklocal_bad_ttl: true,
            send_source_quench: false,
            frag_ttl_ticks: DEFAULT_FRAG_TTL_TICKS,
            sweep_period_ms: DEFAULT_SWEEP_PERIOD_MS,
            max_interfaces: DEFAULT_MAX_INTERFACES,
        }
    }
}

impl IpConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> IpConfigBuilder {
        IpConfigBuilder {
            config: IpConfig::default(),
        }
    }
}

/// Builder for [`IpConfig`].
#[derive(Debug, Clone)]
pub struct IpConfigBuilder {
    config: IpConfig,
}

impl IpConfigBuilder {
    pub fn max_reass_queues(mut self, limit: QueueLimit) -> Self {
        self.config.max_reass_queues = limit;
        self
    }

    pub fn max_frags_per_datagram(mut self, max: usize) -> Self {
        self.config.max_frags_per_datagram = max;
        self
    }

    pub fn forwarding(mut self, enabled: bool) -> Self {
        self.config.forwarding = enabled;
        self
    }

    pub fn interface_check(mut self, policy: EsPolicy) -> Self {
        self.config.interface_check = policy;
        self
    }

    pub fn send_redirects(mut self, enabled: bool) -> Self {
        self.config.send_redirects = enabled;
        self
    }

    pub fn forward_source_routed(mut self, enabled: bool) -> Self {
        self.config.forward_source_routed = enabled;
        self
    }

    pub fn accept_source_routed(mut self, enabled: bool) -> Self {
        self.config.accept_source_routed = enabled;
        self
    }

    pub fn allow_linklocal_bad_ttl(mut self, allow: bool) -> Self {
        self.config.allow_linklocal_bad_ttl = allow;
        self
    }

    pub fn send_source_quench(mut self, enabled: bool) -> Self {
        self.config.send_source_quench = enabled;
        self
    }

    /// Reassembly lifetime in sweep ticks (at least one).
    pub fn frag_ttl_ticks(mut self, ticks: u8) -> Self {
        self.config.frag_ttl_ticks = ticks.max(1);
        self
    }

    /// Sweep period in milliseconds (at least one).
    pub fn sweep_period_ms(mut self, ms: u64) -> Self {
        self.config.sweep_period_ms = ms.max(1);
        self
    }

    pub fn max_interfaces(mut self, n: usize) -> Self {
        self.config.max_interfaces = n;
        self
    }

    pub fn build(self) -> IpConfig {
        self.config
    }
}
