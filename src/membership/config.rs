//! Membership Configuration

use crate::membership::types::Member;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Configuration for one membership instance.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// The local member (required)
    pub host: Option<Member>,

    /// Seed members contacted on join, in order. The first one is the
    /// primary seed.
    pub seeds: Vec<Member>,

    /// Multiplier in the retransmit bound `multiplier * ceil(log10(n + 1))` (default: 3)
    pub retransmit_multiplier: u32,

    /// Pause between retransmissions of one update (default: 500ms)
    pub gossip_interval: Duration,

    /// Peers each update is sent to per retransmission (default: 3)
    pub gossip_fanout: usize,

    /// Interval between probes (default: 2s)
    pub failure_detector_interval: Duration,

    /// How long a member stays Suspect before it is declared down.
    /// Defaults to the failure-detector interval.
    pub suspicion_timeout: Option<Duration>,

    /// Timeout of a direct ping or a push (default: 1s)
    pub ping_timeout: Duration,

    /// Timeout of the full-state pull on join (default: 3s)
    pub join_timeout: Duration,

    /// Ask other members to probe a target whose direct ping failed (default: true)
    pub relay_ping_enabled: bool,

    /// Number of members asked to relay a probe (default: 3)
    pub relay_ping_count: usize,

    /// Skip the Down broadcast on shutdown (default: false)
    pub leave_without_notification: bool,

    /// Disable probing entirely; testing only (default: false)
    pub failure_detector_off: bool,

    /// Bound on remembered departed members (default: 128)
    pub left_members_capacity: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            host: None,
            seeds: Vec::new(),
            retransmit_multiplier: 3,
            gossip_interval: Duration::from_millis(500),
            gossip_fanout: 3,
            failure_detector_interval: Duration::from_millis(2000),
            suspicion_timeout: None,
            ping_timeout: Duration::from_millis(1000),
            join_timeout: Duration::from_millis(3000),
            relay_ping_enabled: true,
            relay_ping_count: 3,
            leave_without_notification: false,
            failure_detector_off: false,
            left_members_capacity: 128,
        }
    }
}

/// Resolve `host` to an IPv4 address.
///
/// Literal addresses are returned as-is; names go through the system
/// resolver and the first IPv4 result wins.
pub fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr, ConfigError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| ConfigError::InvalidAddress(host.to_string()))?;

    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| ConfigError::InvalidAddress(host.to_string()))
}

impl MembershipConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host member from a name and a resolvable host.
    ///
    /// The member gets a fresh random uid.
    pub fn host(
        self,
        node_name: impl Into<String>,
        host: &str,
        port: u16,
    ) -> Result<Self, ConfigError> {
        let ip = resolve_ipv4(host, port)?;
        let member = Member::new(node_name, ip, port)
            .with_hostname(host)
            .with_uid(uuid::Uuid::new_v4().to_string());
        Ok(self.host_member(member))
    }

    /// Set the host member directly.
    pub fn host_member(mut self, member: Member) -> Self {
        self.host = Some(member);
        self
    }

    /// Add a seed by host and port.
    pub fn seed(self, host: &str, port: u16) -> Result<Self, ConfigError> {
        let ip = resolve_ipv4(host, port)?;
        self.seed_member(Member::new("", ip, port).with_hostname(host))
    }

    /// Add a seed member. Adding the same address twice fails.
    pub fn seed_member(mut self, member: Member) -> Result<Self, ConfigError> {
        if self.seeds.contains(&member) {
            return Err(ConfigError::DuplicateSeed(member.address()));
        }
        self.seeds.push(member);
        Ok(self)
    }

    pub fn retransmit_multiplier(mut self, multiplier: u32) -> Self {
        self.retransmit_multiplier = multiplier;
        self
    }

    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn gossip_fanout(mut self, fanout: usize) -> Self {
        self.gossip_fanout = fanout;
        self
    }

    pub fn failure_detector_interval(mut self, interval: Duration) -> Self {
        self.failure_detector_interval = interval;
        self
    }

    pub fn suspicion_timeout(mut self, timeout: Duration) -> Self {
        self.suspicion_timeout = Some(timeout);
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn relay_ping_enabled(mut self, enabled: bool) -> Self {
        self.relay_ping_enabled = enabled;
        self
    }

    pub fn relay_ping_count(mut self, count: usize) -> Self {
        self.relay_ping_count = count;
        self
    }

    pub fn leave_without_notification(mut self, enabled: bool) -> Self {
        self.leave_without_notification = enabled;
        self
    }

    pub fn failure_detector_off(mut self, off: bool) -> Self {
        self.failure_detector_off = off;
        self
    }

    pub fn left_members_capacity(mut self, capacity: usize) -> Self {
        self.left_members_capacity = capacity;
        self
    }

    /// Effective suspicion timeout.
    pub fn effective_suspicion_timeout(&self) -> Duration {
        self.suspicion_timeout
            .unwrap_or(self.failure_detector_interval)
    }

    /// True when there is nobody to join: no seeds, or the host is the
    /// primary seed.
    pub fn starts_single_node(&self) -> bool {
        match (&self.host, self.seeds.first()) {
            (_, None) => true,
            (Some(host), Some(primary)) => host == primary,
            (None, Some(_)) => false,
        }
    }

    /// Seeds other than the host, in configured order.
    pub fn join_targets(&self) -> Vec<Member> {
        self.seeds
            .iter()
            .filter(|seed| self.host.as_ref() != Some(*seed))
            .cloned()
            .collect()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_none() {
            return Err(ConfigError::HostMemberEmpty);
        }
        if self.retransmit_multiplier == 0 {
            return Err(ConfigError::InvalidValue("retransmit_multiplier must be positive"));
        }
        if self.gossip_fanout == 0 {
            return Err(ConfigError::InvalidValue("gossip_fanout must be positive"));
        }
        if self.left_members_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "left_members_capacity must be positive",
            ));
        }
        if self.failure_detector_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "failure_detector_interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("host member is required")]
    HostMemberEmpty,
    #[error("cannot resolve an IPv4 address for {0}")]
    InvalidAddress(String),
    #[error("seed {0} added twice")]
    DuplicateSeed(SocketAddr),
    #[error("{0}")]
    InvalidValue(&'static str),
}
