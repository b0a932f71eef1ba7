//! Membership data types.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Per-member counter; only the member itself increments its own.
pub type Incarnation = u64;

/// A cluster member.
///
/// Identity is `(ip, port)`. Name, hostname, role and uid are descriptive
/// and ignored by equality, ordering and hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub node_name: String,
    pub hostname: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub role: String,
    /// Random per-process id; changes when a node restarts
    pub uid: String,
}

impl Member {
    pub fn new(node_name: impl Into<String>, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            node_name: node_name.into(),
            hostname: ip.to_string(),
            ip,
            port,
            role: String::new(),
            uid: String::new(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    /// Address the member's transport listens on.
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }

    fn identity(&self) -> (Ipv4Addr, u16) {
        (self.ip, self.port)
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Member {}

impl PartialOrd for Member {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Member {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_name, self.ip, self.port)
    }
}

/// Status of a member as seen locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Member is reachable
    Alive,
    /// Probes failed; may still refute
    Suspect,
    /// Member left or was declared down
    Left,
}

/// Everything the local node knows about one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub member: Member,
    pub status: MemberStatus,
    pub incarnation: Incarnation,
    pub actor_system_up: bool,
}

impl MemberRecord {
    pub fn alive(member: Member, incarnation: Incarnation) -> Self {
        Self {
            member,
            status: MemberStatus::Alive,
            incarnation,
            actor_system_up: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }
}

/// State transitions published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A member joined or rejoined
    Up(Member),
    /// A member failed probing and is suspected
    Suspect(Member),
    /// A suspected member refuted the suspicion
    Recovery(Member),
    /// A member left or its suspicion expired
    Down(Member),
    /// A member's actor system came up
    ActorSystemUp(Member),
}

impl MembershipEvent {
    pub fn member(&self) -> &Member {
        match self {
            MembershipEvent::Up(m)
            | MembershipEvent::Suspect(m)
            | MembershipEvent::Recovery(m)
            | MembershipEvent::Down(m)
            | MembershipEvent::ActorSystemUp(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_ignores_descriptive_fields() {
        let a = Member::new("node-a", Ipv4Addr::LOCALHOST, 4748).with_role("worker");
        let b = Member::new("renamed", Ipv4Addr::LOCALHOST, 4748).with_uid("other");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_ordering_by_ip_then_port() {
        let a = Member::new("a", Ipv4Addr::new(10, 0, 0, 1), 9000);
        let b = Member::new("b", Ipv4Addr::new(10, 0, 0, 1), 9001);
        let c = Member::new("c", Ipv4Addr::new(10, 0, 0, 2), 1);

        let mut members = vec![c.clone(), b.clone(), a.clone()];
        members.sort();
        assert_eq!(members, vec![a, b, c]);
    }

    #[test]
    fn test_address() {
        let m = Member::new("node", Ipv4Addr::new(192, 168, 1, 5), 4748);
        assert_eq!(m.address(), "192.168.1.5:4748".parse::<SocketAddr>().unwrap());
        assert_eq!(m.hostname, "192.168.1.5");
        assert_eq!(m.to_string(), "node@192.168.1.5:4748");
    }

    #[test]
    fn test_member_record_alive() {
        let record = MemberRecord::alive(Member::new("n", Ipv4Addr::LOCALHOST, 1), 3);
        assert!(record.is_alive());
        assert_eq!(record.incarnation, 3);
        assert!(!record.actor_system_up);
    }
}
