//! Cluster Membership
//!
//! SWIM-style membership: every node keeps one keyed table of members with
//! an `Alive`, `Suspect` or `Left` status and the last incarnation seen.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                      Membership                       │
//! │                                                       │
//! │  inbound loop ──► handle_gossip / handle_pull ─┐      │
//! │  failure detector ──► ping / relay_ping ───────┤      │
//! │  suspicion timers ─────────────────────────────┤      │
//! │                                                ▼      │
//! │                 MemberTable (Sans-IO merges)          │
//! │                                                │      │
//! │             MergeOutcome ◄─────────────────────┘      │
//! │       gossip ──► TimedFunctorQueue ──► push           │
//! │       events ──► subscribers (lock released)          │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! Merges are idempotent and commutative across incarnations, so the
//! transport is free to drop, duplicate and reorder gossip.

pub mod config;
pub mod cluster;
pub mod event;
pub mod gossip;
pub mod message;
pub mod queue;
pub mod state;
pub mod types;

pub use self::config::{resolve_ipv4, ConfigError, MembershipConfig};
pub use self::cluster::{JoinStatus, Membership, MembershipError, Subscriber};
pub use self::event::{MemberEvent, MemberEventGenerator};
pub use self::gossip::retransmit_limit;
pub use self::message::{
    FullState, MemberUpdate, MessageError, ProtocolMessage, PullRequest, PullResponse, UpdateKind,
};
pub use self::queue::TimedFunctorQueue;
pub use self::state::{MemberTable, MergeAction, MergeOutcome};
pub use self::types::{Incarnation, Member, MemberRecord, MemberStatus, MembershipEvent};
