//! node-keeper Library
//!
//! Gossip-based cluster membership with failure detection over a framed
//! TCP transport.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod infrastructure;
pub mod membership;
pub mod transport;

// Re-export commonly used types
pub use config::load_config;
pub use membership::{
    JoinStatus, Member, MemberEvent, MemberEventGenerator, Membership, MembershipConfig,
    MembershipError, MembershipEvent, Subscriber,
};
pub use transport::{ErrorCode, TcpTransport, Transportable, UnreachableTransport};
