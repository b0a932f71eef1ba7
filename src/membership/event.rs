//! Snapshot differ for status bridges.
//!
//! Turns successive member lists into up/down changes without any of the
//! failure-detection semantics of the core.

use crate::membership::types::Member;
use std::collections::BTreeSet;

/// A change between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    MemberUp(Member),
    MemberDown(Member),
    ActorSystemUp(Member),
    ActorSystemDown(Member),
}

impl MemberEvent {
    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::MemberUp(m)
            | MemberEvent::MemberDown(m)
            | MemberEvent::ActorSystemUp(m)
            | MemberEvent::ActorSystemDown(m) => m,
        }
    }
}

/// Remembers the last snapshot and reports what changed since.
#[derive(Debug, Default)]
pub struct MemberEventGenerator {
    members: BTreeSet<Member>,
    actor_systems: BTreeSet<Member>,
}

impl MemberEventGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff `members` against the previous member snapshot.
    ///
    /// Ups come first, then downs, each in identity order.
    pub fn update(&mut self, members: impl IntoIterator<Item = Member>) -> Vec<MemberEvent> {
        let next: BTreeSet<Member> = members.into_iter().collect();
        let events = diff(&self.members, &next, MemberEvent::MemberUp, MemberEvent::MemberDown);
        self.members = next;
        events
    }

    /// Same as [`update`](Self::update) for the actor-system snapshot.
    pub fn update_actor_systems(
        &mut self,
        members: impl IntoIterator<Item = Member>,
    ) -> Vec<MemberEvent> {
        let next: BTreeSet<Member> = members.into_iter().collect();
        let events = diff(
            &self.actor_systems,
            &next,
            MemberEvent::ActorSystemUp,
            MemberEvent::ActorSystemDown,
        );
        self.actor_systems = next;
        events
    }

    /// The current member baseline.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }
}

fn diff(
    previous: &BTreeSet<Member>,
    next: &BTreeSet<Member>,
    up: fn(Member) -> MemberEvent,
    down: fn(Member) -> MemberEvent,
) -> Vec<MemberEvent> {
    let ups = next.difference(previous).cloned().map(up);
    let downs = previous.difference(next).cloned().map(down);
    ups.chain(downs).collect()
}
