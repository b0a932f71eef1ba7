//! Member Table (Sans-IO)
//!
//! The single keyed store of member status and incarnation, plus the merge
//! rules applied to every update. Merges never do I/O: they return a
//! [`MergeOutcome`] listing what the caller must gossip, publish, or time.
//!
//! At equal incarnation a Down beats a Suspect and an Up: once an identity
//! is Left only a strictly higher incarnation brings it back.

use crate::membership::message::{FullState, MemberUpdate, UpdateKind};
use crate::membership::types::{Incarnation, Member, MemberRecord, MemberStatus, MembershipEvent};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

/// Side effect requested by a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAction {
    /// Disseminate this update
    Gossip(MemberUpdate),
    /// Publish to subscribers
    Notify(MembershipEvent),
    /// Start or restart the suspicion timer for a member
    StartSuspicionTimer {
        member: Member,
        incarnation: Incarnation,
    },
    /// Cancel a pending suspicion timer
    CancelSuspicionTimer(Member),
    /// Tell a member directly that it is known as Left at this incarnation,
    /// so a restarted process can refute above it
    NotifyLeft(MemberUpdate),
}

/// Result of a merge (Sans-IO pattern).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub actions: Vec<MergeAction>,
}

impl MergeOutcome {
    /// Create empty outcome
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add an action
    pub fn with_action(mut self, action: MergeAction) -> Self {
        self.actions.push(action);
        self
    }

    fn gossip(self, update: MemberUpdate) -> Self {
        self.with_action(MergeAction::Gossip(update))
    }

    fn notify(self, event: MembershipEvent) -> Self {
        self.with_action(MergeAction::Notify(event))
    }

    /// Whether the merge changed local state.
    pub fn is_changed(&self) -> bool {
        self.actions
            .iter()
            .any(|a| !matches!(a, MergeAction::NotifyLeft(_)))
    }

    /// Down updates to send straight to the member they name.
    pub fn left_notices(&self) -> impl Iterator<Item = &MemberUpdate> {
        self.actions.iter().filter_map(|a| match a {
            MergeAction::NotifyLeft(u) => Some(u),
            _ => None,
        })
    }

    /// Updates to disseminate.
    pub fn gossip_updates(&self) -> impl Iterator<Item = &MemberUpdate> {
        self.actions.iter().filter_map(|a| match a {
            MergeAction::Gossip(u) => Some(u),
            _ => None,
        })
    }

    /// Events to publish.
    pub fn events(&self) -> impl Iterator<Item = &MembershipEvent> {
        self.actions.iter().filter_map(|a| match a {
            MergeAction::Notify(e) => Some(e),
            _ => None,
        })
    }

    /// Append another outcome's actions.
    pub fn merge(&mut self, other: MergeOutcome) {
        self.actions.extend(other.actions);
    }

    /// Drop the gossip actions, keeping timers and events.
    pub fn without_gossip(mut self) -> Self {
        self.actions.retain(|a| !matches!(a, MergeAction::Gossip(_)));
        self
    }
}

/// Local view of the cluster.
#[derive(Debug, Clone)]
pub struct MemberTable {
    host: Member,
    records: BTreeMap<SocketAddr, MemberRecord>,
    left_order: VecDeque<SocketAddr>,
    left_capacity: usize,
}

impl MemberTable {
    /// Create a table holding only the host, Alive at incarnation 0.
    pub fn new(host: Member, left_capacity: usize) -> Self {
        let mut records = BTreeMap::new();
        records.insert(host.address(), MemberRecord::alive(host.clone(), 0));
        Self {
            host,
            records,
            left_order: VecDeque::new(),
            left_capacity,
        }
    }

    pub fn host(&self) -> &Member {
        &self.host
    }

    /// The host's own incarnation.
    pub fn incarnation(&self) -> Incarnation {
        self.records
            .get(&self.host.address())
            .map(|r| r.incarnation)
            .unwrap_or(0)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&MemberRecord> {
        self.records.get(addr)
    }

    pub fn status_of(&self, member: &Member) -> Option<MemberStatus> {
        self.records.get(&member.address()).map(|r| r.status)
    }

    fn with_status(&self, status: MemberStatus) -> impl Iterator<Item = &MemberRecord> {
        self.records.values().filter(move |r| r.status == status)
    }

    /// Alive members including the host, sorted by identity.
    pub fn members(&self) -> Vec<Member> {
        self.with_status(MemberStatus::Alive)
            .map(|r| r.member.clone())
            .collect()
    }

    pub fn suspects(&self) -> Vec<Member> {
        self.with_status(MemberStatus::Suspect)
            .map(|r| r.member.clone())
            .collect()
    }

    pub fn left(&self) -> Vec<Member> {
        self.with_status(MemberStatus::Left)
            .map(|r| r.member.clone())
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.with_status(MemberStatus::Alive).count()
    }

    /// Alive members other than the host; probe candidates.
    pub fn peers(&self) -> Vec<Member> {
        self.with_status(MemberStatus::Alive)
            .filter(|r| r.member != self.host)
            .map(|r| r.member.clone())
            .collect()
    }

    /// Alive and suspected members other than the host.
    ///
    /// Suspects still receive gossip so they can learn of and refute the
    /// suspicion.
    pub fn gossip_candidates(&self) -> Vec<SocketAddr> {
        self.records
            .values()
            .filter(|r| r.status != MemberStatus::Left && r.member != self.host)
            .map(|r| r.member.address())
            .collect()
    }

    /// Alive members with their incarnations.
    pub fn alive_entries(&self) -> Vec<(Member, Incarnation)> {
        self.with_status(MemberStatus::Alive)
            .map(|r| (r.member.clone(), r.incarnation))
            .collect()
    }

    pub fn full_state(&self) -> FullState {
        FullState::new(self.alive_entries())
    }

    /// Alive members whose actor system is up.
    pub fn actor_systems(&self) -> Vec<Member> {
        self.with_status(MemberStatus::Alive)
            .filter(|r| r.actor_system_up)
            .map(|r| r.member.clone())
            .collect()
    }

    /// Merge one received update.
    pub fn apply(&mut self, update: &MemberUpdate) -> MergeOutcome {
        match update.kind() {
            UpdateKind::Up => self.apply_up(update),
            UpdateKind::Suspect => self.apply_suspect(update),
            UpdateKind::Recovery => self.apply_recovery(update),
            UpdateKind::Down => self.apply_down(update),
            UpdateKind::ActorsUp => self.apply_actors_up(update),
        }
    }

    /// Add a member learned from a ping's member list.
    ///
    /// Only unknown identities are added; anything already known keeps its
    /// locally decided status. A Left member announcing itself at a stale
    /// incarnation is told so.
    pub fn discover(&mut self, member: &Member, incarnation: Incarnation) -> MergeOutcome {
        match self.records.get(&member.address()) {
            None => self.apply_up(&MemberUpdate::up(member.clone(), incarnation)),
            Some(record) if record.status == MemberStatus::Left => {
                Self::left_notice(record, incarnation)
            }
            Some(_) => MergeOutcome::empty(),
        }
    }

    /// Suspect a member whose direct and relayed probes failed.
    pub fn suspect(&mut self, member: &Member) -> MergeOutcome {
        match self.records.get(&member.address()) {
            Some(record) if record.is_alive() => {
                let update = MemberUpdate::suspect(record.member.clone(), record.incarnation);
                self.apply_suspect(&update)
            }
            _ => MergeOutcome::empty(),
        }
    }

    /// Declare a suspect down once its timer expires.
    ///
    /// Ignored if the member refuted or was re-suspected at another
    /// incarnation since the timer started.
    pub fn expire_suspicion(&mut self, member: &Member, incarnation: Incarnation) -> MergeOutcome {
        let Some(record) = self.records.get(&member.address()) else {
            return MergeOutcome::empty();
        };
        if record.status != MemberStatus::Suspect || record.incarnation != incarnation {
            return MergeOutcome::empty();
        }

        let member = record.member.clone();
        self.mark_left(&member, incarnation);
        MergeOutcome::empty()
            .gossip(MemberUpdate::down(member.clone(), incarnation))
            .notify(MembershipEvent::Down(member))
    }

    /// Bump the host's incarnation.
    pub fn increase_incarnation(&mut self) -> Incarnation {
        let next = self.incarnation() + 1;
        self.set_host_incarnation(next);
        next
    }

    /// Answer a Suspect or Down about the host with a fresher Up.
    pub fn refute(&mut self, incarnation: Incarnation) -> MergeOutcome {
        let next = self.incarnation().max(incarnation) + 1;
        self.set_host_incarnation(next);
        MergeOutcome::empty().gossip(MemberUpdate::up(self.host.clone(), next))
    }

    /// The Down a departing host announces about itself.
    pub fn leave(&mut self) -> MemberUpdate {
        let next = self.increase_incarnation();
        MemberUpdate::down(self.host.clone(), next)
    }

    /// Mark the host's actor system up and announce it.
    pub fn set_self_actor_system_up(&mut self) -> MergeOutcome {
        let host_addr = self.host.address();
        let incarnation = self.incarnation();
        match self.records.get_mut(&host_addr) {
            Some(record) if !record.actor_system_up => {
                record.actor_system_up = true;
                MergeOutcome::empty()
                    .gossip(MemberUpdate::actors_up(self.host.clone(), incarnation))
                    .notify(MembershipEvent::ActorSystemUp(self.host.clone()))
            }
            _ => MergeOutcome::empty(),
        }
    }

    /// The host's current ActorsUp announcement, if its actor system is up.
    pub fn self_actor_system_update(&self) -> Option<MemberUpdate> {
        self.records
            .get(&self.host.address())
            .filter(|r| r.actor_system_up)
            .map(|r| MemberUpdate::actors_up(self.host.clone(), r.incarnation))
    }

    fn set_host_incarnation(&mut self, incarnation: Incarnation) {
        if let Some(record) = self.records.get_mut(&self.host.address()) {
            record.incarnation = incarnation;
        }
    }

    /// A Down at the recorded incarnation for a Left member still
    /// announcing itself at or below it.
    fn left_notice(record: &MemberRecord, incarnation: Incarnation) -> MergeOutcome {
        if incarnation > record.incarnation {
            return MergeOutcome::empty();
        }
        MergeOutcome::empty().with_action(MergeAction::NotifyLeft(MemberUpdate::down(
            record.member.clone(),
            record.incarnation,
        )))
    }

    fn is_host(&self, member: &Member) -> bool {
        *member == self.host
    }

    fn insert_alive(&mut self, member: &Member, incarnation: Incarnation) {
        let addr = member.address();
        self.left_order.retain(|a| *a != addr);
        self.records
            .insert(addr, MemberRecord::alive(member.clone(), incarnation));
    }

    fn mark_left(&mut self, member: &Member, incarnation: Incarnation) {
        let addr = member.address();
        let record = self
            .records
            .entry(addr)
            .or_insert_with(|| MemberRecord::alive(member.clone(), incarnation));
        record.status = MemberStatus::Left;
        record.incarnation = record.incarnation.max(incarnation);
        record.actor_system_up = false;

        self.left_order.retain(|a| *a != addr);
        self.left_order.push_back(addr);
        while self.left_order.len() > self.left_capacity {
            if let Some(oldest) = self.left_order.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }

    fn apply_up(&mut self, update: &MemberUpdate) -> MergeOutcome {
        let member = update.member();
        let incarnation = update.incarnation();
        if self.is_host(member) {
            return MergeOutcome::empty();
        }

        let Some(record) = self.records.get_mut(&member.address()) else {
            self.insert_alive(member, incarnation);
            return MergeOutcome::empty()
                .gossip(update.clone())
                .notify(MembershipEvent::Up(member.clone()));
        };

        match record.status {
            MemberStatus::Alive if incarnation > record.incarnation => {
                record.incarnation = incarnation;
                record.member = member.clone();
                MergeOutcome::empty().gossip(update.clone())
            }
            MemberStatus::Alive => MergeOutcome::empty(),
            MemberStatus::Suspect if incarnation >= record.incarnation => {
                record.status = MemberStatus::Alive;
                record.incarnation = incarnation;
                MergeOutcome::empty()
                    .with_action(MergeAction::CancelSuspicionTimer(member.clone()))
                    .gossip(update.clone())
                    .notify(MembershipEvent::Recovery(member.clone()))
            }
            MemberStatus::Suspect => MergeOutcome::empty(),
            MemberStatus::Left if incarnation > record.incarnation => {
                self.insert_alive(member, incarnation);
                MergeOutcome::empty()
                    .gossip(update.clone())
                    .notify(MembershipEvent::Up(member.clone()))
            }
            MemberStatus::Left => Self::left_notice(record, incarnation),
        }
    }

    fn apply_suspect(&mut self, update: &MemberUpdate) -> MergeOutcome {
        let member = update.member();
        let incarnation = update.incarnation();
        if self.is_host(member) {
            return self.refute(incarnation);
        }

        let Some(record) = self.records.get_mut(&member.address()) else {
            return MergeOutcome::empty();
        };

        match record.status {
            MemberStatus::Alive if incarnation >= record.incarnation => {
                record.status = MemberStatus::Suspect;
                record.incarnation = incarnation;
                let member = record.member.clone();
                MergeOutcome::empty()
                    .with_action(MergeAction::StartSuspicionTimer {
                        member: member.clone(),
                        incarnation,
                    })
                    .gossip(update.clone())
                    .notify(MembershipEvent::Suspect(member))
            }
            MemberStatus::Suspect if incarnation > record.incarnation => {
                record.incarnation = incarnation;
                MergeOutcome::empty()
                    .with_action(MergeAction::StartSuspicionTimer {
                        member: record.member.clone(),
                        incarnation,
                    })
                    .gossip(update.clone())
            }
            _ => MergeOutcome::empty(),
        }
    }

    fn apply_recovery(&mut self, update: &MemberUpdate) -> MergeOutcome {
        let member = update.member();
        let incarnation = update.incarnation();
        if self.is_host(member) {
            return MergeOutcome::empty();
        }

        match self.records.get_mut(&member.address()) {
            Some(record)
                if record.status == MemberStatus::Suspect && incarnation >= record.incarnation =>
            {
                record.status = MemberStatus::Alive;
                record.incarnation = incarnation;
                MergeOutcome::empty()
                    .with_action(MergeAction::CancelSuspicionTimer(member.clone()))
                    .gossip(update.clone())
                    .notify(MembershipEvent::Recovery(member.clone()))
            }
            _ => MergeOutcome::empty(),
        }
    }

    fn apply_down(&mut self, update: &MemberUpdate) -> MergeOutcome {
        let member = update.member();
        let incarnation = update.incarnation();
        if self.is_host(member) {
            return self.refute(incarnation);
        }

        let Some(record) = self.records.get(&member.address()) else {
            // Remember it so stale Ups at this incarnation cannot admit it.
            self.mark_left(member, incarnation);
            return MergeOutcome::empty();
        };

        match record.status {
            MemberStatus::Alive | MemberStatus::Suspect => {
                let was_suspect = record.status == MemberStatus::Suspect;
                self.mark_left(member, incarnation);
                let mut outcome = MergeOutcome::empty();
                if was_suspect {
                    outcome = outcome.with_action(MergeAction::CancelSuspicionTimer(member.clone()));
                }
                outcome
                    .gossip(update.clone())
                    .notify(MembershipEvent::Down(member.clone()))
            }
            MemberStatus::Left if incarnation > record.incarnation => {
                self.mark_left(member, incarnation);
                MergeOutcome::empty().gossip(update.clone())
            }
            MemberStatus::Left => MergeOutcome::empty(),
        }
    }

    fn apply_actors_up(&mut self, update: &MemberUpdate) -> MergeOutcome {
        let member = update.member();
        let incarnation = update.incarnation();
        if self.is_host(member) {
            return MergeOutcome::empty();
        }

        let known = self
            .records
            .get(&member.address())
            .map(|r| (r.status, r.incarnation));

        // the ActorsUp itself is gossiped below
        let mut outcome = match known {
            Some((MemberStatus::Alive, _)) => MergeOutcome::empty(),
            Some((MemberStatus::Suspect, stored)) if incarnation < stored => {
                return MergeOutcome::empty();
            }
            Some((MemberStatus::Suspect, _)) => self
                .apply_recovery(&MemberUpdate::recovery(member.clone(), incarnation))
                .without_gossip(),
            Some((MemberStatus::Left, _)) | None => {
                let up = self.apply_up(&MemberUpdate::up(member.clone(), incarnation));
                if !up.is_changed() {
                    return up;
                }
                up.without_gossip()
            }
        };

        let Some(record) = self.records.get_mut(&member.address()) else {
            return outcome;
        };
        if !record.is_alive() || record.actor_system_up || incarnation < record.incarnation {
            return outcome;
        }

        record.actor_system_up = true;
        record.incarnation = incarnation;
        outcome = outcome
            .gossip(update.clone())
            .notify(MembershipEvent::ActorSystemUp(record.member.clone()));
        outcome
    }
}
