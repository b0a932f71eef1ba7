//! Membership Cluster
//!
//! Owns the member table and one transport. Inbound gossip and pulls,
//! probe rounds and suspicion timers all funnel into the Sans-IO
//! [`MemberTable`] merges; [`Membership::execute`] then performs the returned
//! actions after the table lock is released.

use crate::infrastructure::ShutdownController;
use crate::membership::config::{ConfigError, MembershipConfig};
use crate::membership::gossip::{retransmit_limit, select_gossip_targets, select_many, select_random};
use crate::membership::message::{FullState, MemberUpdate, ProtocolMessage, PullRequest, PullResponse};
use crate::membership::queue::TimedFunctorQueue;
use crate::membership::state::{MergeAction, MergeOutcome, MemberTable};
use crate::membership::types::{Incarnation, Member, MemberStatus, MembershipEvent};
use crate::transport::{ErrorCode, InboundMessage, Transportable};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Observer of accepted state transitions.
///
/// Called after the member table lock is released, so implementations may
/// call back into [`Membership`].
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &MembershipEvent);
}

impl Subscriber for mpsc::UnboundedSender<MembershipEvent> {
    fn on_event(&self, event: &MembershipEvent) {
        let _ = self.send(event.clone());
    }
}

/// Errors returned by [`Membership::init`].
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("transport inbound channel already taken")]
    TransportEmpty,
}

/// How joining went. Only `Incomplete` reports a problem, and even then the
/// node is running and will converge through gossip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinStatus {
    /// No seeds, or the host is the primary seed
    SingleNode,
    /// Full state pulled from `seed`
    Joined { seed: SocketAddr, members: usize },
    /// No seed answered
    Incomplete { code: ErrorCode },
}

/// A running membership instance.
pub struct Membership {
    config: MembershipConfig,
    transport: Arc<dyn Transportable>,
    table: RwLock<MemberTable>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
    suspicion_timers: DashMap<SocketAddr, JoinHandle<()>>,
    scheduler: TimedFunctorQueue,
    shutdown: ShutdownController,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    this: Weak<Membership>,
}

impl Membership {
    /// Register the host, join through the seeds and start the background
    /// loops.
    ///
    /// Configuration problems fail synchronously. A join where no seed
    /// answers still returns a running instance with
    /// [`JoinStatus::Incomplete`].
    pub async fn init(
        transport: Arc<dyn Transportable>,
        config: MembershipConfig,
    ) -> Result<(Arc<Self>, JoinStatus), MembershipError> {
        config.validate()?;
        let host = config.host.clone().ok_or(ConfigError::HostMemberEmpty)?;
        let inbound_rx = transport
            .take_inbound_rx()
            .ok_or(MembershipError::TransportEmpty)?;

        let table = MemberTable::new(host.clone(), config.left_members_capacity);
        let scheduler = TimedFunctorQueue::new(config.gossip_interval);

        let membership = Arc::new_cyclic(|this| Membership {
            config,
            transport,
            table: RwLock::new(table),
            subscribers: RwLock::new(Vec::new()),
            suspicion_timers: DashMap::new(),
            scheduler,
            shutdown: ShutdownController::new("membership"),
            tasks: Mutex::new(Vec::new()),
            this: this.clone(),
        });

        tracing::info!("member {} starting", host);
        membership.spawn_inbound_loop(inbound_rx);

        let status = if membership.config.starts_single_node() {
            tracing::info!("{} starting as a single-node cluster", host);
            JoinStatus::SingleNode
        } else {
            membership.join().await
        };

        membership.spawn_failure_detector();

        Ok((membership, status))
    }

    // ==================== Queries ====================

    pub fn host(&self) -> Member {
        self.table.read().host().clone()
    }

    /// The host's current incarnation.
    pub fn incarnation(&self) -> Incarnation {
        self.table.read().incarnation()
    }

    /// Alive members, host included, sorted by identity.
    pub fn get_members(&self) -> Vec<Member> {
        self.table.read().members()
    }

    /// Members currently suspected.
    pub fn get_suspects(&self) -> Vec<Member> {
        self.table.read().suspects()
    }

    /// Members remembered as departed.
    pub fn get_left_members(&self) -> Vec<Member> {
        self.table.read().left()
    }

    pub fn member_status(&self, member: &Member) -> Option<MemberStatus> {
        self.table.read().status_of(member)
    }

    /// Alive members whose actor system is up.
    pub fn actor_systems(&self) -> Vec<Member> {
        self.table.read().actor_systems()
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Register an observer for every accepted transition.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.write().push(subscriber);
    }

    // ==================== Actor systems ====================

    /// Mark the host's actor system up and gossip it.
    pub fn set_self_actor_system_up(&self) {
        let outcome = self.table.write().set_self_actor_system_up();
        self.execute(outcome, None);
    }

    /// Re-gossip the host's ActorsUp, if its actor system is up.
    pub fn send_self_actor_system_up_gossip(&self) {
        let update = self.table.read().self_actor_system_update();
        if let Some(update) = update {
            self.disseminate_gossip(update, None);
        }
    }

    // ==================== Inbound ====================

    /// Merge a gossip push.
    pub fn handle_gossip(&self, from: SocketAddr, payload: &[u8]) {
        let update = match ProtocolMessage::decode(payload) {
            Ok(ProtocolMessage::Update(update)) => update,
            Ok(other) => {
                tracing::debug!("unexpected {} gossip from {}", other.type_name(), from);
                return;
            }
            Err(e) => {
                tracing::debug!("dropping gossip from {}: {}", from, e);
                return;
            }
        };

        tracing::trace!("gossip from {}: {:?}", from, update);
        let outcome = self.table.write().apply(&update);
        self.execute(outcome, Some(from));
    }

    /// Answer a pull request. Returns the encoded response, or an empty
    /// payload for requests that cannot be decoded.
    pub async fn handle_pull(&self, from: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let request = match ProtocolMessage::decode(payload) {
            Ok(ProtocolMessage::PullRequest(request)) => request,
            Ok(other) => {
                tracing::debug!("unexpected {} pull from {}", other.type_name(), from);
                return Vec::new();
            }
            Err(e) => {
                tracing::debug!("dropping pull from {}: {}", from, e);
                return Vec::new();
            }
        };

        let response = match request {
            PullRequest::FullState => {
                let state = self.table.read().full_state();
                tracing::debug!("serving full state ({} members) to {}", state.len(), from);
                ProtocolMessage::FullState(state)
            }
            PullRequest::Ping { members } => {
                self.merge_discovered(&members);
                PullResponse::PingReceived.into()
            }
            PullRequest::PingRelay { origin, target } => {
                tracing::debug!("probing {} on behalf of {}", target, origin);
                if self.probe(&target).await {
                    PullResponse::PingSuccess(target).into()
                } else {
                    PullResponse::PingFailure(target).into()
                }
            }
        };

        match response.encode() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("failed to encode pull response for {}: {}", from, e);
                Vec::new()
            }
        }
    }

    fn merge_discovered(&self, entries: &[(Member, Incarnation)]) {
        let outcome = {
            let mut table = self.table.write();
            let mut outcome = MergeOutcome::empty();
            for (member, incarnation) in entries {
                outcome.merge(table.discover(member, *incarnation));
            }
            outcome
        };
        self.execute(outcome, None);
    }

    fn merge_full_state(&self, state: &FullState) {
        let outcome = {
            let mut table = self.table.write();
            let mut outcome = MergeOutcome::empty();
            for (member, incarnation) in state.entries() {
                outcome.merge(table.apply(&MemberUpdate::up(member.clone(), *incarnation)));
            }
            outcome
        };
        // joining announces only the host; the seed already knows the rest
        self.execute(outcome.without_gossip(), None);
    }

    // ==================== Join ====================

    /// Pull full state from the first seed that answers.
    async fn join(&self) -> JoinStatus {
        let request = match ProtocolMessage::from(PullRequest::FullState).encode() {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("failed to encode join request: {}", e);
                return JoinStatus::Incomplete {
                    code: ErrorCode::Unknown,
                };
            }
        };

        let mut last_code = ErrorCode::Unknown;
        for seed in self.config.join_targets() {
            let seed_addr = seed.address();
            let result = self
                .transport
                .pull(seed_addr, request.clone(), self.config.join_timeout)
                .await;
            if !result.is_ok() {
                tracing::warn!("join through seed {} failed: {:?}", seed_addr, result.code);
                last_code = result.code;
                continue;
            }

            let state = match ProtocolMessage::decode(&result.payload) {
                Ok(ProtocolMessage::FullState(state)) => state,
                _ => {
                    tracing::warn!("seed {} answered join with an unexpected payload", seed_addr);
                    last_code = ErrorCode::Unknown;
                    continue;
                }
            };

            self.merge_full_state(&state);
            let up = {
                let table = self.table.read();
                MemberUpdate::up(table.host().clone(), table.incarnation())
            };
            self.disseminate_gossip(up, None);

            tracing::info!("joined cluster through {} ({} members)", seed_addr, state.len());
            return JoinStatus::Joined {
                seed: seed_addr,
                members: state.len(),
            };
        }

        tracing::warn!("no seed answered, continuing with an incomplete member list");
        JoinStatus::Incomplete { code: last_code }
    }

    fn needs_join(&self) -> bool {
        !self.config.starts_single_node() && self.table.read().alive_count() == 1
    }

    // ==================== Dissemination ====================

    /// Gossip `update` to a random subset of members, retransmitting it
    /// `retransmit_limit` times through the scheduler. `sender` is skipped
    /// where possible.
    pub fn disseminate_gossip(&self, update: MemberUpdate, sender: Option<SocketAddr>) {
        let (targets, limit) = {
            let table = self.table.read();
            let targets =
                select_gossip_targets(&table.gossip_candidates(), sender, self.config.gossip_fanout);
            let limit = retransmit_limit(self.config.retransmit_multiplier, table.alive_count());
            (targets, limit)
        };
        if targets.is_empty() || limit == 0 {
            return;
        }

        let payload = match ProtocolMessage::from(update).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("failed to encode gossip: {}", e);
                return;
            }
        };

        let transport = self.transport.clone();
        let timeout = self.config.ping_timeout;
        self.scheduler.push(
            move || {
                for to in &targets {
                    let transport = transport.clone();
                    let payload = payload.clone();
                    let to = *to;
                    tokio::spawn(async move {
                        let code = transport.push(to, payload, timeout).await;
                        if code != ErrorCode::Ok {
                            tracing::debug!("gossip push to {} failed: {:?}", to, code);
                        }
                    });
                }
            },
            limit,
        );
    }

    /// Push a Down straight to the member it names, once.
    ///
    /// A restarted process that still announces an incarnation we hold as
    /// Left refutes the Down and comes back above it.
    fn notify_left(&self, update: MemberUpdate) {
        if self.shutdown.is_shutdown() {
            return;
        }
        let to = update.member().address();
        let payload = match ProtocolMessage::from(update).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("failed to encode left notice: {}", e);
                return;
            }
        };

        tracing::debug!("telling {} it is known as left", to);
        let transport = self.transport.clone();
        let timeout = self.config.ping_timeout;
        tokio::spawn(async move {
            let code = transport.push(to, payload, timeout).await;
            if code != ErrorCode::Ok {
                tracing::debug!("left notice to {} failed: {:?}", to, code);
            }
        });
    }

    /// Perform the actions a merge returned.
    fn execute(&self, outcome: MergeOutcome, sender: Option<SocketAddr>) {
        let mut events = Vec::new();
        for action in outcome.actions {
            match action {
                MergeAction::Gossip(update) => self.disseminate_gossip(update, sender),
                MergeAction::Notify(event) => events.push(event),
                MergeAction::StartSuspicionTimer {
                    member,
                    incarnation,
                } => self.start_suspicion_timer(member, incarnation),
                MergeAction::CancelSuspicionTimer(member) => self.cancel_suspicion_timer(&member),
                MergeAction::NotifyLeft(update) => self.notify_left(update),
            }
        }
        self.notify(&events);
    }

    fn notify(&self, events: &[MembershipEvent]) {
        if events.is_empty() {
            return;
        }

        for event in events {
            match event {
                MembershipEvent::Up(m) => tracing::info!("member {} is up", m),
                MembershipEvent::Suspect(m) => tracing::info!("member {} is suspected", m),
                MembershipEvent::Recovery(m) => tracing::info!("member {} recovered", m),
                MembershipEvent::Down(m) => tracing::info!("member {} is down", m),
                MembershipEvent::ActorSystemUp(m) => {
                    tracing::info!("actor system on {} is up", m)
                }
            }
        }

        let subscribers = self.subscribers.read().clone();
        for subscriber in &subscribers {
            for event in events {
                subscriber.on_event(event);
            }
        }
    }

    // ==================== Failure detection ====================

    /// One probe round: ping a random alive member, fall back to relays,
    /// and suspect it only if every path failed.
    pub async fn ping(&self) {
        let target = {
            let table = self.table.read();
            select_random(&table.peers())
        };
        let Some(target) = target else {
            return;
        };

        if self.probe(&target).await {
            return;
        }

        if self.config.relay_ping_enabled && self.relay_ping(&target).await {
            tracing::debug!("{} unreachable directly but answered through a relay", target);
            return;
        }

        tracing::info!("direct and relayed probes of {} failed", target);
        let outcome = self.table.write().suspect(&target);
        self.execute(outcome, None);
    }

    /// Ask up to `relay_ping_count` other members to probe `target`.
    /// True as soon as one of them reaches it.
    pub async fn relay_ping(&self, target: &Member) -> bool {
        let relays = {
            let table = self.table.read();
            let candidates: Vec<Member> = table
                .peers()
                .into_iter()
                .filter(|m| m != target)
                .collect();
            select_many(&candidates, self.config.relay_ping_count)
        };
        if relays.is_empty() {
            return false;
        }

        let request = ProtocolMessage::from(PullRequest::PingRelay {
            origin: self.host(),
            target: target.clone(),
        });
        let payload = match request.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("failed to encode relay ping: {}", e);
                return false;
            }
        };

        // the relay needs its own ping timeout to answer
        let timeout = self.config.ping_timeout * 2;
        let mut probes = JoinSet::new();
        for relay in relays {
            let transport = self.transport.clone();
            let payload = payload.clone();
            probes.spawn(async move { transport.pull(relay.address(), payload, timeout).await });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok(result) = joined else {
                continue;
            };
            if !result.is_ok() {
                continue;
            }
            if let Ok(ProtocolMessage::PullResponse(PullResponse::PingSuccess(_))) =
                ProtocolMessage::decode(&result.payload)
            {
                return true;
            }
        }

        false
    }

    /// Direct ping carrying our alive members.
    async fn probe(&self, target: &Member) -> bool {
        let request = ProtocolMessage::from(PullRequest::Ping {
            members: self.table.read().alive_entries(),
        });
        let payload = match request.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("failed to encode ping: {}", e);
                return false;
            }
        };

        let result = self
            .transport
            .pull(target.address(), payload, self.config.ping_timeout)
            .await;
        if !result.is_ok() {
            tracing::debug!("ping to {} failed: {:?}", target, result.code);
            return false;
        }

        matches!(
            ProtocolMessage::decode(&result.payload),
            Ok(ProtocolMessage::PullResponse(PullResponse::PingReceived))
        )
    }

    async fn detector_round(&self) {
        if self.needs_join() {
            self.join().await;
        }
        if !self.config.failure_detector_off {
            self.ping().await;
        }
    }

    fn start_suspicion_timer(&self, member: Member, incarnation: Incarnation) {
        let timeout = self.config.effective_suspicion_timeout();
        let addr = member.address();
        let this = self.this.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(this) = this.upgrade() {
                this.on_suspicion_timeout(member, incarnation);
            }
        });

        if let Some(previous) = self.suspicion_timers.insert(addr, timer) {
            previous.abort();
        }
    }

    fn cancel_suspicion_timer(&self, member: &Member) {
        if let Some((_, timer)) = self.suspicion_timers.remove(&member.address()) {
            timer.abort();
        }
    }

    fn on_suspicion_timeout(&self, member: Member, incarnation: Incarnation) {
        self.suspicion_timers.remove(&member.address());

        let outcome = self.table.write().expire_suspicion(&member, incarnation);
        if outcome.is_changed() {
            tracing::info!("suspicion of {} expired", member);
        }
        self.execute(outcome, None);
    }

    // ==================== Background loops ====================

    fn spawn_inbound_loop(&self, mut inbound_rx: mpsc::Receiver<InboundMessage>) {
        let this = self.this.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    message = inbound_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let Some(membership) = this.upgrade() else {
                    break;
                };

                match message {
                    InboundMessage::Push { from, payload } => {
                        membership.handle_gossip(from, &payload);
                    }
                    InboundMessage::Pull {
                        from,
                        payload,
                        reply,
                    } => {
                        // relay pings wait on a probe; keep the loop moving
                        tokio::spawn(async move {
                            let response = membership.handle_pull(from, &payload).await;
                            let _ = reply.send(response);
                        });
                    }
                }
            }
            tracing::debug!("inbound loop stopped");
        });

        self.tasks.lock().push(task);
    }

    fn spawn_failure_detector(&self) {
        let this = self.this.clone();
        let interval = self.config.failure_detector_interval;
        let mut shutdown_rx = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let Some(membership) = this.upgrade() else {
                            break;
                        };
                        membership.detector_round().await;
                    }
                }
            }
            tracing::debug!("failure detector stopped");
        });

        self.tasks.lock().push(task);
    }

    // ==================== Shutdown ====================

    /// Leave the cluster.
    ///
    /// Announces a Down about the host (unless leave-without-notification is
    /// set), then stops the retransmission scheduler, the probe and inbound
    /// loops, and finally the transport.
    pub async fn shutdown(&self) {
        if self.shutdown.is_shutdown() {
            return;
        }

        if !self.config.leave_without_notification {
            self.announce_leave().await;
        }

        self.shutdown.shutdown();
        self.scheduler.shutdown().await;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.abort_suspicion_timers();

        self.transport.close().await;
        tracing::info!("member {} left the cluster", self.host());
    }

    async fn announce_leave(&self) {
        let (update, targets, limit) = {
            let mut table = self.table.write();
            let targets = table.gossip_candidates();
            if targets.is_empty() {
                return;
            }
            let limit = retransmit_limit(self.config.retransmit_multiplier, table.alive_count());
            (table.leave(), targets, limit)
        };

        let payload = match ProtocolMessage::from(update).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("failed to encode leave announcement: {}", e);
                return;
            }
        };

        tracing::info!("announcing departure to {} members", targets.len());
        for _ in 0..limit {
            let mut pushes = JoinSet::new();
            for to in &targets {
                let transport = self.transport.clone();
                let payload = payload.clone();
                let to = *to;
                let timeout = self.config.ping_timeout;
                pushes.spawn(async move { transport.push(to, payload, timeout).await });
            }
            while pushes.join_next().await.is_some() {}
        }
    }

    fn abort_suspicion_timers(&self) {
        self.suspicion_timers.retain(|_, timer| {
            timer.abort();
            false
        });
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        self.abort_suspicion_timers();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
