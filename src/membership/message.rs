//! Protocol Messages
//!
//! Payloads carried inside transport frames. Member updates travel as gossip
//! pushes; full-state and ping exchanges travel as pulls.

use crate::membership::types::{Incarnation, Member};
use serde::{Deserialize, Serialize};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

/// Status carried by a member update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    Up,
    Down,
    Suspect,
    Recovery,
    ActorsUp,
}

/// A claim about one member's status at an incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    kind: UpdateKind,
    member: Member,
    incarnation: Incarnation,
}

impl MemberUpdate {
    pub fn new(kind: UpdateKind, member: Member, incarnation: Incarnation) -> Self {
        Self {
            kind,
            member,
            incarnation,
        }
    }

    pub fn up(member: Member, incarnation: Incarnation) -> Self {
        Self::new(UpdateKind::Up, member, incarnation)
    }

    pub fn down(member: Member, incarnation: Incarnation) -> Self {
        Self::new(UpdateKind::Down, member, incarnation)
    }

    pub fn suspect(member: Member, incarnation: Incarnation) -> Self {
        Self::new(UpdateKind::Suspect, member, incarnation)
    }

    pub fn recovery(member: Member, incarnation: Incarnation) -> Self {
        Self::new(UpdateKind::Recovery, member, incarnation)
    }

    pub fn actors_up(member: Member, incarnation: Incarnation) -> Self {
        Self::new(UpdateKind::ActorsUp, member, incarnation)
    }

    pub fn kind(&self) -> UpdateKind {
        self.kind
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn is_up_message(&self) -> bool {
        self.kind == UpdateKind::Up
    }

    pub fn is_down_message(&self) -> bool {
        self.kind == UpdateKind::Down
    }

    pub fn is_suspect_message(&self) -> bool {
        self.kind == UpdateKind::Suspect
    }

    pub fn is_recovery_message(&self) -> bool {
        self.kind == UpdateKind::Recovery
    }

    pub fn is_actors_up_message(&self) -> bool {
        self.kind == UpdateKind::ActorsUp
    }
}

/// Anti-entropy snapshot: every alive member with its incarnation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullState {
    entries: Vec<(Member, Incarnation)>,
}

impl FullState {
    pub fn new(entries: Vec<(Member, Incarnation)>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[(Member, Incarnation)] {
        &self.entries
    }

    pub fn members(&self) -> Vec<Member> {
        self.entries.iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Requests answered through a pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullRequest {
    /// Ask for a [`FullState`]
    FullState,
    /// Direct probe; carries the sender's alive members for discovery
    Ping { members: Vec<(Member, Incarnation)> },
    /// Ask the receiver to probe `target` on behalf of `origin`
    PingRelay { origin: Member, target: Member },
}

/// Answers to ping and relay-ping pulls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullResponse {
    PingSuccess(Member),
    PingFailure(Member),
    PingReceived,
}

/// Everything that travels inside a frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Update(MemberUpdate),
    FullState(FullState),
    PullRequest(PullRequest),
    PullResponse(PullResponse),
}

impl ProtocolMessage {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(MessageError::Encode)
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(data).map_err(MessageError::Decode)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ProtocolMessage::Update(_) => "Update",
            ProtocolMessage::FullState(_) => "FullState",
            ProtocolMessage::PullRequest(_) => "PullRequest",
            ProtocolMessage::PullResponse(_) => "PullResponse",
        }
    }
}

impl From<MemberUpdate> for ProtocolMessage {
    fn from(update: MemberUpdate) -> Self {
        ProtocolMessage::Update(update)
    }
}

impl From<PullRequest> for ProtocolMessage {
    fn from(request: PullRequest) -> Self {
        ProtocolMessage::PullRequest(request)
    }
}

impl From<PullResponse> for ProtocolMessage {
    fn from(response: PullResponse) -> Self {
        ProtocolMessage::PullResponse(response)
    }
}
