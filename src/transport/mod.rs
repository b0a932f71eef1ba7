//! Transport
//!
//! Push (fire-and-forget) and pull (request/response) delivery of opaque
//! payloads between nodes. The membership layer only sees [`Transportable`];
//! [`TcpTransport`] is the production implementation and
//! [`UnreachableTransport`] wraps any transport to simulate partitions.
//!
//! ## Wire format
//!
//! Every TCP frame is `[u32 BE length][bincode Envelope]`. The envelope names
//! the sender's listening address so handlers can tell peers apart even
//! though each push/pull uses a fresh outbound connection.

mod frame;
mod tcp;
mod unreachable;

pub use frame::{decode_length, encode_frame, FrameDecoder, FrameError, HEADER_SIZE, MAX_FRAME_SIZE};
pub use tcp::TcpTransport;
pub use unreachable::UnreachableTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Outcome of a transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok,
    /// No answer within the caller's timeout
    Timeout,
    /// Refused, reset, unreachable or undecodable
    Unknown,
}

/// Result of a pull: an error code plus the peer's response bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    pub code: ErrorCode,
    pub payload: Vec<u8>,
}

impl PullResult {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            code: ErrorCode::Ok,
            payload,
        }
    }

    pub fn error(code: ErrorCode) -> Self {
        Self {
            code,
            payload: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok
    }
}

/// A message delivered to the local node.
#[derive(Debug)]
pub enum InboundMessage {
    /// Fire-and-forget payload (gossip)
    Push { from: SocketAddr, payload: Vec<u8> },
    /// Request expecting an answer on `reply`. Dropping `reply` answers with
    /// an empty payload.
    Pull {
        from: SocketAddr,
        payload: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
}

impl InboundMessage {
    pub fn from(&self) -> SocketAddr {
        match self {
            InboundMessage::Push { from, .. } | InboundMessage::Pull { from, .. } => *from,
        }
    }
}

/// Frame body on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Envelope {
    Push { from: SocketAddr, payload: Vec<u8> },
    Pull { from: SocketAddr, payload: Vec<u8> },
    PullResponse { payload: Vec<u8> },
}

/// Transport setup errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Delivery interface used by the membership core.
///
/// Push and pull never fail through `Err`; the outcome is an [`ErrorCode`]
/// so probing code can feed failures into suspicion instead of bailing out.
#[async_trait]
pub trait Transportable: Send + Sync {
    /// Address peers use to reach this node.
    fn local_address(&self) -> SocketAddr;

    /// Receiver of inbound pushes and pulls. Returns `None` once taken.
    fn take_inbound_rx(&self) -> Option<mpsc::Receiver<InboundMessage>>;

    /// Deliver `payload` to `to` without waiting for an answer.
    async fn push(&self, to: SocketAddr, payload: Vec<u8>, timeout: Duration) -> ErrorCode;

    /// Send `payload` to `to` and wait for its answer.
    async fn pull(&self, to: SocketAddr, payload: Vec<u8>, timeout: Duration) -> PullResult;

    /// Stop accepting connections and close open ones.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_result_ok() {
        let result = PullResult::ok(vec![1, 2, 3]);
        assert!(result.is_ok());
        assert_eq!(result.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_pull_result_error() {
        let result = PullResult::error(ErrorCode::Timeout);
        assert!(!result.is_ok());
        assert_eq!(result.code, ErrorCode::Timeout);
        assert!(result.payload.is_empty());
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope::Pull {
            from: "127.0.0.1:4748".parse().unwrap(),
            payload: b"ping".to_vec(),
        };
        let data = bincode::serialize(&envelope).unwrap();
        let decoded: Envelope = bincode::deserialize(&data).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_inbound_message_from() {
        let from: SocketAddr = "10.0.0.1:4748".parse().unwrap();
        let msg = InboundMessage::Push {
            from,
            payload: Vec::new(),
        };
        assert_eq!(msg.from(), from);
    }
}
