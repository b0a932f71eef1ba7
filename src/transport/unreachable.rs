//! Partition simulation: a transport wrapper that refuses to reach chosen peers.

use super::{ErrorCode, InboundMessage, PullResult, Transportable};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Wraps a transport and fails every push or pull to blocked peers with
/// [`ErrorCode::Unknown`], as if the network path were cut.
pub struct UnreachableTransport {
    inner: Arc<dyn Transportable>,
    unreachable: RwLock<HashSet<SocketAddr>>,
}

impl UnreachableTransport {
    pub fn new(inner: Arc<dyn Transportable>) -> Self {
        Self {
            inner,
            unreachable: RwLock::new(HashSet::new()),
        }
    }

    /// Cut the outbound path to `peer`.
    pub fn make_unreachable_to(&self, peer: SocketAddr) {
        tracing::debug!("{} now unreachable from {}", peer, self.inner.local_address());
        self.unreachable.write().insert(peer);
    }

    /// Restore the outbound path to `peer`.
    pub fn make_reachable_to(&self, peer: SocketAddr) {
        self.unreachable.write().remove(&peer);
    }

    pub fn is_unreachable(&self, peer: &SocketAddr) -> bool {
        self.unreachable.read().contains(peer)
    }
}

#[async_trait]
impl Transportable for UnreachableTransport {
    fn local_address(&self) -> SocketAddr {
        self.inner.local_address()
    }

    fn take_inbound_rx(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inner.take_inbound_rx()
    }

    async fn push(&self, to: SocketAddr, payload: Vec<u8>, timeout: Duration) -> ErrorCode {
        if self.is_unreachable(&to) {
            return ErrorCode::Unknown;
        }
        self.inner.push(to, payload, timeout).await
    }

    async fn pull(&self, to: SocketAddr, payload: Vec<u8>, timeout: Duration) -> PullResult {
        if self.is_unreachable(&to) {
            return PullResult::error(ErrorCode::Unknown);
        }
        self.inner.pull(to, payload, timeout).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpTransport;

    #[tokio::test]
    async fn test_unreachable_peer_fails_fast() {
        let inner = Arc::new(TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let peer = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let transport = UnreachableTransport::new(inner);

        transport.make_unreachable_to(peer.local_address());
        assert!(transport.is_unreachable(&peer.local_address()));

        let code = transport
            .push(peer.local_address(), b"gossip".to_vec(), Duration::from_secs(1))
            .await;
        assert_eq!(code, ErrorCode::Unknown);

        let result = transport
            .pull(peer.local_address(), b"ping".to_vec(), Duration::from_secs(1))
            .await;
        assert_eq!(result.code, ErrorCode::Unknown);

        transport.close().await;
        peer.close().await;
    }

    #[tokio::test]
    async fn test_make_reachable_restores_push() {
        let inner = Arc::new(TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let peer = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut peer_rx = peer.take_inbound_rx().unwrap();
        let transport = UnreachableTransport::new(inner);

        transport.make_unreachable_to(peer.local_address());
        transport.make_reachable_to(peer.local_address());

        let code = transport
            .push(peer.local_address(), b"gossip".to_vec(), Duration::from_secs(1))
            .await;
        assert_eq!(code, ErrorCode::Ok);

        let msg = tokio::time::timeout(Duration::from_secs(1), peer_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            InboundMessage::Push { from, payload } => {
                assert_eq!(from, transport.local_address());
                assert_eq!(payload, b"gossip");
            }
            other => panic!("expected push, got {:?}", other),
        }

        transport.close().await;
        peer.close().await;
    }
}
