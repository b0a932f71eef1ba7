//! TCP Transport
//!
//! One short-lived outbound connection per push or pull; one reader task per
//! inbound connection feeding a [`FrameDecoder`].

use super::{
    encode_frame, Envelope, ErrorCode, FrameDecoder, InboundMessage, PullResult, TransportError,
    Transportable,
};
use crate::infrastructure::ShutdownController;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Read buffer size for inbound connections.
const READ_BUFFER_SIZE: usize = 4096;

/// How long `close` waits for inbound connections to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ==================== Sans-IO Functions ====================

/// Serialize an envelope into a frame.
pub(crate) fn encode_envelope(envelope: &Envelope) -> io::Result<Vec<u8>> {
    let data = bincode::serialize(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    encode_frame(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Deserialize an envelope from a frame payload.
pub(crate) fn decode_envelope(data: &[u8]) -> io::Result<Envelope> {
    bincode::deserialize(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Map an I/O failure to a transport error code.
fn error_code(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::TimedOut => ErrorCode::Timeout,
        _ => ErrorCode::Unknown,
    }
}

/// Read frames from `stream` until one full envelope arrives.
async fn read_envelope(stream: &mut TcpStream) -> io::Result<Envelope> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        let mut offset = 0;
        while offset < n {
            offset += decoder
                .decode(&buf[offset..n])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if decoder.is_satisfied() {
                return decode_envelope(&decoder.take());
            }
        }
    }
}

/// TCP implementation of [`Transportable`].
pub struct TcpTransport {
    local_addr: SocketAddr,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    shutdown: ShutdownController,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind the listener and start accepting connections.
    ///
    /// Binding port 0 picks an ephemeral port; [`local_address`] reports it.
    ///
    /// [`local_address`]: Transportable::local_address
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let shutdown = ShutdownController::new("transport");
        let shutdown_rx = shutdown.subscribe();

        tracing::info!("transport listening on {}", local_addr);

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            inbound_tx,
            shutdown.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Check if the transport has been closed.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn accept_loop(
        listener: TcpListener,
        inbound_tx: mpsc::Sender<InboundMessage>,
        shutdown: ShutdownController,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::trace!("accepted connection from {}", peer);
                        let conn_shutdown = shutdown.subscribe();
                        if shutdown.is_shutdown() {
                            break;
                        }
                        let guard = shutdown.connection_guard();
                        let inbound_tx = inbound_tx.clone();
                        tokio::spawn(async move {
                            Self::handle_connection(stream, peer, inbound_tx, conn_shutdown).await;
                            drop(guard);
                        });
                    }
                    Err(e) => {
                        tracing::warn!("failed to accept connection: {:?}", e);
                    }
                }
            }
        }

        tracing::debug!("transport accept loop stopped");
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        inbound_tx: mpsc::Sender<InboundMessage>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let n = tokio::select! {
                _ = shutdown_rx.recv() => return,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("read from {} failed: {:?}", peer, e);
                        return;
                    }
                },
            };

            let mut offset = 0;
            while offset < n {
                match decoder.decode(&buf[offset..n]) {
                    Ok(consumed) => offset += consumed,
                    Err(e) => {
                        tracing::warn!("dropping connection from {}: {}", peer, e);
                        return;
                    }
                }

                if decoder.is_satisfied() {
                    let frame = decoder.take();
                    if let Err(e) = Self::dispatch_frame(&frame, &inbound_tx, &mut writer).await {
                        tracing::debug!("frame from {} not handled: {:?}", peer, e);
                        return;
                    }
                }
            }
        }
    }

    /// Route one inbound frame to the local node, answering pulls in place.
    async fn dispatch_frame(
        frame: &[u8],
        inbound_tx: &mpsc::Sender<InboundMessage>,
        writer: &mut OwnedWriteHalf,
    ) -> io::Result<()> {
        let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "inbound channel closed");

        match decode_envelope(frame)? {
            Envelope::Push { from, payload } => {
                inbound_tx
                    .send(InboundMessage::Push { from, payload })
                    .await
                    .map_err(|_| closed())?;
            }
            Envelope::Pull { from, payload } => {
                let (reply, response) = oneshot::channel();
                inbound_tx
                    .send(InboundMessage::Pull {
                        from,
                        payload,
                        reply,
                    })
                    .await
                    .map_err(|_| closed())?;

                let payload = response.await.unwrap_or_default();
                let frame = encode_envelope(&Envelope::PullResponse { payload })?;
                writer.write_all(&frame).await?;
            }
            Envelope::PullResponse { .. } => {
                tracing::debug!("unexpected pull response on inbound connection");
            }
        }

        Ok(())
    }

    async fn send_push(to: SocketAddr, frame: Vec<u8>) -> io::Result<()> {
        let mut stream = TcpStream::connect(to).await?;
        stream.write_all(&frame).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn send_pull(to: SocketAddr, frame: Vec<u8>) -> io::Result<Vec<u8>> {
        let mut stream = TcpStream::connect(to).await?;
        stream.write_all(&frame).await?;

        match read_envelope(&mut stream).await? {
            Envelope::PullResponse { payload } => Ok(payload),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "expected pull response")),
        }
    }
}

#[async_trait]
impl Transportable for TcpTransport {
    fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    fn take_inbound_rx(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().take()
    }

    async fn push(&self, to: SocketAddr, payload: Vec<u8>, timeout: Duration) -> ErrorCode {
        let envelope = Envelope::Push {
            from: self.local_addr,
            payload,
        };
        let frame = match encode_envelope(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("failed to encode push to {}: {:?}", to, e);
                return ErrorCode::Unknown;
            }
        };

        match tokio::time::timeout(timeout, Self::send_push(to, frame)).await {
            Ok(Ok(())) => ErrorCode::Ok,
            Ok(Err(e)) => {
                tracing::debug!("push to {} failed: {:?}", to, e);
                error_code(&e)
            }
            Err(_) => ErrorCode::Timeout,
        }
    }

    async fn pull(&self, to: SocketAddr, payload: Vec<u8>, timeout: Duration) -> PullResult {
        let envelope = Envelope::Pull {
            from: self.local_addr,
            payload,
        };
        let frame = match encode_envelope(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("failed to encode pull to {}: {:?}", to, e);
                return PullResult::error(ErrorCode::Unknown);
            }
        };

        match tokio::time::timeout(timeout, Self::send_pull(to, frame)).await {
            Ok(Ok(payload)) => PullResult::ok(payload),
            Ok(Err(e)) => {
                tracing::debug!("pull from {} failed: {:?}", to, e);
                PullResult::error(error_code(&e))
            }
            Err(_) => PullResult::error(ErrorCode::Timeout),
        }
    }

    async fn close(&self) {
        self.shutdown.shutdown();

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }
        self.shutdown.wait_for_drain(DRAIN_TIMEOUT).await;

        tracing::info!("transport on {} closed", self.local_addr);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_envelope() {
        let envelope = Envelope::Push {
            from: "127.0.0.1:4748".parse().unwrap(),
            payload: b"gossip".to_vec(),
        };

        let frame = encode_envelope(&envelope).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let decoded = decode_envelope(&frame[4..]).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_envelope_invalid() {
        assert!(decode_envelope(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_error_code_mapping() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(error_code(&refused), ErrorCode::Unknown);

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(error_code(&timed_out), ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(transport.local_address().port(), 0);
        assert!(!transport.is_shutdown());

        assert!(transport.take_inbound_rx().is_some());
        assert!(transport.take_inbound_rx().is_none());

        transport.close().await;
        assert!(transport.is_shutdown());
    }

    #[tokio::test]
    async fn test_push_to_closed_port_reports_unknown() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let target = {
            let other = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
            let addr = other.local_address();
            other.close().await;
            addr
        };

        let code = transport.push(target, b"hi".to_vec(), Duration::from_secs(1)).await;
        assert_eq!(code, ErrorCode::Unknown);

        transport.close().await;
    }
}
