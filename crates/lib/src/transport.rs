//! Transport channel: duplex push connection to the relay.
//!
//! The transport provides no request/response pairing: it pushes inbound
//! frames and accepts outbound emits. `WsTransport` is the WebSocket client
//! used in production; `memory_pair` is an in-process stand-in for tests.

use crate::protocol::{OutboundFrame, RelayFrame};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport closed")]
    Closed,
}

/// Events pushed from the transport to the session client.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Frame(RelayFrame),
    Disconnected { reason: String },
}

/// Duplex push channel to the relay.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Emit an outbound frame.
    async fn emit(&self, frame: OutboundFrame) -> Result<(), TransportError>;
    /// Stop the connection; subsequent emits fail with `Closed`.
    fn stop(&self);
}

/// WebSocket transport: one writer task draining an outbound channel, one
/// reader task parsing pushed frames into `TransportEvent`s.
pub struct WsTransport {
    outbound_tx: mpsc::Sender<Message>,
    running: AtomicBool,
}

impl WsTransport {
    /// Connect to the relay and start the read/write loops. Returns the
    /// transport handle and the inbound event stream.
    pub async fn connect(
        url: &str,
        token: Option<String>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>), TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        if let Some(token) = token {
            let auth = serde_json::json!({ "type": "auth", "token": token });
            sink.send(Message::Text(auth.to_string()))
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);
        let transport = Arc::new(Self {
            outbound_tx,
            running: AtomicBool::new(true),
        });

        let _ = event_tx.send(TransportEvent::Connected).await;

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(frame) => {
                            if event_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                                break "consumer dropped".to_string();
                            }
                        }
                        Err(e) => log::debug!("ignoring unparseable frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) => break "closed by peer".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = event_tx.send(TransportEvent::Disconnected { reason }).await;
        });

        Ok((transport, event_rx))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn emit(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let text = serde_json::to_string(&frame).map_err(|e| TransportError::Send(e.to_string()))?;
        self.outbound_tx
            .send(Message::Text(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.outbound_tx.try_send(Message::Close(None));
    }
}

/// In-memory transport for tests.
pub struct MemoryTransport {
    outbound_tx: mpsc::Sender<OutboundFrame>,
    running: AtomicBool,
}

/// Test-side handles for a `memory_pair`: inject inbound events, observe emits.
pub struct MemoryHarness {
    pub inbound_tx: mpsc::Sender<TransportEvent>,
    pub outbound_rx: mpsc::Receiver<OutboundFrame>,
}

/// Build an in-memory transport. Returns the transport, the inbound stream for
/// the session client, and the test harness handles.
pub fn memory_pair() -> (Arc<MemoryTransport>, mpsc::Receiver<TransportEvent>, MemoryHarness) {
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    (
        Arc::new(MemoryTransport {
            outbound_tx,
            running: AtomicBool::new(true),
        }),
        inbound_rx,
        MemoryHarness {
            inbound_tx,
            outbound_rx,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn emit(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
