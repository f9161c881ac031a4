//! Session client: wires transport, crypto, correlator, queue, and assembler.
//!
//! Everything is constructed explicitly here and shared by reference; there is
//! no global state. The pump tasks started by `start` route transport events to
//! the correlator and the assembler until shutdown.

use crate::assembler::{AgentService, AssemblerConfig, ResponseAssembler};
use crate::config::{resolve_relay_token, resolve_session_secret, Config};
use crate::correlator::{
    ConversationResult, Correlator, CorrelatorConfig, CorrelatorError, SendOptions,
};
use crate::crypto::Keyring;
use crate::delivery::{ChannelContext, OutboundDelivery};
use crate::events::SessionEvent;
use crate::queue::{QueueError, QueuedRequest, RequestQueue};
use crate::transport::{Transport, TransportEvent, WsTransport};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

pub struct SessionClient {
    correlator: Correlator,
    queue: Arc<RequestQueue>,
    assembler: ResponseAssembler,
    transport: Arc<dyn Transport>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionClient {
    /// Connect to the configured relay and start the session pump.
    pub async fn connect(config: &Config) -> Result<Self> {
        let token = resolve_relay_token(config);
        let (transport, inbound) = WsTransport::connect(&config.relay.url, token)
            .await
            .with_context(|| format!("connecting to {}", config.relay.url))?;
        Self::start(config, transport, inbound).await
    }

    /// Assemble the client on top of an already-connected transport.
    pub async fn start(
        config: &Config,
        transport: Arc<dyn Transport>,
        mut inbound: mpsc::Receiver<TransportEvent>,
    ) -> Result<Self> {
        let session_id = config
            .session
            .id
            .clone()
            .context("session.id is not configured")?;
        let secret = resolve_session_secret(config)
            .context("session secret is not configured (session.secret or TETHER_SESSION_SECRET)")?;
        let keyring = Keyring::from_secret(&secret).context("invalid session secret")?;
        let crypto = keyring.for_session(&session_id);

        let mut correlator_config = CorrelatorConfig::for_session(session_id);
        correlator_config.default_timeout_ms = config.timing.request_timeout_ms;
        correlator_config.network_buffer_ms = config.timing.network_buffer_ms as i64;
        correlator_config.silence_timeout_ms = config.timing.silence_timeout_ms;
        let correlator = Correlator::new(correlator_config, crypto, transport.clone());

        let queue = Arc::new(RequestQueue::new());
        let assembler = ResponseAssembler::new(
            AssemblerConfig {
                debounce_ms: config.timing.debounce_ms,
            },
            queue.clone(),
            Arc::new(correlator.clone()) as Arc<dyn AgentService>,
            correlator.event_sender(),
        );

        let mut tasks = Vec::new();

        let (processor_tx, mut processor_rx) = mpsc::channel::<QueuedRequest>(16);
        queue.set_processor(processor_tx).await;
        tasks.push(tokio::spawn({
            let assembler = assembler.clone();
            async move {
                while let Some(request) = processor_rx.recv().await {
                    assembler.process_request(request).await;
                }
            }
        }));

        tasks.push(tokio::spawn({
            let assembler = assembler.clone();
            let mut events = correlator.subscribe();
            async move {
                loop {
                    match events.recv().await {
                        Ok(event) => assembler.on_session_event(&event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::debug!("assembler lagged {} session events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }));

        tasks.push(tokio::spawn({
            let correlator = correlator.clone();
            let assembler = assembler.clone();
            async move {
                while let Some(event) = inbound.recv().await {
                    match event {
                        TransportEvent::Connected => log::info!("relay connected"),
                        TransportEvent::Frame(frame) => correlator.handle_frame(frame).await,
                        TransportEvent::Disconnected { reason } => {
                            correlator.handle_disconnect(&reason).await;
                            assembler.handle_disconnect(&reason).await;
                        }
                    }
                }
            }
        }));

        Ok(Self {
            correlator,
            queue,
            assembler,
            transport,
            tasks,
        })
    }

    /// Send a message into the session and wait for the correlated outcome.
    pub async fn send_and_wait(
        &self,
        content: &str,
        options: SendOptions,
    ) -> Result<ConversationResult, CorrelatorError> {
        self.correlator.send_and_wait(content, options).await
    }

    /// Queue a request whose finalized answer is shipped via `delivery`.
    pub async fn submit(
        &self,
        context: ChannelContext,
        delivery: Arc<dyn OutboundDelivery>,
    ) -> oneshot::Receiver<Result<String, QueueError>> {
        self.queue.submit(context, delivery).await
    }

    /// Subscribe to session events (sync traffic, statuses, progress).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.correlator.subscribe()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn assembler(&self) -> &ResponseAssembler {
        &self.assembler
    }

    /// Stop the transport and abort the pump tasks.
    pub async fn shutdown(self) {
        self.transport.stop();
        for task in self.tasks {
            task.abort();
        }
    }
}
