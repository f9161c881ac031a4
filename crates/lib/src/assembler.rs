//! Response assembler: turns streamed agent output into one finalized answer
//! for the queue's current request.
//!
//! Chunks are buffered as they arrive; each chunk restarts a debounce timer.
//! When the timer fires with no new chunks, or an explicit ready status
//! arrives first, the buffer is finalized and handed to the request's
//! delivery adapter. Only one request is in flight by construction
//! (the queue's invariant, not this type's). The debounce timer and the ready
//! path can race to finalize; the `active_request` guard makes the second
//! attempt a no-op instead of touching the next promoted request.

use crate::events::SessionEvent;
use crate::protocol::ROLE_AGENT;
use crate::queue::{QueuedRequest, RequestQueue};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Forwards one user message into the agent session (fire-and-forget; replies
/// come back through the event stream).
#[async_trait]
pub trait AgentService: Send + Sync {
    async fn forward(&self, content: &str) -> Result<(), String>;
}

#[async_trait]
impl AgentService for crate::correlator::Correlator {
    async fn forward(&self, content: &str) -> Result<(), String> {
        self.send_message(content, None).await.map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Quiet period after the last chunk before the buffer is treated as final.
    pub debounce_ms: u64,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self { debounce_ms: 3_000 }
    }
}

struct AssemblyState {
    buffer: String,
    streaming: bool,
    chunks: usize,
    /// Id of the request this buffer belongs to; None once finalized.
    active_request: Option<String>,
    debounce_task: Option<JoinHandle<()>>,
}

impl AssemblyState {
    fn reset(&mut self) {
        self.buffer.clear();
        self.streaming = false;
        self.chunks = 0;
        self.active_request = None;
        if let Some(task) = self.debounce_task.take() {
            task.abort();
        }
    }
}

/// Buffers and finalizes streamed responses. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResponseAssembler {
    config: Arc<AssemblerConfig>,
    queue: Arc<RequestQueue>,
    agent: Arc<dyn AgentService>,
    events: broadcast::Sender<SessionEvent>,
    state: Arc<Mutex<AssemblyState>>,
}

impl ResponseAssembler {
    pub fn new(
        config: AssemblerConfig,
        queue: Arc<RequestQueue>,
        agent: Arc<dyn AgentService>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            queue,
            agent,
            events,
            state: Arc::new(Mutex::new(AssemblyState {
                buffer: String::new(),
                streaming: false,
                chunks: 0,
                active_request: None,
                debounce_task: None,
            })),
        }
    }

    /// Handle the queue's promoted request: reset assembly state and forward
    /// the request content into the session.
    pub async fn process_request(&self, request: QueuedRequest) {
        {
            let mut state = self.state.lock().await;
            state.reset();
            state.active_request = Some(request.id.clone());
        }
        log::debug!("processing request {}", request.id);
        if let Err(reason) = self.agent.forward(&request.context.content).await {
            log::warn!("forwarding request {} failed: {}", request.id, reason);
            self.state.lock().await.reset();
            self.queue.fail_current(&reason).await;
        }
    }

    /// True while chunks for the current request are being buffered.
    pub async fn is_streaming(&self) -> bool {
        self.state.lock().await.streaming
    }

    /// Route one session event into the assembly state machine. Agent messages
    /// buffer; a ready status finalizes immediately; everything else is ignored.
    pub async fn on_session_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::SyncMessage { role, text, .. } if role == ROLE_AGENT => {
                if let Some(text) = text {
                    self.on_chunk(text).await;
                }
            }
            SessionEvent::EventStatus { event_type, .. }
                if event_type == "ready" || event_type == "idle" =>
            {
                self.finalize_now().await;
            }
            _ => {}
        }
    }

    async fn on_chunk(&self, text: &str) {
        let Some(current) = self.queue.current().await else {
            return;
        };
        let chunks = {
            let mut state = self.state.lock().await;
            if state.active_request.as_deref() != Some(current.id.as_str()) {
                return;
            }
            state.buffer.push_str(text);
            state.streaming = true;
            state.chunks += 1;
            if let Some(task) = state.debounce_task.take() {
                task.abort();
            }
            let debounce_task = tokio::spawn({
                let this = self.clone();
                let delay = self.config.debounce_ms;
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    this.finalize_now().await;
                }
            });
            state.debounce_task = Some(debounce_task);
            state.chunks
        };
        let _ = self.events.send(SessionEvent::Message {
            conversation_id: current.id.clone(),
            text: text.to_string(),
            message_count: chunks,
        });
    }

    /// Finalize the buffered response for the current request. Empty buffers
    /// fail the request; otherwise delivery runs asynchronously (failures are
    /// logged, not retried) and the request completes.
    async fn finalize_now(&self) {
        let Some(current) = self.queue.current().await else {
            return;
        };
        let text = {
            let mut state = self.state.lock().await;
            if state.active_request.as_deref() != Some(current.id.as_str()) {
                return;
            }
            let text = state.buffer.trim().to_string();
            state.reset();
            text
        };
        if text.is_empty() {
            log::warn!("request {} produced an empty response", current.id);
            self.queue.fail_current("empty response").await;
            return;
        }
        let delivery = current.delivery.clone();
        let context = current.context.clone();
        let delivered = text.clone();
        let request_id = current.id.clone();
        tokio::spawn(async move {
            if let Err(e) = delivery.deliver(&context, &delivered).await {
                log::warn!("delivery for request {} failed: {}", request_id, e);
            }
        });
        self.queue.complete_current(&text).await;
    }

    /// The agent connection dropped: fail the outstanding request with the
    /// reason. Buffered partial content is not salvaged.
    pub async fn handle_disconnect(&self, reason: &str) {
        self.state.lock().await.reset();
        if self.queue.current().await.is_some() {
            self.queue.fail_current(reason).await;
        }
    }
}
