//! Conversation correlator: turns the raw encrypted push stream into
//! request/response pairs.
//!
//! The wire protocol carries no request identifiers. A conversation claims an
//! inbound agent message when the message timestamp falls inside the
//! conversation's time window; the authoritative completion signal is the
//! protocol-level `ready` event, with a silence timer and a message-count cap
//! as fallbacks. Traffic that no local conversation claims is classified as
//! external (another client sharing the session) and mirrored to observers.

use crate::crypto::{CryptoError, SessionCrypto};
use crate::events::SessionEvent;
use crate::protocol::{
    EncryptedContent, EventData, MessageContent, OutboundFrame, RelayFrame, SendEnvelope,
    TaggedContent, FRAME_NEW_MESSAGE, ROLE_AGENT,
};
use crate::transport::{Transport, TransportError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio::task::JoinHandle;

/// Hard cap on buffered messages per conversation; exceeded => force-complete.
const DEFAULT_MESSAGE_CAP: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum CorrelatorError {
    #[error("conversation timed out after {0} ms")]
    Timeout(u64),
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    #[error("transport send failed: {0}")]
    Transport(#[from] TransportError),
    #[error("encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("correlator dropped before the conversation resolved")]
    Dropped,
}

/// Correlation tuning for one tracked session.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Session id whose frames are processed; everything else is ignored.
    pub session_id: String,
    /// Value for meta.sentFrom on outbound messages.
    pub sent_from: String,
    /// Timeout when `SendOptions.timeout_ms` is not set.
    pub default_timeout_ms: u64,
    /// Clock-skew allowance: a message may arrive up to this many ms "before"
    /// the conversation's recorded send time and still be claimed.
    pub network_buffer_ms: i64,
    /// Finalize a conversation with buffered messages after this much silence
    /// when no ready event arrives.
    pub silence_timeout_ms: u64,
    /// Message-count safety valve against runaway loops.
    pub message_cap: usize,
}

impl CorrelatorConfig {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sent_from: "tether".to_string(),
            default_timeout_ms: 90_000,
            network_buffer_ms: 2_000,
            silence_timeout_ms: 15_000,
            message_cap: DEFAULT_MESSAGE_CAP,
        }
    }
}

/// Options for one `send_and_wait` call.
#[derive(Default)]
pub struct SendOptions {
    pub timeout_ms: Option<u64>,
    /// Opaque passthrough tag echoed on the outbound frame.
    pub permission_mode: Option<String>,
    /// Invoked per intermediate agent message with (text, message_count).
    /// Must not block: it runs on the frame-handling path.
    pub on_progress: Option<ProgressCallback>,
}

pub type ProgressCallback = Box<dyn Fn(&str, usize) + Send + Sync>;

/// Conversation lifecycle. Transitions are monotonic: waiting -> active ->
/// completed | timeout; terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Waiting,
    Active,
    Completed,
    Timeout,
}

/// One buffered inbound message.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub timestamp: i64,
    pub role: String,
    pub text: String,
    pub raw: serde_json::Value,
}

struct Conversation {
    id: String,
    status: ConversationStatus,
    created_at: i64,
    last_activity_at: i64,
    timeout_ms: u64,
    permission_mode: Option<String>,
    messages: Vec<ConversationMessage>,
    stream_ended_emitted: bool,
    waiting_for_tool: bool,
    outcome: Option<oneshot::Sender<Result<ConversationResult, CorrelatorError>>>,
    on_progress: Option<ProgressCallback>,
    timeout_task: Option<JoinHandle<()>>,
    silence_task: Option<JoinHandle<()>>,
}

impl Conversation {
    fn is_open(&self) -> bool {
        matches!(
            self.status,
            ConversationStatus::Waiting | ConversationStatus::Active
        )
    }

    /// Window: [created_at - network_buffer, created_at + timeout).
    fn window_contains(&self, message_time: i64, network_buffer_ms: i64) -> bool {
        message_time >= self.created_at - network_buffer_ms
            && message_time < self.created_at + self.timeout_ms as i64
    }

    fn abort_timers(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        if let Some(task) = self.silence_task.take() {
            task.abort();
        }
    }

    fn agent_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Read-only view of one tracked conversation.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub id: String,
    pub status: ConversationStatus,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub message_count: usize,
    pub permission_mode: Option<String>,
}

/// Resolved outcome of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationResult {
    pub conversation_id: String,
    /// Concatenated agent text, newline-joined in arrival order.
    pub text: String,
    pub extracted: ExtractedResult,
    pub message_count: usize,
}

/// Structured result extraction, tried in order: fenced JSON block, generated
/// artifact filenames, raw text.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedResult {
    Json(serde_json::Value),
    Artifacts(Vec<String>),
    Text(String),
}

type PreTimeoutFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Owns the set of in-flight conversations for one session. Cheap to clone;
/// clones share state.
#[derive(Clone)]
pub struct Correlator {
    config: Arc<CorrelatorConfig>,
    crypto: SessionCrypto,
    transport: Arc<dyn Transport>,
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
    events: broadcast::Sender<SessionEvent>,
    pre_timeout: Option<PreTimeoutFn>,
}

impl Correlator {
    pub fn new(
        config: CorrelatorConfig,
        crypto: SessionCrypto,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config: Arc::new(config),
            crypto,
            transport,
            conversations: Arc::new(RwLock::new(HashMap::new())),
            events,
            pre_timeout: None,
        }
    }

    /// Register a callback invoked with the conversation id just before a
    /// timeout rejection (e.g. to attempt a soft abort with the agent).
    pub fn with_pre_timeout(mut self, callback: PreTimeoutFn) -> Self {
        self.pre_timeout = Some(callback);
        self
    }

    /// Subscribe to session events. Every subscriber sees every event.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Sender half of the event channel, for components that emit alongside
    /// the correlator (e.g. the response assembler).
    pub fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    /// Ids of conversations still in flight.
    pub async fn active_ids(&self) -> Vec<String> {
        self.conversations.read().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self, id: &str) -> Option<ConversationSnapshot> {
        self.conversations.read().await.get(id).map(|c| ConversationSnapshot {
            id: c.id.clone(),
            status: c.status,
            created_at: c.created_at,
            last_activity_at: c.last_activity_at,
            message_count: c.messages.len(),
            permission_mode: c.permission_mode.clone(),
        })
    }

    /// Send `content` into the session and wait for the correlated outcome.
    /// Rejects on timeout or transport disconnect.
    pub async fn send_and_wait(
        &self,
        content: &str,
        options: SendOptions,
    ) -> Result<ConversationResult, CorrelatorError> {
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let id = format!("conv-{}", uuid::Uuid::new_v4());
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let conversation = Conversation {
            id: id.clone(),
            status: ConversationStatus::Waiting,
            created_at: now_ms(),
            last_activity_at: now_ms(),
            timeout_ms,
            permission_mode: options.permission_mode.clone(),
            messages: Vec::new(),
            stream_ended_emitted: false,
            waiting_for_tool: false,
            outcome: Some(outcome_tx),
            on_progress: options.on_progress,
            timeout_task: None,
            silence_task: None,
        };
        self.conversations.write().await.insert(id.clone(), conversation);

        let timeout_task = tokio::spawn({
            let this = self.clone();
            let id = id.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                this.expire(&id, timeout_ms).await;
            }
        });
        if let Some(conv) = self.conversations.write().await.get_mut(&id) {
            conv.timeout_task = Some(timeout_task);
        }

        if let Err(e) = self
            .send_message(content, options.permission_mode)
            .await
        {
            if let Some(mut conv) = self.conversations.write().await.remove(&id) {
                conv.abort_timers();
            }
            return Err(e);
        }

        log::debug!("conversation {} waiting ({} ms timeout)", id, timeout_ms);
        outcome_rx.await.map_err(|_| CorrelatorError::Dropped)?
    }

    /// Encrypt and emit one user message without tracking a conversation.
    /// Used by callers that consume replies through the event stream.
    pub async fn send_message(
        &self,
        content: &str,
        permission_mode: Option<String>,
    ) -> Result<(), CorrelatorError> {
        let envelope = SendEnvelope::user(content, &self.config.sent_from, permission_mode.clone());
        let sealed = self.crypto.encrypt(&envelope)?;
        let frame = OutboundFrame {
            sid: self.config.session_id.clone(),
            message: EncryptedContent::new(sealed),
            local_id: format!("loc-{}", uuid::Uuid::new_v4()),
            permission_mode,
        };
        self.transport.emit(frame).await?;
        Ok(())
    }

    /// Handle one pushed frame. Never propagates an error: a bad frame must not
    /// take down the other in-flight conversations.
    pub async fn handle_frame(&self, frame: RelayFrame) {
        if frame.body.t != FRAME_NEW_MESSAGE {
            return;
        }
        if frame.body.sid.as_deref() != Some(self.config.session_id.as_str()) {
            return;
        }
        let Some(message) = frame.body.message else {
            return;
        };
        if message.content.t != "encrypted" {
            return;
        }
        let envelope: crate::protocol::Envelope = match self.crypto.decrypt(&message.content.c) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Transient or unrelated traffic on the shared channel.
                log::debug!("dropping undecryptable frame: {}", e);
                return;
            }
        };
        let message_time = message.created_at;

        match &envelope.content {
            MessageContent::Tagged(TaggedContent::Event { data }) => {
                self.handle_event(data.clone(), message_time).await;
            }
            MessageContent::Tagged(TaggedContent::Unsupported) => {
                // Tool-use/tool-result/summary/user sub-frames: skipped.
            }
            _ => {
                let text = envelope.text();
                let raw = serde_json::to_value(&envelope.content).unwrap_or(serde_json::Value::Null);
                let claimed = self.claim_conversation(message_time).await;
                self.emit(SessionEvent::SyncMessage {
                    session_id: self.config.session_id.clone(),
                    role: envelope.role.clone(),
                    text: text.clone(),
                    raw: raw.clone(),
                    is_external: claimed.is_none(),
                });
                if envelope.role != ROLE_AGENT {
                    return;
                }
                let (Some(text), Some(conversation_id)) = (text, claimed) else {
                    return;
                };
                self.on_conversation_message(&conversation_id, message_time, &envelope.role, text, raw)
                    .await;
            }
        }
    }

    /// Structured protocol events. Emitted unconditionally (even when external)
    /// so observers can reflect shared-session activity; never appended to any
    /// message history.
    async fn handle_event(&self, data: EventData, message_time: i64) {
        let is_external = !self.window_claims(message_time).await;
        self.emit(SessionEvent::EventStatus {
            event_type: data.kind().to_string(),
            event_data: serde_json::to_value(&data).unwrap_or(serde_json::Value::Null),
            is_external,
            timestamp: message_time,
        });
        if let EventData::Ready = data {
            if is_external {
                // Recovery signal only: some other client's turn finished.
                log::debug!("external ready event at {}", message_time);
                return;
            }
            let target = {
                let conversations = self.conversations.read().await;
                conversations
                    .values()
                    .filter(|c| c.is_open())
                    .max_by_key(|c| c.created_at)
                    .map(|c| c.id.clone())
            };
            if let Some(id) = target {
                self.finalize(&id).await;
            }
        }
    }

    /// True when any open conversation's window contains `message_time`.
    async fn window_claims(&self, message_time: i64) -> bool {
        self.conversations
            .read()
            .await
            .values()
            .any(|c| c.is_open() && c.window_contains(message_time, self.config.network_buffer_ms))
    }

    /// Most recently created open conversation whose window contains the
    /// message time. Heuristic: with overlapping conversations a message can be
    /// attributed to the wrong one; the wire offers no stronger key.
    async fn claim_conversation(&self, message_time: i64) -> Option<String> {
        self.conversations
            .read()
            .await
            .values()
            .filter(|c| c.is_open() && c.window_contains(message_time, self.config.network_buffer_ms))
            .max_by_key(|c| c.created_at)
            .map(|c| c.id.clone())
    }

    async fn on_conversation_message(
        &self,
        conversation_id: &str,
        message_time: i64,
        role: &str,
        text: String,
        raw: serde_json::Value,
    ) {
        let mut force_complete = false;
        {
            let mut conversations = self.conversations.write().await;
            let Some(conv) = conversations.get_mut(conversation_id) else {
                return;
            };
            if !conv.is_open() {
                return;
            }
            if conv.status == ConversationStatus::Waiting {
                conv.status = ConversationStatus::Active;
            }
            conv.messages.push(ConversationMessage {
                timestamp: message_time,
                role: role.to_string(),
                text: text.clone(),
                raw,
            });
            conv.last_activity_at = now_ms();
            if let Some(task) = conv.silence_task.take() {
                task.abort();
            }
            let count = conv.messages.len();
            if let Some(on_progress) = &conv.on_progress {
                on_progress(&text, count);
            }
            self.emit(SessionEvent::Message {
                conversation_id: conversation_id.to_string(),
                text: text.clone(),
                message_count: count,
            });

            conv.waiting_for_tool = is_tool_in_progress(&text);
            if count > self.config.message_cap {
                // Safety valve against runaway loops; treated as success.
                log::warn!(
                    "conversation {} exceeded {} messages, force-completing",
                    conversation_id,
                    self.config.message_cap
                );
                force_complete = true;
            } else if !conv.waiting_for_tool {
                // Fallback for sessions that never emit ready.
                let silence_task = tokio::spawn({
                    let this = self.clone();
                    let id = conversation_id.to_string();
                    let quiet = self.config.silence_timeout_ms;
                    async move {
                        tokio::time::sleep(Duration::from_millis(quiet)).await;
                        this.silence_elapsed(&id).await;
                    }
                });
                conv.silence_task = Some(silence_task);
            }
        }
        if force_complete {
            self.finalize(conversation_id).await;
        }
    }

    /// Complete a conversation: cancel timers, emit stream-ended (once) and a
    /// ready status, resolve the outcome, drop it from the active set.
    async fn finalize(&self, conversation_id: &str) {
        let conv = self.conversations.write().await.remove(conversation_id);
        let Some(mut conv) = conv else { return };
        conv.abort_timers();
        self.emit_stream_ended(&mut conv);
        self.emit(SessionEvent::EventStatus {
            event_type: "ready".to_string(),
            event_data: json!({ "type": "ready" }),
            is_external: false,
            timestamp: now_ms(),
        });
        conv.status = ConversationStatus::Completed;
        let text = conv.agent_text();
        let result = ConversationResult {
            conversation_id: conv.id.clone(),
            extracted: extract_result(&text),
            text,
            message_count: conv.messages.len(),
        };
        log::debug!(
            "conversation {} completed with {} message(s)",
            conv.id,
            result.message_count
        );
        if let Some(outcome) = conv.outcome.take() {
            let _ = outcome.send(Ok(result));
        }
    }

    /// Timeout timer fired. Late partial content is surfaced via stream-ended
    /// before the rejection.
    async fn expire(&self, conversation_id: &str, timeout_ms: u64) {
        let open = self
            .conversations
            .read()
            .await
            .get(conversation_id)
            .map(|c| c.is_open())
            .unwrap_or(false);
        if !open {
            return;
        }
        if let Some(pre_timeout) = &self.pre_timeout {
            pre_timeout(conversation_id);
        }
        let conv = self.conversations.write().await.remove(conversation_id);
        let Some(mut conv) = conv else { return };
        conv.abort_timers();
        if !conv.messages.is_empty() {
            self.emit_stream_ended(&mut conv);
        }
        conv.status = ConversationStatus::Timeout;
        log::warn!(
            "conversation {} timed out after {} ms ({} buffered message(s))",
            conversation_id,
            timeout_ms,
            conv.messages.len()
        );
        if let Some(outcome) = conv.outcome.take() {
            let _ = outcome.send(Err(CorrelatorError::Timeout(timeout_ms)));
        }
    }

    /// Silence fallback fired: no ready event and no further messages.
    async fn silence_elapsed(&self, conversation_id: &str) {
        let finalize = self
            .conversations
            .read()
            .await
            .get(conversation_id)
            .map(|c| c.is_open() && !c.messages.is_empty() && !c.waiting_for_tool)
            .unwrap_or(false);
        if finalize {
            log::debug!(
                "conversation {} finalized after silence fallback",
                conversation_id
            );
            self.finalize(conversation_id).await;
        }
    }

    /// Reject every in-flight conversation; buffered content is not salvaged.
    pub async fn handle_disconnect(&self, reason: &str) {
        let drained: Vec<Conversation> = {
            let mut conversations = self.conversations.write().await;
            conversations.drain().map(|(_, c)| c).collect()
        };
        if drained.is_empty() {
            return;
        }
        log::warn!(
            "transport disconnected ({}); rejecting {} conversation(s)",
            reason,
            drained.len()
        );
        for mut conv in drained {
            conv.abort_timers();
            if let Some(outcome) = conv.outcome.take() {
                let _ = outcome.send(Err(CorrelatorError::Disconnected(reason.to_string())));
            }
        }
    }

    fn emit_stream_ended(&self, conv: &mut Conversation) {
        if conv.stream_ended_emitted {
            return;
        }
        conv.stream_ended_emitted = true;
        self.emit(SessionEvent::StreamEnded {
            conversation_id: conv.id.clone(),
            last_message: conv.messages.last().map(|m| m.text.clone()),
            message_count: conv.messages.len(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Markers in agent text meaning a tool invocation is still running: a trailing
/// in-progress ellipsis or a tool-call bullet line.
fn is_tool_in_progress(text: &str) -> bool {
    text.trim_end().ends_with('…')
        || text.lines().any(|l| l.trim_start().starts_with("⏺ "))
}

const ARTIFACT_PREFIX: &str = "artifact-";
const ARTIFACT_EXTENSIONS: &[&str] = &["html", "svg", "png", "pdf", "csv", "json", "md"];

/// First fenced ```json block parsed as JSON, if any.
fn fenced_json(text: &str) -> Option<serde_json::Value> {
    let start = text.find("```json")?;
    let rest = &text[start + "```json".len()..];
    let end = rest.find("```")?;
    serde_json::from_str(rest[..end].trim()).ok()
}

/// Whitespace-delimited tokens shaped like generated artifact files
/// (`artifact-<id>.<ext>`), deduplicated in arrival order.
fn scan_artifacts(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in text.split_whitespace() {
        let token =
            token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_');
        if !token.starts_with(ARTIFACT_PREFIX) {
            continue;
        }
        let Some((stem, ext)) = token.rsplit_once('.') else {
            continue;
        };
        if stem.len() <= ARTIFACT_PREFIX.len() {
            continue;
        }
        if ARTIFACT_EXTENSIONS.contains(&ext) && !out.iter().any(|t| t == token) {
            out.push(token.to_string());
        }
    }
    out
}

fn extract_result(text: &str) -> ExtractedResult {
    if let Some(value) = fenced_json(text) {
        return ExtractedResult::Json(value);
    }
    let artifacts = scan_artifacts(text);
    if !artifacts.is_empty() {
        return ExtractedResult::Artifacts(artifacts);
    }
    ExtractedResult::Text(text.to_string())
}
