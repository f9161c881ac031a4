//! Consumer-facing session events.
//!
//! Fan-out uses a tokio broadcast channel: every subscriber sees every event,
//! delivery order between subscribers is not coordinated, and slow subscribers
//! lag rather than block the correlator.

use serde::Serialize;

/// Events emitted while tracking a shared session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Protocol-level event observed on the channel. Emitted even for external
    /// traffic so observers can reflect shared-session activity.
    #[serde(rename_all = "camelCase")]
    EventStatus {
        event_type: String,
        event_data: serde_json::Value,
        is_external: bool,
        timestamp: i64,
    },

    /// Mirror of one conversational message for non-owning observers.
    #[serde(rename_all = "camelCase")]
    SyncMessage {
        session_id: String,
        role: String,
        text: Option<String>,
        raw: serde_json::Value,
        is_external: bool,
    },

    /// Intermediate progress on a tracked conversation or streaming request.
    #[serde(rename_all = "camelCase")]
    Message {
        conversation_id: String,
        text: String,
        message_count: usize,
    },

    /// Terminal stream marker; emitted at most once per conversation.
    #[serde(rename_all = "camelCase")]
    StreamEnded {
        conversation_id: String,
        last_message: Option<String>,
        message_count: usize,
    },
}
