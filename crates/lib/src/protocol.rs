//! Relay wire protocol types (frames, encrypted messages, decrypted envelopes).
//!
//! The relay pushes frames for a shared session; message payloads are opaque
//! encrypted blobs until opened with the session key. The protocol carries no
//! request identifiers; correlation is the correlator's job, not the wire's.

use serde::{Deserialize, Serialize};

/// Frame type for a new conversational message on a session.
pub const FRAME_NEW_MESSAGE: &str = "new-message";
/// Frame type for session metadata updates (ignored by the correlator).
pub const FRAME_UPDATE_SESSION: &str = "update-session";

pub const ROLE_USER: &str = "user";
pub const ROLE_AGENT: &str = "agent";

/// Inbound relay frame: `{ "body": { "t", "sid", "message" } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    pub body: FrameBody,
}

/// Frame body. Only `t == "new-message"` for the tracked `sid` carries a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBody {
    pub t: String,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub message: Option<WireMessage>,
}

/// One pushed message: id, wall-clock creation time (Unix ms), encrypted content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    pub created_at: i64,
    pub content: EncryptedContent,
}

/// Opaque encrypted payload: `{ "t": "encrypted", "c": <base64> }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedContent {
    pub t: String,
    pub c: String,
}

impl EncryptedContent {
    pub fn new(envelope: impl Into<String>) -> Self {
        Self {
            t: "encrypted".to_string(),
            c: envelope.into(),
        }
    }
}

/// Decrypted view of one inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub role: String,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Message content: a flat string or a tagged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Tagged(TaggedContent),
}

/// Tagged content payloads. Tool-use, tool-result, summary, and user sub-frames
/// all land in `Unsupported` and are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TaggedContent {
    Event { data: EventData },
    Output { data: serde_json::Value },
    #[serde(other)]
    Unsupported,
}

/// Protocol-level event payloads carried inside an `event` content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventData {
    /// The agent has finished producing output for the current turn.
    Ready,
    /// The session switched permission mode.
    Switch { mode: String },
    /// A message-shaped event (payload mirrored verbatim).
    Message { message: serde_json::Value },
    /// Usage limit reached; `endsAt` is Unix ms.
    LimitReached {
        #[serde(rename = "endsAt")]
        ends_at: i64,
    },
    #[serde(other)]
    Unknown,
}

impl EventData {
    /// Wire name of the event kind (the `type` tag).
    pub fn kind(&self) -> &'static str {
        match self {
            EventData::Ready => "ready",
            EventData::Switch { .. } => "switch",
            EventData::Message { .. } => "message",
            EventData::LimitReached { .. } => "limit-reached",
            EventData::Unknown => "unknown",
        }
    }
}

impl Envelope {
    /// Conversational text of this envelope, if any. Flat strings are returned
    /// as-is; `output` payloads contribute their assistant text parts; events
    /// and unsupported content carry no text.
    pub fn text(&self) -> Option<String> {
        match &self.content {
            MessageContent::Text(s) => Some(s.clone()),
            MessageContent::Tagged(TaggedContent::Output { data }) => assistant_text(data),
            MessageContent::Tagged(_) => None,
        }
    }
}

/// Concatenated `{type:"text"}` parts of an assistant output payload.
/// Returns None unless `data.type == "assistant"`; non-text parts contribute nothing.
pub fn assistant_text(data: &serde_json::Value) -> Option<String> {
    if data.get("type").and_then(|v| v.as_str()) != Some("assistant") {
        return None;
    }
    let content = data
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| data.get("content"))?
        .as_array()?;
    let mut out = String::new();
    for part in content {
        if part.get("type").and_then(|v| v.as_str()) == Some("text") {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Decrypted payload for an outbound user message (sealed before transmission).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEnvelope {
    pub role: String,
    pub content: TextContent,
    pub meta: SendMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub typ: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMeta {
    pub sent_from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

impl SendEnvelope {
    pub fn user(text: impl Into<String>, sent_from: impl Into<String>, permission_mode: Option<String>) -> Self {
        Self {
            role: ROLE_USER.to_string(),
            content: TextContent {
                typ: "text".to_string(),
                text: text.into(),
            },
            meta: SendMeta {
                sent_from: sent_from.into(),
                permission_mode,
            },
        }
    }
}

/// Outbound frame emitted on the channel: sid, sealed message, send-side bookkeeping.
/// `localId` is generated per send and is NOT echoed back by the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub sid: String,
    pub message: EncryptedContent,
    pub local_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_flat_string_content() {
        let envelope: Envelope =
            serde_json::from_value(json!({ "role": "agent", "content": "pong" })).expect("parse");
        assert_eq!(envelope.role, "agent");
        assert_eq!(envelope.text().as_deref(), Some("pong"));
    }

    #[test]
    fn parse_ready_event() {
        let envelope: Envelope = serde_json::from_value(json!({
            "role": "agent",
            "content": { "type": "event", "data": { "type": "ready" } },
        }))
        .expect("parse");
        match &envelope.content {
            MessageContent::Tagged(TaggedContent::Event { data }) => {
                assert_eq!(data.kind(), "ready");
            }
            other => panic!("expected event, got {:?}", other),
        }
        assert!(envelope.text().is_none());
    }

    #[test]
    fn parse_switch_and_limit_events() {
        let switch: EventData =
            serde_json::from_value(json!({ "type": "switch", "mode": "plan" })).expect("parse");
        assert!(matches!(switch, EventData::Switch { ref mode } if mode == "plan"));
        let limit: EventData =
            serde_json::from_value(json!({ "type": "limit-reached", "endsAt": 1234 }))
                .expect("parse");
        assert!(matches!(limit, EventData::LimitReached { ends_at: 1234 }));
    }

    #[test]
    fn unknown_content_type_is_unsupported() {
        let envelope: Envelope = serde_json::from_value(json!({
            "role": "agent",
            "content": { "type": "tool-use", "data": { "name": "bash" } },
        }))
        .expect("parse");
        assert!(matches!(
            envelope.content,
            MessageContent::Tagged(TaggedContent::Unsupported)
        ));
        assert!(envelope.text().is_none());
    }

    #[test]
    fn output_text_parts_are_concatenated() {
        let envelope: Envelope = serde_json::from_value(json!({
            "role": "agent",
            "content": {
                "type": "output",
                "data": {
                    "type": "assistant",
                    "message": {
                        "content": [
                            { "type": "text", "text": "Hel" },
                            { "type": "tool_use", "name": "bash", "input": {} },
                            { "type": "text", "text": "lo" },
                        ]
                    }
                }
            },
        }))
        .expect("parse");
        assert_eq!(envelope.text().as_deref(), Some("Hello"));
    }

    #[test]
    fn output_from_non_assistant_data_has_no_text() {
        let data = json!({ "type": "user", "message": { "content": [{ "type": "text", "text": "x" }] } });
        assert!(assistant_text(&data).is_none());
    }

    #[test]
    fn outbound_frame_wire_shape() {
        let frame = OutboundFrame {
            sid: "sess-1".to_string(),
            message: EncryptedContent::new("AAAA"),
            local_id: "loc-1".to_string(),
            permission_mode: None,
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value["sid"], "sess-1");
        assert_eq!(value["message"]["t"], "encrypted");
        assert_eq!(value["localId"], "loc-1");
        assert!(value.get("permissionMode").is_none());
    }

    #[test]
    fn frame_without_message_parses() {
        let frame: RelayFrame = serde_json::from_value(json!({
            "body": { "t": "update-session", "sid": "sess-1" }
        }))
        .expect("parse");
        assert_eq!(frame.body.t, FRAME_UPDATE_SESSION);
        assert!(frame.body.message.is_none());
    }
}
