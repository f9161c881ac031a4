//! Outbound delivery of finalized responses.
//!
//! A request carries an opaque `ChannelContext` (what to send plus routing
//! metadata); the assembler hands the finalized text and the unmodified context
//! to whatever delivery adapter the request arrived with.

use async_trait::async_trait;

/// Content to send plus opaque routing/delivery metadata, passed back to the
/// delivery adapter unmodified.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    /// The message content to forward to the agent.
    pub content: String,
    /// Routing metadata for the originating channel (e.g. chat/conversation ids).
    pub routing: serde_json::Value,
}

impl ChannelContext {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            routing: serde_json::Value::Null,
        }
    }

    pub fn with_routing(content: impl Into<String>, routing: serde_json::Value) -> Self {
        Self {
            content: content.into(),
            routing,
        }
    }
}

/// Ships a finalized answer back to whatever originated the request.
#[async_trait]
pub trait OutboundDelivery: Send + Sync {
    /// Deliver `text` using the request's routing context. Default returns error.
    async fn deliver(&self, _context: &ChannelContext, _text: &str) -> Result<(), String> {
        Err("delivery not implemented".to_string())
    }
}

/// Delivery adapter that logs the finalized response. Used when no channel is wired.
pub struct LogDelivery;

#[async_trait]
impl OutboundDelivery for LogDelivery {
    async fn deliver(&self, context: &ChannelContext, text: &str) -> Result<(), String> {
        log::info!(
            "delivering response ({} chars) routing={}",
            text.len(),
            context.routing
        );
        Ok(())
    }
}
