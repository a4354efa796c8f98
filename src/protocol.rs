//! Text-frame protocol: UTF-8 JSON transcript and status messages.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::EngineError;

/// Who (or what) a transcript entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Assistant,
    System,
    Status,
}

/// One entry of the append-only message log.
///
/// Wire shape: `{ "type": "...", "content": "...", "timestamp": <unix ms> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: f64,
}

impl ChatMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, content)
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Status, content)
    }

    /// Parse an inbound text frame. A malformed payload is a `Protocol`
    /// error; the caller drops it without surfacing anything.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::Protocol(e.to_string()))
    }
}

/// Current wall-clock time as unix milliseconds, matching the wire shape.
pub fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}
