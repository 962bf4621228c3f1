//! Wire-format frames sent to subscribers.

use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

/// Close code sent to every subscriber on shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

pub const SHUTDOWN_REASON: &str = "Server shutting down";

// ---------------------------------------------------------------------------
// Relay → subscriber
// ---------------------------------------------------------------------------

/// A published payload as delivered to one channel's subscribers.
///
/// `socket` is omitted entirely when the publisher did not supply one.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    pub event: &'a str,
    pub channel: &'a str,
    pub data: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<&'a Value>,
}

/// Sent back on the same connection when a subscribe message is rejected.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrame {
    pub error: String,
}

impl ErrorFrame {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Serialize a frame to text. Our own frame types always serialize; a
/// failure is logged and yields `None`.
pub fn to_text<T: Serialize>(frame: &T) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::error!(?err, "failed to serialize frame");
            None
        }
    }
}
