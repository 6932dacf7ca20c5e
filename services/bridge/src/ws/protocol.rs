//! Defines the WebSocket message protocol between the voice platform and the bridge.
//!
//! All knowledge of which shapes a frame may arrive in lives here: `decode`
//! turns raw text or bytes into a typed [`InboundFrame`] (or a
//! [`DecodeError`]), and `encode` turns a [`ServerMessage`] into text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serenity_core::{llm_client::ChatTurn, prompt::CallContext};
use std::fmt;

/// Identifier of one reply cycle.
///
/// The platform sends it either as a number or as a string; it is echoed
/// back in the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseId {
    Number(u64),
    Text(String),
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseId::Number(n) => write!(f, "{n}"),
            ResponseId::Text(s) => f.write_str(s),
        }
    }
}

/// The `call` object attached to some events.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CallInfo {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub retell_llm_dynamic_variables: Option<CallContext>,
}

/// A reply-needed event.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub response_id: ResponseId,
    #[serde(default)]
    pub transcript: Vec<ChatTurn>,
    #[serde(default)]
    pub call: Option<CallInfo>,
}

impl TurnRequest {
    /// Dynamic variables carried by this event, if any.
    pub fn dynamic_variables(&self) -> Option<&CallContext> {
        self.call
            .as_ref()
            .and_then(|call| call.retell_llm_dynamic_variables.as_ref())
    }
}

/// Messages sent from the voice platform to the bridge.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "interaction_type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application-level liveness ping.
    PingPong {
        #[serde(default)]
        timestamp: Value,
    },
    /// Call metadata, sent once after the config frame.
    CallDetails {
        #[serde(default)]
        call: CallInfo,
    },
    /// Transcript changed; no reply needed.
    UpdateOnly {
        #[serde(default)]
        transcript: Vec<ChatTurn>,
    },
    /// The agent must reply to the user.
    ResponseRequired(TurnRequest),
    /// The user has been silent; the agent should speak again.
    ReminderRequired(TurnRequest),
    #[serde(other)]
    Unknown,
}

/// Control frames that are answered without reaching the turn logic.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    /// Application-level ping; the reply echoes `timestamp`.
    Ping { timestamp: Value },
}

/// The result of classifying one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(ControlFrame),
    Event(ClientMessage),
}

/// A frame that could not be understood.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON for any known interaction: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("binary frame is not UTF-8")]
    NotUtf8,
}

/// Classifies a text frame.
pub fn decode(raw: &str) -> Result<InboundFrame, DecodeError> {
    if raw.trim().eq_ignore_ascii_case("ping") {
        let now = chrono::Utc::now().timestamp_millis();
        return Ok(InboundFrame::Control(ControlFrame::Ping {
            timestamp: Value::from(now),
        }));
    }

    let message: ClientMessage = serde_json::from_str(raw)?;
    Ok(match message {
        ClientMessage::PingPong { timestamp } => {
            InboundFrame::Control(ControlFrame::Ping { timestamp })
        }
        other => InboundFrame::Event(other),
    })
}

/// Classifies a binary frame carrying UTF-8 JSON.
pub fn decode_bytes(raw: &[u8]) -> Result<InboundFrame, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::NotUtf8)?;
    decode(text)
}

/// Session options announced to the platform when a connection opens.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub auto_reconnect: bool,
    pub call_details: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            call_details: true,
        }
    }
}

/// Messages sent from the bridge to the voice platform.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "response_type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once, first, on every connection.
    Config { config: SessionOptions },
    /// One speakable chunk of the reply to `response_id`.
    Response {
        response_id: ResponseId,
        content: String,
        content_complete: bool,
        end_call: bool,
    },
    /// Answer to an application-level ping.
    PingPong { timestamp: Value },
}

impl ServerMessage {
    pub fn config() -> Self {
        ServerMessage::Config {
            config: SessionOptions::default(),
        }
    }

    pub fn chunk(response_id: ResponseId, content: String, content_complete: bool) -> Self {
        ServerMessage::Response {
            response_id,
            content,
            content_complete,
            end_call: false,
        }
    }
}

/// Serializes an outbound message to its wire text.
pub fn encode(msg: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}
