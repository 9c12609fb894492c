//! Envelope and payload types for the finmesh wire protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};

/// The closed set of message kinds exchanged between nodes.
///
/// Wire names are fixed; a `type` outside this set fails decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// A shared chat exchange (user text plus bot response).
    #[serde(rename = "chat_request")]
    Chat,
    /// One or more critical-condition alert records.
    #[serde(rename = "critical_alert")]
    Alert,
    /// A database query forwarded between nodes.
    #[serde(rename = "db_query")]
    Query,
    /// Join/welcome handshake traffic.
    #[serde(rename = "node_discovery")]
    Discovery,
    /// A reply to an earlier query.
    #[serde(rename = "response")]
    Response,
    /// Liveness echo.
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl MessageKind {
    /// Returns the wire name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat_request",
            Self::Alert => "critical_alert",
            Self::Query => "db_query",
            Self::Discovery => "node_discovery",
            Self::Response => "response",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of wire exchange between nodes.
///
/// `content` is opaque to the protocol: it must be present but is never
/// interpreted here. `target_id` is serialized as an explicit `null` when the
/// envelope is a broadcast; when present the envelope is meant for exactly
/// one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Identifier of the originating node; non-empty.
    pub sender_id: String,
    /// Intended recipient, if this is a unicast envelope.
    #[serde(default)]
    pub target_id: Option<String>,
    /// Kind-specific payload, passed through opaquely.
    pub content: Value,
    /// Capture time at creation.
    pub timestamp: DateTime<Utc>,
    /// `"{sender_id}_{millis}"`; used for logging and dedup, not ordering.
    #[serde(default)]
    pub message_id: String,
}

impl Envelope {
    /// Creates an envelope with a fresh timestamp and message id.
    pub fn new(
        kind: MessageKind,
        content: Value,
        sender_id: impl Into<String>,
        target_id: Option<String>,
    ) -> Self {
        let sender_id = sender_id.into();
        let now = Utc::now();
        let message_id = format!("{}_{}", sender_id, now.timestamp_millis());
        Self {
            kind,
            sender_id,
            target_id,
            content,
            timestamp: now,
            message_id,
        }
    }

    /// Creates a broadcast envelope (no target).
    pub fn broadcast(kind: MessageKind, content: Value, sender_id: impl Into<String>) -> Self {
        Self::new(kind, content, sender_id, None)
    }

    /// Creates an envelope addressed to a single peer.
    pub fn addressed(
        kind: MessageKind,
        content: Value,
        sender_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self::new(kind, content, sender_id, Some(target_id.into()))
    }

    /// True when the envelope is meant for exactly one peer.
    pub fn is_addressed(&self) -> bool {
        self.target_id.is_some()
    }

    /// Checks the invariants that field presence alone cannot express.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.sender_id.is_empty() {
            return Err(ProtocolError::invalid("empty sender_id"));
        }
        Ok(())
    }

    /// Parses an unframed JSON payload into a validated envelope.
    ///
    /// Missing `type`, `sender_id`, `content`, or `timestamp` fields are
    /// rejected here (the serde derive has no defaults for them), as is an
    /// empty `sender_id`.
    pub fn from_json_slice(bytes: &[u8]) -> ProtocolResult<Envelope> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// Discovery handshake actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryAction {
    /// Sent by a node introducing itself over a fresh connection.
    Join,
    /// Reply confirming the join was registered.
    Welcome,
}

/// Payload of a Discovery envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    /// Identifier the sender wants to be known by.
    pub node_id: String,
    /// Handshake step.
    pub action: DiscoveryAction,
}

impl DiscoveryPayload {
    /// Creates a join payload.
    pub fn join(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            action: DiscoveryAction::Join,
        }
    }

    /// Creates a welcome payload.
    pub fn welcome(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            action: DiscoveryAction::Welcome,
        }
    }
}

/// Payload of a Heartbeat reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Liveness marker.
    pub status: String,
    /// Time the reply was produced.
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatPayload {
    /// Creates an "alive" marker stamped with the current time.
    pub fn alive() -> Self {
        Self {
            status: "alive".to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Context marker attached to shared chat exchanges.
pub const CHAT_CONTEXT: &str = "financial_chat";

/// Payload of a Chat envelope: one user/bot exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// What the user asked.
    pub user_input: String,
    /// What the bot answered.
    pub bot_response: String,
    /// Conversation context marker.
    pub context: String,
    /// When the exchange was shared.
    pub timestamp: DateTime<Utc>,
}

impl ChatPayload {
    /// Packages a conversation turn for sharing.
    pub fn new(user_input: impl Into<String>, bot_response: impl Into<String>) -> Self {
        Self {
            user_input: user_input.into(),
            bot_response: bot_response.into(),
            context: CHAT_CONTEXT.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// One critical-condition alert record.
///
/// The detector that produces these lives outside the mesh layer; beyond the
/// type marker and message, fields pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Severity/type marker, e.g. `low_balance`.
    #[serde(rename = "type")]
    pub alert_type: String,
    /// Human-readable description of the condition.
    pub message: String,
    /// Detector-specific extras (account names, amounts, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl AlertRecord {
    /// Creates an alert record with no extra fields.
    pub fn new(alert_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            alert_type: alert_type.into(),
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }

    /// Builder: attach a detector-specific field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}
