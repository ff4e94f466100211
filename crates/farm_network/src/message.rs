//! Message envelope: the immutable unit exchanged between farm nodes.
//!
//! Every frame on the wire is the ASCII tag [`FRAME_TAG`] followed by a
//! compact JSON body. The tag lets nodes running a different format version
//! reject frames cleanly instead of misparsing them. Decoding never panics:
//! every failure comes back as [`NetworkError::MalformedEnvelope`] or
//! [`NetworkError::UnknownKind`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::Severity;
use crate::error::NetworkError;
use crate::identity::PeerId;

/// Format tag preceding every encoded envelope.
pub const FRAME_TAG: &[u8] = b"FARMNET/1\n";

/// Largest frame a node will attempt to decode.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Protocol ceiling for both `ttl_hops` and `path` length.
pub const MAX_TTL_HOPS: u8 = 16;

// ---------------------------------------------------------------------------
// Identifiers and kinds
// ---------------------------------------------------------------------------

/// Network-wide message identifier: `"<origin>:<sequence>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(origin: &PeerId, sequence: u64) -> Self {
        Self(format!("{origin}:{sequence}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The origin part of the id.
    pub fn origin(&self) -> Option<&str> {
        self.0.rsplit_once(':').map(|(origin, _)| origin)
    }

    /// The origin-local sequence number.
    pub fn sequence(&self) -> Option<u64> {
        self.0
            .rsplit_once(':')
            .and_then(|(_, seq)| seq.parse().ok())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The kind of message carried in an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Pest outbreak alert from a detection pipeline.
    PestAlert,
    /// Liveness probe between direct neighbors, never relayed.
    Heartbeat,
    /// Free-text question flooded to the network.
    Query,
    /// Answer to a [`MessageKind::Query`].
    QueryResponse,
}

impl MessageKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PestAlert => "PEST_ALERT",
            Self::Heartbeat => "HEARTBEAT",
            Self::Query => "QUERY",
            Self::QueryResponse => "QUERY_RESPONSE",
        }
    }

    /// Parse a wire name; `None` for kinds this version does not know.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "PEST_ALERT" => Some(Self::PestAlert),
            "HEARTBEAT" => Some(Self::Heartbeat),
            "QUERY" => Some(Self::Query),
            "QUERY_RESPONSE" => Some(Self::QueryResponse),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Content of a `PEST_ALERT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PestAlert {
    pub severity: Severity,
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pest_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pest_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PestAlert {
    pub fn new(severity: Severity, zone: impl Into<String>) -> Self {
        Self {
            severity,
            zone: zone.into(),
            pest_type: None,
            pest_count: None,
            note: None,
        }
    }
}

/// Content of a `HEARTBEAT`: where the sender can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Heartbeat {
    pub address: String,
}

/// Content of a `QUERY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Query {
    pub text: String,
}

/// Content of a `QUERY_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryResponse {
    /// The query being answered.
    pub query_id: MessageId,
    /// The node that asked; the response is delivered there.
    pub query_origin: PeerId,
    /// Path the query took to reach the responder, origin first.
    pub reply_path: Vec<PeerId>,
    pub text: String,
}

/// Typed payload; one fixed shape per [`MessageKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PestAlert(PestAlert),
    Heartbeat(Heartbeat),
    Query(Query),
    QueryResponse(QueryResponse),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::PestAlert(_) => MessageKind::PestAlert,
            Self::Heartbeat(_) => MessageKind::Heartbeat,
            Self::Query(_) => MessageKind::Query,
            Self::QueryResponse(_) => MessageKind::QueryResponse,
        }
    }

    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::PestAlert(p) => serde_json::to_value(p),
            Self::Heartbeat(p) => serde_json::to_value(p),
            Self::Query(p) => serde_json::to_value(p),
            Self::QueryResponse(p) => serde_json::to_value(p),
        }
    }

    fn from_value(kind: MessageKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::PestAlert => Self::PestAlert(serde_json::from_value(value)?),
            MessageKind::Heartbeat => Self::Heartbeat(serde_json::from_value(value)?),
            MessageKind::Query => Self::Query(serde_json::from_value(value)?),
            MessageKind::QueryResponse => Self::QueryResponse(serde_json::from_value(value)?),
        })
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A network message envelope.
///
/// `id`, `origin`, `payload` and `created_at` never change after creation.
/// Only `ttl_hops` and `path` evolve, and only through
/// [`Envelope::forwarded_by`], which returns a new copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    id: MessageId,
    origin: PeerId,
    payload: Payload,
    ttl_hops: u8,
    created_at: DateTime<Utc>,
    path: Vec<PeerId>,
}

impl Envelope {
    /// Create a fresh envelope originated by `origin`.
    pub fn new(origin: PeerId, sequence: u64, payload: Payload, ttl_hops: u8) -> Self {
        Self {
            id: MessageId::new(&origin, sequence),
            origin,
            payload,
            ttl_hops: ttl_hops.min(MAX_TTL_HOPS),
            created_at: Utc::now(),
            path: Vec::new(),
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn origin(&self) -> &PeerId {
        &self.origin
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn ttl_hops(&self) -> u8 {
        self.ttl_hops
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Nodes that already forwarded this copy, oldest first.
    pub fn path(&self) -> &[PeerId] {
        &self.path
    }

    /// The node that handed us this copy, if it was relayed.
    pub fn last_hop(&self) -> Option<&PeerId> {
        self.path.last()
    }

    pub fn has_visited(&self, peer: &PeerId) -> bool {
        self.path.contains(peer)
    }

    /// The copy `peer` sends onward: one hop spent, `peer` appended to path.
    pub fn forwarded_by(&self, peer: &PeerId) -> Self {
        let mut next = self.clone();
        next.ttl_hops = self.ttl_hops.saturating_sub(1);
        next.path.push(peer.clone());
        next
    }

    /// Encode into a tagged wire frame.
    pub fn to_wire(&self) -> Result<Vec<u8>, NetworkError> {
        let body = serde_json::to_vec(&WireEnvelope::try_from_envelope(self)?)?;
        let mut frame = Vec::with_capacity(FRAME_TAG.len() + body.len());
        frame.extend_from_slice(FRAME_TAG);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a tagged wire frame.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, NetworkError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(NetworkError::MalformedEnvelope(format!(
                "frame of {} bytes exceeds {MAX_FRAME_BYTES}",
                bytes.len()
            )));
        }
        let body = match bytes.strip_prefix(FRAME_TAG) {
            Some(body) => body,
            None if bytes.starts_with(b"FARMNET/") => {
                return Err(NetworkError::MalformedEnvelope(
                    "unsupported format version".to_string(),
                ));
            }
            None => {
                return Err(NetworkError::MalformedEnvelope(
                    "missing format tag".to_string(),
                ));
            }
        };
        let wire: WireEnvelope = serde_json::from_slice(body)
            .map_err(|e| NetworkError::MalformedEnvelope(e.to_string()))?;
        Envelope::try_from(wire)
    }
}

// ---------------------------------------------------------------------------
// Wire representation
// ---------------------------------------------------------------------------

/// Field order here is the serialized order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEnvelope {
    id: MessageId,
    origin: PeerId,
    kind: String,
    payload: serde_json::Value,
    ttl_hops: u8,
    created_at: DateTime<Utc>,
    path: Vec<PeerId>,
}

impl WireEnvelope {
    fn try_from_envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: envelope.id.clone(),
            origin: envelope.origin.clone(),
            kind: envelope.kind().as_str().to_string(),
            payload: envelope.payload.to_value()?,
            ttl_hops: envelope.ttl_hops,
            created_at: envelope.created_at,
            path: envelope.path.clone(),
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        // Payload structs hold only strings, numbers and enums, so value
        // conversion cannot fail for them.
        let payload = envelope.payload.to_value().unwrap_or(serde_json::Value::Null);
        Self {
            kind: envelope.kind().as_str().to_string(),
            id: envelope.id,
            origin: envelope.origin,
            payload,
            ttl_hops: envelope.ttl_hops,
            created_at: envelope.created_at,
            path: envelope.path,
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = NetworkError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let malformed = |reason: String| NetworkError::MalformedEnvelope(reason);

        if wire.ttl_hops > MAX_TTL_HOPS {
            return Err(malformed(format!("ttl_hops {} above limit", wire.ttl_hops)));
        }
        if wire.path.len() > usize::from(MAX_TTL_HOPS) {
            return Err(malformed(format!("path of {} hops above limit", wire.path.len())));
        }
        if wire.id.origin() != Some(wire.origin.as_str()) || wire.id.sequence().is_none() {
            return Err(malformed(format!(
                "id {} does not belong to origin {}",
                wire.id, wire.origin
            )));
        }
        let kind = MessageKind::parse(&wire.kind)
            .ok_or_else(|| NetworkError::UnknownKind(wire.kind.clone()))?;
        let payload = Payload::from_value(kind, wire.payload)
            .map_err(|e| malformed(format!("{kind} payload: {e}")))?;

        Ok(Self {
            id: wire.id,
            origin: wire.origin,
            payload,
            ttl_hops: wire.ttl_hops,
            created_at: wire.created_at,
            path: wire.path,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
