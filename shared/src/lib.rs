use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PEERS: usize = 4;
pub const MAX_ID_LEN: usize = 64;
pub const MAX_FIELDS: usize = 32;
/// Longest text field value; with `MAX_FIELDS` this keeps any valid envelope
/// inside one datagram.
pub const MAX_TEXT_LEN: usize = 256;
pub const MAX_DATAGRAM_SIZE: usize = 16 * 1024;

pub type EntityId = String;

/// Identity of one participant, stable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Host,
    Member,
}

/// One row of the room service's membership listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub peer_id: PeerId,
    pub is_host: bool,
}

impl Member {
    pub fn new(peer_id: impl Into<String>, is_host: bool) -> Self {
        Self {
            peer_id: PeerId::new(peer_id),
            is_host,
        }
    }

    pub fn role(&self) -> Role {
        if self.is_host {
            Role::Host
        } else {
            Role::Member
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// Type-specific extra fields carried by spawn and action payloads.
pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovePayload {
    pub entity_id: EntityId,
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub vx: f32,
    pub vy: f32,
}

impl MovePayload {
    pub fn new(entity_id: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            entity_id: entity_id.into(),
            x,
            y,
            angle: 0.0,
            vx: 0.0,
            vy: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnPayload {
    pub entity_id: EntityId,
    pub entity_type: String,
    pub x: f32,
    pub y: f32,
    pub fields: Fields,
}

impl SpawnPayload {
    pub fn new(entity_id: impl Into<String>, entity_type: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            x,
            y,
            fields: Fields::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.fields.get(key), Some(FieldValue::Bool(true)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub entity_id: EntityId,
    pub action_type: String,
    pub fields: Fields,
}

impl ActionPayload {
    pub fn new(entity_id: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            action_type: action_type.into(),
            fields: Fields::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub entity_id: EntityId,
}

/// The closed set of synchronization messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Move(MovePayload),
    Spawn(SpawnPayload),
    Action(ActionPayload),
    Delete(DeletePayload),
    RequestSpawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Move,
    Spawn,
    Action,
    Delete,
    RequestSpawn,
}

/// How an envelope leaves the local peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Coalesced and rate limited, stale values are superseded.
    Batched,
    /// Sent on every open link right away.
    Immediate,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 5] = [
        EnvelopeKind::Move,
        EnvelopeKind::Spawn,
        EnvelopeKind::Action,
        EnvelopeKind::Delete,
        EnvelopeKind::RequestSpawn,
    ];

    pub fn delivery(self) -> Delivery {
        match self {
            EnvelopeKind::Move => Delivery::Batched,
            EnvelopeKind::Spawn
            | EnvelopeKind::Action
            | EnvelopeKind::Delete
            | EnvelopeKind::RequestSpawn => Delivery::Immediate,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Move => "move",
            EnvelopeKind::Spawn => "spawn",
            EnvelopeKind::Action => "action",
            EnvelopeKind::Delete => "delete",
            EnvelopeKind::RequestSpawn => "request_spawn",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons an envelope fails shape validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShapeError {
    #[error("empty or oversized {0}")]
    BadId(&'static str),
    #[error("non-finite {0}")]
    NonFinite(&'static str),
    #[error("too many fields ({0})")]
    TooManyFields(usize),
    #[error("invalid field {0:?}")]
    BadField(String),
}

/// One discrete synchronization message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: PeerId,
    pub sent_at: u64,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(sender: PeerId, payload: Payload) -> Self {
        Self {
            sender,
            sent_at: timestamp_ms(),
            payload,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.payload {
            Payload::Move(_) => EnvelopeKind::Move,
            Payload::Spawn(_) => EnvelopeKind::Spawn,
            Payload::Action(_) => EnvelopeKind::Action,
            Payload::Delete(_) => EnvelopeKind::Delete,
            Payload::RequestSpawn => EnvelopeKind::RequestSpawn,
        }
    }

    pub fn entity_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::Move(p) => Some(&p.entity_id),
            Payload::Spawn(p) => Some(&p.entity_id),
            Payload::Action(p) => Some(&p.entity_id),
            Payload::Delete(p) => Some(&p.entity_id),
            Payload::RequestSpawn => None,
        }
    }

    /// Checks the payload shape before it reaches game logic.
    pub fn validate(&self) -> Result<(), ShapeError> {
        check_id(self.sender.as_str(), "sender")?;

        match &self.payload {
            Payload::Move(p) => {
                check_id(&p.entity_id, "entity_id")?;
                check_finite(p.x, "x")?;
                check_finite(p.y, "y")?;
                check_finite(p.angle, "angle")?;
                check_finite(p.vx, "vx")?;
                check_finite(p.vy, "vy")?;
            }
            Payload::Spawn(p) => {
                check_id(&p.entity_id, "entity_id")?;
                check_id(&p.entity_type, "entity_type")?;
                check_finite(p.x, "x")?;
                check_finite(p.y, "y")?;
                check_fields(&p.fields)?;
            }
            Payload::Action(p) => {
                check_id(&p.entity_id, "entity_id")?;
                check_id(&p.action_type, "action_type")?;
                check_fields(&p.fields)?;
            }
            Payload::Delete(p) => check_id(&p.entity_id, "entity_id")?,
            Payload::RequestSpawn => {}
        }

        Ok(())
    }
}

fn check_id(id: &str, what: &'static str) -> Result<(), ShapeError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(ShapeError::BadId(what));
    }
    Ok(())
}

fn check_finite(value: f32, what: &'static str) -> Result<(), ShapeError> {
    if !value.is_finite() {
        return Err(ShapeError::NonFinite(what));
    }
    Ok(())
}

fn check_fields(fields: &Fields) -> Result<(), ShapeError> {
    if fields.len() > MAX_FIELDS {
        return Err(ShapeError::TooManyFields(fields.len()));
    }
    for (key, value) in fields {
        let bad_value = match value {
            FieldValue::Number(n) => !n.is_finite(),
            FieldValue::Text(text) => text.len() > MAX_TEXT_LEN,
            FieldValue::Bool(_) => false,
        };
        if key.is_empty() || key.len() > MAX_ID_LEN || bad_value {
            return Err(ShapeError::BadField(key.clone()));
        }
    }
    Ok(())
}

/// Traffic on a direct link between two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkPacket {
    Envelope(Envelope),
    Batch(Vec<Envelope>),
    Heartbeat { sent_at: u64 },
    Goodbye,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// A handshake record left in the relay mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub from: PeerId,
    pub to: PeerId,
    pub kind: SignalKind,
    pub data: String,
    pub room: RoomId,
}

/// Traffic between a peer and the signaling relay / room service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayPacket {
    // Peer -> relay
    Join {
        room: RoomId,
        peer: PeerId,
        version: u32,
    },
    Leave {
        room: RoomId,
        peer: PeerId,
    },
    Heartbeat {
        room: RoomId,
        peer: PeerId,
    },
    Post {
        record: SignalRecord,
    },
    Fetch {
        room: RoomId,
        peer: PeerId,
    },
    Ack {
        room: RoomId,
        ids: Vec<u64>,
    },

    // Relay -> peer
    Members {
        room: RoomId,
        members: Vec<Member>,
    },
    Records {
        room: RoomId,
        records: Vec<(u64, SignalRecord)>,
    },
    Undeliverable {
        room: RoomId,
        to: PeerId,
    },
    Rejected {
        reason: String,
    },
}

/// Current wall-clock time in milliseconds.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
