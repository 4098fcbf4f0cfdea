use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de, ser::SerializeMap};
use thiserror::Error;

/// Integer discriminant carried in the `type` field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Hello = 1,
    Leave = 2,
    Status = 3,
    Peer = 4,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(MessageKind::Hello),
            2 => Some(MessageKind::Leave),
            3 => Some(MessageKind::Status),
            4 => Some(MessageKind::Peer),
            _ => None,
        }
    }
}

/// Membership snapshot sent by the relay. `from` is the session identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub from: String,
    pub peers: Vec<String>,
}

/// Application payload exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    pub from: String,
    /// Empty means broadcast to the whole session.
    pub to: Vec<String>,
    pub msg: Vec<u8>,
}

impl PeerMessage {
    pub fn broadcast(from: impl Into<String>, msg: impl Into<Vec<u8>>) -> Self {
        Self {
            from: from.into(),
            to: Vec::new(),
            msg: msg.into(),
        }
    }

    pub fn multicast(from: impl Into<String>, to: Vec<String>, msg: impl Into<Vec<u8>>) -> Self {
        Self {
            from: from.into(),
            to,
            msg: msg.into(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty()
    }
}

/// One protocol unit. On the wire this is a JSON object whose integer `type`
/// field selects the variant:
///
/// | type | fields |
/// |------|--------|
/// | 1 Hello  | `from` |
/// | 2 Leave  | `from` |
/// | 3 Status | `from`, `peers` |
/// | 4 Peer   | `from`, `to` (optional), `msg` (base64) |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    Hello { from: String },
    Leave { from: String },
    Status(StatusMessage),
    Peer(PeerMessage),
}

impl BusMessage {
    pub fn hello(from: impl Into<String>) -> Self {
        BusMessage::Hello { from: from.into() }
    }

    pub fn leave(from: impl Into<String>) -> Self {
        BusMessage::Leave { from: from.into() }
    }

    pub fn status(session_id: impl Into<String>, peers: Vec<String>) -> Self {
        BusMessage::Status(StatusMessage {
            from: session_id.into(),
            peers,
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            BusMessage::Hello { .. } => MessageKind::Hello,
            BusMessage::Leave { .. } => MessageKind::Leave,
            BusMessage::Status(_) => MessageKind::Status,
            BusMessage::Peer(_) => MessageKind::Peer,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            BusMessage::Hello { from } | BusMessage::Leave { from } => from,
            BusMessage::Status(status) => &status.from,
            BusMessage::Peer(peer) => &peer.from,
        }
    }

    /// Encodes the message as a single JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a frame in two passes: the `type` and `from` fields first, then
    /// the fields of the variant the discriminant selects.
    ///
    /// Only structure is checked here. Whether `from` is acceptable is up to the
    /// session receiving the message.
    pub fn decode(frame: &[u8]) -> Result<Self, MalformedMessage> {
        let envelope: Envelope = serde_json::from_slice(frame)?;
        let kind = MessageKind::from_code(envelope.kind)
            .ok_or(MalformedMessage::UnknownType(envelope.kind))?;

        let message = match kind {
            MessageKind::Hello => BusMessage::Hello {
                from: envelope.from,
            },
            MessageKind::Leave => BusMessage::Leave {
                from: envelope.from,
            },
            MessageKind::Status => {
                let fields: StatusFields = serde_json::from_slice(frame)?;
                BusMessage::Status(StatusMessage {
                    from: envelope.from,
                    peers: fields.peers,
                })
            }
            MessageKind::Peer => {
                let fields: PeerFields = serde_json::from_slice(frame)?;
                BusMessage::Peer(PeerMessage {
                    from: envelope.from,
                    to: fields.to,
                    msg: fields.msg,
                })
            }
        };

        Ok(message)
    }
}

impl From<PeerMessage> for BusMessage {
    fn from(message: PeerMessage) -> Self {
        BusMessage::Peer(message)
    }
}

impl From<StatusMessage> for BusMessage {
    fn from(message: StatusMessage) -> Self {
        BusMessage::Status(message)
    }
}

impl Serialize for BusMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", &self.kind().code())?;
        map.serialize_entry("from", self.sender())?;
        match self {
            BusMessage::Hello { .. } | BusMessage::Leave { .. } => {}
            BusMessage::Status(status) => map.serialize_entry("peers", &status.peers)?,
            BusMessage::Peer(peer) => {
                if !peer.is_broadcast() {
                    map.serialize_entry("to", &peer.to)?;
                }
                map.serialize_entry("msg", &STANDARD.encode(&peer.msg))?;
            }
        }
        map.end()
    }
}

#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("message type {0} is unknown")]
    UnknownType(i64),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: i64,
    from: String,
}

#[derive(Deserialize)]
struct StatusFields {
    #[serde(deserialize_with = "nullable")]
    peers: Vec<String>,
}

#[derive(Deserialize)]
struct PeerFields {
    #[serde(default, deserialize_with = "nullable")]
    to: Vec<String>,
    #[serde(deserialize_with = "payload")]
    msg: Vec<u8>,
}

// Clients built on other JSON stacks send `null` for empty lists and payloads.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn payload<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(encoded) => STANDARD.decode(encoded).map_err(de::Error::custom),
        None => Ok(Vec::new()),
    }
}
