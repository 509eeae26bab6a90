//! Packets exchanged between the room server and its clients
//!
//! The transport only carries opaque byte messages; both ends bincode
//! these enums at the boundary. Application payloads stay raw bytes so
//! handlers can decode whatever shape they declared.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing key of an application message: a string name or a small
/// integer tag, whichever the room registered its handler under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKey {
    Name(String),
    Tag(u8),
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Name(n) => write!(f, "{}", n),
            MessageKey::Tag(t) => write!(f, "#{}", t),
        }
    }
}

impl From<&str> for MessageKey {
    fn from(name: &str) -> Self {
        MessageKey::Name(name.to_string())
    }
}

impl From<u8> for MessageKey {
    fn from(tag: u8) -> Self {
        MessageKey::Tag(tag)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ServerPacket {
    /// Join accepted; the assigned session id follows.
    Welcome { session_id: String },
    /// A snapshot or patch frame (see [`crate::codec`]).
    Sync { frame: Vec<u8> },
    /// Application message from the room to this client.
    Message { key: MessageKey, payload: Vec<u8> },
    /// The server is closing this session.
    Kick { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientPacket {
    /// First packet on a fresh connection: which room type to join, with
    /// opaque join options. Consumed by the process boundary; rooms never
    /// see it.
    Join {
        room_type: String,
        options: Vec<u8>,
    },
    /// Application message to the room's registered handlers.
    AppMessage { key: MessageKey, payload: Vec<u8> },
    /// Voluntary leave (`consented = true` on the server side).
    Leave,
}

pub fn encode_packet<T: Serialize>(packet: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(packet)
}

pub fn decode_server_packet(bytes: &[u8]) -> Result<ServerPacket, bincode::Error> {
    bincode::deserialize(bytes)
}

pub fn decode_client_packet(bytes: &[u8]) -> Result<ClientPacket, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_serialization_roundtrip() {
        let packets = vec![
            ServerPacket::Welcome {
                session_id: "abc123XYZ".to_string(),
            },
            ServerPacket::Sync {
                frame: vec![1, 0, 42],
            },
            ServerPacket::Message {
                key: MessageKey::Name("broadcast".to_string()),
                payload: vec![9, 9],
            },
            ServerPacket::Kick {
                reason: "room disposed".to_string(),
            },
        ];

        for packet in packets {
            let bytes = encode_packet(&packet).unwrap();
            let back = decode_server_packet(&bytes).unwrap();
            match (&packet, &back) {
                (ServerPacket::Welcome { session_id: a }, ServerPacket::Welcome { session_id: b }) => {
                    assert_eq!(a, b)
                }
                (ServerPacket::Sync { frame: a }, ServerPacket::Sync { frame: b }) => {
                    assert_eq!(a, b)
                }
                (ServerPacket::Message { key: a, .. }, ServerPacket::Message { key: b, .. }) => {
                    assert_eq!(a, b)
                }
                (ServerPacket::Kick { reason: a }, ServerPacket::Kick { reason: b }) => {
                    assert_eq!(a, b)
                }
                _ => panic!("packet type mismatch after roundtrip"),
            }
        }
    }

    #[test]
    fn message_keys_from_literals() {
        assert_eq!(MessageKey::from("move"), MessageKey::Name("move".into()));
        assert_eq!(MessageKey::from(3u8), MessageKey::Tag(3));
        assert_eq!(MessageKey::from(3u8).to_string(), "#3");
    }
}
