//! Client-side replica of a room's authoritative state
//!
//! The server is the only writer. The replica just applies whatever sync
//! frames arrive, in arrival order: a snapshot rebuilds the tree, a patch
//! mutates the touched paths. Two replicas fed the same ordered frames
//! end up observationally identical, which is the whole contract.

use log::debug;
use shared::codec::{decode, CodecError};
use shared::protocol::{decode_server_packet, MessageKey, ServerPacket};
use shared::schema::{Schema, StateTree};
use std::sync::Arc;
use thiserror::Error;

pub struct Replica {
    tree: StateTree,
    last_version: u64,
}

impl Replica {
    /// The schema must match the server's; a mismatch surfaces as
    /// [`CodecError`]s on the first frame that touches a foreign path.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            tree: StateTree::new(schema),
            last_version: 0,
        }
    }

    /// Applies one sync frame. A failed patch leaves the replica exactly
    /// as it was. Empty input is a no-op.
    pub fn apply(&mut self, frame: &[u8]) -> Result<(), CodecError> {
        if frame.is_empty() {
            return Ok(());
        }
        self.last_version = decode(frame, &mut self.tree)?;
        debug!("replica at version {}", self.last_version);
        Ok(())
    }

    /// Read access to the replicated tree.
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// Root version reported by the server in the last applied frame.
    pub fn last_version(&self) -> u64 {
        self.last_version
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("undecodable packet: {0}")]
    Packet(#[from] bincode::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A server packet that concerns the caller. Sync frames never show up
/// here; they are folded into the replica before the caller sees anything.
#[derive(Debug)]
pub enum RoomEvent {
    Joined { session_id: String },
    Message { key: MessageKey, payload: Vec<u8> },
    Kicked { reason: String },
}

/// Splits the inbound packet stream of one room connection: state goes
/// into the replica, everything else comes back out as a [`RoomEvent`].
pub struct RoomConnection {
    replica: Replica,
    session_id: Option<String>,
}

impl RoomConnection {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            replica: Replica::new(schema),
            session_id: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Feeds one inbound packet.
    pub fn handle(&mut self, bytes: &[u8]) -> Result<Option<RoomEvent>, ConnectionError> {
        match decode_server_packet(bytes)? {
            ServerPacket::Welcome { session_id } => {
                self.session_id = Some(session_id.clone());
                Ok(Some(RoomEvent::Joined { session_id }))
            }
            ServerPacket::Sync { frame } => {
                self.replica.apply(&frame)?;
                Ok(None)
            }
            ServerPacket::Message { key, payload } => Ok(Some(RoomEvent::Message { key, payload })),
            ServerPacket::Kick { reason } => Ok(Some(RoomEvent::Kicked { reason })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::codec::{encode_full, flush};
    use shared::protocol::encode_packet;
    use shared::schema::{FieldType, FloatWidth, Value};

    fn scalar_schema() -> Arc<Schema> {
        let mut schema = Schema::new();
        schema
            .define_field("x", FieldType::Float(FloatWidth::F64), 0)
            .unwrap();
        schema.define_field("label", FieldType::String, 1).unwrap();
        Arc::new(schema)
    }

    #[test]
    fn snapshot_then_patches_track_the_source() {
        let schema = scalar_schema();
        let mut source = StateTree::new(schema.clone());
        let root = source.root();
        source.set(root, 0, Value::Float(1.5)).unwrap();
        source.set(root, 1, Value::Str("start".into())).unwrap();
        source.clear_dirty();

        let mut replica = Replica::new(schema);
        replica.apply(&encode_full(&source).unwrap()).unwrap();
        assert_approx_eq!(
            match replica.tree().get(replica.tree().root(), 0) {
                Some(Value::Float(x)) => x,
                other => panic!("unexpected {:?}", other),
            },
            1.5
        );

        source.set(root, 0, Value::Float(2.5)).unwrap();
        replica.apply(&flush(&mut source).unwrap()).unwrap();
        let r = replica.tree().root();
        assert_eq!(replica.tree().get(r, 0), Some(Value::Float(2.5)));
        assert_eq!(replica.tree().get(r, 1), Some(Value::Str("start".into())));
        assert_eq!(replica.last_version(), source.version());
    }

    #[test]
    fn two_replicas_fed_the_same_frames_converge() {
        let schema = scalar_schema();
        let mut source = StateTree::new(schema.clone());
        let root = source.root();

        let mut a = Replica::new(schema.clone());
        let mut b = Replica::new(schema);

        let mut frames = vec![encode_full(&source).unwrap()];
        source.set(root, 0, Value::Float(3.0)).unwrap();
        frames.push(flush(&mut source).unwrap());
        source.set(root, 1, Value::Str("later".into())).unwrap();
        source.set(root, 0, Value::Float(4.0)).unwrap();
        frames.push(flush(&mut source).unwrap());

        for frame in &frames {
            a.apply(frame).unwrap();
            b.apply(frame).unwrap();
        }
        assert_eq!(
            a.tree().snapshot(a.tree().root()).unwrap(),
            b.tree().snapshot(b.tree().root()).unwrap()
        );
        assert_eq!(a.last_version(), b.last_version());
    }

    #[test]
    fn connection_routes_sync_silently_and_surfaces_the_rest() {
        let schema = scalar_schema();
        let source = StateTree::new(schema.clone());
        let mut conn = RoomConnection::new(schema);

        let welcome = encode_packet(&ServerPacket::Welcome {
            session_id: "s1".into(),
        })
        .unwrap();
        match conn.handle(&welcome).unwrap() {
            Some(RoomEvent::Joined { session_id }) => assert_eq!(session_id, "s1"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(conn.session_id(), Some("s1"));

        let sync = encode_packet(&ServerPacket::Sync {
            frame: encode_full(&source).unwrap(),
        })
        .unwrap();
        assert!(conn.handle(&sync).unwrap().is_none());

        let kick = encode_packet(&ServerPacket::Kick {
            reason: "bye".into(),
        })
        .unwrap();
        assert!(matches!(
            conn.handle(&kick).unwrap(),
            Some(RoomEvent::Kicked { .. })
        ));
    }

    #[test]
    fn garbage_is_an_error_not_a_panic() {
        let mut conn = RoomConnection::new(scalar_schema());
        assert!(matches!(
            conn.handle(&[0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(ConnectionError::Packet(_))
        ));
    }
}
