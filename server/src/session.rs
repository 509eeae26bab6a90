//! Connected-client tracking for a room
//!
//! Each session pairs an opaque identity with an ordered outbound byte
//! queue. The registry enforces identity uniqueness, keeps delivery
//! per-session FIFO, and supports point-in-time broadcasts: membership is
//! snapshotted when the broadcast starts, so sessions joining or leaving
//! mid-broadcast are not retroactively included or excluded.

use log::{info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::protocol::{encode_packet, ServerPacket};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::errors::SessionError;

const SESSION_ID_LEN: usize = 9;

/// Opaque, unique-per-connection session identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_ID_LEN)
            .map(char::from)
            .collect();
        SessionId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        SessionId(s)
    }
}

/// One connected client within a room.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Opaque principal produced by the authentication collaborator.
    pub principal: Option<Vec<u8>>,
    /// Ordered outbound channel; the transport pumps the paired receiver.
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub joined_at: Instant,
    pub last_seen: Instant,
}

impl Session {
    pub fn new(
        id: SessionId,
        principal: Option<Vec<u8>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            principal,
            outbound,
            joined_at: now,
            last_seen: now,
        }
    }

    /// Enqueues a packet on this session's ordered outbound channel.
    /// Returns false if the transport side is gone.
    pub fn send(&self, packet: &ServerPacket) -> bool {
        match encode_packet(packet) {
            Ok(bytes) => self.outbound.send(bytes).is_ok(),
            Err(e) => {
                warn!("session {}: failed to encode outbound packet: {}", self.id, e);
                false
            }
        }
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// All sessions of one room, owned by the room task.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    pub fn add(&mut self, session: Session) -> Result<(), SessionError> {
        if self.sessions.contains_key(&session.id) {
            return Err(SessionError::Duplicate(session.id.clone()));
        }
        info!("session {} registered", session.id);
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Idempotent: removing an absent session is a no-op.
    pub fn remove(&mut self, id: &SessionId) -> bool {
        if self.sessions.remove(id).is_some() {
            info!("session {} removed", id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn send(&self, id: &SessionId, packet: &ServerPacket) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        if !session.send(packet) {
            warn!("session {}: outbound channel closed", id);
        }
        Ok(())
    }

    /// Delivers to every current session except `except`, against a
    /// snapshot of the membership taken at call time.
    pub fn broadcast(&self, packet: &ServerPacket, except: Option<&SessionId>) {
        let ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        for id in ids {
            if Some(&id) == except {
                continue;
            }
            if let Some(session) = self.sessions.get(&id) {
                session.send(packet);
            }
        }
    }

    pub fn mark_seen(&mut self, id: &SessionId) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.last_seen = Instant::now();
        }
    }

    /// Sessions with no inbound traffic within `timeout`, for the room to
    /// forcibly drop.
    pub fn stale(&self, timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.is_stale(timeout))
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
