//! Room registry and process boundary
//!
//! The registry owns the table of live rooms and the factories that build
//! them. Everything past a [`RoomHandle`] happens on the room's own task;
//! the handle is just the command channel plus identity, cheap to clone
//! and safe to hold from any task. Rooms announce their own disposal on a
//! shared channel and a reaper task drops the table entry, so a handle to
//! a disposed room simply starts returning [`RoomError::Closed`].

use log::{info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::errors::RoomError;
use crate::room::{spawn_room, RoomCommand, RoomHandler};
use crate::session::SessionId;

/// Builds a fresh handler for each created room of a given type.
pub type RoomFactory = Box<dyn Fn() -> Box<dyn RoomHandler> + Send + Sync>;

const ROOM_ID_LEN: usize = 9;

fn generate_room_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_ID_LEN)
        .map(char::from)
        .collect()
}

/// Clonable reference to one live room.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    room_id: String,
    room_type: String,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn room_type(&self) -> &str {
        &self.room_type
    }

    /// Asks the room to admit a client. Resolves once authentication and
    /// admission finished; the room keeps running while they are pending.
    pub async fn join(
        &self,
        session_id: Option<String>,
        options: Vec<u8>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<SessionId, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Join {
                session_id,
                options,
                outbound,
                reply: reply_tx,
            })
            .map_err(|_| RoomError::Closed)?;
        reply_rx.await.map_err(|_| RoomError::Closed)?
    }

    /// Forwards raw inbound bytes from a session's transport.
    pub fn message(&self, session_id: SessionId, bytes: Vec<u8>) -> Result<(), RoomError> {
        self.tx
            .send(RoomCommand::Message { session_id, bytes })
            .map_err(|_| RoomError::Closed)
    }

    pub fn leave(&self, session_id: SessionId, consented: bool) -> Result<(), RoomError> {
        self.tx
            .send(RoomCommand::Leave {
                session_id,
                consented,
            })
            .map_err(|_| RoomError::Closed)
    }

    pub fn dispose(&self) -> Result<(), RoomError> {
        self.tx
            .send(RoomCommand::Dispose)
            .map_err(|_| RoomError::Closed)
    }

    pub async fn metadata(&self) -> Result<HashMap<String, String>, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Metadata { reply: reply_tx })
            .map_err(|_| RoomError::Closed)?;
        reply_rx.await.map_err(|_| RoomError::Closed)
    }
}

pub struct RoomRegistry {
    factories: RwLock<HashMap<String, RoomFactory>>,
    rooms: Arc<RwLock<HashMap<String, RoomHandle>>>,
    closed_tx: mpsc::UnboundedSender<String>,
}

impl RoomRegistry {
    pub fn new() -> Arc<Self> {
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<String>();
        let rooms: Arc<RwLock<HashMap<String, RoomHandle>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let reaper_rooms = Arc::clone(&rooms);
        tokio::spawn(async move {
            while let Some(room_id) = closed_rx.recv().await {
                if reaper_rooms.write().await.remove(&room_id).is_some() {
                    info!("room {} removed from registry", room_id);
                }
            }
        });

        Arc::new(Self {
            factories: RwLock::new(HashMap::new()),
            rooms,
            closed_tx,
        })
    }

    /// Registers a room type. Redefining a type replaces its factory;
    /// rooms already running keep their old handler.
    pub async fn define<F>(&self, room_type: &str, factory: F)
    where
        F: Fn() -> Box<dyn RoomHandler> + Send + Sync + 'static,
    {
        if self
            .factories
            .write()
            .await
            .insert(room_type.to_string(), Box::new(factory))
            .is_some()
        {
            warn!("room type {} redefined", room_type);
        }
    }

    /// Creates a room of a registered type. Resolves only after the
    /// room's `on_create` ran: a creation failure surfaces here and the
    /// room never appears in the table.
    pub async fn create(&self, room_type: &str, options: Vec<u8>) -> Result<RoomHandle, RoomError> {
        let handler = {
            let factories = self.factories.read().await;
            let factory = factories
                .get(room_type)
                .ok_or_else(|| RoomError::UnknownType(room_type.to_string()))?;
            factory()
        };

        let room_id = generate_room_id();
        let (tx, created) = spawn_room(
            room_id.clone(),
            handler,
            options,
            self.closed_tx.clone(),
        );
        created.await.map_err(|_| RoomError::Closed)??;

        let handle = RoomHandle {
            room_id: room_id.clone(),
            room_type: room_type.to_string(),
            tx,
        };
        self.rooms.write().await.insert(room_id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// First live room of the given type, or a fresh one. What a lobby
    /// would do with occupancy tracking, reduced to its simplest form.
    pub async fn join_or_create(
        &self,
        room_type: &str,
        options: Vec<u8>,
    ) -> Result<RoomHandle, RoomError> {
        let existing = {
            let rooms = self.rooms.read().await;
            rooms
                .values()
                .find(|h| h.room_type == room_type)
                .cloned()
        };
        match existing {
            Some(handle) => Ok(handle),
            None => self.create(room_type, options).await,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Requests disposal of every live room; used at shutdown.
    pub async fn dispose_all(&self) {
        for handle in self.rooms.read().await.values() {
            let _ = handle.dispose();
        }
    }
}
