//! Inbound message dispatch
//!
//! Routes `(key, payload)` messages from sessions to handlers the room
//! registered during `on_create` (or later). Exact key first, then the
//! wildcard, else the message is dropped with a log line — an unroutable
//! message must never take the room down.

use log::{debug, warn};
use shared::MessageKey;
use std::collections::HashMap;

use crate::room::RoomContext;
use crate::session::SessionId;

pub type MessageHandler = Box<dyn FnMut(&mut RoomContext, &SessionId, &[u8]) + Send>;
pub type WildcardHandler = Box<dyn FnMut(&mut RoomContext, &SessionId, &MessageKey, &[u8]) + Send>;

#[derive(Default)]
pub struct MessageRouter {
    handlers: HashMap<MessageKey, MessageHandler>,
    wildcard: Option<WildcardHandler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            wildcard: None,
        }
    }

    /// Registers the handler for an exact key. Registering the same key
    /// again replaces the previous handler (last registration wins).
    pub fn on(&mut self, key: MessageKey, handler: MessageHandler) {
        if self.handlers.insert(key.clone(), handler).is_some() {
            debug!("message handler for `{}` replaced", key);
        }
    }

    /// Registers the catch-all, invoked for any key with no exact handler.
    pub fn on_any(&mut self, handler: WildcardHandler) {
        if self.wildcard.replace(handler).is_some() {
            debug!("wildcard message handler replaced");
        }
    }

    pub fn has_handler(&self, key: &MessageKey) -> bool {
        self.handlers.contains_key(key)
    }

    /// Dispatches one inbound message. Handlers may re-register routes
    /// through the context; those registrations are applied by the room
    /// loop after dispatch returns.
    pub fn dispatch(
        &mut self,
        ctx: &mut RoomContext,
        session_id: &SessionId,
        key: &MessageKey,
        payload: &[u8],
    ) {
        if let Some(mut handler) = self.handlers.remove(key) {
            handler(ctx, session_id, payload);
            self.handlers.entry(key.clone()).or_insert(handler);
        } else if let Some(mut wildcard) = self.wildcard.take() {
            wildcard(ctx, session_id, key, payload);
            if self.wildcard.is_none() {
                self.wildcard = Some(wildcard);
            }
        } else {
            warn!(
                "dropping message `{}` from session {}: no handler registered",
                key, session_id
            );
        }
    }
}
