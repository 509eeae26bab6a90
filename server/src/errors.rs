use shared::{CodecError, SchemaError};
use thiserror::Error;

use crate::session::SessionId;

/// Errors from the session registry. These indicate a caller bug (double
/// add, send to a gone session); the room itself keeps running.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session `{0}` already registered")]
    Duplicate(SessionId),
    #[error("session `{0}` not found")]
    NotFound(SessionId),
}

/// Errors surfaced through the room lifecycle and process boundary.
#[derive(Debug, Error)]
pub enum RoomError {
    /// `on_create` failed; the room never became active.
    #[error("room creation failed: {0}")]
    Creation(String),
    #[error("room type `{0}` is not defined")]
    UnknownType(String),
    #[error("room is not accepting joins")]
    NotActive,
    /// The room task is gone (disposed or crashed).
    #[error("room is closed")]
    Closed,
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("join rejected by admission policy")]
    JoinRejected,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Failure reported by an authentication collaborator.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AuthError(pub String);
