//! # Room Client Library
//!
//! The consuming side of the room protocol: a [`replica::Replica`] holds
//! a local copy of a room's state tree and keeps it converged with the
//! server by applying snapshot and patch frames in arrival order, and a
//! [`replica::RoomConnection`] sorts the raw packet stream into state
//! updates (absorbed) and application events (surfaced).
//!
//! The client never simulates or predicts; the server is authoritative
//! and this crate only mirrors it. Transports stay out of scope — feed
//! [`replica::RoomConnection::handle`] whatever framed bytes your socket
//! produces.

pub mod replica;

pub use replica::{ConnectionError, Replica, RoomConnection, RoomEvent};
