//! # Room Server Library
//!
//! This library provides the authoritative runtime for multiplayer rooms.
//! A room owns a schema-driven state tree, runs the game logic supplied by
//! its [`room::RoomHandler`], and keeps every connected client's replica
//! converged by broadcasting deltas of exactly what changed.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! The room's state tree is the definitive version of the shared state.
//! Clients never mutate it directly; they send application messages, the
//! room's handlers decide what changes, and the change tracker records
//! every touched path so the next flush sends a minimal patch.
//!
//! ### Room Lifecycle
//! Rooms move through `Creating -> Active -> Disposing -> Disposed`.
//! Handles the complete lifecycle of a session within a room including:
//! - Asynchronous authentication and synchronous admission on join
//! - Welcome + full snapshot delivery before any patches
//! - Consented and unconsented leave paths
//! - Automatic disposal once the last session leaves
//!
//! ### Scheduling
//! Each room runs a fixed-cadence simulation tick plus arbitrary one-shot
//! and repeating timers, all executed on the room's own task so handlers
//! never need locks.
//!
//! ## Architecture Design
//!
//! ### One Task Per Room
//! A room is a single tokio task multiplexing its command inbox, resolved
//! authentications, the simulation interval and the timer wheel through
//! one `select!` loop. All state mutation is serialized on that task;
//! rooms scale horizontally as independent tasks.
//!
//! ### Transport Independence
//! The runtime only ever sees per-session byte channels. The bundled TCP
//! adapter is one way to pump them; any transport that can deliver framed
//! bytes works without touching room code.
//!
//! ## Module Organization
//!
//! ### Room Module (`room`)
//! The lifecycle controller: the handler trait, the per-room context
//! handed to callbacks, and the event loop tying inbox, clock, router and
//! patch flushing together.
//!
//! ### Registry Module (`registry`)
//! The process boundary: room type factories, room creation, the table of
//! live rooms, and clonable handles used by transports.
//!
//! ### Session Module (`session`)
//! Connected-client bookkeeping: ids, principals, ordered outbound
//! channels, staleness tracking, broadcast.
//!
//! ### Router Module (`router`)
//! Maps message keys to handler callbacks, with a wildcard fallback and
//! drop-with-warning for unroutable messages.
//!
//! ### Clock Module (`clock`)
//! Deadline-ordered timer store driven by the room loop.

pub mod clock;
pub mod errors;
pub mod registry;
pub mod room;
pub mod router;
pub mod session;
pub mod transport;
