//! Common functionality shared between the room server and its clients:
//! the schema-driven state model with change tracking, the snapshot/delta
//! wire codec, and the packet types both ends exchange.

pub mod codec;
pub mod protocol;
pub mod schema;

pub use codec::{decode, encode_delta, encode_full, flush, CodecError, SyncFrame, WIRE_VERSION};
pub use protocol::{ClientPacket, MessageKey, ServerPacket};
pub use schema::{
    ChangeKind, FieldDef, FieldType, FloatWidth, IntWidth, NodeId, Op, PatchOp, PathSeg, Schema,
    SchemaError, StateTree, Value, WireValue,
};

/// Default simulation/patch cadence when a room enables the tick without
/// choosing a period.
pub const DEFAULT_TICK_MS: u64 = 50;
