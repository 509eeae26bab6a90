//! Wire encoding of snapshots and deltas
//!
//! A frame is two little-endian bytes of [`WIRE_VERSION`] followed by a
//! bincode-encoded [`SyncFrame`]. The version check is done before bincode
//! gets a look at the payload, so an encoder/decoder mismatch fails loudly
//! instead of silently corrupting replicated state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::{render_path, Op, PatchOp, PathSeg, SchemaError, StateTree, Value, WireValue};

/// Bumped whenever the frame layout or patch semantics change.
pub const WIRE_VERSION: u16 = 1;

/// One synchronization message: everything, or just what changed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SyncFrame {
    /// Full state, sent on join or resync. `version` is the sender's root
    /// version at encode time.
    Snapshot { version: u64, root: WireValue },
    /// Changes since the sender's previous flush, in recording order.
    Patch { version: u64, ops: Vec<PatchOp> },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("wire version mismatch: got {got}, expected {expected}")]
    WireVersion { got: u16, expected: u16 },
    #[error("malformed frame: {0}")]
    Corrupt(String),
    #[error("patch path `{path}` does not exist on the target model")]
    BadPath { path: String },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

fn bad_path(path: &[PathSeg]) -> CodecError {
    CodecError::BadPath {
        path: render_path(path),
    }
}

fn frame_bytes(frame: &SyncFrame) -> Result<Vec<u8>, CodecError> {
    let mut out = WIRE_VERSION.to_le_bytes().to_vec();
    let body = bincode::serialize(frame).map_err(|e| CodecError::Corrupt(e.to_string()))?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Checks the wire version and decodes the frame body. Returns the raw
/// frame without applying it; [`decode`] is the apply path.
pub fn parse_frame(bytes: &[u8]) -> Result<SyncFrame, CodecError> {
    if bytes.len() < 3 {
        return Err(CodecError::Corrupt("frame too short".to_string()));
    }
    let got = u16::from_le_bytes([bytes[0], bytes[1]]);
    if got != WIRE_VERSION {
        return Err(CodecError::WireVersion {
            got,
            expected: WIRE_VERSION,
        });
    }
    bincode::deserialize(&bytes[2..]).map_err(|e| CodecError::Corrupt(e.to_string()))
}

/// Serializes the entire tree. Deterministic for a given tree content.
pub fn encode_full(tree: &StateTree) -> Result<Vec<u8>, CodecError> {
    let root = tree.snapshot(tree.root())?;
    frame_bytes(&SyncFrame::Snapshot {
        version: tree.version(),
        root,
    })
}

/// Serializes only the dirty paths. Returns an empty vector when nothing
/// changed; callers skip sending those. Does not clear dirty state.
pub fn encode_delta(tree: &StateTree) -> Result<Vec<u8>, CodecError> {
    if !tree.is_dirty() {
        return Ok(Vec::new());
    }
    let ops = tree.collect_dirty();
    // changes can cancel out (add then delete): dirty tree, nothing to say
    if ops.is_empty() {
        return Ok(Vec::new());
    }
    frame_bytes(&SyncFrame::Patch {
        version: tree.version(),
        ops,
    })
}

/// `encode_delta` followed by `clear_dirty`: one synchronization point.
pub fn flush(tree: &mut StateTree) -> Result<Vec<u8>, CodecError> {
    let bytes = encode_delta(tree)?;
    tree.clear_dirty();
    Ok(bytes)
}

/// Applies a received frame to `tree` and returns the sender's version.
///
/// A snapshot replaces the whole tree; a patch is applied op by op in
/// recording order. Either kind is built against a staged copy, so if
/// anything fails the original tree is left untouched and the caller can
/// recover with a fresh snapshot instead of running with a half-applied
/// frame.
pub fn decode(bytes: &[u8], tree: &mut StateTree) -> Result<u64, CodecError> {
    match parse_frame(bytes)? {
        SyncFrame::Snapshot { version, root } => {
            let fields = match root {
                WireValue::Object(fields) => fields,
                _ => {
                    return Err(CodecError::Corrupt(
                        "snapshot root must be an object".to_string(),
                    ))
                }
            };
            let mut staged = tree.clone();
            staged.reset();
            let root = staged.root();
            for (tag, value) in &fields {
                apply_into_object(&mut staged, root, *tag, value)?;
            }
            staged.clear_dirty();
            *tree = staged;
            Ok(version)
        }
        SyncFrame::Patch { version, ops } => {
            let mut staged = tree.clone();
            for op in &ops {
                apply_op(&mut staged, op)?;
            }
            staged.clear_dirty();
            *tree = staged;
            Ok(version)
        }
    }
}

fn apply_op(tree: &mut StateTree, op: &PatchOp) -> Result<(), CodecError> {
    let (last, parents) = op
        .path
        .split_last()
        .ok_or_else(|| CodecError::Corrupt("empty patch path".to_string()))?;

    let mut node = tree.root();
    for seg in parents {
        node = match seg {
            PathSeg::Tag(t) => tree.child(node, *t),
            PathSeg::Key(k) => tree.map_child(node, k),
            PathSeg::Index(i) => tree.seq_child(node, *i as usize),
        }
        .ok_or_else(|| bad_path(&op.path))?;
    }

    let value = || {
        op.value
            .as_ref()
            .ok_or_else(|| CodecError::Corrupt("add/replace op without a value".to_string()))
    };

    match last {
        PathSeg::Tag(tag) => match op.op {
            Op::Delete => Err(bad_path(&op.path)),
            Op::Add | Op::Replace => apply_into_object(tree, node, *tag, value()?),
        },
        PathSeg::Key(key) => match op.op {
            Op::Delete => tree.map_remove(node, key).map_err(|_| bad_path(&op.path)),
            Op::Add | Op::Replace => match value()? {
                composite @ (WireValue::Object(_) | WireValue::Seq(_) | WireValue::Map(_)) => {
                    let child = tree.map_insert_child(node, key)?;
                    fill_composite(tree, child, composite)
                }
                scalar => {
                    let v = scalar_value(scalar)?;
                    tree.map_insert(node, key, v).map_err(CodecError::from)
                }
            },
        },
        PathSeg::Index(index) => {
            let index = *index as usize;
            match op.op {
                Op::Delete => tree.seq_remove(node, index).map_err(|_| bad_path(&op.path)),
                Op::Add => match value()? {
                    composite @ (WireValue::Object(_) | WireValue::Seq(_) | WireValue::Map(_)) => {
                        let child = tree.seq_insert_child(node, index)?;
                        fill_composite(tree, child, composite)
                    }
                    scalar => {
                        let v = scalar_value(scalar)?;
                        tree.seq_insert(node, index, v).map_err(CodecError::from)
                    }
                },
                Op::Replace => match value()? {
                    composite @ (WireValue::Object(_) | WireValue::Seq(_) | WireValue::Map(_)) => {
                        let child = tree.seq_replace_child(node, index)?;
                        fill_composite(tree, child, composite)
                    }
                    scalar => {
                        let v = scalar_value(scalar)?;
                        tree.seq_set(node, index, v).map_err(CodecError::from)
                    }
                },
            }
        }
    }
}

/// Writes a wire value into an object field, creating child nodes for
/// composites. Type mismatches surface as schema errors from the tree.
fn apply_into_object(
    tree: &mut StateTree,
    node: crate::schema::NodeId,
    tag: u8,
    value: &WireValue,
) -> Result<(), CodecError> {
    match value {
        WireValue::Object(_) | WireValue::Seq(_) | WireValue::Map(_) => {
            let child = tree.replace_child(node, tag)?;
            fill_composite(tree, child, value)
        }
        scalar => {
            let v = scalar_value(scalar)?;
            tree.set(node, tag, v).map_err(CodecError::from)
        }
    }
}

fn fill_composite(
    tree: &mut StateTree,
    node: crate::schema::NodeId,
    value: &WireValue,
) -> Result<(), CodecError> {
    match value {
        WireValue::Object(fields) => {
            for (tag, v) in fields {
                apply_into_object(tree, node, *tag, v)?;
            }
            Ok(())
        }
        WireValue::Seq(items) => {
            for item in items {
                match item {
                    WireValue::Object(_) | WireValue::Seq(_) | WireValue::Map(_) => {
                        let child = tree.seq_push_child(node)?;
                        fill_composite(tree, child, item)?;
                    }
                    scalar => {
                        let v = scalar_value(scalar)?;
                        tree.seq_push(node, v)?;
                    }
                }
            }
            Ok(())
        }
        WireValue::Map(entries) => {
            for (key, v) in entries {
                match v {
                    WireValue::Object(_) | WireValue::Seq(_) | WireValue::Map(_) => {
                        let child = tree.map_insert_child(node, key)?;
                        fill_composite(tree, child, v)?;
                    }
                    scalar => {
                        let sv = scalar_value(scalar)?;
                        tree.map_insert(node, key, sv)?;
                    }
                }
            }
            Ok(())
        }
        _ => Err(CodecError::Corrupt(
            "expected a composite value".to_string(),
        )),
    }
}

fn scalar_value(value: &WireValue) -> Result<Value, CodecError> {
    match value {
        WireValue::Bool(b) => Ok(Value::Bool(*b)),
        WireValue::Int(v) => Ok(Value::Int(*v)),
        WireValue::Float(f) => Ok(Value::Float(*f)),
        WireValue::Str(s) => Ok(Value::Str(s.clone())),
        _ => Err(CodecError::Corrupt(
            "expected a scalar value".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, FloatWidth, Schema};
    use std::sync::Arc;

    fn demo_schema() -> Arc<Schema> {
        let mut player = Schema::new();
        player
            .define_field("x", FieldType::Float(FloatWidth::F64), 0)
            .unwrap();
        player
            .define_field("y", FieldType::Float(FloatWidth::F64), 1)
            .unwrap();

        let mut root = Schema::new();
        root.define_field("turn", FieldType::String, 0).unwrap();
        root.define_field(
            "players",
            FieldType::Map(Box::new(FieldType::Object(Arc::new(player)))),
            1,
        )
        .unwrap();
        Arc::new(root)
    }

    fn demo_tree() -> StateTree {
        let mut tree = StateTree::new(demo_schema());
        let root = tree.root();
        tree.set(root, 0, Value::Str("none".into())).unwrap();
        let players = tree.ensure_child(root, 1).unwrap();
        let p1 = tree.map_insert_child(players, "c1").unwrap();
        tree.set(p1, 0, Value::Float(1.0)).unwrap();
        tree.set(p1, 1, Value::Float(2.0)).unwrap();
        tree
    }

    #[test]
    fn full_snapshot_round_trips() {
        let source = demo_tree();
        let bytes = encode_full(&source).unwrap();

        let mut target = StateTree::new(demo_schema());
        decode(&bytes, &mut target).unwrap();
        assert_eq!(
            source.snapshot(source.root()).unwrap(),
            target.snapshot(target.root()).unwrap()
        );
    }

    #[test]
    fn delta_applies_to_synced_replica() {
        let mut source = demo_tree();
        let mut target = StateTree::new(demo_schema());
        decode(&encode_full(&source).unwrap(), &mut target).unwrap();
        source.clear_dirty();

        let root = source.root();
        let players = source.child(root, 1).unwrap();
        let p1 = source.map_child(players, "c1").unwrap();
        source.set(p1, 0, Value::Float(3.5)).unwrap();
        let p2 = source.map_insert_child(players, "c2").unwrap();
        source.set(p2, 0, Value::Float(9.0)).unwrap();
        source.set(root, 0, Value::Str("c1".into())).unwrap();

        let patch = flush(&mut source).unwrap();
        assert!(!patch.is_empty());
        decode(&patch, &mut target).unwrap();
        assert_eq!(
            source.snapshot(source.root()).unwrap(),
            target.snapshot(target.root()).unwrap()
        );
    }

    #[test]
    fn empty_delta_encodes_to_nothing() {
        let mut tree = demo_tree();
        tree.clear_dirty();
        assert!(encode_delta(&tree).unwrap().is_empty());
    }

    #[test]
    fn wire_version_mismatch_is_loud() {
        let tree = demo_tree();
        let mut bytes = encode_full(&tree).unwrap();
        bytes[0] = 0xFF;
        bytes[1] = 0xFF;
        let mut target = StateTree::new(demo_schema());
        assert!(matches!(
            decode(&bytes, &mut target),
            Err(CodecError::WireVersion { .. })
        ));
    }

    #[test]
    fn unknown_tag_in_patch_is_rejected() {
        let mut target = StateTree::new(demo_schema());
        let frame = SyncFrame::Patch {
            version: 1,
            ops: vec![PatchOp {
                path: vec![PathSeg::Tag(99)],
                op: Op::Replace,
                value: Some(WireValue::Bool(true)),
            }],
        };
        let bytes = frame_bytes(&frame).unwrap();
        assert!(decode(&bytes, &mut target).is_err());
    }

    #[test]
    fn failed_patch_leaves_target_untouched() {
        let mut target = demo_tree();
        target.clear_dirty();
        let before = target.snapshot(target.root()).unwrap();

        let frame = SyncFrame::Patch {
            version: 7,
            ops: vec![
                PatchOp {
                    path: vec![PathSeg::Tag(0)],
                    op: Op::Replace,
                    value: Some(WireValue::Str("halfway".into())),
                },
                PatchOp {
                    path: vec![PathSeg::Tag(1), PathSeg::Key("missing".into())],
                    op: Op::Delete,
                    value: None,
                },
            ],
        };
        let bytes = frame_bytes(&frame).unwrap();
        assert!(decode(&bytes, &mut target).is_err());
        assert_eq!(target.snapshot(target.root()).unwrap(), before);
    }

    #[test]
    fn failed_snapshot_leaves_target_untouched() {
        let mut target = demo_tree();
        target.clear_dirty();
        let before = target.snapshot(target.root()).unwrap();

        // Second field carries a tag the schema does not know.
        let frame = SyncFrame::Snapshot {
            version: 9,
            root: WireValue::Object(vec![
                (0, WireValue::Str("halfway".into())),
                (99, WireValue::Bool(true)),
            ]),
        };
        let bytes = frame_bytes(&frame).unwrap();
        assert!(decode(&bytes, &mut target).is_err());
        assert_eq!(target.snapshot(target.root()).unwrap(), before);
    }

    #[test]
    fn decode_reports_sender_version() {
        let mut source = demo_tree();
        for _ in 0..3 {
            let root = source.root();
            source.set(root, 0, Value::Str("spin".into())).unwrap();
        }
        let mut target = StateTree::new(demo_schema());
        let version = decode(&encode_full(&source).unwrap(), &mut target).unwrap();
        assert_eq!(version, source.version());
    }
}
