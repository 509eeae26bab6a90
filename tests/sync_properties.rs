//! Cross-crate synchronization properties
//!
//! Exercises the schema/codec pipeline the way the runtime uses it: an
//! authoritative tree on one side, replicas applying its frames on the
//! other.

use assert_approx_eq::assert_approx_eq;
use client::Replica;
use shared::codec::{decode, encode_delta, encode_full, flush, parse_frame, CodecError, SyncFrame};
use shared::schema::{FieldType, FloatWidth, IntWidth, Op, Schema, SchemaError, StateTree, Value};
use std::sync::Arc;

fn game_schema() -> Arc<Schema> {
    let mut player = Schema::new();
    player
        .define_field("x", FieldType::Float(FloatWidth::F64), 0)
        .unwrap();
    player
        .define_field("y", FieldType::Float(FloatWidth::F64), 1)
        .unwrap();

    let mut message = Schema::new();
    message.define_field("message", FieldType::String, 0).unwrap();

    let mut root = Schema::new();
    root.define_field(
        "players",
        FieldType::Map(Box::new(FieldType::Object(Arc::new(player)))),
        0,
    )
    .unwrap();
    root.define_field(
        "messages",
        FieldType::Seq(Box::new(FieldType::Object(Arc::new(message)))),
        1,
    )
    .unwrap();
    root.define_field("turn", FieldType::String, 2).unwrap();
    root.define_field("round", FieldType::Int(IntWidth::U16), 3)
        .unwrap();
    Arc::new(root)
}

/// SNAPSHOT TESTS
mod snapshot_tests {
    use super::*;

    /// A populated tree survives the snapshot round-trip bit for bit.
    #[test]
    fn snapshot_roundtrip_preserves_everything() {
        let schema = game_schema();
        let mut source = StateTree::new(schema.clone());
        let root = source.root();

        let players = source.ensure_child(root, 0).unwrap();
        let p1 = source.map_insert_child(players, "alice").unwrap();
        source.set(p1, 0, Value::Float(12.25)).unwrap();
        source.set(p1, 1, Value::Float(-3.5)).unwrap();
        let feed = source.ensure_child(root, 1).unwrap();
        let m = source.seq_push_child(feed).unwrap();
        source.set(m, 0, Value::Str("hello".into())).unwrap();
        source.set(root, 2, Value::Str("alice".into())).unwrap();
        source.set(root, 3, Value::Int(7)).unwrap();

        let mut target = StateTree::new(schema);
        decode(&encode_full(&source).unwrap(), &mut target).unwrap();

        assert_eq!(
            source.snapshot(source.root()).unwrap(),
            target.snapshot(target.root()).unwrap()
        );
    }

    /// Snapshot encoding is deterministic for a given tree content.
    #[test]
    fn snapshot_encoding_is_deterministic() {
        let schema = game_schema();
        let mut source = StateTree::new(schema);
        let root = source.root();
        let players = source.ensure_child(root, 0).unwrap();
        source.map_insert_child(players, "b").unwrap();
        source.map_insert_child(players, "a").unwrap();

        assert_eq!(encode_full(&source).unwrap(), encode_full(&source).unwrap());
    }
}

/// DELTA TESTS
mod delta_tests {
    use super::*;

    /// One scalar change produces exactly one patch op, addressed to the
    /// changed path and nothing else.
    #[test]
    fn delta_is_minimal() {
        let schema = game_schema();
        let mut source = StateTree::new(schema);
        let root = source.root();
        let players = source.ensure_child(root, 0).unwrap();
        let p1 = source.map_insert_child(players, "alice").unwrap();
        source.set(p1, 0, Value::Float(1.0)).unwrap();
        source.set(p1, 1, Value::Float(2.0)).unwrap();
        source.clear_dirty();

        source.set(p1, 0, Value::Float(1.5)).unwrap();
        let frame = flush(&mut source).unwrap();
        match parse_frame(&frame).unwrap() {
            SyncFrame::Patch { ops, .. } => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].op, Op::Replace);
            }
            other => panic!("expected patch, got {:?}", other),
        }
    }

    /// A clean tree encodes to an empty delta, and applying nothing is a
    /// no-op on the replica.
    #[test]
    fn empty_delta_is_empty_and_idempotent() {
        let schema = game_schema();
        let mut source = StateTree::new(schema.clone());
        assert!(encode_delta(&source).unwrap().is_empty());
        assert!(flush(&mut source).unwrap().is_empty());

        let mut replica = Replica::new(schema);
        replica.apply(&encode_full(&source).unwrap()).unwrap();
        let before = replica.tree().snapshot(replica.tree().root()).unwrap();
        replica.apply(&[]).unwrap();
        assert_eq!(
            replica.tree().snapshot(replica.tree().root()).unwrap(),
            before
        );
    }

    /// Many writes to the same field between flushes collapse into one op
    /// carrying the final value.
    #[test]
    fn writes_coalesce_to_last_value() {
        let schema = game_schema();
        let mut source = StateTree::new(schema.clone());
        let root = source.root();
        let mut replica = Replica::new(schema);
        replica.apply(&encode_full(&source).unwrap()).unwrap();

        for round in 1..=10 {
            source.set(root, 3, Value::Int(round)).unwrap();
        }
        let frame = flush(&mut source).unwrap();
        match parse_frame(&frame).unwrap() {
            SyncFrame::Patch { ops, .. } => assert_eq!(ops.len(), 1),
            other => panic!("expected patch, got {:?}", other),
        }
        replica.apply(&frame).unwrap();
        assert_eq!(
            replica.tree().get(replica.tree().root(), 3),
            Some(Value::Int(10))
        );
    }

    /// Map insertion and removal between the same flushes cancel out.
    #[test]
    fn add_then_remove_cancels() {
        let schema = game_schema();
        let mut source = StateTree::new(schema);
        let root = source.root();
        let players = source.ensure_child(root, 0).unwrap();
        source.clear_dirty();

        source.map_insert_child(players, "ghost").unwrap();
        source.map_remove(players, "ghost").unwrap();
        assert!(flush(&mut source).unwrap().is_empty());
    }

    /// Interleaved edits across a long session keep a replica converged
    /// with the source after every flush.
    #[test]
    fn replica_converges_across_many_flushes() {
        let schema = game_schema();
        let mut source = StateTree::new(schema.clone());
        let root = source.root();
        let mut replica = Replica::new(schema);
        replica.apply(&encode_full(&source).unwrap()).unwrap();

        let players = source.ensure_child(root, 0).unwrap();
        for step in 0..20 {
            let key = format!("p{}", step % 3);
            if step % 7 == 6 {
                let _ = source.map_remove(players, &key);
            } else {
                let p = match source.map_child(players, &key) {
                    Some(p) => p,
                    None => source.map_insert_child(players, &key).unwrap(),
                };
                source.set(p, 0, Value::Float(f64::from(step) * 0.25)).unwrap();
            }
            source.set(root, 3, Value::Int(i64::from(step))).unwrap();

            replica.apply(&flush(&mut source).unwrap()).unwrap();
            assert_eq!(
                source.snapshot(source.root()).unwrap(),
                replica.tree().snapshot(replica.tree().root()).unwrap(),
                "diverged at step {}",
                step
            );
        }
    }
}

/// VALIDATION TESTS
mod validation_tests {
    use super::*;

    /// Int writes outside the declared width are rejected and leave no
    /// dirty mark behind.
    #[test]
    fn out_of_range_int_is_rejected() {
        let schema = game_schema();
        let mut source = StateTree::new(schema);
        let root = source.root();
        source.clear_dirty();

        let err = source.set(root, 3, Value::Int(70_000)).unwrap_err();
        assert!(matches!(err, SchemaError::OutOfRange { .. }));
        assert!(!source.is_dirty());
    }

    /// f32 fields quantize on write so the authoritative value is the
    /// replicated value.
    #[test]
    fn f32_field_stores_what_the_wire_carries() {
        let mut schema = Schema::new();
        schema
            .define_field("v", FieldType::Float(FloatWidth::F32), 0)
            .unwrap();
        let mut source = StateTree::new(Arc::new(schema));
        let root = source.root();

        let precise = 0.1f64 + 0.2f64;
        source.set(root, 0, Value::Float(precise)).unwrap();
        match source.get(root, 0) {
            Some(Value::Float(stored)) => {
                assert_approx_eq!(stored, f64::from(precise as f32));
                assert_eq!(stored, f64::from(precise as f32));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Frames from a different wire version are refused loudly before any
    /// payload is interpreted.
    #[test]
    fn wire_version_mismatch_is_loud() {
        let schema = game_schema();
        let source = StateTree::new(schema.clone());
        let mut frame = encode_full(&source).unwrap();
        frame[0] = frame[0].wrapping_add(1);

        let mut replica = Replica::new(schema);
        assert!(matches!(
            replica.apply(&frame),
            Err(CodecError::WireVersion { .. })
        ));
    }

    /// A patch addressing a path the target does not have fails without
    /// mutating the target.
    #[test]
    fn bad_patch_leaves_target_untouched() {
        // a patch inserting a player, recorded after the `players`
        // container itself was already flushed away
        let alice_patch = {
            let mut source = StateTree::new(game_schema());
            let root = source.root();
            let players = source.ensure_child(root, 0).unwrap();
            source.clear_dirty();
            let alice = source.map_insert_child(players, "alice").unwrap();
            source.set(alice, 0, Value::Float(1.0)).unwrap();
            flush(&mut source).unwrap()
        };

        // the target never materialized `players`, so the path is dead
        let mut target = StateTree::new(game_schema());
        let before = target.snapshot(target.root()).unwrap();
        assert!(matches!(
            decode(&alice_patch, &mut target),
            Err(CodecError::BadPath { .. })
        ));
        assert_eq!(target.snapshot(target.root()).unwrap(), before);
    }
}

/// ERROR PROPAGATION TESTS
mod error_tests {
    use super::*;

    /// Corrupt frames surface as codec errors, never panics.
    #[test]
    fn truncated_frames_error_cleanly() {
        let schema = game_schema();
        let source = StateTree::new(schema.clone());
        let full = encode_full(&source).unwrap();

        for cut in 0..full.len().min(8) {
            let mut target = StateTree::new(schema.clone());
            match decode(&full[..cut], &mut target) {
                Err(CodecError::Corrupt(_)) | Err(CodecError::WireVersion { .. }) => {}
                Ok(_) => panic!("truncated frame at {} decoded", cut),
                Err(other) => panic!("unexpected error {:?} at {}", other, cut),
            }
        }
    }

    /// Schema definition conflicts are caught at definition time.
    #[test]
    fn schema_definition_conflicts() {
        let mut schema = Schema::new();
        schema.define_field("a", FieldType::Bool, 0).unwrap();
        assert!(matches!(
            schema.define_field("b", FieldType::Bool, 0),
            Err(SchemaError::DuplicateTag { .. })
        ));
        assert!(matches!(
            schema.define_field("a", FieldType::Bool, 1),
            Err(SchemaError::DuplicateName { .. })
        ));
    }
}
