//! Typed, change-tracked state trees shared between server and client
//!
//! This module handles the authoritative state representation, including:
//! - Runtime schema definition (fields with stable numeric wire tags)
//! - An arena-backed tree of objects, ordered sequences and insertion-ordered maps
//! - Per-node change sets so a flush can emit only what actually mutated
//! - Version counters bumped on every mutation, transitively up to the root
//!
//! Every nested node keeps a non-owning back-reference to its parent slot.
//! A mutation records a change on the owning node and then walks that chain,
//! marking each ancestor as touched, so `collect_dirty` can descend straight
//! to the mutated leaves without scanning clean subtrees.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Declared bit-width of an integer field. `set` rejects out-of-range values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntWidth {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
}

impl IntWidth {
    pub fn contains(&self, value: i64) -> bool {
        match self {
            IntWidth::I8 => i8::try_from(value).is_ok(),
            IntWidth::I16 => i16::try_from(value).is_ok(),
            IntWidth::I32 => i32::try_from(value).is_ok(),
            IntWidth::I64 => true,
            IntWidth::U8 => u8::try_from(value).is_ok(),
            IntWidth::U16 => u16::try_from(value).is_ok(),
            IntWidth::U32 => u32::try_from(value).is_ok(),
        }
    }
}

/// Declared precision of a float field. `F32` values are rounded on `set`
/// so server and client agree bit-for-bit on what was stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FloatWidth {
    F32,
    F64,
}

/// Declared type of a field or collection element.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldType {
    Bool,
    Int(IntWidth),
    Float(FloatWidth),
    String,
    /// Nested model with its own schema.
    Object(Arc<Schema>),
    /// Ordered sequence of elements.
    Seq(Box<FieldType>),
    /// Insertion-ordered map with string keys.
    Map(Box<FieldType>),
}

impl FieldType {
    fn is_scalar(&self) -> bool {
        matches!(
            self,
            FieldType::Bool | FieldType::Int(_) | FieldType::Float(_) | FieldType::String
        )
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Int(_) => "int",
            FieldType::Float(_) => "float",
            FieldType::String => "string",
            FieldType::Object(_) => "object",
            FieldType::Seq(_) => "seq",
            FieldType::Map(_) => "map",
        }
    }
}

/// One declared field: name for humans, tag for the wire.
///
/// Tags are the stable identity of a field. Reordering or reusing them
/// breaks compatibility with every peer that compiled the old layout.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub tag: u8,
    pub ty: FieldType,
}

/// Ordered registry of field definitions for one model type.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Registers a field. Duplicate tags and names are definition-time
    /// errors; callers are expected to treat them as fatal at startup.
    pub fn define_field(&mut self, name: &str, ty: FieldType, tag: u8) -> Result<(), SchemaError> {
        if let Some(existing) = self.fields.iter().find(|f| f.tag == tag) {
            return Err(SchemaError::DuplicateTag {
                tag,
                existing: existing.name.clone(),
            });
        }
        if self.fields.iter().any(|f| f.name == name) {
            return Err(SchemaError::DuplicateName {
                name: name.to_string(),
            });
        }
        self.fields.push(FieldDef {
            name: name.to_string(),
            tag,
            ty,
        });
        Ok(())
    }

    pub fn field(&self, tag: u8) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.tag == tag)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }
}

/// Runtime scalar value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    fn describe(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
        }
    }
}

/// Self-contained encoding of a value, used for snapshots and patch payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// `(tag, value)` pairs in schema definition order.
    Object(Vec<(u8, WireValue)>),
    Seq(Vec<WireValue>),
    /// `(key, value)` pairs in insertion order.
    Map(Vec<(String, WireValue)>),
}

/// One step of a path from the root to a node or leaf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSeg {
    Tag(u8),
    Key(String),
    Index(u32),
}

impl fmt::Display for PathSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSeg::Tag(t) => write!(f, "#{}", t),
            PathSeg::Key(k) => write!(f, "{:?}", k),
            PathSeg::Index(i) => write!(f, "[{}]", i),
        }
    }
}

pub fn render_path(path: &[PathSeg]) -> String {
    let parts: Vec<String> = path.iter().map(|s| s.to_string()).collect();
    parts.join("/")
}

/// Patch operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Add,
    Replace,
    Delete,
}

/// One entry of a patch: where, what happened, and (except for deletes)
/// the value now at that path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub path: Vec<PathSeg>,
    pub op: Op,
    pub value: Option<WireValue>,
}

/// How a slot changed since the last flush.
///
/// `Touched` means "a descendant changed, descend into the child node";
/// the other three mean the slot itself must be re-sent (or deleted).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Touched,
    Added,
    Replaced,
    Deleted,
}

/// Coalesces a new change into an already-recorded one for the same slot.
/// `None` means the two cancel out and the slot needs no wire traffic.
pub fn merge_changes(old: ChangeKind, new: ChangeKind) -> Option<ChangeKind> {
    use ChangeKind::*;
    match (old, new) {
        // A touch never weakens whatever was already recorded.
        (old, Touched) => Some(old),
        // Added since the last flush: the peer has never seen the slot,
        // so a later replace is still an add, and a delete cancels.
        (Added, Deleted) => None,
        (Added, _) => Some(Added),
        // The peer saw the old value, so resurrecting a deleted slot
        // has to go out as a replace.
        (Deleted, Added) => Some(Replaced),
        (Deleted, Replaced) => Some(Replaced),
        (Deleted, Deleted) => Some(Deleted),
        (_, new) => Some(new),
    }
}

/// Insertion-ordered change records for one node.
#[derive(Clone, Debug, Default)]
struct ChangeSet {
    entries: Vec<(PathSeg, ChangeKind)>,
}

impl ChangeSet {
    fn record(&mut self, seg: PathSeg, kind: ChangeKind) {
        if let Some(pos) = self.entries.iter().position(|(s, _)| *s == seg) {
            match merge_changes(self.entries[pos].1, kind) {
                Some(merged) => self.entries[pos].1 = merged,
                None => {
                    self.entries.remove(pos);
                }
            }
        } else {
            self.entries.push((seg, kind));
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Errors raised by schema definition and state mutation.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum SchemaError {
    #[error("duplicate field tag {tag} (already used by `{existing}`)")]
    DuplicateTag { tag: u8, existing: String },
    #[error("duplicate field name `{name}`")]
    DuplicateName { name: String },
    #[error("field tag {tag} is not defined on this schema")]
    UnknownTag { tag: u8 },
    #[error("type mismatch at `{at}`: expected {expected}, got {got}")]
    TypeMismatch {
        at: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("value {value} out of range for {width:?} field `{at}`")]
    OutOfRange {
        at: String,
        value: i64,
        width: IntWidth,
    },
    #[error("expected a {expected} node")]
    WrongNode { expected: &'static str },
    #[error("node handle is no longer valid")]
    StaleNode,
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("map key `{key}` not found")]
    KeyNotFound { key: String },
}

/// Handle to a node inside a [`StateTree`] arena.
///
/// Handles are generational: freeing a node invalidates every handle to
/// it, even after a later allocation reuses its arena slot. Operations
/// through an invalidated handle return [`SchemaError::StaleNode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: usize,
    gen: u32,
}

#[derive(Clone, Debug)]
enum Slot {
    Scalar(Value),
    Child(NodeId),
}

#[derive(Clone, Debug)]
enum NodeBody {
    Object {
        schema: Arc<Schema>,
        values: BTreeMap<u8, Slot>,
    },
    Seq {
        elem: FieldType,
        items: Vec<Slot>,
    },
    Map {
        elem: FieldType,
        entries: Vec<(String, Slot)>,
    },
}

#[derive(Clone, Debug)]
struct Node {
    /// Non-owning back-reference: which parent node and which slot in it.
    parent: Option<(NodeId, PathSeg)>,
    version: u64,
    changes: ChangeSet,
    body: NodeBody,
}

/// One arena slot. `gen` is bumped whenever the slot's node is freed, so
/// handles minted before the free no longer match.
#[derive(Clone, Debug)]
struct ArenaEntry {
    gen: u32,
    node: Option<Node>,
}

/// The authoritative (or replicated) state of one room.
///
/// All nodes live in one arena owned by the tree; nested models are
/// addressed by [`NodeId`] and never shared across trees.
#[derive(Clone, Debug)]
pub struct StateTree {
    nodes: Vec<ArenaEntry>,
    free: Vec<usize>,
    root: NodeId,
}

impl StateTree {
    pub fn new(schema: Arc<Schema>) -> Self {
        let root_node = Node {
            parent: None,
            version: 0,
            changes: ChangeSet::default(),
            body: NodeBody::Object {
                schema,
                values: BTreeMap::new(),
            },
        };
        Self {
            nodes: vec![ArenaEntry {
                gen: 0,
                node: Some(root_node),
            }],
            free: Vec::new(),
            root: NodeId { index: 0, gen: 0 },
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Monotonic root counter, bumped on every change anywhere in the tree.
    pub fn version(&self) -> u64 {
        self.node(self.root).map(|n| n.version).unwrap_or(0)
    }

    pub fn node_version(&self, id: NodeId) -> Result<u64, SchemaError> {
        Ok(self.node(id)?.version)
    }

    pub fn root_schema(&self) -> Arc<Schema> {
        match self.node(self.root).map(|n| &n.body) {
            Ok(NodeBody::Object { schema, .. }) => schema.clone(),
            _ => unreachable!("root is always an object node"),
        }
    }

    /// Frees every node below the root and clears the root in place.
    /// Used when applying a full snapshot to an existing tree. Handles to
    /// the freed nodes go stale; the root handle stays valid.
    pub fn reset(&mut self) {
        let children: Vec<NodeId> = self
            .node(self.root)
            .map(|n| {
                slots_of(&n.body)
                    .filter_map(|slot| match slot {
                        Slot::Child(c) => Some(*c),
                        Slot::Scalar(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        for child in children {
            self.free_subtree(child);
        }
        if let Ok(root) = self.node_mut(self.root) {
            root.version = 0;
            root.changes.clear();
            if let NodeBody::Object { values, .. } = &mut root.body {
                values.clear();
            }
        }
    }

    // ----- arena plumbing -----

    fn node(&self, id: NodeId) -> Result<&Node, SchemaError> {
        self.nodes
            .get(id.index)
            .filter(|e| e.gen == id.gen)
            .and_then(|e| e.node.as_ref())
            .ok_or(SchemaError::StaleNode)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, SchemaError> {
        self.nodes
            .get_mut(id.index)
            .filter(|e| e.gen == id.gen)
            .and_then(|e| e.node.as_mut())
            .ok_or(SchemaError::StaleNode)
    }

    fn alloc(&mut self, body: NodeBody, parent: (NodeId, PathSeg)) -> NodeId {
        let node = Node {
            parent: Some(parent),
            version: 0,
            changes: ChangeSet::default(),
            body,
        };
        if let Some(index) = self.free.pop() {
            let entry = &mut self.nodes[index];
            entry.node = Some(node);
            NodeId {
                index,
                gen: entry.gen,
            }
        } else {
            self.nodes.push(ArenaEntry {
                gen: 0,
                node: Some(node),
            });
            NodeId {
                index: self.nodes.len() - 1,
                gen: 0,
            }
        }
    }

    fn free_subtree(&mut self, id: NodeId) {
        let children: Vec<NodeId> = match self.node(id) {
            Ok(node) => slots_of(&node.body)
                .filter_map(|slot| match slot {
                    Slot::Child(c) => Some(*c),
                    Slot::Scalar(_) => None,
                })
                .collect(),
            Err(_) => return,
        };
        for child in children {
            self.free_subtree(child);
        }
        let entry = &mut self.nodes[id.index];
        entry.node = None;
        entry.gen = entry.gen.wrapping_add(1);
        self.free.push(id.index);
    }

    fn free_slot(&mut self, slot: Slot) {
        if let Slot::Child(c) = slot {
            self.free_subtree(c);
        }
    }

    /// Records a change on `id` and walks the parent chain, bumping each
    /// ancestor's version and marking the link slot as touched.
    fn record_change(&mut self, id: NodeId, seg: PathSeg, kind: ChangeKind) {
        if let Ok(node) = self.node_mut(id) {
            node.version += 1;
            node.changes.record(seg, kind);
        }
        let mut cursor = id;
        while let Some((pid, link)) = self.node(cursor).ok().and_then(|n| n.parent.clone()) {
            if let Ok(parent) = self.node_mut(pid) {
                parent.version += 1;
                parent.changes.record(link, ChangeKind::Touched);
            }
            cursor = pid;
        }
    }

    fn composite_body(&self, ty: &FieldType) -> Option<NodeBody> {
        match ty {
            FieldType::Object(schema) => Some(NodeBody::Object {
                schema: schema.clone(),
                values: BTreeMap::new(),
            }),
            FieldType::Seq(elem) => Some(NodeBody::Seq {
                elem: (**elem).clone(),
                items: Vec::new(),
            }),
            FieldType::Map(elem) => Some(NodeBody::Map {
                elem: (**elem).clone(),
                entries: Vec::new(),
            }),
            _ => None,
        }
    }

    // ----- object operations -----

    fn object_field(&self, id: NodeId, tag: u8) -> Result<FieldDef, SchemaError> {
        match &self.node(id)?.body {
            NodeBody::Object { schema, .. } => schema
                .field(tag)
                .cloned()
                .ok_or(SchemaError::UnknownTag { tag }),
            _ => Err(SchemaError::WrongNode { expected: "object" }),
        }
    }

    /// Sets a scalar field, marking it changed and bumping versions up to
    /// the root. Integer fields are range-checked, `F32` floats rounded.
    pub fn set(&mut self, id: NodeId, tag: u8, value: Value) -> Result<(), SchemaError> {
        let def = self.object_field(id, tag)?;
        let norm = normalize_scalar(&def.ty, value, &def.name)?;
        let node = self.node_mut(id)?;
        match &mut node.body {
            NodeBody::Object { values, .. } => {
                values.insert(tag, Slot::Scalar(norm));
            }
            _ => return Err(SchemaError::WrongNode { expected: "object" }),
        }
        self.record_change(id, PathSeg::Tag(tag), ChangeKind::Replaced);
        Ok(())
    }

    /// Current scalar value of a field, if set.
    pub fn get(&self, id: NodeId, tag: u8) -> Option<Value> {
        match &self.node(id).ok()?.body {
            NodeBody::Object { values, .. } => match values.get(&tag) {
                Some(Slot::Scalar(v)) => Some(v.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Child node backing a composite field, if it exists.
    pub fn child(&self, id: NodeId, tag: u8) -> Option<NodeId> {
        match &self.node(id).ok()?.body {
            NodeBody::Object { values, .. } => match values.get(&tag) {
                Some(Slot::Child(c)) => Some(*c),
                _ => None,
            },
            _ => None,
        }
    }

    /// Returns the child node for a composite field, creating an empty one
    /// on first access.
    pub fn ensure_child(&mut self, id: NodeId, tag: u8) -> Result<NodeId, SchemaError> {
        if let Some(existing) = self.child(id, tag) {
            return Ok(existing);
        }
        self.replace_child(id, tag)
    }

    /// Installs a fresh, empty child node for a composite field, dropping
    /// any previous value. Recorded as a whole-slot replace.
    pub fn replace_child(&mut self, id: NodeId, tag: u8) -> Result<NodeId, SchemaError> {
        let def = self.object_field(id, tag)?;
        let body = self
            .composite_body(&def.ty)
            .ok_or(SchemaError::TypeMismatch {
                at: def.name.clone(),
                expected: "object, seq or map",
                got: def.ty.describe(),
            })?;
        let child = self.alloc(body, (id, PathSeg::Tag(tag)));
        let old = match &mut self.node_mut(id)?.body {
            NodeBody::Object { values, .. } => values.insert(tag, Slot::Child(child)),
            _ => return Err(SchemaError::WrongNode { expected: "object" }),
        };
        if let Some(old) = old {
            self.free_slot(old);
        }
        self.record_change(id, PathSeg::Tag(tag), ChangeKind::Replaced);
        Ok(child)
    }

    // ----- sequence operations -----

    fn seq_elem_type(&self, id: NodeId) -> Result<FieldType, SchemaError> {
        match &self.node(id)?.body {
            NodeBody::Seq { elem, .. } => Ok(elem.clone()),
            _ => Err(SchemaError::WrongNode { expected: "seq" }),
        }
    }

    pub fn seq_len(&self, id: NodeId) -> usize {
        match self.node(id).ok().map(|n| &n.body) {
            Some(NodeBody::Seq { items, .. }) => items.len(),
            _ => 0,
        }
    }

    pub fn seq_get(&self, id: NodeId, index: usize) -> Option<Value> {
        match &self.node(id).ok()?.body {
            NodeBody::Seq { items, .. } => match items.get(index) {
                Some(Slot::Scalar(v)) => Some(v.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn seq_child(&self, id: NodeId, index: usize) -> Option<NodeId> {
        match &self.node(id).ok()?.body {
            NodeBody::Seq { items, .. } => match items.get(index) {
                Some(Slot::Child(c)) => Some(*c),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn seq_push(&mut self, id: NodeId, value: Value) -> Result<(), SchemaError> {
        let index = self.seq_len(id);
        self.seq_insert(id, index, value)
    }

    pub fn seq_insert(&mut self, id: NodeId, index: usize, value: Value) -> Result<(), SchemaError> {
        let elem = self.seq_elem_type(id)?;
        let norm = normalize_scalar(&elem, value, &format!("[{}]", index))?;
        self.seq_insert_slot(id, index, Slot::Scalar(norm))?;
        self.record_change(id, PathSeg::Index(index as u32), ChangeKind::Added);
        Ok(())
    }

    /// Appends a composite element and returns its node.
    pub fn seq_push_child(&mut self, id: NodeId) -> Result<NodeId, SchemaError> {
        let index = self.seq_len(id);
        self.seq_insert_child(id, index)
    }

    pub fn seq_insert_child(&mut self, id: NodeId, index: usize) -> Result<NodeId, SchemaError> {
        let elem = self.seq_elem_type(id)?;
        let body = self
            .composite_body(&elem)
            .ok_or(SchemaError::TypeMismatch {
                at: format!("[{}]", index),
                expected: "object, seq or map",
                got: elem.describe(),
            })?;
        let child = self.alloc(body, (id, PathSeg::Index(index as u32)));
        self.seq_insert_slot(id, index, Slot::Child(child))?;
        self.record_change(id, PathSeg::Index(index as u32), ChangeKind::Added);
        Ok(child)
    }

    fn seq_insert_slot(&mut self, id: NodeId, index: usize, slot: Slot) -> Result<(), SchemaError> {
        let len = self.seq_len(id);
        if index > len {
            return Err(SchemaError::IndexOutOfBounds { index, len });
        }
        match &mut self.node_mut(id)?.body {
            NodeBody::Seq { items, .. } => items.insert(index, slot),
            _ => return Err(SchemaError::WrongNode { expected: "seq" }),
        }
        self.reindex_seq_children(id, index + 1);
        Ok(())
    }

    pub fn seq_set(&mut self, id: NodeId, index: usize, value: Value) -> Result<(), SchemaError> {
        let elem = self.seq_elem_type(id)?;
        let norm = normalize_scalar(&elem, value, &format!("[{}]", index))?;
        let len = self.seq_len(id);
        let old = match &mut self.node_mut(id)?.body {
            NodeBody::Seq { items, .. } => match items.get_mut(index) {
                Some(slot) => std::mem::replace(slot, Slot::Scalar(norm)),
                None => return Err(SchemaError::IndexOutOfBounds { index, len }),
            },
            _ => return Err(SchemaError::WrongNode { expected: "seq" }),
        };
        self.free_slot(old);
        self.record_change(id, PathSeg::Index(index as u32), ChangeKind::Replaced);
        Ok(())
    }

    /// Replaces the element at `index` with a fresh composite node.
    pub fn seq_replace_child(&mut self, id: NodeId, index: usize) -> Result<NodeId, SchemaError> {
        let elem = self.seq_elem_type(id)?;
        let body = self
            .composite_body(&elem)
            .ok_or(SchemaError::TypeMismatch {
                at: format!("[{}]", index),
                expected: "object, seq or map",
                got: elem.describe(),
            })?;
        let len = self.seq_len(id);
        if index >= len {
            return Err(SchemaError::IndexOutOfBounds { index, len });
        }
        let child = self.alloc(body, (id, PathSeg::Index(index as u32)));
        let old = match &mut self.node_mut(id)?.body {
            NodeBody::Seq { items, .. } => std::mem::replace(&mut items[index], Slot::Child(child)),
            _ => return Err(SchemaError::WrongNode { expected: "seq" }),
        };
        self.free_slot(old);
        self.record_change(id, PathSeg::Index(index as u32), ChangeKind::Replaced);
        Ok(child)
    }

    /// Removes the element at `index`.
    ///
    /// Removal shifts every later index, which makes the per-index change
    /// records recorded so far ambiguous. Rather than track the shift, the
    /// whole sequence is marked replaced in its parent and re-sent on the
    /// next flush. Map entries do not have this problem and keep precise
    /// per-key deltas.
    pub fn seq_remove(&mut self, id: NodeId, index: usize) -> Result<(), SchemaError> {
        let len = self.seq_len(id);
        if index >= len {
            return Err(SchemaError::IndexOutOfBounds { index, len });
        }
        let old = match &mut self.node_mut(id)?.body {
            NodeBody::Seq { items, .. } => items.remove(index),
            _ => return Err(SchemaError::WrongNode { expected: "seq" }),
        };
        self.free_slot(old);
        self.reindex_seq_children(id, index);
        let node = self.node_mut(id)?;
        node.version += 1;
        node.changes.clear();
        if let Some((pid, link)) = node.parent.clone() {
            self.record_change(pid, link, ChangeKind::Replaced);
        }
        Ok(())
    }

    /// Rewrites the parent back-references of sequence children at or after
    /// `from`, keeping their recorded index in sync with their position.
    fn reindex_seq_children(&mut self, id: NodeId, from: usize) {
        let updates: Vec<(NodeId, usize)> = match self.node(id).ok().map(|n| &n.body) {
            Some(NodeBody::Seq { items, .. }) => items
                .iter()
                .enumerate()
                .skip(from)
                .filter_map(|(i, slot)| match slot {
                    Slot::Child(c) => Some((*c, i)),
                    Slot::Scalar(_) => None,
                })
                .collect(),
            _ => return,
        };
        for (child, index) in updates {
            if let Ok(node) = self.node_mut(child) {
                node.parent = Some((id, PathSeg::Index(index as u32)));
            }
        }
    }

    // ----- map operations -----

    fn map_elem_type(&self, id: NodeId) -> Result<FieldType, SchemaError> {
        match &self.node(id)?.body {
            NodeBody::Map { elem, .. } => Ok(elem.clone()),
            _ => Err(SchemaError::WrongNode { expected: "map" }),
        }
    }

    pub fn map_len(&self, id: NodeId) -> usize {
        match self.node(id).ok().map(|n| &n.body) {
            Some(NodeBody::Map { entries, .. }) => entries.len(),
            _ => 0,
        }
    }

    pub fn map_contains(&self, id: NodeId, key: &str) -> bool {
        match self.node(id).ok().map(|n| &n.body) {
            Some(NodeBody::Map { entries, .. }) => entries.iter().any(|(k, _)| k == key),
            _ => false,
        }
    }

    pub fn map_get(&self, id: NodeId, key: &str) -> Option<Value> {
        match &self.node(id).ok()?.body {
            NodeBody::Map { entries, .. } => {
                match entries.iter().find(|(k, _)| k == key).map(|(_, s)| s) {
                    Some(Slot::Scalar(v)) => Some(v.clone()),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub fn map_child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        match &self.node(id).ok()?.body {
            NodeBody::Map { entries, .. } => {
                match entries.iter().find(|(k, _)| k == key).map(|(_, s)| s) {
                    Some(Slot::Child(c)) => Some(*c),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Keys in insertion order. A finite, restartable traversal: mutate
    /// freely between calls, the next call sees the current membership.
    pub fn map_keys(&self, id: NodeId) -> Vec<String> {
        match self.node(id).ok().map(|n| &n.body) {
            Some(NodeBody::Map { entries, .. }) => {
                entries.iter().map(|(k, _)| k.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Inserts or replaces a scalar entry. Existing keys keep their
    /// insertion position.
    pub fn map_insert(&mut self, id: NodeId, key: &str, value: Value) -> Result<(), SchemaError> {
        let elem = self.map_elem_type(id)?;
        let norm = normalize_scalar(&elem, value, key)?;
        let (old, kind) = self.map_put_slot(id, key, Slot::Scalar(norm))?;
        if let Some(old) = old {
            self.free_slot(old);
        }
        self.record_change(id, PathSeg::Key(key.to_string()), kind);
        Ok(())
    }

    /// Inserts or replaces a composite entry, returning its fresh node.
    /// Existing keys keep their insertion position.
    pub fn map_insert_child(&mut self, id: NodeId, key: &str) -> Result<NodeId, SchemaError> {
        let elem = self.map_elem_type(id)?;
        let body = self
            .composite_body(&elem)
            .ok_or(SchemaError::TypeMismatch {
                at: key.to_string(),
                expected: "object, seq or map",
                got: elem.describe(),
            })?;
        let child = self.alloc(body, (id, PathSeg::Key(key.to_string())));
        let (old, kind) = self.map_put_slot(id, key, Slot::Child(child))?;
        if let Some(old) = old {
            self.free_slot(old);
        }
        self.record_change(id, PathSeg::Key(key.to_string()), kind);
        Ok(child)
    }

    fn map_put_slot(
        &mut self,
        id: NodeId,
        key: &str,
        slot: Slot,
    ) -> Result<(Option<Slot>, ChangeKind), SchemaError> {
        match &mut self.node_mut(id)?.body {
            NodeBody::Map { entries, .. } => {
                if let Some(pos) = entries.iter().position(|(k, _)| k == key) {
                    let old = std::mem::replace(&mut entries[pos].1, slot);
                    Ok((Some(old), ChangeKind::Replaced))
                } else {
                    entries.push((key.to_string(), slot));
                    Ok((None, ChangeKind::Added))
                }
            }
            _ => Err(SchemaError::WrongNode { expected: "map" }),
        }
    }

    pub fn map_remove(&mut self, id: NodeId, key: &str) -> Result<(), SchemaError> {
        let pos = match &self.node(id)?.body {
            NodeBody::Map { entries, .. } => entries
                .iter()
                .position(|(k, _)| k == key)
                .ok_or(SchemaError::KeyNotFound {
                    key: key.to_string(),
                })?,
            _ => return Err(SchemaError::WrongNode { expected: "map" }),
        };
        let (_, old) = match &mut self.node_mut(id)?.body {
            NodeBody::Map { entries, .. } => entries.remove(pos),
            _ => return Err(SchemaError::WrongNode { expected: "map" }),
        };
        self.free_slot(old);
        self.record_change(id, PathSeg::Key(key.to_string()), ChangeKind::Deleted);
        Ok(())
    }

    // ----- snapshots and dirty collection -----

    /// Immutable deep copy of a subtree. Deterministic: object fields come
    /// out in schema definition order, collections in their stored order.
    pub fn snapshot(&self, id: NodeId) -> Result<WireValue, SchemaError> {
        let node = self.node(id)?;
        match &node.body {
            NodeBody::Object { schema, values } => {
                let mut fields = Vec::new();
                for def in schema.fields() {
                    if let Some(slot) = values.get(&def.tag) {
                        fields.push((def.tag, self.snapshot_slot(slot)?));
                    }
                }
                Ok(WireValue::Object(fields))
            }
            NodeBody::Seq { items, .. } => {
                let mut out = Vec::with_capacity(items.len());
                for slot in items {
                    out.push(self.snapshot_slot(slot)?);
                }
                Ok(WireValue::Seq(out))
            }
            NodeBody::Map { entries, .. } => {
                let mut out = Vec::with_capacity(entries.len());
                for (key, slot) in entries {
                    out.push((key.clone(), self.snapshot_slot(slot)?));
                }
                Ok(WireValue::Map(out))
            }
        }
    }

    fn snapshot_slot(&self, slot: &Slot) -> Result<WireValue, SchemaError> {
        match slot {
            Slot::Scalar(v) => Ok(scalar_to_wire(v)),
            Slot::Child(c) => self.snapshot(*c),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.node(self.root)
            .map(|n| !n.changes.is_empty())
            .unwrap_or(false)
    }

    /// The minimal ordered set of operations covering every mutation since
    /// the last [`clear_dirty`](Self::clear_dirty).
    pub fn collect_dirty(&self) -> Vec<PatchOp> {
        let mut ops = Vec::new();
        let mut path = Vec::new();
        self.collect_node(self.root, &mut path, &mut ops);
        ops
    }

    fn collect_node(&self, id: NodeId, path: &mut Vec<PathSeg>, ops: &mut Vec<PatchOp>) {
        let node = match self.node(id) {
            Ok(n) => n,
            Err(_) => return,
        };
        for (seg, kind) in &node.changes.entries {
            path.push(seg.clone());
            match kind {
                ChangeKind::Touched => {
                    if let Some(Slot::Child(child)) = lookup_slot(&node.body, seg) {
                        self.collect_node(*child, path, ops);
                    }
                }
                ChangeKind::Added | ChangeKind::Replaced => {
                    if let Some(slot) = lookup_slot(&node.body, seg) {
                        if let Ok(value) = self.snapshot_slot(slot) {
                            ops.push(PatchOp {
                                path: path.clone(),
                                op: if *kind == ChangeKind::Added {
                                    Op::Add
                                } else {
                                    Op::Replace
                                },
                                value: Some(value),
                            });
                        }
                    }
                }
                ChangeKind::Deleted => {
                    ops.push(PatchOp {
                        path: path.clone(),
                        op: Op::Delete,
                        value: None,
                    });
                }
            }
            path.pop();
        }
    }

    /// Clears every change record in the tree. Version counters are kept.
    pub fn clear_dirty(&mut self) {
        for entry in &mut self.nodes {
            if let Some(node) = entry.node.as_mut() {
                node.changes.clear();
            }
        }
    }
}

fn slots_of(body: &NodeBody) -> Box<dyn Iterator<Item = &Slot> + '_> {
    match body {
        NodeBody::Object { values, .. } => Box::new(values.values()),
        NodeBody::Seq { items, .. } => Box::new(items.iter()),
        NodeBody::Map { entries, .. } => Box::new(entries.iter().map(|(_, s)| s)),
    }
}

fn lookup_slot<'a>(body: &'a NodeBody, seg: &PathSeg) -> Option<&'a Slot> {
    match (body, seg) {
        (NodeBody::Object { values, .. }, PathSeg::Tag(t)) => values.get(t),
        (NodeBody::Seq { items, .. }, PathSeg::Index(i)) => items.get(*i as usize),
        (NodeBody::Map { entries, .. }, PathSeg::Key(k)) => {
            entries.iter().find(|(key, _)| key == k).map(|(_, s)| s)
        }
        _ => None,
    }
}

/// Type-checks a scalar against its declared type, range-checking integers
/// and rounding `F32` floats to 32-bit precision.
fn normalize_scalar(ty: &FieldType, value: Value, at: &str) -> Result<Value, SchemaError> {
    match (ty, value) {
        (FieldType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
        (FieldType::Int(width), Value::Int(v)) => {
            if width.contains(v) {
                Ok(Value::Int(v))
            } else {
                Err(SchemaError::OutOfRange {
                    at: at.to_string(),
                    value: v,
                    width: *width,
                })
            }
        }
        (FieldType::Float(FloatWidth::F32), Value::Float(f)) => Ok(Value::Float(f as f32 as f64)),
        (FieldType::Float(FloatWidth::F64), Value::Float(f)) => Ok(Value::Float(f)),
        (FieldType::String, Value::Str(s)) => Ok(Value::Str(s)),
        (ty, value) => Err(SchemaError::TypeMismatch {
            at: at.to_string(),
            expected: ty.describe(),
            got: value.describe(),
        }),
    }
}

pub(crate) fn scalar_to_wire(value: &Value) -> WireValue {
    match value {
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(v) => WireValue::Int(*v),
        Value::Float(f) => WireValue::Float(*f),
        Value::Str(s) => WireValue::Str(s.clone()),
    }
}
