//! The storage document: one rooted tree of replicated nodes.
//!
//! A document owns the node arena, the Lamport clock, the undo history
//! and the subscription tables. Local mutations stamp a fresh clock, emit
//! an op into the outbound queue and notify subscribers; remote ops are
//! routed by path and applied under last-writer-wins and position rules.
//! All replicas that see the same set of ops converge to the same tree.
//!
//! Nodes live in an arena keyed by [`NodeId`]; the parent link is an id,
//! never an owning reference, and every attached node knows its path from
//! the root. Node ids are replica-local — paths are the cross-replica
//! identity.

use crate::clock::LamportClock;
use crate::error::{StorageError, StorageResult};
use crate::history::{CoalesceKey, Group, History};
use crate::op::{Op, Path};
use crate::pos::Position;
use crate::value::{SerializedCrdt, SerializedItem, SerializedNode};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Identifies a node within one document. Ids are never reused and never
/// leave the process; remote peers address nodes by path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) const fn first() -> Self {
        NodeId(0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// The three live node kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Object,
    Map,
    List,
}

/// A stored value: a JSON scalar or a child node.
#[derive(Clone, Debug)]
pub enum Value {
    Scalar(serde_json::Value),
    Node(NodeId),
}

impl Value {
    pub fn as_scalar(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Scalar(v) => Some(v),
            Value::Node(_) => None,
        }
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Value::Node(id) => Some(*id),
            Value::Scalar(_) => None,
        }
    }
}

/// A register or list slot: the value plus the clock of the write that
/// installed it.
#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    clock: u64,
}

impl Entry {
    fn child_id(&self) -> Option<NodeId> {
        self.value.as_node()
    }
}

#[derive(Debug)]
enum NodeBody {
    Object(HashMap<String, Entry>),
    Map(HashMap<String, Entry>),
    List(BTreeMap<Position, Entry>),
}

impl NodeBody {
    fn kind(&self) -> NodeKind {
        match self {
            NodeBody::Object(_) => NodeKind::Object,
            NodeBody::Map(_) => NodeKind::Map,
            NodeBody::List(_) => NodeKind::List,
        }
    }

    fn fields(&self) -> Option<&HashMap<String, Entry>> {
        match self {
            NodeBody::Object(e) | NodeBody::Map(e) => Some(e),
            NodeBody::List(_) => None,
        }
    }

    fn fields_mut(&mut self) -> Option<&mut HashMap<String, Entry>> {
        match self {
            NodeBody::Object(e) | NodeBody::Map(e) => Some(e),
            NodeBody::List(_) => None,
        }
    }

    fn items(&self) -> Option<&BTreeMap<Position, Entry>> {
        match self {
            NodeBody::List(e) => Some(e),
            _ => None,
        }
    }

    fn items_mut(&mut self) -> Option<&mut BTreeMap<Position, Entry>> {
        match self {
            NodeBody::List(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    path: Path,
    body: NodeBody,
}

/// A change notification: the mutated node and its path at mutation time.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub node: NodeId,
    pub path: Path,
}

/// Handle returned by `subscribe`/`subscribe_deep`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ShallowCallback = Arc<Mutex<dyn FnMut(&ChangeEvent) + Send>>;
type DeepCallback = Arc<Mutex<dyn FnMut(&[ChangeEvent]) + Send>>;

struct DeepSub {
    id: SubscriptionId,
    target: NodeId,
    callback: DeepCallback,
}

/// A replicated storage tree.
pub struct StorageDoc {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_node: u64,
    clock: LamportClock,
    /// Discriminating digit appended to generated list positions, so
    /// concurrent inserts between the same neighbors on different
    /// replicas produce distinct keys.
    actor: u8,
    history: History,
    shallow: HashMap<NodeId, Vec<(SubscriptionId, ShallowCallback)>>,
    deep: Vec<DeepSub>,
    next_sub: u64,
    batch_depth: u32,
    pending: Vec<ChangeEvent>,
    outbound: Vec<Op>,
}

impl Default for StorageDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageDoc {
    /// Creates an empty document: a root Object and a zeroed clock.
    pub fn new() -> Self {
        Self::with_history(History::new())
    }

    /// Creates an empty document with a custom history configuration.
    pub fn with_history(history: History) -> Self {
        let root = NodeId::first();
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                parent: None,
                path: Vec::new(),
                body: NodeBody::Object(HashMap::new()),
            },
        );
        Self {
            nodes,
            root,
            next_node: 1,
            clock: LamportClock::new(),
            actor: 0,
            history,
            shallow: HashMap::new(),
            deep: Vec::new(),
            next_sub: 0,
            batch_depth: 0,
            pending: Vec::new(),
            outbound: Vec::new(),
        }
    }

    /// Builds a document from a snapshot, e.g. the first `storage-sync`.
    pub fn from_snapshot(snapshot: &SerializedCrdt, clock: u64) -> StorageResult<Self> {
        let mut doc = Self::new();
        doc.apply_snapshot(snapshot, clock)?;
        Ok(doc)
    }

    /// Sets the replica discriminator used in generated list positions.
    pub fn with_actor(mut self, actor: u8) -> Self {
        self.actor = actor;
        self
    }

    pub fn set_actor(&mut self, actor: u8) {
        self.actor = actor;
    }

    // ========== Reads ==========

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn kind(&self, node: NodeId) -> Option<NodeKind> {
        self.nodes.get(&node).map(|n| n.body.kind())
    }

    pub fn path(&self, node: NodeId) -> Option<&Path> {
        self.nodes.get(&node).map(|n| &n.path)
    }

    /// The parent of an attached node; `None` for the root.
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).and_then(|n| n.parent)
    }

    /// The current clock value.
    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    /// Resolves a path from the root: field names for Object/Map hops,
    /// position keys for List hops.
    pub fn resolve(&self, path: &[String]) -> Option<NodeId> {
        let mut current = self.root;
        for segment in path {
            let node = self.nodes.get(&current)?;
            let value = match &node.body {
                NodeBody::Object(e) | NodeBody::Map(e) => &e.get(segment)?.value,
                NodeBody::List(items) => &items.get(&Position::new(segment.clone()))?.value,
            };
            current = value.as_node()?;
        }
        Some(current)
    }

    /// Reads a register from an Object or Map.
    pub fn get(&self, node: NodeId, key: &str) -> Option<&Value> {
        self.nodes
            .get(&node)?
            .body
            .fields()?
            .get(key)
            .map(|e| &e.value)
    }

    /// Reads a register as JSON: scalars clone through, child nodes
    /// serialize to their envelope.
    pub fn get_json(&self, node: NodeId, key: &str) -> Option<serde_json::Value> {
        let value = self.get(node, key)?;
        serde_json::to_value(self.serialize_value(value)).ok()
    }

    /// Resolves a register that holds a child node.
    pub fn child(&self, node: NodeId, key: &str) -> Option<NodeId> {
        self.get(node, key)?.as_node()
    }

    pub fn contains_key(&self, node: NodeId, key: &str) -> bool {
        self.get(node, key).is_some()
    }

    /// Field names of an Object or Map, sorted for determinism.
    pub fn keys(&self, node: NodeId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .nodes
            .get(&node)
            .and_then(|n| n.body.fields())
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn list_len(&self, node: NodeId) -> usize {
        self.nodes
            .get(&node)
            .and_then(|n| n.body.items())
            .map(|items| items.len())
            .unwrap_or(0)
    }

    /// Reads a list slot by index (position order).
    pub fn list_get(&self, node: NodeId, index: usize) -> Option<&Value> {
        self.nodes
            .get(&node)?
            .body
            .items()?
            .values()
            .nth(index)
            .map(|e| &e.value)
    }

    /// All list values as JSON, in position order.
    pub fn list_json(&self, node: NodeId) -> Vec<serde_json::Value> {
        self.nodes
            .get(&node)
            .and_then(|n| n.body.items())
            .map(|items| {
                items
                    .values()
                    .filter_map(|e| serde_json::to_value(self.serialize_value(&e.value)).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All list positions, in order.
    pub fn list_positions(&self, node: NodeId) -> Vec<Position> {
        self.nodes
            .get(&node)
            .and_then(|n| n.body.items())
            .map(|items| items.keys().cloned().collect())
            .unwrap_or_default()
    }

    // ========== Local mutations ==========

    /// Writes a register on an Object or Map.
    pub fn set(
        &mut self,
        node: NodeId,
        key: &str,
        value: impl Into<SerializedCrdt>,
    ) -> StorageResult<()> {
        let path = self.expect_fields(node)?;
        let op = Op::Set {
            path,
            key: key.to_string(),
            value: value.into(),
            clock: self.clock.tick(),
        };
        self.record_inverse(&op, node, key.to_string());
        self.apply_and_emit(op);
        Ok(())
    }

    /// Writes several registers as one atomic action: subscribers fire
    /// once, and the whole update undoes as one step.
    pub fn update(
        &mut self,
        node: NodeId,
        fields: impl IntoIterator<Item = (String, SerializedCrdt)>,
    ) -> StorageResult<()> {
        self.expect_fields(node)?;
        self.begin_batch();
        let mut result = Ok(());
        for (key, value) in fields {
            if let Err(e) = self.set(node, &key, value) {
                result = Err(e);
                break;
            }
        }
        self.end_batch();
        result
    }

    /// Deletes a register. Returns `false` if the key was absent.
    pub fn delete(&mut self, node: NodeId, key: &str) -> StorageResult<bool> {
        let path = self.expect_fields(node)?;
        if !self.contains_key(node, key) {
            return Ok(false);
        }
        let op = Op::Delete {
            path,
            key: key.to_string(),
            clock: self.clock.tick(),
        };
        self.record_inverse(&op, node, key.to_string());
        self.apply_and_emit(op);
        Ok(true)
    }

    /// Appends to the end of a list. Returns the generated position.
    pub fn list_push(
        &mut self,
        node: NodeId,
        value: impl Into<SerializedCrdt>,
    ) -> StorageResult<Position> {
        let len = self.expect_list(node)?;
        self.list_insert(node, len, value)
    }

    /// Inserts at an index. `index == len` appends.
    pub fn list_insert(
        &mut self,
        node: NodeId,
        index: usize,
        value: impl Into<SerializedCrdt>,
    ) -> StorageResult<Position> {
        let len = self.expect_list(node)?;
        if index > len {
            return Err(StorageError::IndexOutOfBounds { index, len });
        }
        let positions = self.list_positions(node);
        let lo = index.checked_sub(1).and_then(|i| positions.get(i));
        let hi = positions.get(index);
        let position = Position::between_with_actor(lo, hi, self.actor)?;

        let path = self.node_path(node)?;
        let op = Op::ListInsert {
            path,
            position: position.clone(),
            value: value.into(),
            clock: self.clock.tick(),
        };
        self.record_inverse(&op, node, position.as_str().to_string());
        self.apply_and_emit(op);
        Ok(position)
    }

    /// Deletes the item at an index.
    pub fn list_delete(&mut self, node: NodeId, index: usize) -> StorageResult<()> {
        let len = self.expect_list(node)?;
        if index >= len {
            return Err(StorageError::IndexOutOfBounds { index, len });
        }
        let positions = self.list_positions(node);
        let position = positions[index].clone();

        let path = self.node_path(node)?;
        let op = Op::ListDelete {
            path,
            position: position.clone(),
            clock: self.clock.tick(),
        };
        self.record_inverse(&op, node, position.as_str().to_string());
        self.apply_and_emit(op);
        Ok(())
    }

    /// Repositions the item at `from` so it lands at index `to`.
    pub fn list_move(&mut self, node: NodeId, from: usize, to: usize) -> StorageResult<()> {
        let len = self.expect_list(node)?;
        if from >= len {
            return Err(StorageError::IndexOutOfBounds { index: from, len });
        }
        if to >= len {
            return Err(StorageError::IndexOutOfBounds { index: to, len });
        }
        if from == to {
            return Ok(());
        }
        let positions = self.list_positions(node);
        let from_position = positions[from].clone();
        let mut remaining = positions;
        remaining.remove(from);
        let lo = to.checked_sub(1).and_then(|i| remaining.get(i));
        let hi = remaining.get(to);
        let to_position = Position::between_with_actor(lo, hi, self.actor)?;

        let path = self.node_path(node)?;
        let op = Op::ListMove {
            path,
            from_position: from_position.clone(),
            to_position,
            clock: self.clock.tick(),
        };
        self.record_inverse(&op, node, from_position.as_str().to_string());
        self.apply_and_emit(op);
        Ok(())
    }

    // ========== Remote application ==========

    /// Applies ops received from the network. Returns one "did apply"
    /// flag per op; rejected or unroutable ops are no-ops.
    pub fn apply_remote_ops(&mut self, ops: &[Op]) -> Vec<bool> {
        self.begin_batch();
        let applied = ops
            .iter()
            .map(|op| {
                self.clock.observe(op.clock());
                let ok = self.apply_op(op);
                if !ok {
                    tracing::debug!(op = ?op, "remote op dropped");
                }
                ok
            })
            .collect();
        self.end_batch();
        applied
    }

    /// Replays ops as local: each is re-stamped with a fresh clock,
    /// applied, and emitted to the outbound queue. Used for offline
    /// buffers after a snapshot rehydrate and for undo/redo.
    pub fn replay_local(&mut self, ops: &[Op]) {
        self.begin_batch();
        for op in ops {
            let fresh = op.clone().with_clock(self.clock.tick());
            if self.apply_op(&fresh) {
                self.outbound.push(fresh);
            }
        }
        self.end_batch();
    }

    // ========== Outbound queue ==========

    /// Drains the ops emitted by local mutations since the last drain.
    pub fn take_outbound(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.outbound)
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    // ========== Batching ==========

    /// Groups mutations so subscribers fire once at the end and the whole
    /// batch undoes as one step.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.begin_batch();
        let result = f(self);
        self.end_batch();
        result
    }

    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
        if self.batch_depth == 1 {
            self.history.begin_action();
        }
    }

    pub fn end_batch(&mut self) {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth == 0 {
            self.history.end_action();
            self.flush();
        }
    }

    // ========== Subscriptions ==========

    /// Subscribes to mutations of one node. Fires once per changed node
    /// per flush.
    pub fn subscribe(
        &mut self,
        node: NodeId,
        callback: impl FnMut(&ChangeEvent) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.next_sub_id();
        self.shallow
            .entry(node)
            .or_default()
            .push((id, Arc::new(Mutex::new(callback))));
        id
    }

    /// Subscribes to mutations of a node or any of its descendants.
    /// Fires once per flush with every matching change.
    pub fn subscribe_deep(
        &mut self,
        node: NodeId,
        callback: impl FnMut(&[ChangeEvent]) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.next_sub_id();
        self.deep.push(DeepSub {
            id,
            target: node,
            callback: Arc::new(Mutex::new(callback)),
        });
        id
    }

    /// Removes a subscription. Returns `false` if it was not found.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for subs in self.shallow.values_mut() {
            if let Some(i) = subs.iter().position(|(sid, _)| *sid == id) {
                subs.remove(i);
                return true;
            }
        }
        if let Some(i) = self.deep.iter().position(|s| s.id == id) {
            self.deep.remove(i);
            return true;
        }
        false
    }

    // ========== History ==========

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Undoes the most recent local action. The inverse ops are
    /// re-clocked and emitted like any local mutation, so remote peers
    /// converge on the undone state under the usual rules.
    pub fn undo(&mut self) -> bool {
        let Some(group) = self.history.pop_undo() else {
            return false;
        };
        let redo_group = self.apply_inverse_group(&group);
        self.history.push_redo(redo_group);
        true
    }

    /// Re-applies the most recently undone action.
    pub fn redo(&mut self) -> bool {
        let Some(group) = self.history.pop_redo() else {
            return false;
        };
        let undo_group = self.apply_inverse_group(&group);
        self.history.push_undo(undo_group);
        true
    }

    fn apply_inverse_group(&mut self, group: &Group) -> Group {
        self.history.pause();
        self.begin_batch();
        let mut captured = Vec::new();
        for op in group.ops.iter().rev() {
            if let Some(inverse) = self.invert(op) {
                captured.push(inverse);
            }
            let fresh = op.clone().with_clock(self.clock.tick());
            if self.apply_op(&fresh) {
                self.outbound.push(fresh);
            }
        }
        self.end_batch();
        self.history.resume();
        Group { ops: captured }
    }

    // ========== Snapshots ==========

    /// Serializes the whole tree into the wire envelope.
    pub fn serialize(&self) -> SerializedCrdt {
        self.serialize_node(self.root)
    }

    /// Replaces the entire tree from a snapshot without invalidating
    /// subscribers: shallow subscriptions transfer to the node at the
    /// same path, deep subscriptions are re-targeted, and history is
    /// cleared. All deep subscribers and every transferred shallow
    /// subscriber fire once.
    pub fn apply_snapshot(&mut self, snapshot: &SerializedCrdt, clock: u64) -> StorageResult<()> {
        if !matches!(
            snapshot,
            SerializedCrdt::Node(SerializedNode::LiveObject { .. })
        ) {
            return Err(StorageError::InvalidSnapshot);
        }

        let old_by_path = self.collect_paths(self.root);
        let new_root = match self.materialize(snapshot, None, Vec::new(), clock) {
            Value::Node(id) => id,
            Value::Scalar(_) => return Err(StorageError::InvalidSnapshot),
        };
        let new_by_path = self.collect_paths(new_root);

        // Transfer shallow subscribers to the same path in the new tree.
        for (path, old_id) in &old_by_path {
            if let Some(new_id) = new_by_path.get(path) {
                if let Some(subs) = self.shallow.remove(old_id) {
                    self.shallow.entry(*new_id).or_default().extend(subs);
                }
            }
        }

        // Re-target deep subscriptions whose target survived by path.
        let old_path_of: HashMap<NodeId, &Path> =
            old_by_path.iter().map(|(p, id)| (*id, p)).collect();
        for sub in &mut self.deep {
            if let Some(path) = old_path_of.get(&sub.target) {
                if let Some(new_id) = new_by_path.get(*path) {
                    sub.target = *new_id;
                }
            }
        }

        for old_id in old_path_of.keys() {
            self.nodes.remove(old_id);
        }
        self.root = new_root;
        self.clock.sync(clock);
        self.history.clear();
        self.pending.clear();

        self.notify_after_snapshot();
        Ok(())
    }

    // ========== Internals ==========

    fn next_sub_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_sub);
        self.next_sub += 1;
        id
    }

    fn expect_fields(&self, node: NodeId) -> StorageResult<Path> {
        let n = self
            .nodes
            .get(&node)
            .ok_or(StorageError::NodeNotFound(node))?;
        if n.body.fields().is_none() {
            return Err(StorageError::WrongKind {
                expected: NodeKind::Object,
                found: n.body.kind(),
            });
        }
        Ok(n.path.clone())
    }

    fn expect_list(&self, node: NodeId) -> StorageResult<usize> {
        let n = self
            .nodes
            .get(&node)
            .ok_or(StorageError::NodeNotFound(node))?;
        n.body
            .items()
            .map(|items| items.len())
            .ok_or(StorageError::WrongKind {
                expected: NodeKind::List,
                found: n.body.kind(),
            })
    }

    fn node_path(&self, node: NodeId) -> StorageResult<Path> {
        self.nodes
            .get(&node)
            .map(|n| n.path.clone())
            .ok_or(StorageError::NodeNotFound(node))
    }

    fn record_inverse(&mut self, op: &Op, node: NodeId, target: String) {
        if self.history.is_paused() {
            return;
        }
        if let Some(inverse) = self.invert(op) {
            self.history
                .record(inverse, CoalesceKey { node, target }, Instant::now());
        }
    }

    fn apply_and_emit(&mut self, op: Op) {
        if self.apply_op(&op) {
            self.outbound.push(op);
        }
    }

    /// Computes the op that restores the current state of `op`'s target.
    /// Clocks are left at zero; replay re-stamps them.
    fn invert(&self, op: &Op) -> Option<Op> {
        let id = self.resolve(op.path())?;
        let node = self.nodes.get(&id)?;
        match op {
            Op::Set { path, key, .. } | Op::Delete { path, key, .. } => {
                let entries = node.body.fields()?;
                match entries.get(key) {
                    Some(entry) => Some(Op::Set {
                        path: path.clone(),
                        key: key.clone(),
                        value: self.serialize_value(&entry.value),
                        clock: 0,
                    }),
                    None => match op {
                        Op::Set { .. } => Some(Op::Delete {
                            path: path.clone(),
                            key: key.clone(),
                            clock: 0,
                        }),
                        _ => None,
                    },
                }
            }
            Op::ListInsert { path, position, .. } => Some(Op::ListDelete {
                path: path.clone(),
                position: position.clone(),
                clock: 0,
            }),
            Op::ListDelete { path, position, .. } => {
                let entry = node.body.items()?.get(position)?;
                Some(Op::ListInsert {
                    path: path.clone(),
                    position: position.clone(),
                    value: self.serialize_value(&entry.value),
                    clock: 0,
                })
            }
            Op::ListMove {
                path,
                from_position,
                to_position,
                ..
            } => {
                node.body.items()?.get(from_position)?;
                Some(Op::ListMove {
                    path: path.clone(),
                    from_position: to_position.clone(),
                    to_position: from_position.clone(),
                    clock: 0,
                })
            }
        }
    }

    /// Applies one op to the tree. Returns whether it changed anything.
    /// A missing node along the path drops the op: a later insert of the
    /// parent carries the full nested envelope, re-materializing the
    /// subtree.
    fn apply_op(&mut self, op: &Op) -> bool {
        let Some(id) = self.resolve(op.path()) else {
            return false;
        };
        match op {
            Op::Set {
                path,
                key,
                value,
                clock,
            } => {
                let old_child = {
                    let Some(entries) = self.nodes.get(&id).and_then(|n| n.body.fields()) else {
                        return false;
                    };
                    match entries.get(key) {
                        Some(entry) if entry.clock >= *clock => return false,
                        Some(entry) => entry.child_id(),
                        None => None,
                    }
                };
                if let Some(child) = old_child {
                    self.detach_subtree(child);
                }
                let mut child_path = path.clone();
                child_path.push(key.clone());
                let stored = self.materialize(value, Some(id), child_path, *clock);
                if let Some(entries) = self.nodes.get_mut(&id).and_then(|n| n.body.fields_mut()) {
                    entries.insert(
                        key.clone(),
                        Entry {
                            value: stored,
                            clock: *clock,
                        },
                    );
                }
                self.changed(id);
                true
            }

            Op::Delete { key, clock, .. } => {
                let old_child = {
                    let Some(entries) = self.nodes.get(&id).and_then(|n| n.body.fields()) else {
                        return false;
                    };
                    match entries.get(key) {
                        Some(entry) if entry.clock >= *clock => return false,
                        Some(entry) => entry.child_id(),
                        None => return false,
                    }
                };
                if let Some(child) = old_child {
                    self.detach_subtree(child);
                }
                if let Some(entries) = self.nodes.get_mut(&id).and_then(|n| n.body.fields_mut()) {
                    entries.remove(key);
                }
                self.changed(id);
                true
            }

            Op::ListInsert {
                path,
                position,
                value,
                clock,
            } => {
                {
                    let Some(items) = self.nodes.get(&id).and_then(|n| n.body.items()) else {
                        return false;
                    };
                    if items.contains_key(position) {
                        return false;
                    }
                }
                let mut child_path = path.clone();
                child_path.push(position.as_str().to_string());
                let stored = self.materialize(value, Some(id), child_path, *clock);
                if let Some(items) = self.nodes.get_mut(&id).and_then(|n| n.body.items_mut()) {
                    items.insert(
                        position.clone(),
                        Entry {
                            value: stored,
                            clock: *clock,
                        },
                    );
                }
                self.changed(id);
                true
            }

            Op::ListDelete { position, .. } => {
                let removed = match self.nodes.get_mut(&id).and_then(|n| n.body.items_mut()) {
                    Some(items) => items.remove(position),
                    None => return false,
                };
                let Some(entry) = removed else {
                    return false;
                };
                if let Some(child) = entry.child_id() {
                    self.detach_subtree(child);
                }
                self.changed(id);
                true
            }

            Op::ListMove {
                path,
                from_position,
                to_position,
                clock,
            } => {
                let moved = {
                    let Some(items) = self.nodes.get_mut(&id).and_then(|n| n.body.items_mut())
                    else {
                        return false;
                    };
                    match items.get(from_position) {
                        Some(entry) if entry.clock >= *clock => return false,
                        Some(_) if items.contains_key(to_position) => return false,
                        Some(_) => {}
                        None => return false,
                    }
                    let mut entry = match items.remove(from_position) {
                        Some(entry) => entry,
                        None => return false,
                    };
                    entry.clock = *clock;
                    let child = entry.child_id();
                    items.insert(to_position.clone(), entry);
                    child
                };
                if let Some(child) = moved {
                    let mut child_path = path.clone();
                    child_path.push(to_position.as_str().to_string());
                    self.reroot_paths(child, child_path);
                }
                self.changed(id);
                true
            }
        }
    }

    /// Instantiates a serialized value into the arena, attaching any
    /// nested nodes under `parent` at `path`. Every installed entry gets
    /// the given clock.
    fn materialize(
        &mut self,
        value: &SerializedCrdt,
        parent: Option<NodeId>,
        path: Path,
        clock: u64,
    ) -> Value {
        let node = match value {
            SerializedCrdt::Scalar(v) => return Value::Scalar(v.clone()),
            SerializedCrdt::Node(node) => node,
        };
        let id = NodeId(self.next_node);
        self.next_node += 1;

        let body = match node {
            SerializedNode::LiveObject { data } | SerializedNode::LiveMap { data } => {
                let mut entries = HashMap::with_capacity(data.len());
                for (key, child) in data {
                    let mut child_path = path.clone();
                    child_path.push(key.clone());
                    let stored = self.materialize(child, Some(id), child_path, clock);
                    entries.insert(
                        key.clone(),
                        Entry {
                            value: stored,
                            clock,
                        },
                    );
                }
                if matches!(node, SerializedNode::LiveObject { .. }) {
                    NodeBody::Object(entries)
                } else {
                    NodeBody::Map(entries)
                }
            }
            SerializedNode::LiveList { items } => {
                let mut entries = BTreeMap::new();
                for SerializedItem { position, value } in items {
                    let mut child_path = path.clone();
                    child_path.push(position.as_str().to_string());
                    let stored = self.materialize(value, Some(id), child_path, clock);
                    entries.insert(
                        position.clone(),
                        Entry {
                            value: stored,
                            clock,
                        },
                    );
                }
                NodeBody::List(entries)
            }
        };

        self.nodes.insert(
            id,
            Node {
                parent,
                path,
                body,
            },
        );
        Value::Node(id)
    }

    /// Removes a node and all descendants from the arena. Subscribers
    /// keyed by the removed ids stay registered but never fire again.
    fn detach_subtree(&mut self, id: NodeId) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        let children: Vec<NodeId> = match &node.body {
            NodeBody::Object(e) | NodeBody::Map(e) => {
                e.values().filter_map(Entry::child_id).collect()
            }
            NodeBody::List(items) => items.values().filter_map(Entry::child_id).collect(),
        };
        for child in children {
            self.detach_subtree(child);
        }
    }

    /// Rewrites the stored paths of a subtree after its anchor moved.
    fn reroot_paths(&mut self, id: NodeId, new_path: Path) {
        let children: Vec<(NodeId, Path)> = {
            let Some(node) = self.nodes.get_mut(&id) else {
                return;
            };
            node.path = new_path.clone();
            match &node.body {
                NodeBody::Object(e) | NodeBody::Map(e) => e
                    .iter()
                    .filter_map(|(k, entry)| {
                        entry.child_id().map(|c| {
                            let mut p = new_path.clone();
                            p.push(k.clone());
                            (c, p)
                        })
                    })
                    .collect(),
                NodeBody::List(items) => items
                    .iter()
                    .filter_map(|(pos, entry)| {
                        entry.child_id().map(|c| {
                            let mut p = new_path.clone();
                            p.push(pos.as_str().to_string());
                            (c, p)
                        })
                    })
                    .collect(),
            }
        };
        for (child, path) in children {
            self.reroot_paths(child, path);
        }
    }

    fn serialize_node(&self, id: NodeId) -> SerializedCrdt {
        let Some(node) = self.nodes.get(&id) else {
            tracing::debug!(node = %id, "serializing detached node");
            return SerializedCrdt::Scalar(serde_json::Value::Null);
        };
        match &node.body {
            NodeBody::Object(entries) => SerializedCrdt::Node(SerializedNode::LiveObject {
                data: entries
                    .iter()
                    .map(|(k, e)| (k.clone(), self.serialize_value(&e.value)))
                    .collect(),
            }),
            NodeBody::Map(entries) => SerializedCrdt::Node(SerializedNode::LiveMap {
                data: entries
                    .iter()
                    .map(|(k, e)| (k.clone(), self.serialize_value(&e.value)))
                    .collect(),
            }),
            NodeBody::List(items) => SerializedCrdt::Node(SerializedNode::LiveList {
                items: items
                    .iter()
                    .map(|(pos, e)| SerializedItem {
                        position: pos.clone(),
                        value: self.serialize_value(&e.value),
                    })
                    .collect(),
            }),
        }
    }

    fn serialize_value(&self, value: &Value) -> SerializedCrdt {
        match value {
            Value::Scalar(v) => SerializedCrdt::Scalar(v.clone()),
            Value::Node(id) => self.serialize_node(*id),
        }
    }

    fn collect_paths(&self, from: NodeId) -> HashMap<Path, NodeId> {
        let mut out = HashMap::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            out.insert(node.path.clone(), id);
            match &node.body {
                NodeBody::Object(e) | NodeBody::Map(e) => {
                    stack.extend(e.values().filter_map(Entry::child_id));
                }
                NodeBody::List(items) => {
                    stack.extend(items.values().filter_map(Entry::child_id));
                }
            }
        }
        out
    }

    fn changed(&mut self, node: NodeId) {
        if self.pending.iter().any(|ev| ev.node == node) {
            return;
        }
        let Some(path) = self.nodes.get(&node).map(|n| n.path.clone()) else {
            return;
        };
        self.pending.push(ChangeEvent { node, path });
        if self.batch_depth == 0 {
            self.flush();
        }
    }

    /// Delivers accumulated change events: shallow subscribers once per
    /// changed node, deep subscribers once per callback with every event
    /// at or under their target.
    fn flush(&mut self) {
        if self.batch_depth > 0 || self.pending.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.pending);

        let mut shallow_calls: Vec<(ShallowCallback, ChangeEvent)> = Vec::new();
        for event in &events {
            if let Some(subs) = self.shallow.get(&event.node) {
                for (_, callback) in subs {
                    shallow_calls.push((callback.clone(), event.clone()));
                }
            }
        }

        let mut deep_calls: Vec<(DeepCallback, Vec<ChangeEvent>)> = Vec::new();
        for sub in &self.deep {
            let Some(target) = self.nodes.get(&sub.target) else {
                continue;
            };
            let prefix = &target.path;
            let matched: Vec<ChangeEvent> = events
                .iter()
                .filter(|ev| ev.path.len() >= prefix.len() && ev.path[..prefix.len()] == prefix[..])
                .cloned()
                .collect();
            if !matched.is_empty() {
                deep_calls.push((sub.callback.clone(), matched));
            }
        }

        for (callback, event) in shallow_calls {
            invoke_shallow(&callback, &event);
        }
        for (callback, events) in deep_calls {
            invoke_deep(&callback, &events);
        }
    }

    fn notify_after_snapshot(&mut self) {
        let root_event = ChangeEvent {
            node: self.root,
            path: Vec::new(),
        };

        let mut shallow_calls: Vec<(ShallowCallback, ChangeEvent)> = Vec::new();
        for (node, subs) in &self.shallow {
            let Some(n) = self.nodes.get(node) else {
                continue;
            };
            let event = ChangeEvent {
                node: *node,
                path: n.path.clone(),
            };
            for (_, callback) in subs {
                shallow_calls.push((callback.clone(), event.clone()));
            }
        }

        let deep_calls: Vec<DeepCallback> = self
            .deep
            .iter()
            .filter(|s| self.nodes.contains_key(&s.target))
            .map(|s| s.callback.clone())
            .collect();

        for (callback, event) in shallow_calls {
            invoke_shallow(&callback, &event);
        }
        let events = [root_event];
        for callback in deep_calls {
            invoke_deep(&callback, &events);
        }
    }
}

impl fmt::Debug for StorageDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageDoc")
            .field("root", &self.root)
            .field("nodes", &self.nodes.len())
            .field("clock", &self.clock.value())
            .finish()
    }
}

/// Subscriber callbacks run to completion between ops; one that panics
/// must not corrupt the document, so panics are caught and logged.
fn invoke_shallow(callback: &ShallowCallback, event: &ChangeEvent) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut guard = callback.lock().unwrap_or_else(|e| e.into_inner());
        guard(event);
    }));
    if result.is_err() {
        tracing::error!(node = %event.node, "storage subscriber panicked");
    }
}

fn invoke_deep(callback: &DeepCallback, events: &[ChangeEvent]) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut guard = callback.lock().unwrap_or_else(|e| e.into_inner());
        guard(events);
    }));
    if result.is_err() {
        tracing::error!("deep storage subscriber panicked");
    }
}
