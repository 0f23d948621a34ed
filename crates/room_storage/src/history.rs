//! Undo/redo history for a storage document.
//!
//! History records inverse operations, grouped into atomic units that map
//! to single user-visible actions. Groups coalesce when successive edits
//! hit the same field or position within a short window, the way rapid
//! typing or dragging should undo as one step.

use crate::doc::NodeId;
use crate::op::Op;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default coalescing window for successive edits to the same target.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(500);

/// Default cap on each stack, in groups. Oldest groups are evicted first.
pub const DEFAULT_CAP: usize = 64;

/// Identifies the register or position an inverse op restores, for
/// coalescing decisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoalesceKey {
    pub node: NodeId,
    pub target: String,
}

/// One undoable unit: the inverse ops of a single user action, applied in
/// reverse order on undo.
#[derive(Clone, Debug, Default)]
pub struct Group {
    pub ops: Vec<Op>,
}

/// Undo/redo stacks with coalescing, pause/resume, and bounded depth.
#[derive(Debug)]
pub struct History {
    undo: VecDeque<Group>,
    redo: VecDeque<Group>,
    cap: usize,
    window: Duration,
    pause_depth: u32,
    /// Set while a batch is open; all records append to one group.
    action_open: bool,
    last_record: Option<(Instant, CoalesceKey)>,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            cap: DEFAULT_CAP,
            window: DEFAULT_COALESCE_WINDOW,
            pause_depth: 0,
            action_open: false,
            last_record: None,
        }
    }

    /// Overrides the coalescing window. `Duration::ZERO` disables
    /// coalescing entirely, which tests rely on for deterministic groups.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Overrides the stack cap.
    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap.max(1);
        self
    }

    /// Stops recording until `resume`. Pauses nest.
    pub fn pause(&mut self) {
        self.pause_depth += 1;
    }

    pub fn resume(&mut self) {
        self.pause_depth = self.pause_depth.saturating_sub(1);
    }

    pub fn is_paused(&self) -> bool {
        self.pause_depth > 0
    }

    /// Records one inverse op captured before a local mutation.
    ///
    /// A new local edit invalidates everything on the redo stack. The op
    /// joins the current group when a batch is open, or when it targets
    /// the same register within the coalescing window; otherwise it opens
    /// a new group.
    pub fn record(&mut self, inverse: Op, key: CoalesceKey, now: Instant) {
        if self.is_paused() {
            return;
        }
        self.redo.clear();

        let coalesce = self.action_open
            || match &self.last_record {
                Some((at, last_key)) => {
                    *last_key == key && now.saturating_duration_since(*at) < self.window
                }
                None => false,
            };

        if coalesce {
            if let Some(group) = self.undo.back_mut() {
                group.ops.push(inverse);
            } else {
                self.undo.push_back(Group { ops: vec![inverse] });
            }
        } else {
            self.undo.push_back(Group { ops: vec![inverse] });
            if self.undo.len() > self.cap {
                self.undo.pop_front();
            }
        }
        if !self.action_open {
            self.last_record = Some((now, key));
        }
    }

    /// Opens an explicit group; every record until `end_action` joins it.
    pub fn begin_action(&mut self) {
        if self.is_paused() || self.action_open {
            return;
        }
        self.action_open = true;
        self.undo.push_back(Group::default());
        if self.undo.len() > self.cap {
            self.undo.pop_front();
        }
    }

    /// Closes the explicit group. An empty group (no recorded ops) is
    /// discarded.
    pub fn end_action(&mut self) {
        if !self.action_open {
            return;
        }
        self.action_open = false;
        self.last_record = None;
        if self.undo.back().is_some_and(|g| g.ops.is_empty()) {
            self.undo.pop_back();
        }
    }

    pub fn pop_undo(&mut self) -> Option<Group> {
        self.last_record = None;
        self.undo.pop_back()
    }

    pub fn pop_redo(&mut self) -> Option<Group> {
        self.redo.pop_back()
    }

    /// Pushes the inverse group captured during an undo.
    pub fn push_redo(&mut self, group: Group) {
        self.redo.push_back(group);
        if self.redo.len() > self.cap {
            self.redo.pop_front();
        }
    }

    /// Pushes the inverse group captured during a redo. Unlike `record`,
    /// this does not clear the redo stack.
    pub fn push_undo(&mut self, group: Group) {
        self.undo.push_back(group);
        if self.undo.len() > self.cap {
            self.undo.pop_front();
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Drops both stacks. Called when a snapshot rehydrates the tree:
    /// recorded inverses refer to nodes that may no longer exist.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.last_record = None;
        self.action_open = false;
    }

    #[cfg(test)]
    fn undo_len(&self) -> usize {
        self.undo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inverse(key: &str) -> Op {
        Op::Delete {
            path: vec![],
            key: key.to_string(),
            clock: 0,
        }
    }

    fn key(node: NodeId, target: &str) -> CoalesceKey {
        CoalesceKey {
            node,
            target: target.to_string(),
        }
    }

    #[test]
    fn test_record_pushes_groups() {
        let mut h = History::new().with_window(Duration::ZERO);
        let node = NodeId::first();
        let t = Instant::now();
        h.record(inverse("a"), key(node, "a"), t);
        h.record(inverse("b"), key(node, "b"), t);
        assert_eq!(h.undo_len(), 2);
    }

    #[test]
    fn test_same_target_coalesces_within_window() {
        let mut h = History::new();
        let node = NodeId::first();
        let t = Instant::now();
        h.record(inverse("a"), key(node, "a"), t);
        h.record(inverse("a"), key(node, "a"), t + Duration::from_millis(100));
        assert_eq!(h.undo_len(), 1);

        // Outside the window a new group opens.
        h.record(inverse("a"), key(node, "a"), t + Duration::from_secs(2));
        assert_eq!(h.undo_len(), 2);
    }

    #[test]
    fn test_different_target_never_coalesces() {
        let mut h = History::new();
        let node = NodeId::first();
        let t = Instant::now();
        h.record(inverse("a"), key(node, "a"), t);
        h.record(inverse("b"), key(node, "b"), t);
        assert_eq!(h.undo_len(), 2);
    }

    #[test]
    fn test_action_groups_everything() {
        let mut h = History::new().with_window(Duration::ZERO);
        let node = NodeId::first();
        let t = Instant::now();
        h.begin_action();
        h.record(inverse("a"), key(node, "a"), t);
        h.record(inverse("b"), key(node, "b"), t);
        h.end_action();
        assert_eq!(h.undo_len(), 1);
        assert_eq!(h.pop_undo().unwrap().ops.len(), 2);
    }

    #[test]
    fn test_empty_action_is_discarded() {
        let mut h = History::new();
        h.begin_action();
        h.end_action();
        assert!(!h.can_undo());
    }

    #[test]
    fn test_pause_suppresses_recording() {
        let mut h = History::new();
        let node = NodeId::first();
        h.pause();
        h.record(inverse("a"), key(node, "a"), Instant::now());
        assert!(!h.can_undo());
        h.resume();
        h.record(inverse("a"), key(node, "a"), Instant::now());
        assert!(h.can_undo());
    }

    #[test]
    fn test_record_clears_redo() {
        let mut h = History::new();
        let node = NodeId::first();
        h.push_redo(Group {
            ops: vec![inverse("x")],
        });
        assert!(h.can_redo());
        h.record(inverse("a"), key(node, "a"), Instant::now());
        assert!(!h.can_redo());
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut h = History::new().with_window(Duration::ZERO).with_cap(3);
        let node = NodeId::first();
        let t = Instant::now();
        for i in 0..5 {
            h.record(inverse(&format!("k{i}")), key(node, &format!("k{i}")), t);
        }
        assert_eq!(h.undo_len(), 3);
        // Oldest surviving group is k2.
        let g = h.undo.front().unwrap();
        assert!(matches!(&g.ops[0], Op::Delete { key, .. } if key == "k2"));
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut h = History::new();
        let node = NodeId::first();
        h.record(inverse("a"), key(node, "a"), Instant::now());
        h.push_redo(Group {
            ops: vec![inverse("b")],
        });
        h.clear();
        assert!(!h.can_undo());
        assert!(!h.can_redo());
    }
}
