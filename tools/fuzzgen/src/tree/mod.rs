//! Execution tree: a trie over `(decision id, value)` sequences.
//!
//! Each node owns its children behind its own mutex, so sessions advancing on
//! disjoint branches never contend. No operation holds two node locks at once.

mod traverse;

pub use traverse::{Traversal, TraversalItem};

use crate::codec::{RawValue, TypeTag};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Child key. Ordered so traversal is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey {
    pub decision_id: u64,
    pub value: RawValue,
}

/// What was requested at a node, recorded by the first session to get there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionSignature {
    pub decision_id: u64,
    pub tag: TypeTag,
    pub lo: RawValue,
    pub hi: RawValue,
}

impl DecisionSignature {
    fn conflicts_with(&self, other: &DecisionSignature, strict: bool) -> bool {
        if self.decision_id != other.decision_id {
            return true;
        }
        strict && (self.tag != other.tag || self.lo != other.lo || self.hi != other.hi)
    }
}

#[derive(Debug, Default)]
struct NodeState {
    children: BTreeMap<EdgeKey, Arc<Node>>,
    outcome: Option<bool>,
    may_win: bool,
    decision: Option<DecisionSignature>,
}

#[derive(Debug)]
pub struct Node {
    parent: Weak<Node>,
    key: Option<EdgeKey>,
    depth: usize,
    state: Mutex<NodeState>,
}

impl Node {
    fn root() -> Arc<Self> {
        Arc::new(Self {
            parent: Weak::new(),
            key: None,
            depth: 0,
            state: Mutex::new(NodeState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` only for the root.
    pub fn key(&self) -> Option<EdgeKey> {
        self.key
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.key.is_none()
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.upgrade()
    }

    pub fn outcome(&self) -> Option<bool> {
        self.lock().outcome
    }

    pub fn may_win(&self) -> bool {
        self.lock().may_win
    }

    pub fn decision(&self) -> Option<DecisionSignature> {
        self.lock().decision
    }

    pub fn child(&self, key: &EdgeKey) -> Option<Arc<Node>> {
        self.lock().children.get(key).cloned()
    }

    pub fn child_count(&self) -> usize {
        self.lock().children.len()
    }

    /// Children in key order, snapshotted under the node lock.
    pub fn children(&self) -> Vec<Arc<Node>> {
        self.lock().children.values().cloned().collect()
    }

    /// Up to `n` most recent edge values on the root path, oldest first.
    pub fn recent_values(&self, n: usize) -> Vec<RawValue> {
        let mut values = Vec::with_capacity(n.min(self.depth));
        if let Some(key) = self.key {
            if n > 0 {
                values.push(key.value);
            }
        }
        let mut current = self.parent();
        while values.len() < n {
            let Some(node) = current else { break };
            let Some(key) = node.key else { break };
            values.push(key.value);
            current = node.parent();
        }
        values.reverse();
        values
    }
}

/// Result of checking a request against the decision recorded at a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First request seen at this node; it is now the recorded one.
    Recorded,
    /// Consistent with the recorded decision.
    Matched,
    Conflict { recorded: DecisionSignature },
}

#[derive(Debug)]
pub struct ExecutionTree {
    root: Arc<Node>,
    nodes: AtomicUsize,
}

impl Default for ExecutionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTree {
    pub fn new() -> Self {
        Self {
            root: Node::root(),
            nodes: AtomicUsize::new(1),
        }
    }

    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.root)
    }

    /// Looks up or creates the child of `node` keyed by `(decision_id, value)`.
    pub fn advance(&self, node: &Arc<Node>, decision_id: u64, value: RawValue) -> Arc<Node> {
        let key = EdgeKey { decision_id, value };
        let mut state = node.lock();
        let child = state.children.entry(key).or_insert_with(|| {
            self.nodes.fetch_add(1, Ordering::Relaxed);
            Arc::new(Node {
                parent: Arc::downgrade(node),
                key: Some(key),
                depth: node.depth + 1,
                state: Mutex::new(NodeState::default()),
            })
        });
        Arc::clone(child)
    }

    /// Follows or creates a whole path from the root.
    pub fn advance_path(&self, path: &[(u64, RawValue)]) -> Arc<Node> {
        path.iter()
            .fold(self.root(), |node, (id, value)| self.advance(&node, *id, *value))
    }

    /// Atomically records `request` at `node` or compares it with what is there.
    pub fn claim_decision(
        &self,
        node: &Node,
        request: DecisionSignature,
        strict: bool,
    ) -> Claim {
        let mut state = node.lock();
        match state.decision {
            None => {
                state.decision = Some(request);
                Claim::Recorded
            }
            Some(recorded) if recorded.conflicts_with(&request, strict) => {
                Claim::Conflict { recorded }
            }
            Some(_) => Claim::Matched,
        }
    }

    /// Undoes a [`Claim::Recorded`] for `request` when the decision was never
    /// served. A different recorded decision stays.
    pub fn release_claim(&self, node: &Node, request: DecisionSignature) {
        let mut state = node.lock();
        if state.decision == Some(request) {
            state.decision = None;
        }
    }

    /// Sets (or overwrites) the outcome of `node`. A success also flags the
    /// node and every ancestor as `may_win`. A failure clears the node's own
    /// flag unless one of its children may still win; ancestors keep theirs.
    pub fn mark_outcome(&self, node: &Arc<Node>, outcome: bool) {
        if !outcome {
            let winning_child = node.children().iter().any(|child| child.may_win());
            let mut state = node.lock();
            state.outcome = Some(false);
            state.may_win = winning_child;
            return;
        }
        {
            let mut state = node.lock();
            state.outcome = Some(true);
            state.may_win = true;
        }
        let mut current = node.parent();
        while let Some(ancestor) = current {
            {
                let mut state = ancestor.lock();
                if state.may_win {
                    break;
                }
                state.may_win = true;
            }
            current = ancestor.parent();
        }
    }

    pub fn traverse(&self, window: usize) -> Traversal {
        Traversal::new(self.root(), window)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.load(Ordering::Relaxed)
    }

    /// Number of edges on the longest root-to-leaf path.
    pub fn longest_path(&self) -> usize {
        let mut longest = 0;
        let mut stack = vec![self.root()];
        while let Some(node) = stack.pop() {
            longest = longest.max(node.depth);
            stack.extend(node.children());
        }
        longest
    }

    /// Drops every node below the root and clears the root's labels.
    /// Cursors held into the old tree keep working but are detached from it.
    pub fn reset(&self) {
        *self.root.lock() = NodeState::default();
        self.nodes.store(1, Ordering::Relaxed);
    }

    pub(crate) fn restore_labels(
        &self,
        node: &Node,
        outcome: Option<bool>,
        may_win: bool,
        decision: Option<DecisionSignature>,
    ) {
        let mut state = node.lock();
        state.outcome = outcome;
        state.may_win = may_win;
        state.decision = decision;
    }
}

#[cfg(test)]
mod tests {
    use super::{Claim, DecisionSignature, ExecutionTree};
    use crate::codec::{RawValue, Scalar, TypeTag};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn v(x: i32) -> RawValue {
        Scalar::I32(x).to_raw()
    }

    fn sig(id: u64) -> DecisionSignature {
        DecisionSignature {
            decision_id: id,
            tag: TypeTag::I32,
            lo: v(0),
            hi: v(100),
        }
    }

    #[test]
    fn advance_is_idempotent() {
        let tree = ExecutionTree::new();
        let a = tree.advance_path(&[(1, v(5)), (2, v(6))]);
        let b = tree.advance_path(&[(1, v(5)), (2, v(6))]);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(tree.node_count(), 3);
        assert_eq!(a.depth(), 2);
        assert!(tree.root().is_root());
    }

    #[test]
    fn siblings_have_distinct_keys() {
        let tree = ExecutionTree::new();
        let root = tree.root();
        for id in 0..4 {
            for x in 0..4 {
                tree.advance(&root, id, v(x));
                tree.advance(&root, id, v(x));
            }
        }
        let keys = root
            .children()
            .iter()
            .map(|c| c.key().expect("child key"))
            .collect::<Vec<_>>();
        assert_eq!(keys.len(), 16);
        assert_eq!(keys.iter().collect::<HashSet<_>>().len(), 16);
    }

    #[test]
    fn same_value_under_different_ids_is_a_different_child() {
        let tree = ExecutionTree::new();
        let root = tree.root();
        let a = tree.advance(&root, 1, v(3));
        let b = tree.advance(&root, 2, v(3));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn success_propagates_may_win_to_the_root() {
        let tree = ExecutionTree::new();
        let leaf = tree.advance_path(&[(1, v(1)), (2, v(2)), (3, v(3))]);
        let side = tree.advance_path(&[(1, v(1)), (2, v(9))]);
        tree.mark_outcome(&side, false);
        assert!(!tree.root().may_win());

        tree.mark_outcome(&leaf, true);
        assert_eq!(leaf.outcome(), Some(true));
        let mut current = Some(leaf);
        while let Some(node) = current {
            assert!(node.may_win());
            current = node.parent();
        }
        assert!(!side.may_win());

        tree.mark_outcome(&side, true);
        assert_eq!(side.outcome(), Some(true));
    }

    #[test]
    fn failure_after_success_clears_may_win_unless_a_child_wins() {
        let tree = ExecutionTree::new();
        let mid = tree.advance_path(&[(1, v(1))]);
        let leaf = tree.advance(&mid, 2, v(2));

        tree.mark_outcome(&leaf, true);
        tree.mark_outcome(&leaf, false);
        assert_eq!(leaf.outcome(), Some(false));
        assert!(!leaf.may_win());
        assert!(mid.may_win());

        tree.mark_outcome(&leaf, true);
        tree.mark_outcome(&mid, false);
        assert_eq!(mid.outcome(), Some(false));
        assert!(mid.may_win());
    }

    #[test]
    fn claim_records_then_checks_decision_ids() {
        let tree = ExecutionTree::new();
        let root = tree.root();
        assert_eq!(tree.claim_decision(&root, sig(7), false), Claim::Recorded);
        assert_eq!(tree.claim_decision(&root, sig(7), false), Claim::Matched);
        assert_eq!(
            tree.claim_decision(&root, sig(9), false),
            Claim::Conflict { recorded: sig(7) }
        );

        let wider = DecisionSignature {
            hi: v(200),
            ..sig(7)
        };
        assert_eq!(tree.claim_decision(&root, wider, false), Claim::Matched);
        assert!(matches!(
            tree.claim_decision(&root, wider, true),
            Claim::Conflict { .. }
        ));
    }

    #[test]
    fn recent_values_pads_nothing_and_keeps_order() {
        let tree = ExecutionTree::new();
        let node = tree.advance_path(&[(1, v(1)), (1, v(2)), (1, v(3))]);
        assert_eq!(node.recent_values(2), vec![v(2), v(3)]);
        assert_eq!(node.recent_values(10), vec![v(1), v(2), v(3)]);
        assert!(tree.root().recent_values(4).is_empty());
    }

    #[test]
    fn longest_path_and_reset() {
        let tree = ExecutionTree::new();
        tree.advance_path(&[(1, v(1)), (1, v(2)), (1, v(3)), (1, v(4))]);
        tree.advance_path(&[(1, v(1)), (1, v(7))]);
        assert_eq!(tree.longest_path(), 4);
        tree.reset();
        assert_eq!(tree.longest_path(), 0);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.root().child_count(), 0);
    }

    #[test]
    fn concurrent_advances_converge_on_one_node_per_key() {
        let tree = Arc::new(ExecutionTree::new());
        let handles = (0..8)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    let mut leaves = Vec::new();
                    for x in 0..50 {
                        let shared = tree.advance_path(&[(1, v(x % 5)), (2, v(x % 7))]);
                        let own = tree.advance_path(&[(3, v(t)), (4, v(x))]);
                        leaves.push((shared, own));
                    }
                    leaves
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("thread");
        }
        // root + 5 + 35 shared, 8 + 8*50 private
        assert_eq!(tree.node_count(), 1 + 5 + 35 + 8 + 400);
        let a = tree.advance_path(&[(1, v(2)), (2, v(3))]);
        let b = tree.advance_path(&[(1, v(2)), (2, v(3))]);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
