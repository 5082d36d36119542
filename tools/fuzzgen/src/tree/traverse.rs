use super::{EdgeKey, Node};
use serde::Serialize;
use std::sync::Arc;

/// One node as seen by a downstream consumer of the tree.
#[derive(Debug, Clone, Serialize)]
pub struct TraversalItem {
    #[serde(skip)]
    pub node: Arc<Node>,
    pub depth: usize,
    pub decision_id: Option<u64>,
    /// Last `window` edge values on the root path, oldest first, zero padded
    /// on the right.
    pub window: Vec<f64>,
    pub outcome: Option<bool>,
    pub may_win: bool,
}

impl TraversalItem {
    pub fn key(&self) -> Option<EdgeKey> {
        self.node.key()
    }
}

/// Lazy pre-order walk, children in key order. Children are snapshotted when
/// their parent is visited, so nodes added behind the cursor are skipped and
/// nodes added ahead of it are seen.
pub struct Traversal {
    stack: Vec<Arc<Node>>,
    window: usize,
}

impl Traversal {
    pub(super) fn new(root: Arc<Node>, window: usize) -> Self {
        Self {
            stack: vec![root],
            window,
        }
    }
}

impl Iterator for Traversal {
    type Item = TraversalItem;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children().into_iter().rev());

        let mut window = node
            .recent_values(self.window)
            .into_iter()
            .map(|value| value.as_f64())
            .collect::<Vec<_>>();
        window.resize(self.window, 0.0);

        Some(TraversalItem {
            depth: node.depth(),
            decision_id: node.key().map(|key| key.decision_id),
            window,
            outcome: node.outcome(),
            may_win: node.may_win(),
            node,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::{RawValue, Scalar};
    use crate::tree::ExecutionTree;

    fn v(x: u8) -> RawValue {
        Scalar::U8(x).to_raw()
    }

    #[test]
    fn depth_first_in_key_order_with_padded_windows() {
        let tree = ExecutionTree::new();
        tree.advance_path(&[(1, v(2)), (1, v(5))]);
        tree.advance_path(&[(1, v(1))]);
        let leaf = tree.advance_path(&[(1, v(2)), (1, v(4))]);
        tree.mark_outcome(&leaf, true);

        let items = tree.traverse(3).collect::<Vec<_>>();
        let windows = items.iter().map(|i| i.window.clone()).collect::<Vec<_>>();
        assert_eq!(
            windows,
            vec![
                vec![0.0, 0.0, 0.0],
                vec![1.0, 0.0, 0.0],
                vec![2.0, 0.0, 0.0],
                vec![2.0, 4.0, 0.0],
                vec![2.0, 5.0, 0.0],
            ]
        );
        let labels = items.iter().map(|i| (i.may_win, i.outcome)).collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec![
                (true, None),
                (false, None),
                (true, None),
                (true, Some(true)),
                (false, None),
            ]
        );
    }

    #[test]
    fn window_keeps_only_the_most_recent_values() {
        let tree = ExecutionTree::new();
        tree.advance_path(&[(1, v(1)), (1, v(2)), (1, v(3)), (1, v(4))]);
        let deepest = tree.traverse(2).last().expect("leaf");
        assert_eq!(deepest.window, vec![3.0, 4.0]);
        assert_eq!(deepest.depth, 4);
    }

    #[test]
    fn traversal_is_restartable() {
        let tree = ExecutionTree::new();
        tree.advance_path(&[(1, v(1)), (2, v(2))]);
        let first = tree.traverse(4).map(|i| i.key()).collect::<Vec<_>>();
        let second = tree.traverse(4).map(|i| i.key()).collect::<Vec<_>>();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }
}
