//! Size-ordered index of free blocks.
//!
//! The index is an AVL tree whose nodes are not allocated anywhere: they are
//! written in place at an address the caller picks, which in practice is the
//! payload of a free block. A free block's payload is unused by definition,
//! so the allocator borrows its first bytes for the node, the same way the
//! node of a free-list entry would be overlaid on the free memory it tracks.
//!
//! ```text
//! +------------------------+ <--------+
//! |       size_curr        |          |
//! |       size_prev        |          |-------> Block header
//! |       offset           |          |
//! +------------------------+ <--------+
//! |       TreeNode         | -------> lives in the free payload
//! +------------------------+
//! |     rest of payload    |
//! |        (unused)        |
//! +------------------------+
//! ```
//!
//! Keys are block sizes and duplicates are allowed; equal keys descend to
//! the right on insertion, so the shape of the tree, and with it the answer
//! of [`Tree::find_best`], is deterministic for a given operation history.

use std::mem;
use std::ptr::NonNull;

/// Non-null pointer to a tree node.
pub(crate) type Link = Option<NonNull<TreeNode>>;

#[repr(C)]
pub(crate) struct TreeNode {
    left: Link,
    right: Link,
    parent: Link,
    key: usize,
    height: usize,
}

/// Bytes a node occupies at the start of a free payload. The minimum block
/// size is derived from this, which is what guarantees the node always fits.
pub(crate) const TREE_NODE_SIZE: usize = mem::size_of::<TreeNode>();

impl TreeNode {
    /// The key this node was inserted with, i.e. the size of its block.
    pub(crate) fn key(&self) -> usize {
        self.key
    }
}

pub(crate) struct Tree {
    root: Link,
    len: usize,
}

impl Tree {
    pub(crate) const fn new() -> Self {
        Self { root: None, len: 0 }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Writes a fresh node at `addr` and inserts it with the given key.
    ///
    /// **SAFETY**: caller must guarantee `addr` points to at least
    /// [`TREE_NODE_SIZE`] writable bytes, aligned for [`TreeNode`], that stay
    /// untouched until the node is removed again.
    pub(crate) unsafe fn add(&mut self, addr: NonNull<u8>, key: usize) -> NonNull<TreeNode> {
        unsafe {
            debug_assert_eq!(addr.as_ptr() as usize % mem::align_of::<TreeNode>(), 0);

            let mut node = addr.cast::<TreeNode>();
            node.as_ptr().write(TreeNode {
                left: None,
                right: None,
                parent: None,
                key,
                height: 1,
            });
            self.len += 1;

            let Some(mut current) = self.root else {
                self.root = Some(node);
                return node;
            };

            loop {
                if key < current.as_ref().key {
                    match current.as_ref().left {
                        Some(next) => current = next,
                        None => {
                            current.as_mut().left = Some(node);
                            break;
                        }
                    }
                } else {
                    // Duplicate keys descend to the right.
                    match current.as_ref().right {
                        Some(next) => current = next,
                        None => {
                            current.as_mut().right = Some(node);
                            break;
                        }
                    }
                }
            }
            node.as_mut().parent = Some(current);
            self.rebalance(current);
            node
        }
    }

    /// Unlinks `node` from the tree. The node's storage is not touched
    /// beyond the unlink; ownership of the bytes returns to the caller.
    ///
    /// **SAFETY**: `node` must be a node previously returned by
    /// [`Tree::add`] on this tree and not removed since.
    pub(crate) unsafe fn remove(&mut self, node: NonNull<TreeNode>) {
        unsafe {
            self.len -= 1;

            if node.as_ref().left.is_some() && node.as_ref().right.is_some() {
                // Two children: splice the in-order successor into node's
                // place. The successor has no left child by construction.
                let mut succ = node.as_ref().right.unwrap();
                while let Some(left) = succ.as_ref().left {
                    succ = left;
                }

                let retrace = if succ.as_ref().parent == Some(node) {
                    // The successor is node's right child and keeps its own
                    // right subtree; retracing starts at the successor.
                    succ
                } else {
                    // Detach the successor and graft node's right subtree
                    // onto it; retracing starts at its old parent.
                    let mut succ_parent = succ.as_ref().parent.unwrap();
                    succ_parent.as_mut().left = succ.as_ref().right;
                    if let Some(mut right) = succ.as_ref().right {
                        right.as_mut().parent = Some(succ_parent);
                    }
                    let mut node_right = node.as_ref().right.unwrap();
                    succ.as_mut().right = Some(node_right);
                    node_right.as_mut().parent = Some(succ);
                    succ_parent
                };

                let mut node_left = node.as_ref().left.unwrap();
                succ.as_mut().left = Some(node_left);
                node_left.as_mut().parent = Some(succ);
                succ.as_mut().parent = node.as_ref().parent;
                self.replace_child(node.as_ref().parent, node, Some(succ));
                self.rebalance(retrace);
                return;
            }

            // One child at most: lift it into node's place.
            let child = node.as_ref().left.or(node.as_ref().right);
            let parent = node.as_ref().parent;
            if let Some(mut child) = child {
                child.as_mut().parent = parent;
            }
            match parent {
                None => self.root = child,
                Some(mut parent) => {
                    if parent.as_ref().left == Some(node) {
                        parent.as_mut().left = child;
                    } else {
                        parent.as_mut().right = child;
                    }
                    self.rebalance(parent);
                }
            }
        }
    }

    /// Best-fit lookup: the node with the smallest key `>= key`, or `None`
    /// if every key is smaller.
    pub(crate) fn find_best(&self, key: usize) -> Option<NonNull<TreeNode>> {
        let mut best = None;
        let mut current = self.root;
        while let Some(node) = current {
            unsafe {
                if node.as_ref().key >= key {
                    best = Some(node);
                    current = node.as_ref().left;
                } else {
                    current = node.as_ref().right;
                }
            }
        }
        best
    }

    /// In-order traversal, smallest key first.
    pub(crate) fn walk<F: FnMut(NonNull<TreeNode>)>(&self, mut visit: F) {
        fn walk_link<F: FnMut(NonNull<TreeNode>)>(link: Link, visit: &mut F) {
            if let Some(node) = link {
                unsafe {
                    walk_link(node.as_ref().left, visit);
                    visit(node);
                    walk_link(node.as_ref().right, visit);
                }
            }
        }
        walk_link(self.root, &mut visit);
    }

    fn height(link: Link) -> usize {
        link.map_or(0, |node| unsafe { node.as_ref().height })
    }

    unsafe fn update_height(mut node: NonNull<TreeNode>) {
        unsafe {
            let height = 1 + Self::height(node.as_ref().left).max(Self::height(node.as_ref().right));
            node.as_mut().height = height;
        }
    }

    fn balance(node: NonNull<TreeNode>) -> isize {
        unsafe { Self::height(node.as_ref().left) as isize - Self::height(node.as_ref().right) as isize }
    }

    /// Repairs heights and AVL balance on the path from `start` to the root.
    unsafe fn rebalance(&mut self, start: NonNull<TreeNode>) {
        unsafe {
            let mut current = Some(start);
            while let Some(node) = current {
                Self::update_height(node);
                let balance = Self::balance(node);
                let subroot = if balance > 1 {
                    if Self::balance(node.as_ref().left.unwrap()) < 0 {
                        self.rotate_left(node.as_ref().left.unwrap());
                    }
                    self.rotate_right(node)
                } else if balance < -1 {
                    if Self::balance(node.as_ref().right.unwrap()) > 0 {
                        self.rotate_right(node.as_ref().right.unwrap());
                    }
                    self.rotate_left(node)
                } else {
                    node
                };
                current = subroot.as_ref().parent;
            }
        }
    }

    unsafe fn rotate_left(&mut self, mut node: NonNull<TreeNode>) -> NonNull<TreeNode> {
        unsafe {
            let mut pivot = node.as_ref().right.unwrap();
            let parent = node.as_ref().parent;

            node.as_mut().right = pivot.as_ref().left;
            if let Some(mut moved) = pivot.as_ref().left {
                moved.as_mut().parent = Some(node);
            }
            pivot.as_mut().left = Some(node);
            node.as_mut().parent = Some(pivot);
            pivot.as_mut().parent = parent;
            self.replace_child(parent, node, Some(pivot));
            Self::update_height(node);
            Self::update_height(pivot);
            pivot
        }
    }

    unsafe fn rotate_right(&mut self, mut node: NonNull<TreeNode>) -> NonNull<TreeNode> {
        unsafe {
            let mut pivot = node.as_ref().left.unwrap();
            let parent = node.as_ref().parent;

            node.as_mut().left = pivot.as_ref().right;
            if let Some(mut moved) = pivot.as_ref().right {
                moved.as_mut().parent = Some(node);
            }
            pivot.as_mut().right = Some(node);
            node.as_mut().parent = Some(pivot);
            pivot.as_mut().parent = parent;
            self.replace_child(parent, node, Some(pivot));
            Self::update_height(node);
            Self::update_height(pivot);
            pivot
        }
    }

    /// Rewires the edge that pointed at `old` to point at `new`.
    unsafe fn replace_child(&mut self, parent: Link, old: NonNull<TreeNode>, new: Link) {
        unsafe {
            match parent {
                None => self.root = new,
                Some(mut parent) => {
                    if parent.as_ref().left == Some(old) {
                        parent.as_mut().left = new;
                    } else {
                        debug_assert_eq!(parent.as_ref().right, Some(old));
                        parent.as_mut().right = new;
                    }
                }
            }
        }
    }

    /// Structural self-check used by the tests: parent links, the ordering
    /// invariant (left <= node <= right) and the AVL balance bound.
    #[cfg(test)]
    fn validate(&self) {
        fn check(link: Link, parent: Link, lo: Option<usize>, hi: Option<usize>) -> usize {
            let Some(node) = link else { return 0 };
            let node_ref = unsafe { node.as_ref() };
            assert_eq!(node_ref.parent, parent);
            if let Some(lo) = lo {
                assert!(node_ref.key >= lo);
            }
            if let Some(hi) = hi {
                assert!(node_ref.key <= hi);
            }
            let left = check(node_ref.left, link, lo, Some(node_ref.key));
            let right = check(node_ref.right, link, Some(node_ref.key), hi);
            assert!((left as isize - right as isize).abs() <= 1);
            assert_eq!(node_ref.height, 1 + left.max(right));
            node_ref.height
        }
        check(self.root, None, None, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::mem::MaybeUninit;

    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    /// Stable out-of-tree storage for nodes. Boxes don't move when the
    /// vector reallocates, so the handed-out addresses stay valid.
    #[derive(Default)]
    struct Slots(Vec<Box<MaybeUninit<TreeNode>>>);

    impl Slots {
        fn take(&mut self) -> NonNull<u8> {
            self.0.push(Box::new(MaybeUninit::uninit()));
            NonNull::from(self.0.last_mut().unwrap().as_mut()).cast()
        }
    }

    fn keys_in_order(tree: &Tree) -> Vec<usize> {
        let mut keys = Vec::new();
        tree.walk(|node| keys.push(unsafe { node.as_ref().key() }));
        keys
    }

    #[test]
    fn new_tree_is_empty() {
        let tree = Tree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert!(tree.find_best(0).is_none());
    }

    #[test]
    fn walk_yields_sorted_keys() {
        let mut slots = Slots::default();
        let mut tree = Tree::new();

        for key in [96usize, 48, 1024, 256, 48, 4096, 16] {
            unsafe { tree.add(slots.take(), key) };
            tree.validate();
        }

        assert_eq!(tree.len(), 7);
        assert_eq!(keys_in_order(&tree), vec![16, 48, 48, 96, 256, 1024, 4096]);
    }

    #[test]
    fn find_best_is_a_ceiling_lookup() {
        let mut slots = Slots::default();
        let mut tree = Tree::new();

        for key in [64usize, 256, 1024] {
            unsafe { tree.add(slots.take(), key) };
        }

        let best = |key| tree.find_best(key).map(|n| unsafe { n.as_ref().key() });
        assert_eq!(best(1), Some(64));
        assert_eq!(best(64), Some(64));
        assert_eq!(best(65), Some(256));
        assert_eq!(best(1024), Some(1024));
        assert_eq!(best(1025), None);
    }

    #[test]
    fn remove_specific_nodes() {
        let mut slots = Slots::default();
        let mut tree = Tree::new();

        let nodes: Vec<_> = [32usize, 64, 64, 128]
            .iter()
            .map(|&key| unsafe { tree.add(slots.take(), key) })
            .collect();

        // Removing one of the duplicates must leave the other in place.
        unsafe { tree.remove(nodes[1]) };
        tree.validate();
        assert_eq!(keys_in_order(&tree), vec![32, 64, 128]);

        unsafe { tree.remove(nodes[0]) };
        unsafe { tree.remove(nodes[3]) };
        tree.validate();
        assert_eq!(keys_in_order(&tree), vec![64]);

        unsafe { tree.remove(nodes[2]) };
        assert!(tree.is_empty());
    }

    #[test]
    fn randomized_against_reference_multiset() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut slots = Slots::default();
        let mut tree = Tree::new();
        let mut live: Vec<(NonNull<TreeNode>, usize)> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_ratio(3, 5) {
                let key = rng.gen_range(0..96usize) * 16;
                let node = unsafe { tree.add(slots.take(), key) };
                live.push((node, key));
            } else {
                let index = rng.gen_range(0..live.len());
                let (node, _) = live.swap_remove(index);
                unsafe { tree.remove(node) };
            }
            tree.validate();
            assert_eq!(tree.len(), live.len());

            let probe = rng.gen_range(0..1600);
            let expected = live.iter().map(|&(_, k)| k).filter(|&k| k >= probe).min();
            let found = tree.find_best(probe).map(|n| unsafe { n.as_ref().key() });
            assert_eq!(found, expected);
        }

        let mut reference: Vec<usize> = live.iter().map(|&(_, k)| k).collect();
        reference.sort_unstable();
        assert_eq!(keys_in_order(&tree), reference);

        let mut order: Vec<usize> = (0..live.len()).collect();
        order.shuffle(&mut rng);
        for index in order {
            unsafe { tree.remove(live[index].0) };
            tree.validate();
        }
        assert!(tree.is_empty());
    }
}
