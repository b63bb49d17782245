//! Ordered index of free blocks.
//!
//! An AVL tree keyed by [`BlockId`]. Node storage is a side table with one slot
//! per block of the reservation, so inserting never allocates and freed blocks
//! are never written to. Ordering by id is ordering by address.

use crate::space::BlockId;

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
struct Node {
  left: u32,
  right: u32,
  parent: u32,
  /// 0 while the block is not in the tree.
  height: i32,
}

impl Node {
  const EMPTY: Node = Node {
    left: NIL,
    right: NIL,
    parent: NIL,
    height: 0,
  };
}

pub struct FreeBlockIndex {
  nodes: Box<[Node]>,
  root: u32,
  min: u32,
  max: u32,
  len: usize,
}

impl FreeBlockIndex {
  /// Creates an empty index able to hold ids `0..capacity`.
  pub fn with_capacity(capacity: usize) -> Self {
    debug_assert!(capacity < NIL as usize);
    Self {
      nodes: vec![Node::EMPTY; capacity].into_boxed_slice(),
      root: NIL,
      min: NIL,
      max: NIL,
      len: 0,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.root == NIL
  }

  #[inline]
  pub fn contains(&self, id: BlockId) -> bool {
    self
      .nodes
      .get(id.index())
      .is_some_and(|node| node.height != 0)
  }

  /// Smallest id in the index.
  pub fn first(&self) -> Option<BlockId> {
    (self.min != NIL).then_some(BlockId(self.min))
  }

  /// Largest id in the index.
  pub fn last(&self) -> Option<BlockId> {
    (self.max != NIL).then_some(BlockId(self.max))
  }

  /// Inserts `id`, which must not already be present.
  pub fn push(&mut self, id: BlockId) {
    debug_assert!(!self.contains(id), "block {id} pushed twice");
    self.add(id.0);
    self.len += 1;
  }

  /// Removes and returns the smallest id.
  pub fn pop_front(&mut self) -> Option<BlockId> {
    if self.min == NIL {
      return None;
    }
    let id = self.min;
    self.delete_edge(id);
    Some(BlockId(id))
  }

  /// Removes the largest id if it equals `id`. Leaves the index untouched otherwise.
  pub fn pop_back_if(&mut self, id: BlockId) -> bool {
    if self.max == NIL || self.max != id.0 {
      return false;
    }
    self.delete_edge(id.0);
    true
  }

  // ===========================================================================
  // Node access
  // ===========================================================================

  #[inline]
  fn node(&self, i: u32) -> &Node {
    &self.nodes[i as usize]
  }

  #[inline]
  fn node_mut(&mut self, i: u32) -> &mut Node {
    &mut self.nodes[i as usize]
  }

  #[inline]
  fn height(&self, i: u32) -> i32 {
    if i == NIL { 0 } else { self.node(i).height }
  }

  #[inline]
  fn heights(&self, i: u32) -> (i32, i32) {
    let node = self.node(i);
    (self.height(node.left), self.height(node.right))
  }

  fn set_left(&mut self, parent: u32, child: u32) {
    self.node_mut(parent).left = child;
    if child != NIL {
      self.node_mut(child).parent = parent;
    }
  }

  fn set_right(&mut self, parent: u32, child: u32) {
    self.node_mut(parent).right = child;
    if child != NIL {
      self.node_mut(child).parent = parent;
    }
  }

  /// Swaps the `find` child link of `parent` for `value`.
  fn replace_child(&mut self, parent: u32, find: u32, value: u32) {
    if self.node(parent).left == find {
      self.set_left(parent, value);
    } else if self.node(parent).right == find {
      self.set_right(parent, value);
    }
  }

  /// Recomputes the height of `i`. Returns true if it changed.
  fn fix_height(&mut self, i: u32) -> bool {
    let (lh, rh) = self.heights(i);
    let new_height = lh.max(rh) + 1;
    let node = self.node_mut(i);
    if node.height != new_height {
      node.height = new_height;
      true
    } else {
      false
    }
  }

  /// Replaces `old` with `new` under `parent`, or makes `new` the root.
  fn reattach(&mut self, parent: u32, old: u32, new: u32) {
    if parent != NIL {
      self.replace_child(parent, old, new);
    } else {
      self.root = new;
      self.node_mut(new).parent = NIL;
    }
  }

  // ===========================================================================
  // Insertion
  // ===========================================================================

  fn add(&mut self, id: u32) {
    *self.node_mut(id) = Node {
      height: 1,
      ..Node::EMPTY
    };

    if self.root == NIL {
      self.root = id;
      self.min = id;
      self.max = id;
      return;
    }

    let mut current = self.root;
    loop {
      let go_left = id < current;
      let target = if go_left {
        self.node(current).left
      } else {
        self.node(current).right
      };

      if target != NIL {
        current = target;
        continue;
      }

      if go_left {
        self.set_left(current, id);
        if current == self.min {
          self.min = id;
        }
      } else {
        self.set_right(current, id);
        if current == self.max {
          self.max = id;
        }
      }
      self.fix_up(current);
      return;
    }
  }

  // ===========================================================================
  // Rotations
  // ===========================================================================

  /// Returns the new subtree root.
  fn rotate_left(&mut self, pivot: u32) -> u32 {
    let parent = self.node(pivot).parent;
    let new_root = self.node(pivot).right;
    let shifted = self.node(new_root).left;
    self.set_left(new_root, pivot);
    self.set_right(pivot, shifted);
    self.reattach(parent, pivot, new_root);
    self.fix_height(pivot);
    self.fix_height(new_root);
    new_root
  }

  /// Returns the new subtree root.
  fn rotate_right(&mut self, pivot: u32) -> u32 {
    let parent = self.node(pivot).parent;
    let new_root = self.node(pivot).left;
    let shifted = self.node(new_root).right;
    self.set_right(new_root, pivot);
    self.set_left(pivot, shifted);
    self.reattach(parent, pivot, new_root);
    self.fix_height(pivot);
    self.fix_height(new_root);
    new_root
  }

  /// Restores balance at `i`. Returns true if the subtree height changed.
  fn try_balance(&mut self, i: u32) -> bool {
    let before = self.node(i).height;
    let (lh, rh) = self.heights(i);
    let root = if lh - rh >= 2 {
      let left = self.node(i).left;
      let (llh, lrh) = self.heights(left);
      if llh < lrh {
        self.rotate_left(left);
      }
      self.rotate_right(i)
    } else if rh - lh >= 2 {
      let right = self.node(i).right;
      let (rlh, rrh) = self.heights(right);
      if rrh < rlh {
        self.rotate_right(right);
      }
      self.rotate_left(i)
    } else {
      return self.fix_height(i);
    };
    self.node(root).height != before
  }

  fn fix_up(&mut self, mut i: u32) {
    while i != NIL {
      let parent = self.node(i).parent;
      if !self.try_balance(i) {
        return;
      }
      i = parent;
    }
  }

  // ===========================================================================
  // Removal
  // ===========================================================================

  /// Unlinks the current minimum or maximum. Either has at most one child.
  fn delete_edge(&mut self, id: u32) {
    let Node {
      left,
      right,
      parent,
      ..
    } = *self.node(id);

    if id == self.min {
      self.min = if right != NIL { right } else { parent };
    }
    if id == self.max {
      self.max = if left != NIL { left } else { parent };
    }

    let child = if left != NIL { left } else { right };
    if parent != NIL {
      self.replace_child(parent, id, child);
      self.fix_up(parent);
    } else {
      self.root = child;
      if child != NIL {
        self.node_mut(child).parent = NIL;
      }
    }

    *self.node_mut(id) = Node::EMPTY;
    self.len -= 1;
  }

  // ===========================================================================
  // Verification
  // ===========================================================================

  /// In-order keys.
  #[cfg(test)]
  pub(crate) fn keys(&self) -> Vec<BlockId> {
    let mut out = Vec::with_capacity(self.len);
    let mut stack = Vec::new();
    let mut cur = self.root;
    while cur != NIL || !stack.is_empty() {
      while cur != NIL {
        stack.push(cur);
        cur = self.node(cur).left;
      }
      let Some(top) = stack.pop() else { break };
      out.push(BlockId(top));
      cur = self.node(top).right;
    }
    out
  }

  /// Panics if links, heights, balance, ordering or the min/max cache are off.
  #[cfg(test)]
  pub(crate) fn assert_valid(&self) {
    fn walk(index: &FreeBlockIndex, i: u32, parent: u32, lo: i64, hi: i64) -> (i32, usize) {
      if i == NIL {
        return (0, 0);
      }
      let node = index.node(i);
      assert_eq!(node.parent, parent, "bad parent link at {i}");
      assert!((i as i64) > lo && (i as i64) < hi, "order violated at {i}");
      let (lh, ln) = walk(index, node.left, i, lo, i as i64);
      let (rh, rn) = walk(index, node.right, i, i as i64, hi);
      assert!((lh - rh).abs() <= 1, "unbalanced at {i}: {lh} vs {rh}");
      assert_eq!(node.height, lh.max(rh) + 1, "stale height at {i}");
      (node.height, ln + rn + 1)
    }

    let (_, count) = walk(self, self.root, NIL, -1, i64::MAX);
    assert_eq!(count, self.len);
    let keys = self.keys();
    assert_eq!(self.first(), keys.first().copied());
    assert_eq!(self.last(), keys.last().copied());
  }
}
