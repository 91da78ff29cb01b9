//! Prefix tree aggregating allocations by source-location path.
//!
//! Interior nodes are call sites; leaves are allocation sites carrying a
//! `SiteStats`. Child maps are insertion-ordered and keyed by `FrameKey`,
//! so repeat visits to one site coalesce in O(1) while emission order
//! stays stable.

use indexmap::IndexMap;
use nohash_hasher::BuildNoHashHasher;

use crate::host::{FunctionRef, WarningFlags, WeakObject};
use crate::location::{
  FrameKey, SourceLocation, interior_key, resolve_line_column, terminal_key,
};
use crate::shadow_stack::ShadowCallFrame;
use crate::site_stats::SiteStats;

pub type ChildMap<F, W> =
  IndexMap<FrameKey, PathNode<F, W>, BuildNoHashHasher<FrameKey>>;

pub enum PathNodeKind<F: FunctionRef, W: WeakObject> {
  Internal(ChildMap<F, W>),
  Leaf(SiteStats<W>),
}

/// One node in the allocation path tree. The live fields are transient:
/// they are valid between an estimate pass and the next mutation.
pub struct PathNode<F: FunctionRef, W: WeakObject> {
  pub(crate) interesting: bool,
  pub(crate) kind: PathNodeKind<F, W>,
  pub(crate) live_count: usize,
  pub(crate) live_size: usize,
  pub(crate) location: SourceLocation<F>,
  pub(crate) warnings: WarningFlags,
}

impl<F: FunctionRef, W: WeakObject> PathNode<F, W> {
  /// Child nodes in insertion order; `None` for leaves.
  pub fn children(&self) -> Option<impl Iterator<Item = &PathNode<F, W>>> {
    match &self.kind {
      PathNodeKind::Internal(children) => Some(children.values()),
      PathNodeKind::Leaf(_) => None,
    }
  }

  #[must_use]
  pub fn interesting(&self) -> bool {
    self.interesting
  }

  #[must_use]
  pub fn is_leaf(&self) -> bool {
    matches!(self.kind, PathNodeKind::Leaf(_))
  }

  #[must_use]
  pub fn live_count(&self) -> usize {
    self.live_count
  }

  #[must_use]
  pub fn live_size(&self) -> usize {
    self.live_size
  }

  #[must_use]
  pub fn location(&self) -> &SourceLocation<F> {
    &self.location
  }

  fn new_internal(location: SourceLocation<F>) -> Self {
    Self {
      interesting: false,
      kind: PathNodeKind::Internal(ChildMap::default()),
      live_count: 0,
      live_size: 0,
      location,
      warnings: WarningFlags::NONE,
    }
  }

  fn new_leaf(location: SourceLocation<F>) -> Self {
    Self {
      interesting: false,
      kind: PathNodeKind::Leaf(SiteStats::new()),
      live_count: 0,
      live_size: 0,
      location,
      warnings: WarningFlags::NONE,
    }
  }

  /// The allocation-site statistics; `None` for interior nodes.
  #[must_use]
  pub fn stats(&self) -> Option<&SiteStats<W>> {
    match &self.kind {
      PathNodeKind::Internal(_) => None,
      PathNodeKind::Leaf(stats) => Some(stats),
    }
  }

  #[must_use]
  pub fn warnings(&self) -> WarningFlags {
    self.warnings
  }
}

/// Owner of every allocation path observed by one tracer.
pub struct PathTree<F: FunctionRef, W: WeakObject> {
  roots: ChildMap<F, W>,
}

impl<F: FunctionRef, W: WeakObject> Default for PathTree<F, W> {
  fn default() -> Self {
    Self::new()
  }
}

impl<F: FunctionRef, W: WeakObject> PathTree<F, W> {
  /// Drop every node. Nodes release their stats as they go, which unroots
  /// the weak sets.
  pub fn clear(&mut self) {
    self.roots.clear();
  }

  fn extend_level<'a>(
    level: &'a mut ChildMap<F, W>,
    frames: &[ShadowCallFrame<F>],
    position: usize,
  ) -> &'a mut SiteStats<W> {
    let frame = &frames[position];
    let (line, column) = resolve_line_column(frame);
    let identity = frame.function.identity();

    if position == 0 {
      let key = terminal_key(identity, line, column);
      let node = level.entry(key).or_insert_with(|| {
        PathNode::new_leaf(SourceLocation::new(
          frame.function.clone(),
          line,
          column,
        ))
      });

      match &mut node.kind {
        PathNodeKind::Leaf(stats) => stats,
        PathNodeKind::Internal(_) => {
          unreachable!("terminal key resolved to an interior node")
        }
      }
    } else {
      let key = interior_key(identity, line, column);
      let node = level.entry(key).or_insert_with(|| {
        PathNode::new_internal(SourceLocation::new(
          frame.function.clone(),
          line,
          column,
        ))
      });

      match &mut node.kind {
        PathNodeKind::Internal(children) => {
          Self::extend_level(children, frames, position - 1)
        }
        PathNodeKind::Leaf(_) => {
          unreachable!("interior key resolved to a leaf node")
        }
      }
    }
  }

  /// Walk (and grow) the tree along the given frames, innermost first,
  /// and return the stats of the terminal allocation site. Roots are the
  /// outermost frames; the innermost frame becomes the leaf.
  pub fn extend_for(
    &mut self,
    frames: &[ShadowCallFrame<F>],
  ) -> &mut SiteStats<W> {
    debug_assert!(!frames.is_empty(), "attribution requires a frame");

    Self::extend_level(&mut self.roots, frames, frames.len() - 1)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.roots.is_empty()
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      roots: ChildMap::default(),
    }
  }

  #[must_use]
  pub fn root_count(&self) -> usize {
    self.roots.len()
  }

  /// Roots in first-insertion order.
  pub fn roots(&self) -> impl Iterator<Item = &PathNode<F, W>> {
    self.roots.values()
  }

  pub(crate) fn roots_mut(
    &mut self,
  ) -> impl Iterator<Item = &mut PathNode<F, W>> {
    self.roots.values_mut()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::{Recycler, TrackedObject};
  use crate::rc_host::{RcFunction, RcHeap, RcWeak};

  fn frame(function: &RcFunction, offset: u32) -> ShadowCallFrame<RcFunction> {
    ShadowCallFrame {
      bytecode_offset: offset,
      function: function.clone(),
    }
  }

  #[test]
  fn repeat_visits_coalesce_to_one_leaf() {
    let heap = RcHeap::new();
    let source = "let a = make();\nlet b = make();\n";
    let f = RcFunction::with_statements(
      "build",
      Some("/app/build.js"),
      Some(source),
      &[(0, 0), (8, 16)],
    );

    let mut tree: PathTree<RcFunction, RcWeak> = PathTree::new();

    for _ in 0..2 {
      let obj = heap.alloc_primitive();
      let stats = tree.extend_for(&[frame(&f, 9)]);
      stats.add(obj.object_id(), heap.downgrade(&obj));
    }

    assert_eq!(tree.root_count(), 1);
    let root = tree.roots().next().expect("missing root");
    assert!(root.is_leaf());
    assert_eq!(root.stats().expect("missing stats").alloc_count(), 2);
  }

  #[test]
  fn offsets_in_one_statement_share_a_leaf() {
    let source = "let a = make();\nlet b = make();\n";
    let f = RcFunction::with_statements(
      "build",
      Some("/app/build.js"),
      Some(source),
      &[(0, 0), (8, 16)],
    );

    let mut tree: PathTree<RcFunction, RcWeak> = PathTree::new();
    tree.extend_for(&[frame(&f, 8)]);
    tree.extend_for(&[frame(&f, 12)]);
    assert_eq!(tree.root_count(), 1);

    // A different statement resolves to a different line, so it splits.
    tree.extend_for(&[frame(&f, 2)]);
    assert_eq!(tree.root_count(), 2);
  }

  #[test]
  fn chain_builds_interior_nodes_down_to_the_allocation_site() {
    let inner =
      RcFunction::new("inner", Some("/app/inner.js"), Some("alloc();\n"));
    let outer =
      RcFunction::new("outer", Some("/app/outer.js"), Some("inner();\n"));

    let mut tree: PathTree<RcFunction, RcWeak> = PathTree::new();

    // Innermost first: the allocation happens in `inner`, called by
    // `outer`, so `outer` is the root and `inner` the leaf.
    tree.extend_for(&[frame(&inner, 0), frame(&outer, 0)]);
    tree.extend_for(&[frame(&inner, 0), frame(&outer, 0)]);

    assert_eq!(tree.root_count(), 1);
    let root = tree.roots().next().expect("missing root");
    assert!(!root.is_leaf());
    assert_eq!(root.location().function().display_name(), "outer");

    let children: Vec<_> =
      root.children().expect("missing children").collect();
    assert_eq!(children.len(), 1);
    assert!(children[0].is_leaf());
    assert_eq!(
      children[0].location().function().display_name(),
      "inner"
    );
  }

  #[test]
  fn no_two_siblings_share_a_location() {
    let f = RcFunction::with_statements(
      "build",
      Some("/app/build.js"),
      Some("a();\nb();\n"),
      &[(0, 0), (4, 5)],
    );

    let mut tree: PathTree<RcFunction, RcWeak> = PathTree::new();
    tree.extend_for(&[frame(&f, 0)]);
    tree.extend_for(&[frame(&f, 4)]);
    tree.extend_for(&[frame(&f, 5)]);

    let locations: Vec<(u32, u32)> = tree
      .roots()
      .map(|node| (node.location().line(), node.location().column()))
      .collect();

    let mut deduped = locations.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), locations.len());
  }
}
