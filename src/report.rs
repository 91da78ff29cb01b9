use super::*;

use crate::file_map;

/// Drives one report over a tracer's path tree.
///
/// Emission runs in fixed phases: force deferred object representations,
/// request an exhaustive collection so every weak set reflects true
/// liveness, estimate sizes bottom-up, flag interesting sites against the
/// configured thresholds, and finally stream the surviving nodes.
pub struct Reporter<'a, F: FunctionRef, R: Recycler> {
  config: &'a TracerConfig,
  recycler: &'a R,
  tree: &'a mut PathTree<F, R::Weak>,
}

impl<'a, F: FunctionRef, R: Recycler> Reporter<'a, F, R> {
  /// Write the trimmed report: interesting, user-visible sites only, plus
  /// the file-source map. The interning table is cleared on the way out
  /// even when a write fails, so further emissions stay consistent.
  ///
  /// # Errors
  ///
  /// Returns an error if the underlying writer fails.
  pub fn emit<D: AllocDataWriter + ?Sized>(
    &mut self,
    writer: &mut D,
  ) -> Result<(), EmitError> {
    self.force_all();
    self.recycler.collect_exhaustive();

    let (total_count, total_size) = self.estimate();
    let count_threshold =
      (total_count as f64 * self.config.count_threshold_fraction) as usize;
    let size_threshold =
      (total_size as f64 * self.config.size_threshold_fraction) as usize;
    self.flag_interesting(count_threshold, size_threshold);

    log::debug!(
      "emitting trace: {total_count} live objects, ~{total_size} bytes, \
       thresholds {count_threshold}/{size_threshold}"
    );

    let result = self.write_trimmed(writer);
    file_map::clear_source_entries();
    result?;

    Ok(())
  }

  /// Sum live counts and sizes bottom-up; interior nodes carry the totals
  /// of their children. Returns the grand totals across roots.
  fn estimate(&mut self) -> (usize, usize) {
    let mut total_count = 0;
    let mut total_size = 0;

    for root in self.tree.roots_mut() {
      let (count, size) = Self::estimate_node(root);
      total_count += count;
      total_size += size;
    }

    (total_count, total_size)
  }

  fn estimate_node(node: &mut PathNode<F, R::Weak>) -> (usize, usize) {
    match &mut node.kind {
      PathNodeKind::Leaf(stats) => {
        let estimate = stats.estimate();
        node.live_count = estimate.live_count;
        node.live_size = estimate.live_size;
        node.warnings = estimate.warnings;

        (estimate.live_count, estimate.live_size)
      }
      PathNodeKind::Internal(children) => {
        let mut count = 0;
        let mut size = 0;

        for child in children.values_mut() {
          let (child_count, child_size) = Self::estimate_node(child);
          count += child_count;
          size += child_size;
        }

        node.live_count = count;
        node.live_size = size;

        (count, size)
      }
    }
  }

  fn flag_interesting(&mut self, count_threshold: usize, size_threshold: usize) {
    for root in self.tree.roots_mut() {
      Self::flag_node(root, count_threshold, size_threshold);
    }
  }

  fn flag_node(
    node: &mut PathNode<F, R::Weak>,
    count_threshold: usize,
    size_threshold: usize,
  ) -> bool {
    match &mut node.kind {
      PathNodeKind::Leaf(_) => {
        node.interesting = node.live_count >= count_threshold
          || node.live_size >= size_threshold;
      }
      PathNodeKind::Internal(children) => {
        let mut any_interesting = false;
        for child in children.values_mut() {
          any_interesting |=
            Self::flag_node(child, count_threshold, size_threshold);
        }
        node.interesting = any_interesting;
      }
    }

    node.interesting
  }

  /// Make deferred object representations reachable and flat before any
  /// collection runs.
  pub fn force_all(&self) {
    for root in self.tree.roots() {
      Self::force_node(root);
    }
  }

  fn force_node(node: &PathNode<F, R::Weak>) {
    match &node.kind {
      PathNodeKind::Leaf(stats) => stats.force_materialize(),
      PathNodeKind::Internal(children) => {
        for child in children.values() {
          Self::force_node(child);
        }
      }
    }
  }

  #[must_use]
  pub fn new(
    tree: &'a mut PathTree<F, R::Weak>,
    recycler: &'a R,
    config: &'a TracerConfig,
  ) -> Self {
    Self {
      config,
      recycler,
      tree,
    }
  }

  fn should_emit(node: &PathNode<F, R::Weak>) -> bool {
    node.interesting && node.live_count > 0 && !node.location.is_internal()
  }

  /// Write the untrimmed detailed report: every non-internal root with its
  /// full counters and warning flags, no thresholding.
  ///
  /// # Errors
  ///
  /// Returns an error if the underlying writer fails.
  pub fn write_detailed<D: AllocDataWriter + ?Sized>(
    &mut self,
    writer: &mut D,
  ) -> Result<(), EmitError> {
    self.force_all();
    self.recycler.collect_exhaustive();

    writer.write_sequence_start(Separator::None)?;
    writer.adjust_indent(1);

    let mut first = true;
    for root in self.tree.roots_mut() {
      if root.location.is_internal() {
        continue;
      }

      if !first {
        writer.write_separator(Separator::Comma)?;
      }
      first = false;

      writer.write_separator(Separator::BigSpace)?;
      Self::write_detailed_node(writer, root)?;
    }

    writer.write_separator(Separator::BigSpace)?;
    writer.adjust_indent(-1);
    writer.write_sequence_end()?;
    writer.flush()?;

    Ok(())
  }

  fn write_detailed_node<D: AllocDataWriter + ?Sized>(
    writer: &mut D,
    node: &mut PathNode<F, R::Weak>,
  ) -> io::Result<()> {
    writer.write_record_start(Separator::None)?;
    writer.adjust_indent(1);
    node.location.write_detailed(writer)?;

    match &mut node.kind {
      PathNodeKind::Leaf(stats) => {
        let alloc_count = stats.alloc_count();
        let estimate = stats.estimate();

        writer.write_separator(Separator::Comma)?;
        writer.write_record_start_with_key(Key::Site, Separator::BigSpace)?;
        writer.write_uint(
          Key::AllocationCount,
          alloc_count,
          Separator::None,
        )?;
        writer.write_uint(
          Key::LiveCount,
          estimate.live_count as u64,
          Separator::Comma,
        )?;
        writer.write_uint(
          Key::LiveSize,
          estimate.live_size as u64,
          Separator::Comma,
        )?;

        if !estimate.warnings.is_empty() {
          writer.write_sequence_start_with_key(Key::Flags, Separator::Comma)?;
          let mut first = true;
          for name in estimate.warnings.names() {
            let separator = if first {
              Separator::None
            } else {
              Separator::Comma
            };
            writer.write_naked_string(name, separator)?;
            first = false;
          }
          writer.write_sequence_end()?;
        }

        writer.write_record_end()?;
      }
      PathNodeKind::Internal(children) => {
        writer.write_separator(Separator::Comma)?;
        writer
          .write_sequence_start_with_key(Key::CallPaths, Separator::BigSpace)?;
        writer.adjust_indent(1);

        let mut first = true;
        for child in children.values_mut() {
          if !first {
            writer.write_separator(Separator::Comma)?;
          }
          first = false;

          writer.write_separator(Separator::BigSpace)?;
          Self::write_detailed_node(writer, child)?;
        }

        writer.write_separator(Separator::BigSpace)?;
        writer.adjust_indent(-1);
        writer.write_sequence_end()?;
      }
    }

    writer.adjust_indent(-1);
    writer.write_separator(Separator::BigSpace)?;
    writer.write_record_end()
  }

  fn write_trimmed<D: AllocDataWriter + ?Sized>(
    &self,
    writer: &mut D,
  ) -> io::Result<()> {
    writer.write_record_start(Separator::None)?;
    writer.adjust_indent(1);
    writer
      .write_sequence_start_with_key(Key::Allocations, Separator::BigSpace)?;
    writer.adjust_indent(1);

    let mut first = true;
    for root in self.tree.roots() {
      if !Self::should_emit(root) {
        continue;
      }

      if !first {
        writer.write_separator(Separator::Comma)?;
      }
      first = false;

      writer.write_separator(Separator::BigSpace)?;
      Self::write_trimmed_node(writer, root)?;
    }

    writer.write_separator(Separator::BigSpace)?;
    writer.adjust_indent(-1);
    writer.write_sequence_end()?;

    file_map::write_file_map(writer, Separator::CommaBigSpace)?;

    writer.adjust_indent(-1);
    writer.write_separator(Separator::BigSpace)?;
    writer.write_record_end()?;
    writer.flush()
  }

  fn write_trimmed_node<D: AllocDataWriter + ?Sized>(
    writer: &mut D,
    node: &PathNode<F, R::Weak>,
  ) -> io::Result<()> {
    writer.write_record_start(Separator::None)?;
    node.location.write_trimmed(writer)?;
    writer.write_separator(Separator::CommaBigSpace)?;

    writer.adjust_indent(1);
    writer.write_record_start_with_key(Key::AllocInfo, Separator::None)?;
    writer.write_uint(Key::Count, node.live_count as u64, Separator::None)?;
    writer.write_uint(
      Key::EstimatedSize,
      node.live_size as u64,
      Separator::Comma,
    )?;
    writer.write_record_end()?;
    writer.adjust_indent(-1);

    match &node.kind {
      PathNodeKind::Leaf(stats) => {
        stats.write_site(writer)?;
      }
      PathNodeKind::Internal(children) => {
        writer.write_sequence_start_with_key(
          Key::SubPaths,
          Separator::CommaBigSpace,
        )?;
        writer.adjust_indent(1);

        let mut first = true;
        for child in children.values() {
          if !Self::should_emit(child) {
            continue;
          }

          if !first {
            writer.write_separator(Separator::Comma)?;
          }
          first = false;

          writer.write_separator(Separator::BigSpace)?;
          Self::write_trimmed_node(writer, child)?;
        }

        writer.write_separator(Separator::BigSpace)?;
        writer.adjust_indent(-1);
        writer.write_sequence_end()?;
      }
    }

    writer.write_separator(Separator::BigSpace)?;
    writer.write_record_end()
  }
}
