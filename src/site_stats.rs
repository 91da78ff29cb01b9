//! Per-allocation-site accounting.

use std::io;

use indexmap::IndexMap;
use nohash_hasher::BuildNoHashHasher;

use crate::host::{ObjectId, TrackedObject, WarningFlags, WeakObject};
use crate::writer::{AllocDataWriter, Key, Separator};

/// Result of one estimate pass over a site's weak set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SiteEstimate {
  pub live_count: usize,
  pub live_size: usize,
  pub warnings: WarningFlags,
}

/// Counters for one allocation site plus the weak set of every object it
/// produced. The set holds weak handles only; the profiler never keeps an
/// object alive.
pub struct SiteStats<W: WeakObject> {
  alloc_count: u64,
  live_set: IndexMap<ObjectId, W, BuildNoHashHasher<ObjectId>>,
}

impl<W: WeakObject> Default for SiteStats<W> {
  fn default() -> Self {
    Self::new()
  }
}

impl<W: WeakObject> SiteStats<W> {
  /// Record one allocation. The count is monotonic; re-inserting an id
  /// already present leaves the weak set unchanged.
  pub fn add(&mut self, id: ObjectId, weak: W) {
    self.alloc_count += 1;
    self.live_set.entry(id).or_insert(weak);
  }

  #[must_use]
  pub fn alloc_count(&self) -> u64 {
    self.alloc_count
  }

  /// Size up every surviving object and prune entries the collector has
  /// reclaimed. Callers must arrange that a collection ran recently; this
  /// does not trigger one.
  ///
  /// The warning bitset is raised only when flagged objects account for at
  /// least half of the site's measured size.
  pub fn estimate(&mut self) -> SiteEstimate {
    let mut estimate = SiteEstimate::default();
    let mut raised = WarningFlags::NONE;
    let mut flagged_size = 0usize;

    self.live_set.retain(|_, weak| {
      let Some(obj) = weak.upgrade() else {
        return false;
      };

      let mut flags = WarningFlags::NONE;
      let mut size = obj.compute_alloc_info(&mut flags);
      if obj.is_composite() {
        size += obj.compute_prop_alloc_info(&mut flags);
      }

      if !flags.is_empty() {
        raised |= flags;
        flagged_size += size;
      }

      estimate.live_count += 1;
      estimate.live_size += size;
      true
    });

    if !raised.is_empty() && flagged_size * 2 >= estimate.live_size {
      estimate.warnings = raised;
    }

    estimate
  }

  /// Coerce deferred representations of the surviving objects so a
  /// following estimate measures their real footprint.
  pub fn force_materialize(&self) {
    for weak in self.live_set.values() {
      if let Some(obj) = weak.upgrade() {
        obj.force_materialize();
      }
    }
  }

  #[must_use]
  pub fn live_len(&self) -> usize {
    self.live_set.len()
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      alloc_count: 0,
      live_set: IndexMap::default(),
    }
  }

  /// Emit the surviving object identities in insertion order.
  ///
  /// # Errors
  ///
  /// Returns an error if the underlying writer fails.
  pub fn write_site<D: AllocDataWriter + ?Sized>(
    &self,
    writer: &mut D,
  ) -> io::Result<()> {
    writer
      .write_sequence_start_with_key(Key::ObjectIds, Separator::CommaBigSpace)?;

    let mut first = true;
    for (id, weak) in &self.live_set {
      if weak.upgrade().is_none() {
        continue;
      }

      let separator = if first {
        Separator::None
      } else {
        Separator::Comma
      };
      writer.write_naked_object_id(*id, separator)?;
      first = false;
    }

    writer.write_sequence_end()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::{
    DYNAMIC_ENTRY_SIZE, DYNAMIC_SIZE_DEFAULT, Recycler, STATIC_SIZE_DEFAULT,
    STRING_CHAR_UNIT_SIZE,
  };
  use crate::rc_host::RcHeap;

  #[test]
  fn add_is_monotonic_and_dedups_ids() {
    let heap = RcHeap::new();
    let obj = heap.alloc_primitive();

    let mut stats = SiteStats::new();
    stats.add(obj.object_id(), heap.downgrade(&obj));
    stats.add(obj.object_id(), heap.downgrade(&obj));

    assert_eq!(stats.alloc_count(), 2);
    assert_eq!(stats.live_len(), 1);
  }

  #[test]
  fn estimate_sizes_primitives_and_composites() {
    let heap = RcHeap::new();
    let primitive = heap.alloc_primitive();
    let composite = heap.alloc_composite(3);

    let mut stats = SiteStats::new();
    stats.add(primitive.object_id(), heap.downgrade(&primitive));
    stats.add(composite.object_id(), heap.downgrade(&composite));

    let estimate = stats.estimate();
    assert_eq!(estimate.live_count, 2);
    assert_eq!(
      estimate.live_size,
      STATIC_SIZE_DEFAULT + DYNAMIC_SIZE_DEFAULT + 3 * DYNAMIC_ENTRY_SIZE
    );
    assert!(estimate.warnings.is_empty());
  }

  #[test]
  fn estimate_prunes_reclaimed_entries() {
    let heap = RcHeap::new();
    let mut stats = SiteStats::new();

    let mut objs = Vec::new();
    for _ in 0..10 {
      let obj = heap.alloc_primitive();
      stats.add(obj.object_id(), heap.downgrade(&obj));
      objs.push(obj);
    }

    for obj in objs.drain(..7) {
      heap.release(&obj);
    }
    heap.collect_exhaustive();

    let estimate = stats.estimate();
    assert_eq!(estimate.live_count, 3);
    assert_eq!(stats.live_len(), 3);
    assert_eq!(stats.alloc_count(), 10);
  }

  #[test]
  fn force_materialize_makes_string_sizes_accurate() {
    let heap = RcHeap::new();
    let string = heap.alloc_string(&["hello", " ", "world"]);

    let mut stats = SiteStats::new();
    stats.add(string.object_id(), heap.downgrade(&string));

    let deferred = stats.estimate();
    assert_eq!(deferred.live_size, STATIC_SIZE_DEFAULT);

    stats.force_materialize();
    let flat = stats.estimate();
    assert_eq!(
      flat.live_size,
      STATIC_SIZE_DEFAULT + "hello world".len() * STRING_CHAR_UNIT_SIZE
    );
  }

  #[test]
  fn warnings_need_half_of_measured_size() {
    let heap = RcHeap::new();

    // The flagged object dominates this site, so the flag surfaces.
    let sparse = heap
      .alloc_flagged_composite(64, WarningFlags::SPARSE_ARRAY_OBJECT);
    let small = heap.alloc_primitive();

    let mut dominated = SiteStats::new();
    dominated.add(sparse.object_id(), heap.downgrade(&sparse));
    dominated.add(small.object_id(), heap.downgrade(&small));
    assert_eq!(
      dominated.estimate().warnings,
      WarningFlags::SPARSE_ARRAY_OBJECT
    );

    // A flagged object that is a sliver of the site stays quiet.
    let tiny_flagged =
      heap.alloc_flagged_composite(0, WarningFlags::LOW_DATA_CONTENT_OBJECT);
    let big = heap.alloc_composite(64);

    let mut diluted = SiteStats::new();
    diluted.add(tiny_flagged.object_id(), heap.downgrade(&tiny_flagged));
    diluted.add(big.object_id(), heap.downgrade(&big));
    assert!(diluted.estimate().warnings.is_empty());
  }
}
