use std::ops::{Deref, DerefMut};

use crate::config::TracerConfig;
use crate::export::{EmitError, TraceDataIo, trace_resource_name};
use crate::host::{FunctionRef, Recycler, TrackedObject};
use crate::path_tree::{PathNode, PathNodeKind, PathTree};
use crate::report::Reporter;
use crate::shadow_stack::ShadowCallStack;
use crate::summary::{SiteRecord, Summary};
use crate::writer::{AllocDataWriter, TextFormatWriter};

/// Thin builder that customizes `TracerConfig` without exposing all knobs
/// up front.
#[derive(Debug, Default)]
pub struct TracerBuilder {
  config: TracerConfig,
}

impl TracerBuilder {
  #[must_use]
  pub fn count_threshold_fraction(mut self, fraction: f64) -> Self {
    self.config = self.config.with_count_threshold_fraction(fraction);
    self
  }

  #[must_use]
  pub fn finish<F: FunctionRef, R: Recycler>(
    self,
    recycler: R,
  ) -> AllocTracer<F, R> {
    AllocTracer::with_config(recycler, self.config)
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      config: TracerConfig::default(),
    }
  }

  #[must_use]
  pub fn size_threshold_fraction(mut self, fraction: f64) -> Self {
    self.config = self.config.with_size_threshold_fraction(fraction);
    self
  }

  #[must_use]
  pub fn start_enabled(mut self, enabled: bool) -> Self {
    self.config.start_enabled = enabled;
    self
  }

  #[must_use]
  pub fn with_config(mut self, config: TracerConfig) -> Self {
    self.config = config;
    self
  }
}

/// Entry point for one interpreter context: mirrors its call stack,
/// attributes every trackable allocation to a source location, and writes
/// reports on demand.
///
/// A tracer is single-threaded by construction; the host invokes it from
/// the thread running that context's bytecode, never from a collector
/// callback.
pub struct AllocTracer<F: FunctionRef, R: Recycler> {
  config: TracerConfig,
  enabled: bool,
  recycler: R,
  stack: ShadowCallStack<F>,
  tree: PathTree<F, R::Weak>,
}

impl<F: FunctionRef, R: Recycler> AllocTracer<F, R> {
  #[must_use]
  pub fn builder() -> TracerBuilder {
    TracerBuilder::new()
  }

  fn collect_site_records(
    node: &mut PathNode<F, R::Weak>,
    records: &mut Vec<SiteRecord>,
  ) {
    match &mut node.kind {
      PathNodeKind::Leaf(stats) => {
        let alloc_count = stats.alloc_count();
        let estimate = stats.estimate();
        let location = &node.location;

        records.push(SiteRecord {
          alloc_count,
          column: location.column(),
          file: location.function().source_url().map(str::to_string),
          function: location.function().display_name().to_string(),
          line: location.line() + 1,
          live_count: estimate.live_count as i64,
          live_size: estimate.live_size as i64,
        });
      }
      PathNodeKind::Internal(children) => {
        for child in children.values_mut() {
          Self::collect_site_records(child, records);
        }
      }
    }
  }

  #[must_use]
  pub fn config(&self) -> &TracerConfig {
    &self.config
  }

  /// Current shadow-stack depth.
  #[must_use]
  pub fn depth(&self) -> usize {
    self.stack.depth()
  }

  pub fn disable(&mut self) {
    self.enabled = false;
  }

  /// Open the `allocTracing_<snapId>.json` resource and write one trimmed
  /// report into it.
  ///
  /// # Errors
  ///
  /// Returns an error if the resource stream cannot be opened or a write
  /// fails. The tracer stays consistent either way and further emissions
  /// are allowed.
  pub fn emit_trimmed<T: TraceDataIo>(
    &mut self,
    snapshot_id: i64,
    io_info: &T,
  ) -> Result<(), EmitError> {
    let name = trace_resource_name(snapshot_id);
    let stream = io_info
      .open_resource_stream(&name)
      .map_err(|err| EmitError::Resource(format!("{name}: {err}")))?;

    let mut writer = TextFormatWriter::new(stream);
    self.emit_trimmed_into(&mut writer)
  }

  /// Write one trimmed report through a host-provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if the underlying writer fails.
  pub fn emit_trimmed_into<D: AllocDataWriter + ?Sized>(
    &mut self,
    writer: &mut D,
  ) -> Result<(), EmitError> {
    Reporter::new(&mut self.tree, &self.recycler, &self.config).emit(writer)
  }

  pub fn enable(&mut self) {
    self.enabled = true;
  }

  #[must_use]
  pub fn enabled(&self) -> bool {
    self.enabled
  }

  /// Force lazy object representations ahead of an emission.
  pub fn force_all(&mut self) {
    Reporter::new(&mut self.tree, &self.recycler, &self.config).force_all();
  }

  #[must_use]
  pub fn new(recycler: R) -> Self {
    Self::with_config(recycler, TracerConfig::default())
  }

  /// Remove the top shadow frame. Underflow traps in debug builds.
  pub fn pop(&mut self) {
    self.stack.pop();
  }

  /// Append a shadow frame for the function the interpreter just entered.
  pub fn push(&mut self, function: F) {
    self.stack.push(function);
  }

  /// Attribute one allocation to the current program point.
  ///
  /// Host-driven allocations (empty shadow stack) and objects the
  /// recycler cannot track are dropped. When no user frame exists the
  /// allocation is attributed to the top internal frame; such paths are
  /// counted but suppressed from emission.
  pub fn record(&mut self, obj: &R::Object) {
    if !self.enabled {
      return;
    }

    if self.stack.is_empty() {
      log::trace!("dropping host-driven allocation with no frames");
      return;
    }

    if !self.recycler.is_alloc_trackable(obj) {
      log::trace!("dropping untrackable allocation");
      return;
    }

    let Some(frame) = self
      .stack
      .top_user_frame()
      .or_else(|| self.stack.top_frame())
    else {
      return;
    };

    let stats = self.tree.extend_for(std::slice::from_ref(&frame));
    stats.add(obj.object_id(), self.recycler.downgrade(obj));
  }

  /// Push a frame that pops itself when the returned guard leaves scope,
  /// whether by normal return or unwind.
  pub fn scoped_frame(&mut self, function: F) -> ScopedFrame<'_, F, R> {
    self.push(function);
    ScopedFrame { tracer: self }
  }

  /// Number of distinct root sites observed so far.
  #[must_use]
  pub fn site_count(&self) -> usize {
    self.tree.root_count()
  }

  /// Flatten every allocation site into a mergeable summary, ordered by
  /// live size, largest first. Forces lazy data and runs a collection so
  /// the live numbers are current.
  pub fn summary(&mut self) -> Summary {
    Reporter::new(&mut self.tree, &self.recycler, &self.config).force_all();
    self.recycler.collect_exhaustive();

    let mut records = Vec::new();
    for root in self.tree.roots_mut() {
      Self::collect_site_records(root, &mut records);
    }

    records.sort_by(|a, b| b.live_size.cmp(&a.live_size));

    Summary::new(records)
  }

  /// Set the top shadow frame's bytecode offset.
  pub fn update_offset(&mut self, bytecode_offset: u32) {
    self.stack.update_offset(bytecode_offset);
  }

  #[must_use]
  pub fn with_config(recycler: R, config: TracerConfig) -> Self {
    let enabled = config.start_enabled;

    Self {
      config,
      enabled,
      recycler,
      stack: ShadowCallStack::new(),
      tree: PathTree::new(),
    }
  }

  /// Write the untrimmed detailed report through a host-provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if the underlying writer fails.
  pub fn write_report<D: AllocDataWriter + ?Sized>(
    &mut self,
    writer: &mut D,
  ) -> Result<(), EmitError> {
    Reporter::new(&mut self.tree, &self.recycler, &self.config)
      .write_detailed(writer)
  }
}

/// Frame guard tied to one interpreter-level call. Dropping it pops the
/// frame, so thrown errors and abrupt returns cannot leak shadow frames.
pub struct ScopedFrame<'a, F: FunctionRef, R: Recycler> {
  tracer: &'a mut AllocTracer<F, R>,
}

impl<F: FunctionRef, R: Recycler> Deref for ScopedFrame<'_, F, R> {
  type Target = AllocTracer<F, R>;

  fn deref(&self) -> &Self::Target {
    self.tracer
  }
}

impl<F: FunctionRef, R: Recycler> DerefMut for ScopedFrame<'_, F, R> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.tracer
  }
}

impl<F: FunctionRef, R: Recycler> Drop for ScopedFrame<'_, F, R> {
  fn drop(&mut self) {
    self.tracer.pop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::file_map::serialize_emission;
  use crate::rc_host::{RcFunction, RcHeap, RcObject};

  fn emit_to_string(tracer: &mut AllocTracer<RcFunction, RcHeap>) -> String {
    let mut writer = TextFormatWriter::new(Vec::new());
    tracer
      .emit_trimmed_into(&mut writer)
      .expect("emission failed");
    String::from_utf8(writer.into_inner()).expect("non-utf8 report")
  }

  fn parse(report: &str) -> serde_json::Value {
    serde_json::from_str(report).expect("report is invalid json")
  }

  #[test]
  fn single_site_report() {
    let _serial = serialize_emission();

    let heap = RcHeap::new();
    let mut tracer = AllocTracer::new(heap.clone());
    let user = RcFunction::new(
      "makeWidget",
      Some("/app/file.js"),
      Some("new Widget();\n"),
    );

    let mut keep = Vec::new();
    let mut frame = tracer.scoped_frame(user);
    for _ in 0..100 {
      let obj = heap.alloc_primitive();
      frame.record(&obj);
      keep.push(obj);
    }
    drop(frame);

    let report = parse(&emit_to_string(&mut tracer));

    let allocations = report["allocations"]
      .as_array()
      .expect("missing allocations");
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0]["allocInfo"]["count"], 100);
    assert_eq!(
      allocations[0]["objectIds"]
        .as_array()
        .expect("missing objectIds")
        .len(),
      100
    );
    assert_eq!(allocations[0]["src"]["function"], "makeWidget");
    assert_eq!(allocations[0]["src"]["fileId"], 1);

    let files = report["fileToSourceMap"]
      .as_array()
      .expect("missing file map");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["filename"], "/app/file.js");
  }

  #[test]
  fn thresholds_suppress_minor_sites() {
    let _serial = serialize_emission();

    let heap = RcHeap::new();
    let mut tracer = AllocTracer::<RcFunction, RcHeap>::builder()
      .count_threshold_fraction(0.05)
      .size_threshold_fraction(0.05)
      .finish(heap.clone());

    let site_a = RcFunction::new("hot", Some("/app/hot.js"), Some("a();\n"));
    let site_b = RcFunction::new("cold", Some("/app/cold.js"), Some("b();\n"));

    let mut keep = Vec::new();
    let mut frame = tracer.scoped_frame(site_a);
    for _ in 0..50 {
      let obj = heap.alloc_primitive();
      frame.record(&obj);
      keep.push(obj);
    }
    drop(frame);

    let mut frame = tracer.scoped_frame(site_b);
    let lone = heap.alloc_primitive();
    frame.record(&lone);
    keep.push(lone);
    drop(frame);

    let report = parse(&emit_to_string(&mut tracer));
    let allocations = report["allocations"]
      .as_array()
      .expect("missing allocations");
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0]["src"]["function"], "hot");
  }

  #[test]
  fn weak_sets_follow_collection() {
    let _serial = serialize_emission();

    let heap = RcHeap::new();
    let mut tracer: AllocTracer<RcFunction, RcHeap> = AllocTracer::new(heap.clone());
    let site = RcFunction::new("cache", Some("/app/cache.js"), Some("x;\n"));

    let mut objs = Vec::new();
    let mut frame = tracer.scoped_frame(site);
    for _ in 0..10 {
      let obj = heap.alloc_primitive();
      frame.record(&obj);
      objs.push(obj);
    }
    drop(frame);

    for obj in objs.drain(..7) {
      heap.release(&obj);
    }

    let report = parse(&emit_to_string(&mut tracer));
    let record = &report["allocations"][0];
    assert_eq!(record["allocInfo"]["count"], 3);
    assert_eq!(
      record["objectIds"].as_array().expect("missing ids").len(),
      3
    );

    // The monotonic allocation count is untouched by collection.
    let summary = tracer.summary();
    assert_eq!(summary.records()[0].alloc_count, 10);
    assert_eq!(summary.records()[0].live_count, 3);
  }

  #[test]
  fn internal_sites_are_counted_but_suppressed() {
    let _serial = serialize_emission();

    let heap = RcHeap::new();
    let mut tracer: AllocTracer<RcFunction, RcHeap> = AllocTracer::new(heap.clone());
    let internal = RcFunction::new("bootstrap", None, None);

    let obj = heap.alloc_primitive();
    let mut frame = tracer.scoped_frame(internal);
    frame.record(&obj);
    drop(frame);

    let report = parse(&emit_to_string(&mut tracer));
    assert_eq!(
      report["allocations"]
        .as_array()
        .expect("missing allocations")
        .len(),
      0
    );

    let summary = tracer.summary();
    assert_eq!(summary.records().len(), 1);
    assert_eq!(summary.records()[0].alloc_count, 1);
    assert_eq!(summary.records()[0].file, None);
  }

  #[test]
  fn empty_stack_drops_host_allocations() {
    let heap = RcHeap::new();
    let mut tracer = AllocTracer::<RcFunction, RcHeap>::new(heap.clone());

    let obj = heap.alloc_primitive();
    tracer.record(&obj);

    assert_eq!(tracer.site_count(), 0);
  }

  #[test]
  fn untrackable_objects_are_dropped() {
    let heap = RcHeap::new();
    let mut tracer = AllocTracer::new(heap.clone());
    let site = RcFunction::new("site", Some("/app/site.js"), Some("x;\n"));

    let obj = heap.alloc_untrackable();
    let mut frame = tracer.scoped_frame(site);
    frame.record(&obj);
    drop(frame);

    assert_eq!(tracer.site_count(), 0);
  }

  #[test]
  fn disabled_tracer_drops_allocations() {
    let heap = RcHeap::new();
    let mut tracer = AllocTracer::<RcFunction, RcHeap>::builder()
      .start_enabled(false)
      .finish(heap.clone());
    let site = RcFunction::new("site", Some("/app/site.js"), Some("x;\n"));

    let obj = heap.alloc_primitive();
    let mut frame = tracer.scoped_frame(site.clone());
    frame.record(&obj);
    drop(frame);
    assert_eq!(tracer.site_count(), 0);

    tracer.enable();
    let mut frame = tracer.scoped_frame(site);
    frame.record(&obj);
    drop(frame);
    assert_eq!(tracer.site_count(), 1);
  }

  #[test]
  fn attribution_follows_the_top_user_frame() {
    let heap = RcHeap::new();
    let mut tracer = AllocTracer::new(heap.clone());

    let source = "first();\nsecond();\n";
    let user = RcFunction::with_statements(
      "run",
      Some("/app/run.js"),
      Some(source),
      &[(0, 0), (10, 9)],
    );
    let shim = RcFunction::new("shim", None, None);

    let obj = heap.alloc_primitive();
    let mut outer = tracer.scoped_frame(user);
    outer.update_offset(10);
    // The allocation surfaces through an internal helper frame; it still
    // lands on the user statement below it.
    let mut inner = outer.scoped_frame(shim);
    inner.record(&obj);
    drop(inner);
    drop(outer);

    let summary = tracer.summary();
    assert_eq!(summary.records().len(), 1);
    assert_eq!(summary.records()[0].function, "run");
    assert_eq!(summary.records()[0].line, 2);
  }

  #[test]
  fn unwinds_restore_stack_depth() {
    let heap = RcHeap::new();
    let mut tracer = AllocTracer::new(heap.clone());
    let fn_a = RcFunction::new("a", Some("/app/a.js"), Some("b();\n"));
    let fn_b = RcFunction::new("b", Some("/app/b.js"), Some("throw;\n"));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let mut outer = tracer.scoped_frame(fn_a.clone());
      let mut inner = outer.scoped_frame(fn_b.clone());
      inner.update_offset(3);
      panic!("thrown error propagates");
    }));

    assert!(result.is_err());
    assert_eq!(tracer.depth(), 0);
  }

  #[test]
  fn accepted_allocations_match_summary_totals() {
    let heap = RcHeap::new();
    let mut tracer = AllocTracer::new(heap.clone());
    let site_a = RcFunction::new("a", Some("/app/a.js"), Some("x;\n"));
    let site_b = RcFunction::new("b", Some("/app/b.js"), Some("y;\n"));

    let mut accepted = 0u64;
    let mut keep = Vec::new();

    // Interleave accepted, untrackable, and host-driven allocations.
    for round in 0..12 {
      let site = if round % 2 == 0 { &site_a } else { &site_b };
      let mut frame = tracer.scoped_frame(site.clone());

      let obj = heap.alloc_primitive();
      frame.record(&obj);
      accepted += 1;
      keep.push(obj);

      let untrackable = heap.alloc_untrackable();
      frame.record(&untrackable);
      drop(frame);

      let host_driven = heap.alloc_primitive();
      tracer.record(&host_driven);
    }

    let summary = tracer.summary();
    let total: u64 = summary
      .records()
      .iter()
      .map(|record| record.alloc_count)
      .sum();
    assert_eq!(total, accepted);
  }

  #[test]
  fn emit_trimmed_writes_the_named_resource() {
    let _serial = serialize_emission();

    let heap = RcHeap::new();
    let mut tracer = AllocTracer::new(heap.clone());
    let site = RcFunction::new("grow", Some("/app/grow.js"), Some("x;\n"));

    let obj = heap.alloc_primitive();
    let mut frame = tracer.scoped_frame(site);
    frame.record(&obj);
    drop(frame);

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let io_info = crate::export::DirDataIo::new(dir.path());
    tracer.emit_trimmed(42, &io_info).expect("emission failed");

    let written =
      std::fs::read_to_string(dir.path().join("allocTracing_42.json"))
        .expect("missing trace resource");
    let report = parse(&written);
    assert_eq!(report["allocations"][0]["allocInfo"]["count"], 1);
  }

  #[test]
  fn repeated_emission_is_byte_identical() {
    let _serial = serialize_emission();

    let heap = RcHeap::new();
    let mut tracer = AllocTracer::new(heap.clone());

    let mut keep: Vec<RcObject> = Vec::new();
    for index in 0..4 {
      let site = RcFunction::new(
        &format!("site_{index}"),
        Some(format!("/app/site_{index}.js").as_str()),
        Some("alloc();\n"),
      );
      let mut frame = tracer.scoped_frame(site);
      for _ in 0..=index {
        let obj = heap.alloc_composite(index);
        frame.record(&obj);
        keep.push(obj);
      }
      drop(frame);
    }

    let first = emit_to_string(&mut tracer);
    let second = emit_to_string(&mut tracer);
    assert_eq!(first, second);
  }
}
