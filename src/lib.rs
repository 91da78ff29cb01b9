//! Allocation-site profiler core for a managed-object runtime.
//!
//! The host interpreter mirrors its call stack into an [`AllocTracer`],
//! reports every trackable allocation, and periodically asks for a
//! trimmed, JSON-shaped report of the sites holding a meaningful share of
//! live memory. The tracer observes objects through weak references only
//! and cooperates with the host's garbage collector to learn which of
//! them survived.

mod config;
mod export;
mod file_map;
mod host;
mod location;
mod path_tree;
mod rc_host;
mod report;
mod shadow_stack;
mod site_stats;
mod summary;
mod tracer;
mod writer;

use {
  memmap2::MmapMut,
  serde::{Serialize, Serializer, ser::SerializeStruct},
  std::{
    fmt::{self, Display, Formatter},
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
  },
};

pub use {
  config::{
    INTERESTING_COUNT_FRACTION, INTERESTING_SIZE_FRACTION, TracerConfig,
  },
  export::{
    DirDataIo, EmitError, MmapStreamSink, TraceDataIo, trace_resource_name,
  },
  file_map::{clear_source_entries, intern_file, write_file_map},
  host::{
    DYNAMIC_ENTRY_SIZE, DYNAMIC_SIZE_DEFAULT, FunctionRef, ObjectId, Recycler,
    STATIC_SIZE_DEFAULT, STRING_CHAR_UNIT_SIZE, SourceEncoding, SourceText,
    TrackedObject, WarningFlags, WeakObject,
  },
  location::{
    FrameKey, INTERNAL_CODE_NAME, SourceLocation, interior_key,
    is_internal_url, terminal_key,
  },
  path_tree::{ChildMap, PathNode, PathNodeKind, PathTree},
  rc_host::{RcFunction, RcHeap, RcObject, RcWeak},
  report::Reporter,
  shadow_stack::{ShadowCallFrame, ShadowCallStack},
  site_stats::{SiteEstimate, SiteStats},
  summary::{SiteRecord, Summary, SummaryDelta},
  tracer::{AllocTracer, ScopedFrame, TracerBuilder},
  writer::{AllocDataWriter, Key, Separator, TextFormatWriter},
};
