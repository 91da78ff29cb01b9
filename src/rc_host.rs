//! Reference host backed by `Rc` handles.
//!
//! A stand-in for a real managed runtime, small enough to read in one
//! sitting: functions carry statement tables over plain source strings,
//! objects live as `Rc` allocations rooted by the heap, and an exhaustive
//! collection drops the roots of released objects so their weak handles
//! die. The demo binary and the test suite both drive the tracer through
//! this host.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::host::{
  DYNAMIC_ENTRY_SIZE, DYNAMIC_SIZE_DEFAULT, FunctionRef, ObjectId, Recycler,
  STATIC_SIZE_DEFAULT, STRING_CHAR_UNIT_SIZE, SourceEncoding, SourceText,
  TrackedObject, WarningFlags, WeakObject,
};

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

struct StatementSpan {
  first_bytecode_offset: u32,
  start_char_offset: u32,
}

struct FunctionData {
  display_name: String,
  identity: u64,
  source: Option<String>,
  statements: Vec<StatementSpan>,
  url: Option<String>,
}

/// Cheap handle to a function body.
#[derive(Clone)]
pub struct RcFunction {
  data: Rc<FunctionData>,
}

impl RcFunction {
  /// A function with a single statement starting at offset zero.
  #[must_use]
  pub fn new(
    display_name: &str,
    url: Option<&str>,
    source: Option<&str>,
  ) -> Self {
    Self::with_statements(display_name, url, source, &[(0, 0)])
  }

  /// A function with an explicit statement table. Each span pairs the
  /// statement's first bytecode offset with its starting character offset
  /// in the source.
  #[must_use]
  pub fn with_statements(
    display_name: &str,
    url: Option<&str>,
    source: Option<&str>,
    spans: &[(u32, u32)],
  ) -> Self {
    let statements = spans
      .iter()
      .map(|&(first_bytecode_offset, start_char_offset)| StatementSpan {
        first_bytecode_offset,
        start_char_offset,
      })
      .collect();

    Self {
      data: Rc::new(FunctionData {
        display_name: display_name.to_string(),
        identity: NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed),
        source: source.map(str::to_string),
        statements,
        url: url.map(str::to_string),
      }),
    }
  }
}

impl FunctionRef for RcFunction {
  fn display_name(&self) -> &str {
    &self.data.display_name
  }

  fn enclosing_statement_index(&self, bytecode_offset: u32) -> u32 {
    self
      .data
      .statements
      .iter()
      .rposition(|span| span.first_bytecode_offset <= bytecode_offset)
      .unwrap_or(0) as u32
  }

  fn identity(&self) -> u64 {
    self.data.identity
  }

  fn line_char_offset(&self, char_offset: u32) -> (u32, u32) {
    let Some(source) = &self.data.source else {
      return (0, 0);
    };

    let mut line = 0;
    let mut column = 0;
    for (index, ch) in source.chars().enumerate() {
      if index as u32 >= char_offset {
        break;
      }

      if ch == '\n' {
        line += 1;
        column = 0;
      } else {
        column += 1;
      }
    }

    (line, column)
  }

  fn source_text(&self) -> Option<SourceText<'_>> {
    self.data.source.as_ref().map(|source| SourceText {
      bytes: source.as_bytes(),
      encoding: SourceEncoding::Utf8,
    })
  }

  fn source_url(&self) -> Option<&str> {
    self.data.url.as_deref()
  }

  fn statement_start_offset(&self, statement_index: u32) -> u32 {
    self
      .data
      .statements
      .get(statement_index as usize)
      .map_or(0, |span| span.start_char_offset)
  }
}

enum StringRepr {
  Deferred(Vec<String>),
  Flat(String),
}

enum ObjectKind {
  Composite { property_count: usize },
  Primitive,
  Str { repr: RefCell<StringRepr> },
}

struct ObjectData {
  id: ObjectId,
  kind: ObjectKind,
  trackable: bool,
  warnings: WarningFlags,
}

/// Strong handle to a heap object.
#[derive(Clone)]
pub struct RcObject {
  data: Rc<ObjectData>,
}

impl TrackedObject for RcObject {
  fn compute_alloc_info(&self, flags: &mut WarningFlags) -> usize {
    *flags |= self.data.warnings;

    match &self.data.kind {
      ObjectKind::Primitive => STATIC_SIZE_DEFAULT,
      ObjectKind::Str { repr } => {
        // A deferred rope has no measurable flat storage yet.
        let chars = match &*repr.borrow() {
          StringRepr::Deferred(_) => 0,
          StringRepr::Flat(text) => text.chars().count(),
        };

        STATIC_SIZE_DEFAULT + chars * STRING_CHAR_UNIT_SIZE
      }
      ObjectKind::Composite { .. } => DYNAMIC_SIZE_DEFAULT,
    }
  }

  fn compute_prop_alloc_info(&self, _flags: &mut WarningFlags) -> usize {
    match &self.data.kind {
      ObjectKind::Composite { property_count } => {
        property_count * DYNAMIC_ENTRY_SIZE
      }
      _ => 0,
    }
  }

  fn force_materialize(&self) {
    if let ObjectKind::Str { repr } = &self.data.kind {
      let mut repr = repr.borrow_mut();
      if let StringRepr::Deferred(parts) = &*repr {
        *repr = StringRepr::Flat(parts.concat());
      }
    }
  }

  fn is_composite(&self) -> bool {
    matches!(self.data.kind, ObjectKind::Composite { .. })
  }

  fn object_id(&self) -> ObjectId {
    self.data.id
  }
}

/// Weak handle; dead once the heap's collection drops the last root.
#[derive(Clone)]
pub struct RcWeak {
  data: Weak<ObjectData>,
}

impl WeakObject for RcWeak {
  type Strong = RcObject;

  fn upgrade(&self) -> Option<RcObject> {
    self.data.upgrade().map(|data| RcObject { data })
  }
}

struct HeapState {
  next_id: ObjectId,
  pending_release: Vec<RcObject>,
  roots: Vec<RcObject>,
}

/// The reference heap. Released objects stay reachable until the next
/// exhaustive collection, mirroring how a tracing collector defers
/// reclamation.
#[derive(Clone)]
pub struct RcHeap {
  state: Rc<RefCell<HeapState>>,
}

impl Default for RcHeap {
  fn default() -> Self {
    Self::new()
  }
}

impl RcHeap {
  fn alloc(
    &self,
    kind: ObjectKind,
    trackable: bool,
    warnings: WarningFlags,
  ) -> RcObject {
    let mut state = self.state.borrow_mut();
    let id = state.next_id;
    state.next_id += 1;

    let obj = RcObject {
      data: Rc::new(ObjectData {
        id,
        kind,
        trackable,
        warnings,
      }),
    };
    state.roots.push(obj.clone());

    obj
  }

  #[must_use]
  pub fn alloc_composite(&self, property_count: usize) -> RcObject {
    self.alloc(
      ObjectKind::Composite { property_count },
      true,
      WarningFlags::NONE,
    )
  }

  #[must_use]
  pub fn alloc_flagged_composite(
    &self,
    property_count: usize,
    warnings: WarningFlags,
  ) -> RcObject {
    self.alloc(ObjectKind::Composite { property_count }, true, warnings)
  }

  #[must_use]
  pub fn alloc_primitive(&self) -> RcObject {
    self.alloc(ObjectKind::Primitive, true, WarningFlags::NONE)
  }

  /// A string in its deferred (rope) representation.
  #[must_use]
  pub fn alloc_string(&self, parts: &[&str]) -> RcObject {
    let parts = parts.iter().map(|part| (*part).to_string()).collect();
    self.alloc(
      ObjectKind::Str {
        repr: RefCell::new(StringRepr::Deferred(parts)),
      },
      true,
      WarningFlags::NONE,
    )
  }

  #[must_use]
  pub fn alloc_untrackable(&self) -> RcObject {
    self.alloc(ObjectKind::Primitive, false, WarningFlags::NONE)
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      state: Rc::new(RefCell::new(HeapState {
        next_id: 1,
        pending_release: Vec::new(),
        roots: Vec::new(),
      })),
    }
  }

  /// Drop the root keeping this object alive. The object is reclaimed at
  /// the next exhaustive collection, not immediately.
  pub fn release(&self, obj: &RcObject) {
    let mut state = self.state.borrow_mut();

    if let Some(index) = state
      .roots
      .iter()
      .position(|root| Rc::ptr_eq(&root.data, &obj.data))
    {
      let root = state.roots.swap_remove(index);
      state.pending_release.push(root);
    }
  }
}

impl Recycler for RcHeap {
  type Object = RcObject;
  type Weak = RcWeak;

  fn collect_exhaustive(&self) {
    self.state.borrow_mut().pending_release.clear();
  }

  fn downgrade(&self, obj: &RcObject) -> RcWeak {
    RcWeak {
      data: Rc::downgrade(&obj.data),
    }
  }

  fn is_alloc_trackable(&self, obj: &RcObject) -> bool {
    obj.data.trackable
  }
}
