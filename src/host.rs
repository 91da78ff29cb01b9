//! Interfaces the profiler consumes from the hosting runtime.
//!
//! The core contains no runtime of its own: the interpreter injects a
//! function handle type, a trackable-object type, and a recycler handle
//! through these traits. All of them are expected to be cheap-to-clone
//! references into host-owned storage.

use std::ops::{BitOr, BitOrAssign};

/// Flat per-object cost assumed for primitive (static-type) objects.
pub const STATIC_SIZE_DEFAULT: usize = 8;

/// Base overhead assumed for composite (dynamic-type) objects.
pub const DYNAMIC_SIZE_DEFAULT: usize = 32;

/// Cost of one property slot reference in a composite object.
pub const DYNAMIC_ENTRY_SIZE: usize = std::mem::size_of::<*const ()>();

/// Size of one string code unit (UTF-16 storage in the host runtime).
pub const STRING_CHAR_UNIT_SIZE: usize = 2;

/// Opaque, session-stable identity of one managed object.
pub type ObjectId = u64;

/// Encoding of the raw source bytes a function carries.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SourceEncoding {
  Cesu8,
  Utf8,
}

/// Borrowed view of a function's source text, decoded lazily at interning.
#[derive(Debug, Clone, Copy)]
pub struct SourceText<'a> {
  pub bytes: &'a [u8],
  pub encoding: SourceEncoding,
}

/// Memory-shape warnings a host may raise while sizing an object.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WarningFlags {
  bits: u8,
}

impl WarningFlags {
  pub const LOW_DATA_CONTENT_ARRAY_OBJECT: WarningFlags =
    WarningFlags { bits: 1 << 1 };
  pub const LOW_DATA_CONTENT_CONTAINER_OBJECT: WarningFlags =
    WarningFlags { bits: 1 << 3 };
  pub const LOW_DATA_CONTENT_OBJECT: WarningFlags =
    WarningFlags { bits: 1 << 0 };
  pub const NONE: WarningFlags = WarningFlags { bits: 0 };
  pub const SPARSE_ARRAY_OBJECT: WarningFlags = WarningFlags { bits: 1 << 2 };

  #[must_use]
  pub fn contains(self, other: WarningFlags) -> bool {
    self.bits & other.bits == other.bits
  }

  #[must_use]
  pub fn is_empty(self) -> bool {
    self.bits == 0
  }

  /// Names of the raised flags, in a fixed order.
  pub fn names(self) -> impl Iterator<Item = &'static str> {
    const LABELS: [(WarningFlags, &str); 4] = [
      (WarningFlags::LOW_DATA_CONTENT_OBJECT, "LowDataContentObject"),
      (
        WarningFlags::LOW_DATA_CONTENT_ARRAY_OBJECT,
        "LowDataContentArrayObject",
      ),
      (WarningFlags::SPARSE_ARRAY_OBJECT, "SparseArrayObject"),
      (
        WarningFlags::LOW_DATA_CONTENT_CONTAINER_OBJECT,
        "LowDataContentContainerObject",
      ),
    ];

    LABELS
      .into_iter()
      .filter(move |(flag, _)| self.contains(*flag))
      .map(|(_, name)| name)
  }
}

impl BitOr for WarningFlags {
  type Output = WarningFlags;

  fn bitor(self, rhs: WarningFlags) -> WarningFlags {
    WarningFlags {
      bits: self.bits | rhs.bits,
    }
  }
}

impl BitOrAssign for WarningFlags {
  fn bitor_assign(&mut self, rhs: WarningFlags) {
    self.bits |= rhs.bits;
  }
}

/// Handle to a managed object the garbage collector can track weakly.
pub trait TrackedObject {
  /// Size contribution of the object body. Hosts fold the size-policy
  /// constants above into this and may raise warning flags.
  fn compute_alloc_info(&self, flags: &mut WarningFlags) -> usize;

  /// Additional per-property cost; only consulted for composite objects.
  fn compute_prop_alloc_info(&self, _flags: &mut WarningFlags) -> usize {
    0
  }

  /// Coerce any deferred representation (rope strings and the like) into
  /// its final in-memory form so the size estimate is accurate.
  fn force_materialize(&self) {}

  fn is_composite(&self) -> bool;

  fn object_id(&self) -> ObjectId;
}

/// Weak handle to a tracked object; dead once the collector reclaims it.
pub trait WeakObject: Clone {
  type Strong: TrackedObject;

  fn upgrade(&self) -> Option<Self::Strong>;
}

/// The host's collector-facing surface.
pub trait Recycler {
  type Object: TrackedObject;
  type Weak: WeakObject<Strong = Self::Object>;

  /// Run a full collection pass, blocking until every dead weak reference
  /// has been expunged.
  fn collect_exhaustive(&self);

  fn downgrade(&self, obj: &Self::Object) -> Self::Weak;

  fn is_alloc_trackable(&self, obj: &Self::Object) -> bool;
}

/// Handle to an executing function body, resolvable to source positions.
pub trait FunctionRef: Clone {
  fn display_name(&self) -> &str;

  /// Index of the statement enclosing the given bytecode offset.
  fn enclosing_statement_index(&self, bytecode_offset: u32) -> u32;

  /// Session-stable identity used to key attribution.
  fn identity(&self) -> u64;

  /// Resolve a character offset to a zero-based `(line, column)`.
  fn line_char_offset(&self, char_offset: u32) -> (u32, u32);

  fn source_text(&self) -> Option<SourceText<'_>>;

  fn source_url(&self) -> Option<&str>;

  /// Character offset at which the given statement starts.
  fn statement_start_offset(&self, statement_index: u32) -> u32;
}
