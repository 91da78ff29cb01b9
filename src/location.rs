//! Source-location identity for call sites and allocation sites.

use std::io;

use crate::file_map;
use crate::host::FunctionRef;
use crate::shadow_stack::ShadowCallFrame;
use crate::writer::{AllocDataWriter, Key, Separator};

/// File name stand-in for locations with no user-visible source.
pub const INTERNAL_CODE_NAME: &str = "#internalcode#";

/// Deterministic key coalescing repeat visits to one `(function, line,
/// column)` site within a child map.
pub type FrameKey = u64;

const LOCATION_MIX: u64 = 0x9e37_79b9_7f4a_7c15;
const TERMINAL_TAG: u64 = 0x517c_c1b7_2722_0a95;

/// Key for a call-site (interior) node.
#[must_use]
pub fn interior_key(identity: u64, line: u32, column: u32) -> FrameKey {
  let packed = (u64::from(line) << 32) | u64::from(column);
  identity ^ packed.wrapping_mul(LOCATION_MIX)
}

/// Key for an allocation-site (leaf) node. Tagged so one location can act
/// as both call site and allocation site among siblings.
#[must_use]
pub fn terminal_key(identity: u64, line: u32, column: u32) -> FrameKey {
  interior_key(identity, line, column) ^ TERMINAL_TAG
}

/// A frame is internal when its function has no source url or the url is
/// not shaped like an absolute file path.
#[must_use]
pub fn is_internal_url(url: Option<&str>) -> bool {
  let Some(url) = url else {
    return true;
  };

  let bytes = url.as_bytes();
  if bytes.len() <= 1 {
    return true;
  }

  #[cfg(windows)]
  {
    bytes[0] != b'\\' && bytes[1] != b':'
  }
  #[cfg(not(windows))]
  {
    bytes[0] != b'/' && bytes[1] != b':'
  }
}

/// Resolve a shadow frame's bytecode offset to a zero-based line/column
/// through the host's statement tables.
pub(crate) fn resolve_line_column<F: FunctionRef>(
  frame: &ShadowCallFrame<F>,
) -> (u32, u32) {
  if frame.function.source_url().is_none() {
    return (0, 0);
  }

  let statement = frame
    .function
    .enclosing_statement_index(frame.bytecode_offset);
  let start_offset = frame.function.statement_start_offset(statement);

  frame.function.line_char_offset(start_offset)
}

/// Immutable program-point identity: a function plus a zero-based line and
/// column. Lines are one-based on output.
pub struct SourceLocation<F: FunctionRef> {
  column: u32,
  function: F,
  line: u32,
}

impl<F: FunctionRef> SourceLocation<F> {
  #[must_use]
  pub fn column(&self) -> u32 {
    self.column
  }

  #[must_use]
  pub fn from_frame(frame: &ShadowCallFrame<F>) -> Self {
    let (line, column) = resolve_line_column(frame);
    Self::new(frame.function.clone(), line, column)
  }

  #[must_use]
  pub fn function(&self) -> &F {
    &self.function
  }

  #[must_use]
  pub fn is_internal(&self) -> bool {
    is_internal_url(self.function.source_url())
  }

  #[must_use]
  pub fn line(&self) -> u32 {
    self.line
  }

  /// Component-wise equality against another program point.
  #[must_use]
  pub fn matches(&self, function: &F, line: u32, column: u32) -> bool {
    if self.line != line || self.column != column {
      return false;
    }

    self.function.source_url() == function.source_url()
  }

  #[must_use]
  pub fn new(function: F, line: u32, column: u32) -> Self {
    Self {
      column,
      function,
      line,
    }
  }

  /// Emit the detailed-report form: file (or the internal sentinel), a
  /// one-based line, and the column.
  ///
  /// # Errors
  ///
  /// Returns an error if the underlying writer fails.
  pub fn write_detailed<D: AllocDataWriter + ?Sized>(
    &self,
    writer: &mut D,
  ) -> io::Result<()> {
    writer.write_record_start_with_key(Key::Src, Separator::BigSpace)?;

    let file = self.function.source_url().unwrap_or(INTERNAL_CODE_NAME);
    writer.write_string(Key::File, file, Separator::None)?;
    writer.write_int(Key::Line, i64::from(self.line) + 1, Separator::Comma)?;
    writer.write_int(Key::Column, i64::from(self.column), Separator::Comma)?;

    writer.write_record_end()
  }

  /// Emit the trimmed-report form: function name, one-based line, column,
  /// and the interned file id. When the url or source text is unavailable
  /// the record carries no file id.
  ///
  /// # Errors
  ///
  /// Returns an error if the underlying writer fails.
  pub fn write_trimmed<D: AllocDataWriter + ?Sized>(
    &self,
    writer: &mut D,
  ) -> io::Result<()> {
    writer.write_record_start_with_key(Key::Src, Separator::BigSpace)?;

    writer.write_string(
      Key::Function,
      self.function.display_name(),
      Separator::None,
    )?;
    writer.write_int(Key::Line, i64::from(self.line) + 1, Separator::Comma)?;
    writer.write_int(Key::Column, i64::from(self.column), Separator::Comma)?;

    if let Some(url) = self.function.source_url() {
      if let Some(source) = self.function.source_text() {
        let file_id = file_map::intern_file(url, &source);
        writer.write_uint(Key::FileId, u64::from(file_id), Separator::Comma)?;
      }
    }

    writer.write_record_end()
  }
}
