//! Report writer contract and its text implementation.
//!
//! The reporter never formats bytes itself: it drives an
//! `AllocDataWriter`, which owns buffering and flushing. The concrete
//! `TextFormatWriter` renders the JSON-shaped trace format with quoted
//! keys, escaped strings, and newline-plus-indent "big space" separators.

use std::io::{self, Write};

use crate::host::ObjectId;

/// Token spacing written before the next token.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Separator {
  /// Newline plus the current indent.
  BigSpace,
  Comma,
  /// Comma, then newline plus the current indent.
  CommaBigSpace,
  None,
}

/// Well-known record keys of the trace format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Key {
  AllocInfo,
  AllocationCount,
  Allocations,
  CallPaths,
  Column,
  Count,
  EstimatedSize,
  File,
  FileId,
  FileToSourceMap,
  Filename,
  Flags,
  Function,
  Line,
  LiveCount,
  LiveSize,
  ObjectIds,
  Site,
  Source,
  Src,
  SubPaths,
}

impl Key {
  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      Key::AllocInfo => "allocInfo",
      Key::AllocationCount => "allocationCount",
      Key::Allocations => "allocations",
      Key::CallPaths => "callPaths",
      Key::Column => "column",
      Key::Count => "count",
      Key::EstimatedSize => "estimatedSize",
      Key::File => "file",
      Key::FileId => "fileId",
      Key::FileToSourceMap => "fileToSourceMap",
      Key::Filename => "filename",
      Key::Flags => "flags",
      Key::Function => "function",
      Key::Line => "line",
      Key::LiveCount => "liveCount",
      Key::LiveSize => "liveSize",
      Key::ObjectIds => "objectIds",
      Key::Site => "site",
      Key::Source => "source",
      Key::Src => "src",
      Key::SubPaths => "subPaths",
    }
  }
}

/// Contract between the reporter and the byte sink.
pub trait AllocDataWriter {
  fn adjust_indent(&mut self, delta: i32);

  /// # Errors
  ///
  /// Returns an error if the sink fails to accept or persist bytes.
  fn flush(&mut self) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_int(
    &mut self,
    key: Key,
    value: i64,
    separator: Separator,
  ) -> io::Result<()>;

  /// Writes an object identity as the opaque string form `"*<id>"`.
  ///
  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_naked_object_id(
    &mut self,
    id: ObjectId,
    separator: Separator,
  ) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_naked_string(
    &mut self,
    value: &str,
    separator: Separator,
  ) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_record_end(&mut self) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_record_start(&mut self, separator: Separator) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_record_start_with_key(
    &mut self,
    key: Key,
    separator: Separator,
  ) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_separator(&mut self, separator: Separator) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_sequence_end(&mut self) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_sequence_start(&mut self, separator: Separator) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_sequence_start_with_key(
    &mut self,
    key: Key,
    separator: Separator,
  ) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_string(
    &mut self,
    key: Key,
    value: &str,
    separator: Separator,
  ) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns an error if the sink rejects the write.
  fn write_uint(
    &mut self,
    key: Key,
    value: u64,
    separator: Separator,
  ) -> io::Result<()>;
}

/// Text renderer over any synchronous byte sink.
pub struct TextFormatWriter<W: Write> {
  indent: u32,
  inner: W,
}

impl<W: Write> TextFormatWriter<W> {
  fn emit_separator(&mut self, separator: Separator) -> io::Result<()> {
    match separator {
      Separator::None => Ok(()),
      Separator::Comma => self.inner.write_all(b", "),
      Separator::BigSpace => {
        self.inner.write_all(b"\n")?;
        self.write_indent()
      }
      Separator::CommaBigSpace => {
        self.inner.write_all(b",\n")?;
        self.write_indent()
      }
    }
  }

  pub fn into_inner(self) -> W {
    self.inner
  }

  #[must_use]
  pub fn new(inner: W) -> Self {
    Self { indent: 0, inner }
  }

  fn write_escaped(&mut self, value: &str) -> io::Result<()> {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('"');
    for ch in value.chars() {
      match ch {
        '"' => escaped.push_str("\\\""),
        '\\' => escaped.push_str("\\\\"),
        '\n' => escaped.push_str("\\n"),
        '\r' => escaped.push_str("\\r"),
        '\t' => escaped.push_str("\\t"),
        control if (control as u32) < 0x20 => {
          escaped.push_str(&format!("\\u{:04x}", control as u32));
        }
        other => escaped.push(other),
      }
    }
    escaped.push('"');

    self.inner.write_all(escaped.as_bytes())
  }

  fn write_indent(&mut self) -> io::Result<()> {
    for _ in 0..self.indent {
      self.inner.write_all(b"  ")?;
    }
    Ok(())
  }

  fn write_key(&mut self, key: Key) -> io::Result<()> {
    self.inner.write_all(b"\"")?;
    self.inner.write_all(key.as_str().as_bytes())?;
    self.inner.write_all(b"\": ")
  }
}

impl<W: Write> AllocDataWriter for TextFormatWriter<W> {
  fn adjust_indent(&mut self, delta: i32) {
    if delta >= 0 {
      self.indent = self.indent.saturating_add(delta.unsigned_abs());
    } else {
      self.indent = self.indent.saturating_sub(delta.unsigned_abs());
    }
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }

  fn write_int(
    &mut self,
    key: Key,
    value: i64,
    separator: Separator,
  ) -> io::Result<()> {
    self.emit_separator(separator)?;
    self.write_key(key)?;
    self.inner.write_all(value.to_string().as_bytes())
  }

  fn write_naked_object_id(
    &mut self,
    id: ObjectId,
    separator: Separator,
  ) -> io::Result<()> {
    self.emit_separator(separator)?;
    self.inner.write_all(format!("\"*{id}\"").as_bytes())
  }

  fn write_naked_string(
    &mut self,
    value: &str,
    separator: Separator,
  ) -> io::Result<()> {
    self.emit_separator(separator)?;
    self.write_escaped(value)
  }

  fn write_record_end(&mut self) -> io::Result<()> {
    self.inner.write_all(b" }")
  }

  fn write_record_start(&mut self, separator: Separator) -> io::Result<()> {
    self.emit_separator(separator)?;
    self.inner.write_all(b"{ ")
  }

  fn write_record_start_with_key(
    &mut self,
    key: Key,
    separator: Separator,
  ) -> io::Result<()> {
    self.emit_separator(separator)?;
    self.write_key(key)?;
    self.inner.write_all(b"{ ")
  }

  fn write_separator(&mut self, separator: Separator) -> io::Result<()> {
    self.emit_separator(separator)
  }

  fn write_sequence_end(&mut self) -> io::Result<()> {
    self.inner.write_all(b" ]")
  }

  fn write_sequence_start(&mut self, separator: Separator) -> io::Result<()> {
    self.emit_separator(separator)?;
    self.inner.write_all(b"[ ")
  }

  fn write_sequence_start_with_key(
    &mut self,
    key: Key,
    separator: Separator,
  ) -> io::Result<()> {
    self.emit_separator(separator)?;
    self.write_key(key)?;
    self.inner.write_all(b"[ ")
  }

  fn write_string(
    &mut self,
    key: Key,
    value: &str,
    separator: Separator,
  ) -> io::Result<()> {
    self.emit_separator(separator)?;
    self.write_key(key)?;
    self.write_escaped(value)
  }

  fn write_uint(
    &mut self,
    key: Key,
    value: u64,
    separator: Separator,
  ) -> io::Result<()> {
    self.emit_separator(separator)?;
    self.write_key(key)?;
    self.inner.write_all(value.to_string().as_bytes())
  }
}
