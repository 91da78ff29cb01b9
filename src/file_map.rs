//! Process-wide interning of file sources referenced by a report.
//!
//! Every tracer in the process shares one table so file ids agree across
//! reports written in the same emission. Entries are inserted lazily while
//! locations are written and the table is cleared when the emission ends.

use std::io;
use std::sync::{Mutex, MutexGuard};

use crate::host::{SourceEncoding, SourceText};
use crate::writer::{AllocDataWriter, Key, Separator};

struct FileSourceEntry {
  filename: Box<str>,
  source: Box<str>,
}

static FILE_TO_SOURCE: Mutex<Vec<FileSourceEntry>> = Mutex::new(Vec::new());

fn lock_entries() -> MutexGuard<'static, Vec<FileSourceEntry>> {
  match FILE_TO_SOURCE.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

/// Forget every interned file. Called at end-of-emission.
pub fn clear_source_entries() {
  lock_entries().clear();
}

/// Intern a file and return its 1-based id. The source bytes are decoded
/// once, on first sight of the file.
pub fn intern_file(filename: &str, source: &SourceText<'_>) -> u32 {
  let mut entries = lock_entries();

  for (index, entry) in entries.iter().enumerate() {
    if &*entry.filename == filename {
      return index as u32 + 1;
    }
  }

  entries.push(FileSourceEntry {
    filename: filename.into(),
    source: decode_source(source).into_boxed_str(),
  });

  entries.len() as u32
}

/// Emit the interned table as the `fileToSourceMap` sequence.
///
/// # Errors
///
/// Returns an error if the underlying writer fails.
pub fn write_file_map<D: AllocDataWriter + ?Sized>(
  writer: &mut D,
  separator: Separator,
) -> io::Result<()> {
  writer.write_sequence_start_with_key(Key::FileToSourceMap, separator)?;
  writer.adjust_indent(1);

  let entries = lock_entries();
  for (index, entry) in entries.iter().enumerate() {
    let leading = if index == 0 {
      Separator::BigSpace
    } else {
      Separator::CommaBigSpace
    };
    writer.write_record_start(leading)?;

    writer.write_uint(Key::FileId, index as u64 + 1, Separator::None)?;
    writer.write_string(Key::Filename, &entry.filename, Separator::Comma)?;
    writer.write_string(Key::Source, &entry.source, Separator::Comma)?;

    writer.write_record_end()?;
  }
  drop(entries);

  writer.adjust_indent(-1);
  writer.write_sequence_end()
}

/// Decode a function's raw source bytes into a measured string.
fn decode_source(source: &SourceText<'_>) -> String {
  match source.encoding {
    SourceEncoding::Utf8 => String::from_utf8_lossy(source.bytes).into_owned(),
    SourceEncoding::Cesu8 => decode_cesu8(source.bytes),
  }
}

/// CESU-8 stores supplementary characters as a pair of three-byte encoded
/// UTF-16 surrogates. Recombine the pairs, pass well-formed UTF-8 runs
/// through, and map anything else to U+FFFD.
fn decode_cesu8(bytes: &[u8]) -> String {
  let mut out = String::with_capacity(bytes.len());
  let mut rest = bytes;

  while !rest.is_empty() {
    match std::str::from_utf8(rest) {
      Ok(valid) => {
        out.push_str(valid);
        break;
      }
      Err(err) => {
        let valid_up_to = err.valid_up_to();
        if let Ok(prefix) = std::str::from_utf8(&rest[..valid_up_to]) {
          out.push_str(prefix);
        }
        rest = &rest[valid_up_to..];

        if let Some(supplementary) = decode_surrogate_pair(rest) {
          out.push(supplementary);
          rest = &rest[6..];
        } else {
          out.push(char::REPLACEMENT_CHARACTER);
          let skip = err.error_len().unwrap_or(rest.len()).max(1);
          rest = &rest[skip.min(rest.len())..];
        }
      }
    }
  }

  out
}

fn decode_surrogate_pair(bytes: &[u8]) -> Option<char> {
  let high = decode_surrogate_unit(bytes.get(..3)?)?;
  let low = decode_surrogate_unit(bytes.get(3..6)?)?;

  if !(0xd800..0xdc00).contains(&high) || !(0xdc00..0xe000).contains(&low) {
    return None;
  }

  let combined = 0x10000 + ((high - 0xd800) << 10) + (low - 0xdc00);
  char::from_u32(combined)
}

fn decode_surrogate_unit(bytes: &[u8]) -> Option<u32> {
  let [first, second, third] = *bytes else {
    return None;
  };

  if first != 0xed || second & 0xc0 != 0x80 || third & 0xc0 != 0x80 {
    return None;
  }

  Some(
    (0xd000 | (u32::from(second) & 0x3f) << 6) | (u32::from(third) & 0x3f),
  )
}

#[cfg(test)]
pub(crate) static EMISSION_SERIAL: Mutex<()> = Mutex::new(());

#[cfg(test)]
pub(crate) fn serialize_emission() -> MutexGuard<'static, ()> {
  match EMISSION_SERIAL.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}
