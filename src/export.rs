use super::*;

/// Errors that can occur while emitting a report or summary.
#[derive(Debug)]
pub enum EmitError {
  Io(io::Error),
  Json(serde_json::Error),
  Resource(String),
}

impl Display for EmitError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error during emission: {err}"),
      Self::Json(err) => write!(f, "failed to encode summary as json: {err}"),
      Self::Resource(name) => {
        write!(f, "failed to open trace resource stream: {name}")
      }
    }
  }
}

impl std::error::Error for EmitError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
      Self::Resource(_) => None,
    }
  }
}

impl From<io::Error> for EmitError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for EmitError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

/// Name of the trimmed-trace resource for one snapshot.
#[must_use]
pub fn trace_resource_name(snapshot_id: i64) -> String {
  format!("allocTracing_{snapshot_id}.json")
}

/// Opens named resource streams on behalf of the tracer.
pub trait TraceDataIo {
  type Stream: Write;

  /// # Errors
  ///
  /// Returns an error if the named stream cannot be created.
  fn open_resource_stream(&self, name: &str) -> io::Result<Self::Stream>;
}

/// Resource streams backed by files in one directory.
pub struct DirDataIo {
  root: PathBuf,
}

impl DirDataIo {
  #[must_use]
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  #[must_use]
  pub fn root(&self) -> &Path {
    &self.root
  }
}

impl TraceDataIo for DirDataIo {
  type Stream = BufWriter<File>;

  fn open_resource_stream(&self, name: &str) -> io::Result<Self::Stream> {
    let file = File::create(self.root.join(name))?;
    Ok(BufWriter::new(file))
  }
}

/// Report sink backed by an mmap'd file of fixed capacity.
pub struct MmapStreamSink {
  mmap: MmapMut,
  position: usize,
}

impl MmapStreamSink {
  /// # Errors
  ///
  /// Returns an error if the backing file cannot be created, resized, or
  /// mapped into memory.
  pub fn create(path: impl AsRef<Path>, capacity: usize) -> io::Result<Self> {
    let capacity = capacity.max(1);

    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .read(true)
      .truncate(true)
      .open(path)?;

    let capacity_u64 = u64::try_from(capacity)
      .map_err(|_| io::Error::other("capacity exceeds u64"))?;

    file.set_len(capacity_u64)?;

    // SAFETY: the file handle remains open for the lifetime of the mapping.
    let mmap = unsafe { MmapMut::map_mut(&file)? };

    Ok(Self { mmap, position: 0 })
  }

  #[must_use]
  pub fn position(&self) -> usize {
    self.position
  }

  /// # Errors
  ///
  /// Returns an error if the write would exceed the reserved capacity.
  fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
    let Some(end) = self.position.checked_add(data.len()) else {
      return Err(io::Error::other("mmap position overflow"));
    };

    if end > self.mmap.len() {
      return Err(io::Error::new(
        io::ErrorKind::WriteZero,
        "mmap capacity exceeded",
      ));
    }

    self.mmap[self.position..end].copy_from_slice(data);

    self.position = end;

    Ok(())
  }
}

impl Write for MmapStreamSink {
  fn flush(&mut self) -> io::Result<()> {
    self.mmap.flush_async()
  }

  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.write_bytes(buf)?;
    Ok(buf.len())
  }
}
