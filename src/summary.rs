use super::*;

/// One allocation site flattened out of the path tree.
#[derive(Debug, Clone)]
pub struct SiteRecord {
  pub alloc_count: u64,
  pub column: u32,
  pub file: Option<String>,
  pub function: String,
  /// One-based, matching report output.
  pub line: u32,
  pub live_count: i64,
  pub live_size: i64,
}

impl SiteRecord {
  #[must_use]
  pub fn same_site(&self, other: &SiteRecord) -> bool {
    self.line == other.line
      && self.column == other.column
      && self.function == other.function
      && self.file == other.file
  }
}

impl Serialize for SiteRecord {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("SiteRecord", 7)?;
    state.serialize_field("function", &self.function)?;
    state.serialize_field("line", &self.line)?;
    state.serialize_field("column", &self.column)?;
    state.serialize_field("alloc_count", &self.alloc_count)?;
    state.serialize_field("live_count", &self.live_count)?;
    state.serialize_field("live_size", &self.live_size)?;

    if let Some(file) = &self.file {
      state.serialize_field("file", file)?;
    }

    state.end()
  }
}

/// Compact, mergeable view of every allocation site a tracer has seen.
#[derive(Debug, Clone, Default)]
pub struct Summary {
  records: Vec<SiteRecord>,
}

impl Serialize for Summary {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("Summary", 1)?;
    state.serialize_field("records", &self.records)?;
    state.end()
  }
}

impl Summary {
  /// Serialize the summary delta between this summary and an older
  /// baseline to JSON.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_delta_json<W: Write>(
    &self,
    older: &Summary,
    writer: W,
  ) -> Result<(), EmitError> {
    SummaryDelta::from_summaries(self, older).export_json(writer)
  }

  /// Serialize the summary to JSON using the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), EmitError> {
    serde_json::to_writer(writer, self)?;
    Ok(())
  }

  #[must_use]
  pub fn new(records: Vec<SiteRecord>) -> Self {
    Self { records }
  }

  #[must_use]
  pub fn records(&self) -> &[SiteRecord] {
    &self.records
  }
}

/// Lightweight diff between two summaries.
#[derive(Debug, Clone, Default)]
pub struct SummaryDelta {
  records: Vec<SiteRecord>,
}

impl Serialize for SummaryDelta {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("SummaryDelta", 1)?;
    state.serialize_field("records", &self.records)?;
    state.end()
  }
}

impl SummaryDelta {
  /// Serialize the delta to JSON using the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), EmitError> {
    serde_json::to_writer(writer, self)?;
    Ok(())
  }

  #[must_use]
  pub fn from_summaries(newer: &Summary, older: &Summary) -> Self {
    let mut deltas = Vec::new();

    for record in newer.records() {
      let baseline = older
        .records()
        .iter()
        .find(|candidate| candidate.same_site(record));

      let delta_record = match baseline {
        Some(prev) => SiteRecord {
          alloc_count: record.alloc_count.saturating_sub(prev.alloc_count),
          column: record.column,
          file: record.file.clone(),
          function: record.function.clone(),
          line: record.line,
          live_count: record.live_count - prev.live_count,
          live_size: record.live_size - prev.live_size,
        },
        None => record.clone(),
      };

      deltas.push(delta_record);
    }

    Self::new(deltas)
  }

  #[must_use]
  pub fn new(records: Vec<SiteRecord>) -> Self {
    Self { records }
  }

  #[must_use]
  pub fn records(&self) -> &[SiteRecord] {
    &self.records
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(
    function: &str,
    line: u32,
    alloc_count: u64,
    live_count: i64,
    live_size: i64,
  ) -> SiteRecord {
    SiteRecord {
      alloc_count,
      column: 4,
      file: Some("/app/main.js".to_string()),
      function: function.to_string(),
      line,
      live_count,
      live_size,
    }
  }

  #[test]
  fn delta_subtracts_matching_sites() {
    let older = Summary::new(vec![record("build", 10, 5, 5, 40)]);
    let newer = Summary::new(vec![
      record("build", 10, 9, 2, 16),
      record("parse", 20, 3, 3, 24),
    ]);

    let delta = SummaryDelta::from_summaries(&newer, &older);

    assert_eq!(delta.records()[0].alloc_count, 4);
    assert_eq!(delta.records()[0].live_count, -3);
    assert_eq!(delta.records()[0].live_size, -24);

    // Sites without a baseline pass through unchanged.
    assert_eq!(delta.records()[1].alloc_count, 3);
  }

  #[test]
  fn summary_exports_json() {
    let summary = Summary::new(vec![record("build", 10, 5, 5, 40)]);

    let mut out = Vec::new();
    summary.export_json(&mut out).expect("export failed");

    let parsed: serde_json::Value =
      serde_json::from_slice(&out).expect("invalid summary json");
    assert_eq!(parsed["records"][0]["function"], "build");
    assert_eq!(parsed["records"][0]["line"], 10);
    assert_eq!(parsed["records"][0]["file"], "/app/main.js");
  }
}
