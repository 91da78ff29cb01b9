//! Tracer tuning knobs.

/// Default fraction of the total live count a site must hold to be
/// reported.
pub const INTERESTING_COUNT_FRACTION: f64 = 0.01;

/// Default fraction of the total live size a site must hold to be
/// reported.
pub const INTERESTING_SIZE_FRACTION: f64 = 0.01;

/// Controls attribution and report trimming.
#[derive(Debug, Clone)]
pub struct TracerConfig {
  /// Sites with `live_count >= floor(total * fraction)` are interesting.
  pub count_threshold_fraction: f64,
  /// Sites with `live_size >= floor(total * fraction)` are interesting.
  pub size_threshold_fraction: f64,
  /// Whether the tracer accepts allocations immediately once constructed.
  pub start_enabled: bool,
}

impl Default for TracerConfig {
  fn default() -> Self {
    Self {
      count_threshold_fraction: INTERESTING_COUNT_FRACTION,
      size_threshold_fraction: INTERESTING_SIZE_FRACTION,
      start_enabled: true,
    }
  }
}

impl TracerConfig {
  /// Explicitly disable eager tracer start-up.
  #[must_use]
  pub fn disabled(mut self) -> Self {
    self.start_enabled = false;
    self
  }

  /// Builder-style helper to adjust the live-count threshold fraction.
  #[must_use]
  pub fn with_count_threshold_fraction(mut self, fraction: f64) -> Self {
    self.count_threshold_fraction = fraction.clamp(0.0, 1.0);
    self
  }

  /// Builder-style helper to adjust the live-size threshold fraction.
  #[must_use]
  pub fn with_size_threshold_fraction(mut self, fraction: f64) -> Self {
    self.size_threshold_fraction = fraction.clamp(0.0, 1.0);
    self
  }
}
