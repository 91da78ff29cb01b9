//! Mirror of the interpreter's call stack.
//!
//! The host pushes a frame when it enters a function, keeps the top
//! frame's bytecode offset current, and pops on exit. `AllocTracer`
//! wraps the exceptional-exit case in a scoped guard so unwinds can
//! never leak frames.

use smallvec::SmallVec;

use crate::host::FunctionRef;
use crate::location::is_internal_url;

const STACK_INLINE_DEPTH: usize = 32;

/// One executing function plus the bytecode offset it is currently at.
#[derive(Clone)]
pub struct ShadowCallFrame<F: FunctionRef> {
  pub bytecode_offset: u32,
  pub function: F,
}

impl<F: FunctionRef> ShadowCallFrame<F> {
  #[must_use]
  pub fn is_internal(&self) -> bool {
    is_internal_url(self.function.source_url())
  }
}

/// Push/pop stack shadowing the interpreter's frames.
pub struct ShadowCallStack<F: FunctionRef> {
  frames: SmallVec<[ShadowCallFrame<F>; STACK_INLINE_DEPTH]>,
}

impl<F: FunctionRef> Default for ShadowCallStack<F> {
  fn default() -> Self {
    Self::new()
  }
}

impl<F: FunctionRef> ShadowCallStack<F> {
  #[must_use]
  pub fn depth(&self) -> usize {
    self.frames.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      frames: SmallVec::new(),
    }
  }

  /// Remove the top frame. Underflow is a caller contract violation and
  /// traps in debug builds.
  pub fn pop(&mut self) {
    debug_assert!(!self.frames.is_empty(), "shadow stack underflow");

    self.frames.pop();
  }

  /// Append a frame for the given function, starting at offset zero.
  pub fn push(&mut self, function: F) {
    self.frames.push(ShadowCallFrame {
      bytecode_offset: 0,
      function,
    });
  }

  /// Snapshot of the top frame, internal or not.
  #[must_use]
  pub fn top_frame(&self) -> Option<ShadowCallFrame<F>> {
    self.frames.last().cloned()
  }

  /// Snapshot of the topmost frame that resolves to user code. All
  /// internal and host frames above it are collapsed.
  #[must_use]
  pub fn top_user_frame(&self) -> Option<ShadowCallFrame<F>> {
    self
      .frames
      .iter()
      .rev()
      .find(|frame| !frame.is_internal())
      .cloned()
  }

  /// Set the top frame's bytecode offset. Requires a non-empty stack.
  pub fn update_offset(&mut self, bytecode_offset: u32) {
    debug_assert!(!self.frames.is_empty(), "shadow stack underflow");

    if let Some(top) = self.frames.last_mut() {
      top.bytecode_offset = bytecode_offset;
    }
  }
}
