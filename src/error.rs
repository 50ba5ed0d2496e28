//! The three error kinds of §7: invocation, code, and internal.

use crate::types::ast::Span;

/// A fatal compiler error. The propagation policy is fatal-on-first-sighting;
/// callers that want whole-program diagnostics accumulate `CompileError`s
/// themselves rather than relying on this type to do it for them.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
  /// Bad CLI invocation. The core crate only raises this for optimization
  /// levels it cannot run; flag parsing itself is a driver concern.
  #[error("invalid invocation: {0}")]
  Invocation(String),

  /// A semantic error attributable to the source program.
  #[error("{span}: {message}")]
  Code {
    /// Where the offending construct appears.
    span: Span,
    /// Human-readable description.
    message: String,
  },

  /// An invariant the implementation must never violate.
  #[error("internal compiler error: {0}")]
  Internal(String),
}

impl CompileError {
  /// Build a `Code` error from a span and a message.
  pub fn code(span: Span, message: impl Into<String>) -> Self {
    CompileError::Code { span, message: message.into() }
  }

  /// Build an `Internal` error.
  pub fn internal(message: impl Into<String>) -> Self {
    CompileError::Internal(message.into())
  }

  /// True if this is a `Code` error (as opposed to `Invocation`/`Internal`).
  #[must_use] pub fn is_code_error(&self) -> bool {
    matches!(self, CompileError::Code { .. })
  }
}

/// Convenience alias used throughout the pipeline.
pub type Result<T> = std::result::Result<T, CompileError>;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::ast::Span;

  #[test]
  fn code_error_formats_with_span_prefix() {
    let span = Span { file: "main.cls".into(), line: 4, col: 9 };
    let e = CompileError::code(span, "undeclared identifier `x`");
    assert_eq!(e.to_string(), "main.cls:4:9: undeclared identifier `x`");
  }

  #[test]
  fn internal_error_is_tagged() {
    let e = CompileError::internal("non-monotonic TAC index");
    assert_eq!(e.to_string(), "internal compiler error: non-monotonic TAC index");
  }
}
