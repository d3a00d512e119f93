//! Classified gateway errors.
//!
//! Callers match on the category to decide recovery: only `Offline` is
//! recoverable locally (replica fallback for reads, outbox replay for
//! writes); `Status` and `Format` are terminal for the attempt and must be
//! surfaced.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
  /// No response was obtained: known-offline state, network unreachable,
  /// timeout or cancellation. `queued` is true when the mutation was
  /// captured by the outbox for replay on reconnect.
  #[error("offline")]
  Offline { queued: bool },

  /// A well-formed HTTP response with a non-success status. Includes
  /// validation rejections (e.g. duplicate name, malformed frequency
  /// arrays), surfaced verbatim and never auto-retried.
  #[error("HTTP {status}: {message}")]
  Status { status: u16, message: String },

  /// The response could not be parsed as the expected format (wrong
  /// content type, HTML where JSON was expected). Usually a routing
  /// misconfiguration, never silently retried.
  #[error("unexpected response format: {0}")]
  Format(String),
}

impl ApiError {
  pub fn is_offline(&self) -> bool {
    matches!(self, ApiError::Offline { .. })
  }

  /// True when the failed mutation was captured by the outbox.
  pub fn was_queued(&self) -> bool {
    matches!(self, ApiError::Offline { queued: true })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_offline_classification() {
    let err = ApiError::Offline { queued: true };
    assert!(err.is_offline());
    assert!(err.was_queued());

    let err = ApiError::Status {
      status: 400,
      message: "duplicate name".to_string(),
    };
    assert!(!err.is_offline());
    assert_eq!(err.to_string(), "HTTP 400: duplicate name");
  }
}
