//! Error types for proxy operations.

use thiserror::Error;

/// Errors surfaced by proxy operations.
///
/// Synchronous operations (`load`, `get`, `set`, method calls) return these
/// directly. Background listeners never return errors; per-field decode
/// failures are logged and the offending field skipped so one malformed
/// notification cannot take a watcher down.
#[derive(Debug, Error)]
pub enum Error {
    /// A bus-level communication failure (connection lost, call failed).
    ///
    /// Surfaced to the caller as-is; the engine does not retry.
    #[error("D-Bus transport error: {0}")]
    Transport(#[from] zbus::Error),

    /// The remote service refused a property write or method call.
    ///
    /// The local cache is left unchanged when this is returned.
    #[error("remote rejected {name}: {reason}")]
    Rejected {
        /// D-Bus error name reported by the remote service.
        name: String,
        /// Human-readable detail from the error reply.
        reason: String,
    },

    /// A wire value did not match the shape expected by the declared schema.
    #[error("failed to decode {what}: {detail}")]
    Decode {
        /// What was being decoded (property name, signal member, ...).
        what: String,
        /// Why decoding failed.
        detail: String,
    },

    /// `start()` was called on a watcher that is already running.
    #[error("property watcher already started")]
    WatcherActive,
}

impl Error {
    pub(crate) fn decode(what: impl Into<String>, detail: impl ToString) -> Self {
        Error::Decode {
            what: what.into(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn rejected(name: impl Into<String>, reason: impl ToString) -> Self {
        Error::Rejected {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if this error is a remote-side refusal rather than a
    /// transport or decoding problem.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rejected { .. })
    }
}

impl From<zvariant::Error> for Error {
    fn from(e: zvariant::Error) -> Self {
        Error::Transport(zbus::Error::Variant(e))
    }
}

impl From<zbus::names::Error> for Error {
    fn from(e: zbus::names::Error) -> Self {
        Error::Transport(zbus::Error::from(e))
    }
}
