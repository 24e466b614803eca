// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! # Error Types for the Consumer Framework
//!
//! This module provides the error type shared by queue registration, the
//! middleware pipeline and the connection lifecycle. The `Error` enum is
//! cloneable so lifecycle outcomes can be fanned out to every caller joined
//! on the same in-flight connect or close operation.

use std::sync::Arc;

use thiserror::Error;

/// Boxed error type returned by middleware.
///
/// Middleware authors are free to use any error type; the pipeline and the
/// application error sink carry it as a trait object.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Represents errors raised by the consumer framework itself.
///
/// Covers synchronous registration failures, schema violations, transport
/// failures surfaced during the connection lifecycle, cross-cancellation of
/// concurrent connect/close requests, and pipeline contract misuse.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Bad argument to a registration or lifecycle call
    #[error("{0}")]
    Validation(String),

    /// A queue with the same name is already registered
    #[error("queue `{0}` is already registered")]
    AlreadyExists(String),

    /// Queue registration conflicts with the schema collaborator
    #[error("{0}")]
    SchemaViolation(String),

    /// Failure propagated from the broker transport
    #[error("{message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// A pending connect was cancelled by a close, or vice versa
    #[error("{message}")]
    CancelledByPeer {
        message: String,
        /// The peer operation's failure that caused the cancellation
        peer: Arc<Error>,
    },

    /// `next` was invoked more than once by the same middleware
    #[error("`next` was invoked more than once by the same middleware")]
    PipelineMisuse,
}

impl Error {
    /// Creates a transport error wrapping the collaborator's failure.
    ///
    /// # Parameters
    /// * `message` - Human-readable description of the failed operation
    /// * `source` - The underlying transport error, preserved for callers
    ///
    /// # Returns
    /// An `Error::Transport` carrying both
    pub fn transport(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Transport {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Creates a transport error with no underlying source.
    pub fn transport_msg(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Returns the peer failure attached to a `CancelledByPeer` error.
    ///
    /// # Returns
    /// The error the cancelled peer operation failed with, or `None` for any
    /// other variant
    pub fn peer(&self) -> Option<&Error> {
        match self {
            Error::CancelledByPeer { peer, .. } => Some(peer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_preserves_source() {
        let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "boom");
        let err = Error::transport("failure to connect", source);

        assert_eq!(err.to_string(), "failure to connect");
        let source = std::error::Error::source(&err).expect("source attached");
        assert!(source.to_string().contains("boom"));
    }

    #[test]
    fn cancelled_by_peer_carries_the_peer_error() {
        let peer = Error::transport_msg("failure to connect");
        let err = Error::CancelledByPeer {
            message: "Close cancelled because pending connect failed (closeErr)".to_owned(),
            peer: Arc::new(peer),
        };

        assert_eq!(
            err.to_string(),
            "Close cancelled because pending connect failed (closeErr)"
        );
        assert!(matches!(err.peer(), Some(Error::Transport { .. })));
    }
}
