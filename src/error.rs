//! Upstream connection error types.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::config::NetErrorPolicy;

/// Result type for upstream pool operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Errors surfaced by connection acquisition, I/O, and lifecycle paths.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The TCP connect (and TLS handshake, when enabled) did not finish
    /// before the configured connect timeout.
    #[error("connect to upstream timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The OS rejected the connection (refused, unreachable, ...).
    #[error("connect to upstream failed: {0}")]
    Connect(#[source] io::Error),

    /// TLS handshake with the upstream failed.
    #[error("TLS handshake with upstream failed: {0}")]
    TlsHandshake(String),

    /// The configured host is not a valid TLS server name.
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    /// TLS was requested by the configuration but no client config was
    /// provided at pool construction.
    #[error("TLS required by configuration but no client config was provided")]
    TlsNotConfigured,

    /// A read or write deadline elapsed before the operation completed.
    #[error("I/O deadline elapsed")]
    IoTimeout,

    /// Socket error after the connection was established.
    #[error("I/O error on upstream connection: {0}")]
    Io(#[from] io::Error),

    /// All pool slots are in use; no new connection may be opened.
    #[error("upstream pool exhausted ({max} connections in use)")]
    PoolExhausted {
        /// Configured connection cap.
        max: usize,
    },
}

impl UpstreamError {
    /// Check if this error is a connect or I/O deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout(_) | Self::IoTimeout)
    }

    /// Check if this error is fatal to the connection it occurred on.
    ///
    /// A connection that saw a fatal error is never returned to the pool,
    /// regardless of the caller's recycle intent.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout(_)
                | Self::Connect(_)
                | Self::TlsHandshake(_)
                | Self::IoTimeout
                | Self::Io(_)
        )
    }

    /// Check if the caller may retry the failed operation on a fresh
    /// connection under the given policy.
    ///
    /// The pool itself never retries; this is advisory for the layer that
    /// decides what to do with a failed flush. `PoolExhausted` and
    /// configuration errors are never retryable.
    pub fn is_retryable(&self, policy: NetErrorPolicy) -> bool {
        if policy == NetErrorPolicy::Fail {
            return false;
        }
        match self {
            Self::ConnectTimeout(_) | Self::IoTimeout => true,
            Self::Connect(_) | Self::Io(_) => true,
            Self::TlsHandshake(_) => false,
            Self::InvalidServerName(_) | Self::TlsNotConfigured => false,
            Self::PoolExhausted { .. } => false,
        }
    }

    /// The `io::ErrorKind` to record on the connection for this error, if
    /// it is fatal to the connection.
    pub(crate) fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::ConnectTimeout(_) | Self::IoTimeout => Some(io::ErrorKind::TimedOut),
            Self::Connect(e) | Self::Io(e) => Some(e.kind()),
            Self::TlsHandshake(_) => Some(io::ErrorKind::InvalidData),
            _ => None,
        }
    }
}
