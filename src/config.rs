//! Upstream pool configuration.
//!
//! `UpstreamConfig` is the plain-data surface a config loader deserializes
//! for each upstream target. TLS certificate material is deliberately not
//! part of it; the caller hands a ready `rustls::ClientConfig` to the pool
//! constructor instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the caller should do when a network error is reported for an
/// upstream operation.
///
/// The pool records the error and destroys the connection either way; this
/// policy only tells the forwarding layer whether re-dispatching the chunk
/// on a fresh connection is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetErrorPolicy {
    /// Propagate the failure to the caller without retrying.
    #[default]
    Fail,
    /// The caller may retry on a fresh connection.
    Retry,
}

/// Configuration for a single upstream target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream host name or address.
    pub host: String,
    /// Upstream TCP port.
    pub port: u16,
    /// Wrap every connection in a TLS session.
    pub use_tls: bool,
    /// Soft cap on total connections (available + busy) per pool.
    pub max_connections: usize,
    /// Keep released connections around for reuse. When off, every
    /// connection is single-use.
    pub keepalive: bool,
    /// How long an idle keepalive connection may sit in the pool before the
    /// sweeper reclaims it.
    pub keepalive_idle_timeout: Duration,
    /// Maximum number of times a connection may be recycled before it is
    /// destroyed on release. `0` means unlimited.
    pub keepalive_max_recycle: u32,
    /// Deadline for TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    /// Advisory retry policy for network errors, see [`NetErrorPolicy`].
    pub net_error_policy: NetErrorPolicy,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 0,
            use_tls: false,
            max_connections: 32,
            keepalive: true,
            keepalive_idle_timeout: Duration::from_secs(30),
            keepalive_max_recycle: 2000,
            connect_timeout: Duration::from_secs(10),
            net_error_policy: NetErrorPolicy::Fail,
        }
    }
}

impl UpstreamConfig {
    /// Create a configuration for `host:port` with default policy values.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Enable or disable TLS for this target.
    pub fn use_tls(mut self, enabled: bool) -> Self {
        self.use_tls = enabled;
        self
    }

    /// Set the connection cap.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Enable or disable keepalive reuse.
    pub fn keepalive(mut self, enabled: bool) -> Self {
        self.keepalive = enabled;
        self
    }

    /// Set the idle timeout after which a pooled connection is reclaimed.
    pub fn keepalive_idle_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_idle_timeout = timeout;
        self
    }

    /// Set the recycle limit per connection (`0` = unlimited).
    pub fn keepalive_max_recycle(mut self, max: u32) -> Self {
        self.keepalive_max_recycle = max;
        self
    }

    /// Set the connect (TCP + TLS handshake) timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the advisory network-error policy.
    pub fn net_error_policy(mut self, policy: NetErrorPolicy) -> Self {
        self.net_error_policy = policy;
        self
    }

    /// `host:port` label used in logs.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
