//! Per-connection lifecycle state machine and metadata.
//!
//! Every pooled connection moves through a fixed lifecycle:
//!
//! ```text
//!   Connecting ──► Active ◄──► Idle
//!        │            │          │
//!        └────────────┴──────────┴──► Destroying ──► Destroyed
//! ```
//!
//! - `Connecting`: TCP connect / TLS handshake in flight, bounded by the
//!   connect deadline.
//! - `Active`: checked out to a caller, member of the busy set.
//! - `Idle`: released with keepalive, member of the available set.
//! - `Destroying`: condemned but still referenced by a suspended caller;
//!   parked until the last guard drops.
//! - `Destroyed`: transport shut down and released. Terminal.
//!
//! Destruction is guarded two ways. The `guards` refcount counts live
//! references held by callers (including a caller suspended inside an I/O
//! await); a connection with `guards > 0` is never torn down, only marked
//! `doomed`. The transport slot is an `Option` taken exactly once, so the
//! underlying socket shutdown can never be issued twice no matter how many
//! paths race to destroy the same entry.

use std::io;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::transport::Transport;

/// Identifier of a pooled connection, unique per pool.
pub type ConnId = u64;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ConnState {
    /// TCP connect / TLS handshake in progress.
    Connecting,
    /// Checked out to a caller.
    Active,
    /// Parked in the available set, eligible for reuse.
    Idle,
    /// Condemned, waiting for outstanding guards to drop.
    Destroying,
    /// Transport released. Terminal.
    Destroyed,
}

impl ConnState {
    /// A live connection counts against the pool cap.
    pub(crate) fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Active | Self::Idle)
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

/// One pooled connection: transport slot plus lifecycle metadata.
pub(crate) struct Conn {
    pub(crate) id: ConnId,
    pub(crate) state: ConnState,
    /// `Some` while the pool holds the transport (connecting is an
    /// exception: the opener owns the stream until the connect finishes).
    /// `None` while checked out to a caller or after destruction.
    pub(crate) transport: Option<Transport>,

    pub(crate) ts_created: Instant,
    pub(crate) ts_assigned: Option<Instant>,
    pub(crate) ts_available: Option<Instant>,
    pub(crate) ts_connect_start: Instant,
    /// Cleared once the connect completes, so the sweeper only applies the
    /// connect timeout to entries that are genuinely mid-connect.
    pub(crate) connect_deadline: Option<Instant>,

    /// Keepalive eligibility. Off means single-use.
    pub(crate) recycle: bool,
    /// How many times this connection has been returned to the pool.
    pub(crate) recycle_count: u32,
    /// First network error recorded on this connection, if any.
    pub(crate) net_error: Option<io::ErrorKind>,

    /// Live references held by callers. Non-zero forbids destruction.
    pub(crate) guards: u32,
    /// Condemned while referenced; destruction completes when the last
    /// guard drops.
    pub(crate) doomed: bool,
}

impl Conn {
    pub(crate) fn new(id: ConnId, now: Instant, connect_deadline: Instant, recycle: bool) -> Self {
        Self {
            id,
            state: ConnState::Connecting,
            transport: None,
            ts_created: now,
            ts_assigned: None,
            ts_available: None,
            ts_connect_start: now,
            connect_deadline: Some(connect_deadline),
            recycle,
            recycle_count: 0,
            net_error: None,
            guards: 0,
            doomed: false,
        }
    }

    /// Connect (and handshake, when applicable) finished: the connection is
    /// handed to the caller that opened it.
    pub(crate) fn mark_connected(&mut self, now: Instant) {
        debug_assert_eq!(self.state, ConnState::Connecting, "connect completed twice");
        self.state = ConnState::Active;
        self.connect_deadline = None;
        self.ts_assigned = Some(now);
    }

    /// An idle connection was checked out again.
    pub(crate) fn mark_assigned(&mut self, now: Instant) {
        debug_assert_eq!(self.state, ConnState::Idle, "assigned a non-idle connection");
        self.state = ConnState::Active;
        self.ts_assigned = Some(now);
    }

    /// Released back to the available set.
    pub(crate) fn mark_idle(&mut self, now: Instant) {
        debug_assert_eq!(self.state, ConnState::Active, "released a non-active connection");
        self.state = ConnState::Idle;
        self.ts_available = Some(now);
        self.recycle_count += 1;
    }

    /// Record a network error. The first error wins; it pins the reason the
    /// connection will be destroyed even if later operations fail
    /// differently.
    pub(crate) fn mark_error(&mut self, kind: io::ErrorKind) {
        if self.net_error.is_none() {
            self.net_error = Some(kind);
        }
    }

    /// Whether a release may return this connection to the available set.
    /// An error recorded on the connection overrides keepalive intent.
    pub(crate) fn can_recycle(&self, max_recycle: u32) -> bool {
        self.recycle
            && !self.doomed
            && self.net_error.is_none()
            && (max_recycle == 0 || self.recycle_count < max_recycle)
    }

    /// True when an idle connection has outlived the keepalive idle window.
    pub(crate) fn idle_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.state == ConnState::Idle
            && self
                .ts_available
                .is_some_and(|ts| now.duration_since(ts) >= idle_timeout)
    }

    /// True when a mid-connect connection has blown its connect deadline.
    pub(crate) fn connect_expired(&self, now: Instant) -> bool {
        self.state == ConnState::Connecting
            && self.connect_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Tear down the transport. Returns `true` the first time only; the
    /// transport slot is taken exactly once, so repeated calls cannot close
    /// the socket twice.
    pub(crate) fn destroy(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ConnState::Destroyed;
        if let Some(transport) = self.transport.take() {
            // Dropping the stream closes the descriptor and, for TLS, the
            // session bound to it.
            drop(transport);
        }
        trace!(id = self.id, error = ?self.net_error, "connection destroyed");
        true
    }
}
