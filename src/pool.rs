//! Upstream connection pool.
//!
//! One `Upstream` manages all connections to a single remote target. It
//! keeps two index sets over an arena of connection entries:
//!
//! - **available**: idle keepalive connections, reused LIFO so the most
//!   recently released socket (warmest TLS session) goes out first
//! - **busy**: connections checked out to callers, including entries whose
//!   connect/handshake is still in flight
//!
//! plus a **pending** list of condemned entries that are still referenced
//! by a suspended caller and may not be torn down yet.
//!
//! The pool is designed for a single-threaded cooperative runtime: all
//! types here are `!Send`, collections are mutated without locks, and the
//! only lifecycle hazard is a sweep interleaving with a caller that is
//! parked inside an I/O await. That hazard is handled by the per-entry
//! guard refcount: the sweeper marks guarded entries doomed instead of
//! destroying them, and the last guard drop completes the destruction.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::config::UpstreamConfig;
use crate::conn::{Conn, ConnId, ConnState};
use crate::error::{Result, UpstreamError};
use crate::transport::Transport;

// ============================================================================
// Stats
// ============================================================================

/// Lifetime counters for one upstream pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamStats {
    /// Connections opened (connect + handshake completed).
    pub opened: u64,
    /// Checkouts served from the available set.
    pub reused: u64,
    /// Releases that returned a connection to the available set.
    pub recycled: u64,
    /// Entries fully destroyed.
    pub destroyed: u64,
    /// Network errors recorded on connections.
    pub errors: u64,
    /// Acquisitions rejected because the pool was at capacity.
    pub exhausted: u64,
}

// ============================================================================
// Pool internals
// ============================================================================

pub(crate) struct PoolInner {
    cfg: UpstreamConfig,
    conns: HashMap<ConnId, Conn>,
    /// Idle connections, LIFO: `pop` yields the most recently released.
    available: Vec<ConnId>,
    busy: HashSet<ConnId>,
    /// Doomed entries still held by a guard.
    pending: Vec<ConnId>,
    next_id: ConnId,
    stats: UpstreamStats,
}

impl PoolInner {
    fn shared(cfg: UpstreamConfig) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            cfg,
            conns: HashMap::new(),
            available: Vec::new(),
            busy: HashSet::new(),
            pending: Vec::new(),
            next_id: 1,
            stats: UpstreamStats::default(),
        }))
    }

    fn live(&self) -> usize {
        self.available.len() + self.busy.len()
    }

    /// Pop idle connections until one survives keepalive validation.
    fn checkout_idle(&mut self, now: Instant) -> Option<(ConnId, Transport)> {
        let idle_timeout = self.cfg.keepalive_idle_timeout;
        while let Some(id) = self.available.pop() {
            let expired = self
                .conns
                .get(&id)
                .is_none_or(|c| c.idle_expired(now, idle_timeout));
            if expired {
                debug!(id, upstream = %self.cfg.addr(), "stale idle connection dropped at checkout");
                self.finish_destroy(id);
                continue;
            }
            let transport = {
                let conn = self
                    .conns
                    .get_mut(&id)
                    .expect("available entry missing from arena");
                conn.mark_assigned(now);
                conn.transport
                    .take()
                    .expect("idle connection without transport")
            };
            self.busy.insert(id);
            self.stats.reused += 1;
            trace!(id, upstream = %self.cfg.addr(), "reusing pooled connection");
            return Some((id, transport));
        }
        None
    }

    /// Reserve a slot for a new connection, enforcing the pool cap.
    fn register_connecting(&mut self, now: Instant, deadline: Instant) -> Result<ConnId> {
        let max = self.cfg.max_connections;
        if self.live() >= max {
            self.stats.exhausted += 1;
            debug!(upstream = %self.cfg.addr(), max, "pool exhausted");
            return Err(UpstreamError::PoolExhausted { max });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.conns
            .insert(id, Conn::new(id, now, deadline, self.cfg.keepalive));
        self.busy.insert(id);
        trace!(id, upstream = %self.cfg.addr(), "opening new upstream connection");
        Ok(id)
    }

    /// Return a checked-out connection. Recycles it into the available set
    /// when permitted, otherwise closes the stream and leaves entry removal
    /// to the guard drop that follows.
    fn release(
        &mut self,
        id: ConnId,
        transport: Option<Transport>,
        recycle_intent: bool,
        now: Instant,
    ) {
        let Some(conn) = self.conns.get_mut(&id) else {
            // Pool was forcefully torn down while the caller held the
            // connection; just close the stream.
            drop(transport);
            return;
        };
        assert_eq!(
            conn.state,
            ConnState::Active,
            "released a connection the pool does not consider active"
        );

        let max_recycle = self.cfg.keepalive_max_recycle;
        if recycle_intent && conn.can_recycle(max_recycle) && transport.is_some() {
            let held = conn.ts_assigned.map(|ts| now.duration_since(ts));
            conn.transport = transport;
            conn.mark_idle(now);
            self.busy.remove(&id);
            self.available.push(id);
            self.stats.recycled += 1;
            trace!(id, upstream = %self.cfg.addr(), ?held, "connection recycled");
        } else {
            debug!(id, upstream = %self.cfg.addr(), error = ?conn.net_error, "connection dropped on release");
            conn.state = ConnState::Destroying;
            // physical close happens here, exactly once
            drop(transport);
        }
    }

    /// Drop one guard reference. When the last guard on a condemned or
    /// never-connected entry goes away, destruction completes.
    fn release_guard(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        assert!(conn.guards > 0, "connection guard refcount underflow");
        conn.guards -= 1;
        if conn.guards == 0
            && (conn.doomed || matches!(conn.state, ConnState::Connecting | ConnState::Destroying))
        {
            self.finish_destroy(id);
        }
    }

    fn mark_error(&mut self, id: ConnId, kind: io::ErrorKind) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.mark_error(kind);
            self.stats.errors += 1;
        }
    }

    /// Reap timed-out connections.
    ///
    /// Idle entries past the keepalive window are destroyed on the spot:
    /// nothing can hold a guard on an idle connection. Mid-connect entries
    /// past their deadline are condemned; if the opening caller still holds
    /// its guard (it is suspended inside the connect await), the entry is
    /// parked on the pending list and destroyed when that guard drops.
    pub(crate) fn sweep(&mut self, now: Instant) {
        debug_assert_eq!(
            self.conns.values().filter(|c| c.state.is_live()).count(),
            self.live(),
            "arena out of sync with index sets"
        );

        let idle_timeout = self.cfg.keepalive_idle_timeout;
        let expired: Vec<ConnId> = self
            .available
            .iter()
            .copied()
            .filter(|id| {
                self.conns
                    .get(id)
                    .is_some_and(|c| c.idle_expired(now, idle_timeout))
            })
            .collect();
        for id in expired {
            debug!(id, upstream = %self.cfg.addr(), "idle keepalive connection timed out");
            self.finish_destroy(id);
        }

        let overdue: Vec<ConnId> = self
            .busy
            .iter()
            .copied()
            .filter(|id| self.conns.get(id).is_some_and(|c| c.connect_expired(now)))
            .collect();
        for id in overdue {
            let deferred = {
                let conn = self.conns.get_mut(&id).expect("busy entry missing from arena");
                conn.mark_error(io::ErrorKind::TimedOut);
                if conn.guards == 0 {
                    false
                } else {
                    conn.doomed = true;
                    conn.state = ConnState::Destroying;
                    true
                }
            };
            if deferred {
                warn!(id, upstream = %self.cfg.addr(), "connect timed out, deferring destruction until the holder resumes");
                self.busy.remove(&id);
                self.pending.push(id);
            } else {
                warn!(id, upstream = %self.cfg.addr(), "connect timed out");
                self.finish_destroy(id);
            }
        }
    }

    /// Remove an entry from every set and tear down its transport.
    fn finish_destroy(&mut self, id: ConnId) {
        self.available.retain(|&x| x != id);
        self.busy.remove(&id);
        self.pending.retain(|&x| x != id);
        if let Some(mut conn) = self.conns.remove(&id) {
            if conn.destroy() {
                self.stats.destroyed += 1;
            }
        }
    }

    /// Forced teardown: destroy every entry, guards or not. Outstanding
    /// handles find their entry gone and degrade to a local close.
    fn shutdown_all(&mut self) {
        if !self.conns.is_empty() {
            debug!(upstream = %self.cfg.addr(), count = self.conns.len(), "forced pool teardown");
        }
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            self.finish_destroy(id);
        }
    }
}

// ============================================================================
// Guard
// ============================================================================

/// One counted reference to a pooled connection. Held by the caller that
/// opened or checked out the connection, across every suspension point, so
/// the sweeper can never free the entry out from under a parked caller.
struct ConnGuard {
    inner: Rc<RefCell<PoolInner>>,
    id: ConnId,
}

impl ConnGuard {
    fn attach(inner: &Rc<RefCell<PoolInner>>, id: ConnId) -> Self {
        inner
            .borrow_mut()
            .conns
            .get_mut(&id)
            .expect("guard attached to unknown connection")
            .guards += 1;
        Self {
            inner: Rc::clone(inner),
            id,
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.inner.borrow_mut().release_guard(self.id);
    }
}

// ============================================================================
// Caller handle
// ============================================================================

/// A checked-out upstream connection.
///
/// Dropping the handle releases the connection: back into the pool when it
/// is keepalive-eligible and error-free, otherwise the stream is closed.
/// Use [`UpstreamConn::release`] to make the intent explicit.
pub struct UpstreamConn {
    pub(crate) transport: Option<Transport>,
    recycle_intent: bool,
    guard: ConnGuard,
}

impl UpstreamConn {
    fn checked_out(transport: Transport, guard: ConnGuard) -> Self {
        Self {
            transport: Some(transport),
            recycle_intent: true,
            guard,
        }
    }

    /// Pool-local identifier of this connection.
    pub fn id(&self) -> ConnId {
        self.guard.id
    }

    /// How many times this connection has been returned to the pool.
    pub fn recycle_count(&self) -> u32 {
        self.guard
            .inner
            .borrow()
            .conns
            .get(&self.guard.id)
            .map_or(0, |c| c.recycle_count)
    }

    /// Time since this connection was opened.
    pub fn age(&self) -> Duration {
        self.guard
            .inner
            .borrow()
            .conns
            .get(&self.guard.id)
            .map_or(Duration::ZERO, |c| Instant::now().duration_since(c.ts_created))
    }

    /// Turn keepalive on or off for this connection. Off makes the next
    /// release destroy it regardless of the release intent.
    pub fn set_recycle(&self, enabled: bool) {
        if let Some(conn) = self
            .guard
            .inner
            .borrow_mut()
            .conns
            .get_mut(&self.guard.id)
        {
            conn.recycle = enabled;
        }
    }

    /// Record a network error against this connection. An errored
    /// connection is never returned to the pool.
    pub fn mark_error(&self, kind: io::ErrorKind) {
        self.guard.inner.borrow_mut().mark_error(self.guard.id, kind);
    }

    /// Release the connection with an explicit recycle intent.
    pub fn release(mut self, recycle: bool) {
        self.recycle_intent = recycle;
    }

    /// Record the failure from an I/O result on this connection, if it is
    /// fatal to the transport.
    pub(crate) fn note_failure(&self, err: &UpstreamError) {
        if let Some(kind) = err.io_kind() {
            self.mark_error(kind);
        }
    }
}

impl std::fmt::Debug for UpstreamConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConn")
            .field("id", &self.guard.id)
            .field("recycle_intent", &self.recycle_intent)
            .finish_non_exhaustive()
    }
}

impl Drop for UpstreamConn {
    fn drop(&mut self) {
        let transport = self.transport.take();
        let now = Instant::now();
        self.guard
            .inner
            .borrow_mut()
            .release(self.guard.id, transport, self.recycle_intent, now);
        // the guard field drops right after and finishes any destruction
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Connection pool for a single upstream target.
pub struct Upstream {
    inner: Rc<RefCell<PoolInner>>,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl Upstream {
    /// Create a plain-TCP pool. Fails when the configuration asks for TLS;
    /// use [`Upstream::with_tls`] for that.
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        if config.use_tls {
            return Err(UpstreamError::TlsNotConfigured);
        }
        Ok(Self {
            inner: PoolInner::shared(config),
            tls: None,
        })
    }

    /// Create a TLS pool. The client configuration (root store, ALPN, ...)
    /// is loaded by the caller; this crate only runs sessions over it.
    pub fn with_tls(mut config: UpstreamConfig, tls_config: Arc<ClientConfig>) -> Result<Self> {
        let name = ServerName::try_from(config.host.clone())
            .map_err(|_| UpstreamError::InvalidServerName(config.host.clone()))?;
        config.use_tls = true;
        Ok(Self {
            inner: PoolInner::shared(config),
            tls: Some((TlsConnector::from(tls_config), name)),
        })
    }

    /// Snapshot of this pool's configuration.
    pub fn config(&self) -> UpstreamConfig {
        self.inner.borrow().cfg.clone()
    }

    /// Check out a connection: the most recently released idle one when
    /// available, otherwise a freshly opened one while under the cap.
    ///
    /// Opening a connection registers the entry before the first await, so
    /// a sweep that runs while the connect is parked can apply the connect
    /// timeout to it.
    pub async fn acquire(&self) -> Result<UpstreamConn> {
        let now = Instant::now();
        // bind first so the borrow ends before the guard re-borrows the pool
        let reused = self.inner.borrow_mut().checkout_idle(now);
        if let Some((id, transport)) = reused {
            let guard = ConnGuard::attach(&self.inner, id);
            return Ok(UpstreamConn::checked_out(transport, guard));
        }

        let (host, port, connect_timeout) = {
            let inner = self.inner.borrow();
            (
                inner.cfg.host.clone(),
                inner.cfg.port,
                inner.cfg.connect_timeout,
            )
        };
        let deadline = now + connect_timeout;
        // an elapsed deadline resolves before any socket work, matching the
        // deadline-bounded I/O path
        if deadline <= Instant::now() {
            return Err(UpstreamError::ConnectTimeout(connect_timeout));
        }
        let id = self.inner.borrow_mut().register_connecting(now, deadline)?;
        let guard = ConnGuard::attach(&self.inner, id);

        let attempt = timeout_at(deadline, Transport::open(&host, port, self.tls.as_ref())).await;
        match attempt {
            Ok(Ok(transport)) => {
                let mut inner = self.inner.borrow_mut();
                let conn = inner.conns.get_mut(&id).expect("connecting entry vanished");
                if conn.doomed {
                    // A sweep condemned this entry while the connect was
                    // parked; honor the verdict. The guard drop below
                    // completes the entry teardown, dropping the transport
                    // closes the socket we just opened.
                    drop(inner);
                    drop(guard);
                    drop(transport);
                    return Err(UpstreamError::ConnectTimeout(connect_timeout));
                }
                let connected_at = Instant::now();
                trace!(
                    id,
                    elapsed = ?connected_at.duration_since(conn.ts_connect_start),
                    "upstream connection established"
                );
                conn.mark_connected(connected_at);
                inner.stats.opened += 1;
                drop(inner);
                Ok(UpstreamConn::checked_out(transport, guard))
            }
            Ok(Err(err)) => {
                self.inner.borrow_mut().note_connect_failure(id, &err);
                drop(guard);
                Err(err)
            }
            Err(_elapsed) => {
                let err = UpstreamError::ConnectTimeout(connect_timeout);
                self.inner.borrow_mut().note_connect_failure(id, &err);
                drop(guard);
                Err(err)
            }
        }
    }

    /// Run one maintenance pass with the given clock reading. Normally
    /// driven by a [`crate::Sweeper`] on a timer tick.
    pub fn sweep(&self, now: Instant) {
        self.inner.borrow_mut().sweep(now);
    }

    /// Destroy every connection in the pool, referenced or not. Called
    /// automatically when the pool is dropped.
    pub fn shutdown(&self) {
        self.inner.borrow_mut().shutdown_all();
    }

    /// Idle connections ready for reuse.
    pub fn available_count(&self) -> usize {
        self.inner.borrow().available.len()
    }

    /// Connections checked out or mid-connect.
    pub fn busy_count(&self) -> usize {
        self.inner.borrow().busy.len()
    }

    /// Condemned connections waiting on an outstanding reference.
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Connections counting against the pool cap.
    pub fn live(&self) -> usize {
        self.inner.borrow().live()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> UpstreamStats {
        self.inner.borrow().stats
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<PoolInner>> {
        Rc::downgrade(&self.inner)
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Upstream")
            .field("addr", &inner.cfg.addr())
            .field("tls", &self.tls.is_some())
            .field("available", &inner.available.len())
            .field("busy", &inner.busy.len())
            .field("pending", &inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolInner {
    fn note_connect_failure(&mut self, id: ConnId, err: &UpstreamError) {
        if let Some(kind) = err.io_kind() {
            self.mark_error(id, kind);
        }
        debug!(id, upstream = %self.cfg.addr(), %err, "upstream connect failed");
        // entry teardown completes when the opener's guard drops
    }
}

#[cfg(test)]
impl Upstream {
    /// Membership invariants: every live entry is in exactly one index set,
    /// pending entries are doomed and guarded, and nothing is duplicated.
    pub(crate) fn assert_consistent(&self) {
        let inner = self.inner.borrow();
        for id in &inner.available {
            let conn = &inner.conns[id];
            assert_eq!(conn.state, ConnState::Idle);
            assert!(conn.transport.is_some(), "idle entry without transport");
            assert!(!inner.busy.contains(id), "entry in both available and busy");
        }
        for id in &inner.busy {
            let conn = &inner.conns[id];
            assert!(matches!(conn.state, ConnState::Connecting | ConnState::Active));
        }
        for id in &inner.pending {
            let conn = &inner.conns[id];
            assert!(conn.doomed);
            assert!(conn.guards > 0, "pending entry with no outstanding guard");
        }
        assert_eq!(
            inner.conns.len(),
            inner.available.len() + inner.busy.len() + inner.pending.len(),
            "arena size does not match index sets"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::task::{self, LocalSet};

    /// Accepts connections and holds them open without ever writing.
    async fn sink_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });
        (addr, handle)
    }

    fn pool_for(addr: SocketAddr) -> Upstream {
        let cfg = UpstreamConfig::new(addr.ip().to_string(), addr.port());
        Upstream::new(cfg).unwrap()
    }

    fn tls_client_config() -> Arc<ClientConfig> {
        // pick a process-level provider; more than one backend is compiled in
        let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();
        let roots = tokio_rustls::rustls::RootCertStore::empty();
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    #[tokio::test]
    async fn respects_cap_then_reuses_lifo() {
        let (addr, _srv) = sink_server().await;
        let cfg = UpstreamConfig::new(addr.ip().to_string(), addr.port()).max_connections(2);
        let pool = Upstream::new(cfg).unwrap();

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.busy_count(), 2);
        assert_eq!(pool.available_count(), 0);
        pool.assert_consistent();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, UpstreamError::PoolExhausted { max: 2 }));
        assert_eq!(pool.stats().exhausted, 1);
        // exhaustion never touches existing connections
        assert_eq!(pool.busy_count(), 2);

        let first_id = first.id();
        drop(first);
        assert_eq!(pool.busy_count(), 1);
        assert_eq!(pool.available_count(), 1);
        pool.assert_consistent();

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), first_id, "expected the released connection back");
        assert_eq!(again.recycle_count(), 1);
        assert_eq!(pool.stats().opened, 2);
        assert_eq!(pool.stats().reused, 1);

        drop(again);
        drop(second);
        pool.assert_consistent();
    }

    #[tokio::test]
    async fn lifo_prefers_most_recently_released() {
        let (addr, _srv) = sink_server().await;
        let pool = pool_for(addr);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        let second_id = second.id();
        drop(first);
        drop(second);
        assert_eq!(pool.available_count(), 2);

        let next = pool.acquire().await.unwrap();
        assert_eq!(next.id(), second_id, "last released must be first reused");
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_idle_connection() {
        let (addr, _srv) = sink_server().await;
        let pool = pool_for(addr);
        let idle_timeout = pool.config().keepalive_idle_timeout;

        let conn = pool.acquire().await.unwrap();
        let old_id = conn.id();
        drop(conn);
        assert_eq!(pool.available_count(), 1);

        pool.sweep(Instant::now() + idle_timeout + Duration::from_secs(1));
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.stats().destroyed, 1);
        pool.assert_consistent();

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), old_id);
        assert_eq!(pool.stats().opened, 2);
    }

    #[tokio::test]
    async fn sweep_before_idle_timeout_keeps_connection() {
        let (addr, _srv) = sink_server().await;
        let pool = pool_for(addr);

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        pool.sweep(Instant::now());
        assert_eq!(pool.available_count(), 1);
        assert_eq!(pool.stats().destroyed, 0);
    }

    #[tokio::test]
    async fn mark_error_forces_destruction_on_release() {
        let (addr, _srv) = sink_server().await;
        let pool = pool_for(addr);

        let conn = pool.acquire().await.unwrap();
        conn.mark_error(io::ErrorKind::ConnectionReset);
        conn.release(true); // recycle intent is overridden by the error
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.stats().destroyed, 1);
        assert_eq!(pool.stats().recycled, 0);
        assert_eq!(pool.stats().errors, 1);
        pool.assert_consistent();
    }

    #[tokio::test]
    async fn explicit_release_without_recycle_destroys() {
        let (addr, _srv) = sink_server().await;
        let pool = pool_for(addr);

        let conn = pool.acquire().await.unwrap();
        conn.release(false);
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn set_recycle_off_makes_connection_single_use() {
        let (addr, _srv) = sink_server().await;
        let pool = pool_for(addr);

        let conn = pool.acquire().await.unwrap();
        conn.set_recycle(false);
        drop(conn);
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn keepalive_disabled_makes_connections_single_use() {
        let (addr, _srv) = sink_server().await;
        let cfg = UpstreamConfig::new(addr.ip().to_string(), addr.port()).keepalive(false);
        let pool = Upstream::new(cfg).unwrap();

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.stats().destroyed, 1);
        assert_eq!(pool.stats().recycled, 0);
    }

    #[tokio::test]
    async fn recycle_limit_forces_destruction() {
        let (addr, _srv) = sink_server().await;
        let cfg = UpstreamConfig::new(addr.ip().to_string(), addr.port()).keepalive_max_recycle(1);
        let pool = Upstream::new(cfg).unwrap();

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.available_count(), 1);
        assert_eq!(pool.stats().recycled, 1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.recycle_count(), 1);
        drop(conn); // limit reached: destroyed instead of recycled
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.stats().recycled, 1);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn connect_with_past_deadline_times_out() {
        // Port from a listener that was dropped: connect would fail fast,
        // but the elapsed deadline must win and report a connect timeout.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let cfg = UpstreamConfig::new(addr.ip().to_string(), addr.port())
            .connect_timeout(Duration::ZERO);
        let pool = Upstream::new(cfg).unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, UpstreamError::ConnectTimeout(_)));
        assert_eq!(pool.live(), 0, "failed connect must not leak an entry");
        // the elapsed deadline resolves before any entry is registered
        assert_eq!(pool.stats().opened, 0);
        assert_eq!(pool.stats().destroyed, 0);
        pool.assert_consistent();
    }

    #[tokio::test]
    async fn connect_refused_destroys_entry_and_propagates() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let pool = pool_for(addr);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Connect(_)));
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.stats().destroyed, 1);
        assert_eq!(pool.stats().errors, 1);
        pool.assert_consistent();
    }

    #[tokio::test]
    async fn sweep_defers_destruction_of_guarded_connect() {
        // TLS against a server that accepts and stays silent: the handshake
        // parks forever, which models a caller suspended mid-connect.
        let (addr, _srv) = sink_server().await;
        let cfg = UpstreamConfig::new(addr.ip().to_string(), addr.port())
            .connect_timeout(Duration::from_secs(60));
        let pool = Rc::new(Upstream::with_tls(cfg, tls_client_config()).unwrap());

        let local = LocalSet::new();
        local
            .run_until(async {
                let p = Rc::clone(&pool);
                let opener = task::spawn_local(async move { p.acquire().await });

                // let the opener register its entry and park in the handshake
                while pool.busy_count() == 0 {
                    task::yield_now().await;
                }
                for _ in 0..10 {
                    task::yield_now().await;
                }

                // a sweep far in the future condemns the entry but must not
                // destroy it while the opener still holds its guard
                pool.sweep(Instant::now() + Duration::from_secs(120));
                assert_eq!(pool.pending_count(), 1);
                assert_eq!(pool.busy_count(), 0);
                assert_eq!(pool.stats().destroyed, 0, "guarded entry must survive the sweep");
                pool.assert_consistent();

                // once the holder goes away the destruction completes
                opener.abort();
                let _ = opener.await;
                assert_eq!(pool.pending_count(), 0);
                assert_eq!(pool.stats().destroyed, 1);
                assert_eq!(pool.live(), 0);
                pool.assert_consistent();
            })
            .await;
    }

    #[tokio::test]
    async fn forced_shutdown_destroys_everything_once() {
        let (addr, _srv) = sink_server().await;
        let pool = pool_for(addr);

        let held = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        drop(idle);
        assert_eq!(pool.busy_count(), 1);
        assert_eq!(pool.available_count(), 1);

        pool.shutdown();
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.stats().destroyed, 2);

        // the stale handle degrades to a local close, nothing double-counts
        drop(held);
        assert_eq!(pool.stats().destroyed, 2);

        // shutting down again is a no-op
        pool.shutdown();
        assert_eq!(pool.stats().destroyed, 2);
    }

    #[tokio::test]
    async fn pool_and_handle_have_debug_representations() {
        let (addr, _srv) = sink_server().await;
        let pool = pool_for(addr);
        let conn = pool.acquire().await.unwrap();
        let repr = format!("{pool:?} {conn:?}");
        assert!(repr.contains("Upstream"));
        assert!(repr.contains("UpstreamConn"));
    }

    #[tokio::test]
    async fn tls_pool_requires_valid_server_name() {
        let cfg = UpstreamConfig::new("not a hostname", 443);
        let err = Upstream::with_tls(cfg, tls_client_config()).unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidServerName(_)));
    }

    #[tokio::test]
    async fn plain_pool_rejects_tls_config_flag() {
        let cfg = UpstreamConfig::new("127.0.0.1", 443).use_tls(true);
        let err = Upstream::new(cfg).unwrap_err();
        assert!(matches!(err, UpstreamError::TlsNotConfigured));
    }
}
