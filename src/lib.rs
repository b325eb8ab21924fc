//! # Outflow
//!
//! Upstream connection pooling for log and metrics forwarders: reusable
//! TCP (optionally TLS-wrapped) connections to remote endpoints, handed
//! out to forwarding tasks on a single-threaded cooperative runtime and
//! reclaimed by keepalive, timeout, and error policy.
//!
//! ## Features
//!
//! - **Keepalive reuse**: released connections return to a per-target pool
//!   and are reused LIFO, so the warmest TLS session goes out first
//! - **Lifecycle safety**: a connection referenced by a task suspended in
//!   an I/O await is never destroyed out from under it; timed-out entries
//!   are condemned and reclaimed when the last reference drops
//! - **Deadlines everywhere**: connect, handshake, read, and write all
//!   carry absolute deadlines; expiry is a distinct timeout error and the
//!   connection is destroyed, never silently retried
//! - **TLS sessions**: rustls-backed, one session per connection, config
//!   supplied by the caller
//! - **Sweeper**: timer-driven reclamation of idle and stuck connections
//!   across all registered pools
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use outflow::{Upstream, UpstreamConfig};
//! use std::time::Duration;
//! use tokio::time::Instant;
//!
//! fn main() -> outflow::Result<()> {
//!     let rt = tokio::runtime::Builder::new_current_thread()
//!         .enable_all()
//!         .build()?;
//!     let local = tokio::task::LocalSet::new();
//!     local.block_on(&rt, async {
//!         let pool = Upstream::new(UpstreamConfig::new("127.0.0.1", 24224))?;
//!
//!         let mut conn = pool.acquire().await?;
//!         let deadline = Instant::now() + Duration::from_secs(5);
//!         conn.write_all(b"log chunk", deadline).await?;
//!         conn.release(true);
//!
//!         pool.sweep(Instant::now());
//!         Ok(())
//!     })
//! }
//! ```
//!
//! The pool types are `!Send` by design: the original deployment model is
//! one cooperative event loop per forwarding engine, so collections are
//! mutated without locks and the only cross-task hazard (a sweep racing a
//! suspended I/O caller) is handled by per-connection reference guards.

mod config;
mod conn;
mod error;
mod io;
mod pool;
mod sweeper;
mod transport;

pub use config::{NetErrorPolicy, UpstreamConfig};
pub use conn::ConnId;
pub use error::{Result, UpstreamError};
pub use pool::{Upstream, UpstreamConn, UpstreamStats};
pub use sweeper::Sweeper;
