//! Deadline-bounded I/O on pooled connections.
//!
//! Every operation carries an absolute deadline. A would-block condition
//! suspends the calling task on the runtime's reactor until the socket is
//! ready or the deadline fires, whichever comes first; a deadline already
//! in the past resolves to `IoTimeout` without suspending at all. Timeouts
//! and socket errors are recorded on the connection, so it can never be
//! recycled afterwards.

use std::future::Future;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

use crate::error::{Result, UpstreamError};
use crate::pool::UpstreamConn;

/// Run one I/O operation under an absolute deadline.
pub(crate) async fn with_deadline<T>(
    deadline: Instant,
    op: impl Future<Output = io::Result<T>>,
) -> Result<T> {
    if deadline <= Instant::now() {
        return Err(UpstreamError::IoTimeout);
    }
    match timeout_at(deadline, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(UpstreamError::Io(e)),
        Err(_) => Err(UpstreamError::IoTimeout),
    }
}

impl UpstreamConn {
    /// Read up to `buf.len()` bytes, waiting no later than `deadline`.
    pub async fn read(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        let transport = self
            .transport
            .as_mut()
            .expect("transport present while handle is live");
        let res = with_deadline(deadline, transport.read(buf)).await;
        self.note_io(&res);
        res
    }

    /// Write up to `buf.len()` bytes, waiting no later than `deadline`.
    pub async fn write(&mut self, buf: &[u8], deadline: Instant) -> Result<usize> {
        let transport = self
            .transport
            .as_mut()
            .expect("transport present while handle is live");
        let res = with_deadline(deadline, transport.write(buf)).await;
        self.note_io(&res);
        res
    }

    /// Write the whole buffer, waiting no later than `deadline`.
    pub async fn write_all(&mut self, buf: &[u8], deadline: Instant) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .expect("transport present while handle is live");
        let res = with_deadline(deadline, transport.write_all(buf)).await;
        self.note_io(&res);
        res
    }

    /// Flush buffered data (a no-op for plain TCP, drains TLS records).
    pub async fn flush(&mut self, deadline: Instant) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .expect("transport present while handle is live");
        let res = with_deadline(deadline, transport.flush()).await;
        self.note_io(&res);
        res
    }

    /// Gracefully shut down the write side (sends the TLS close-notify for
    /// encrypted connections). The connection will not be recycled after
    /// this.
    pub async fn shutdown(&mut self, deadline: Instant) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .expect("transport present while handle is live");
        let res = with_deadline(deadline, transport.shutdown()).await;
        self.note_io(&res);
        // a shut-down socket must never go back into the pool
        self.set_recycle(false);
        res
    }

    fn note_io<T>(&self, res: &Result<T>) {
        if let Err(err) = res {
            self.note_failure(err);
        }
    }
}
