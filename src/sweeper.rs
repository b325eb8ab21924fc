//! Periodic maintenance over registered pools.
//!
//! The sweeper holds weak references to pool internals and applies the
//! keepalive-idle and connect timeouts on every tick. Pools that have been
//! dropped are pruned as they are encountered.

use std::cell::RefCell;
use std::rc::Weak;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

use crate::pool::{PoolInner, Upstream};

/// Timer-driven sweep over a set of upstream pools.
#[derive(Default)]
pub struct Sweeper {
    pools: RefCell<Vec<Weak<RefCell<PoolInner>>>>,
}

impl Sweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool to the maintenance set.
    pub fn register(&self, pool: &Upstream) {
        self.pools.borrow_mut().push(pool.downgrade());
    }

    /// Pools currently under maintenance.
    pub fn pool_count(&self) -> usize {
        self.pools.borrow().len()
    }

    /// Run one maintenance pass with the given clock reading.
    pub fn tick(&self, now: Instant) {
        let mut pools = self.pools.borrow_mut();
        let before = pools.len();
        pools.retain(|weak| match weak.upgrade() {
            Some(inner) => {
                inner.borrow_mut().sweep(now);
                true
            }
            None => false,
        });
        if pools.len() != before {
            trace!(pruned = before - pools.len(), "dropped pools pruned from sweeper");
        }
    }

    /// Tick forever on a fixed period. The sweeper is `!Send`; spawn this
    /// with `tokio::task::spawn_local` on the same thread as the pools.
    pub async fn run(self, period: Duration) {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick(Instant::now());
        }
    }
}
