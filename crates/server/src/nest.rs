//! The task nest.
//!
//! A structured-concurrency primitive owning the per-packet tasks spawned
//! by the pipeline. Shutdown closes the gate first, then waits for every
//! in-flight task to finish, so no task ever observes a half-torn-down
//! server. Tasks are never aborted; they are all short-lived or bounded by
//! oracle timeouts.

use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Owner of in-flight pipeline tasks with a join-all shutdown.
#[derive(Debug, Default)]
pub struct Nest {
    live: AtomicUsize,
    shut: AtomicBool,
    idle: Notify,
}

impl Nest {
    /// Creates an open nest.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawns a task into the nest. Returns `false` without spawning when
    /// the nest has been shut.
    pub fn hatch<F>(self: &Arc<Self>, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shut.load(Ordering::Acquire) {
            return false;
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        let nest = Arc::clone(self);
        tokio::spawn(async move {
            task.await;
            if nest.live.fetch_sub(1, Ordering::AcqRel) == 1 {
                nest.idle.notify_waiters();
            }
        });
        true
    }

    /// Waits until every task currently in the nest has finished.
    pub async fn drain(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.live.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Closes the gate and drains. Tasks hatched afterwards are refused.
    pub async fn close(&self) {
        self.shut.store(true, Ordering::Release);
        self.drain().await;
    }

    /// Number of tasks currently in flight.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}
