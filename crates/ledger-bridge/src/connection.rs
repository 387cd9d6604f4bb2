//! Lazily created, shared remote connection
//!
//! Several code paths (push subscriptions for different records) may race to
//! open the same connection. Creation is serialized behind an async lock and
//! re-checked under it, so concurrent callers share one connection.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct LazyConnection<T> {
    slot: Mutex<Option<Arc<T>>>,
    connects: AtomicUsize,
}

impl<T> LazyConnection<T> {
    /// Create a new, empty slot
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            connects: AtomicUsize::new(0),
        }
    }

    /// Return the live connection, creating it if there is none or the
    /// current one is no longer alive.
    pub async fn get_or_connect<F, Fut, E>(
        &self,
        is_alive: impl Fn(&T) -> bool,
        connect: F,
    ) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(existing) = slot.as_ref() {
            if is_alive(existing) {
                return Ok(existing.clone());
            }
            tracing::debug!("Cached connection is dead, reconnecting");
        }

        let connection = Arc::new(connect().await?);
        self.connects.fetch_add(1, Ordering::SeqCst);
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Number of connections created so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Drop the cached connection
    pub async fn close(&self) {
        self.slot.lock().await.take();
    }
}

impl<T> Default for LazyConnection<T> {
    fn default() -> Self {
        Self::new()
    }
}
