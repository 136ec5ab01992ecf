//! Reader/writer monitor guarding one shared collection.

use std::fmt;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A named reader/writer monitor. Any number of readers may hold it at once
/// while no writer holds it or is queued ahead of them; a writer holds it
/// exclusively. Waiters are served in FIFO order, so a queued writer keeps
/// later readers out and a released writer lets the readers queued behind
/// it in together.
///
/// Every shared table gets its own `Monitor`, so independent tables never
/// contend with each other.
pub struct Monitor<T> {
    /// Name of the guarded collection, for tracing.
    name: &'static str,

    lock: RwLock<T>,
}

impl<T> Monitor<T> {
    /// Creates a new monitor guarding `value`.
    pub fn new(name: &'static str, value: T) -> Self {
        Monitor {
            name,
            lock: RwLock::new(value),
        }
    }

    /// Waits until read access is granted.
    pub async fn acquire_read(&self) -> RwLockReadGuard<'_, T> {
        pf_trace!(self.name; "acquire_read");
        self.lock.read().await
    }

    /// Waits until exclusive write access is granted.
    pub async fn acquire_write(&self) -> RwLockWriteGuard<'_, T> {
        pf_trace!(self.name; "acquire_write");
        self.lock.write().await
    }

    /// Gives up read access.
    pub fn release_read(&self, guard: RwLockReadGuard<'_, T>) {
        pf_trace!(self.name; "release_read");
        drop(guard);
    }

    /// Gives up write access.
    pub fn release_write(&self, guard: RwLockWriteGuard<'_, T>) {
        pf_trace!(self.name; "release_write");
        drop(guard);
    }
}

impl<T> fmt::Debug for Monitor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{self, Duration};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_readers() {
        let monitor = Monitor::new("numbers", vec![1, 2, 3]);
        let r1 = monitor.acquire_read().await;
        let r2 = monitor.acquire_read().await;
        assert_eq!(r1.len() + r2.len(), 6);
        monitor.release_read(r1);
        monitor.release_read(r2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writer_excludes_readers() {
        let monitor = Arc::new(Monitor::new("counter", 0u32));
        let mut w = monitor.acquire_write().await;

        let monitor_ref = monitor.clone();
        let reader =
            tokio::spawn(async move { *monitor_ref.acquire_read().await });
        time::sleep(Duration::from_millis(100)).await;
        assert!(!reader.is_finished());

        *w = 7;
        monitor.release_write(w);
        assert_eq!(reader.await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_writer_blocks_new_readers() {
        let monitor = Arc::new(Monitor::new("counter", 0u32));
        let r = monitor.acquire_read().await;

        let monitor_ref = monitor.clone();
        let writer = tokio::spawn(async move {
            let mut w = monitor_ref.acquire_write().await;
            *w += 1;
        });
        time::sleep(Duration::from_millis(100)).await;

        // a reader arriving after the queued writer sees its update
        let monitor_ref = monitor.clone();
        let late_reader =
            tokio::spawn(async move { *monitor_ref.acquire_read().await });
        time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());
        assert!(!late_reader.is_finished());

        monitor.release_read(r);
        writer.await.unwrap();
        assert_eq!(late_reader.await.unwrap(), 1);
    }
}
