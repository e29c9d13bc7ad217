//! Tab pool
//!
//! Fixed-capacity pool of browser tabs. `acquire` waits until a tab is idle;
//! the returned `PooledTab` hands the tab back when dropped, so every exit
//! path of a task releases its tab. Tabs are only added by startup and
//! recycling (`put_new`) and only removed by recycling (`retire`) or
//! shutdown (`drain`).

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::backend::Tab;

#[derive(Debug, Error, PartialEq)]
pub enum PoolError {
    #[error("tab pool is shut down")]
    Closed,
}

struct PoolInner {
    idle: Mutex<VecDeque<Arc<dyn Tab>>>,
    /// One permit per idle tab
    available: Semaphore,
    /// Idle plus checked out
    size: AtomicUsize,
    checked_out: AtomicUsize,
    capacity: usize,
}

impl PoolInner {
    fn push(&self, tab: Arc<dyn Tab>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(tab);
        self.available.add_permits(1);
    }
}

/// Shared handle to the pool
#[derive(Clone)]
pub struct TabPool {
    inner: Arc<PoolInner>,
}

impl TabPool {
    /// Create an empty pool; fill it with `put_new`
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(VecDeque::with_capacity(capacity)),
                available: Semaphore::new(0),
                size: AtomicUsize::new(0),
                checked_out: AtomicUsize::new(0),
                capacity,
            }),
        }
    }

    /// Add a freshly opened tab
    pub fn put_new(&self, tab: Arc<dyn Tab>) {
        self.inner.size.fetch_add(1, Ordering::SeqCst);
        self.inner.push(tab);
    }

    /// Wait for an idle tab
    pub async fn acquire(&self) -> Result<PooledTab, PoolError> {
        let permit = self
            .inner
            .available
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;
        permit.forget();

        // Permits never exceed idle tabs: push happens before add_permits
        // and the pop below follows the forget.
        let tab = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or(PoolError::Closed)?;

        self.inner.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(PooledTab {
            tab,
            pool: self.inner.clone(),
            retired: false,
        })
    }

    /// Close the pool and take every idle tab out of it
    pub fn drain(&self) -> Vec<Arc<dyn Tab>> {
        self.inner.available.close();
        let tabs: Vec<_> = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        self.inner.size.fetch_sub(tabs.len(), Ordering::SeqCst);
        tabs
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.inner.available.available_permits()
    }

    pub fn checked_out(&self) -> usize {
        self.inner.checked_out.load(Ordering::SeqCst)
    }
}

/// A tab checked out of the pool; returns itself on drop
pub struct PooledTab {
    tab: Arc<dyn Tab>,
    pool: Arc<PoolInner>,
    retired: bool,
}

impl PooledTab {
    /// Give the tab back now
    pub fn release(self) {
        drop(self);
    }

    /// Take the tab out of the pool for good (recycling); the caller closes it
    pub fn retire(mut self) -> Arc<dyn Tab> {
        self.retired = true;
        self.pool.size.fetch_sub(1, Ordering::SeqCst);
        self.tab.clone()
    }
}

impl fmt::Debug for PooledTab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledTab")
            .field("tab", &self.tab.id())
            .field("retired", &self.retired)
            .finish()
    }
}

impl Deref for PooledTab {
    type Target = dyn Tab;

    fn deref(&self) -> &Self::Target {
        self.tab.as_ref()
    }
}

impl Drop for PooledTab {
    fn drop(&mut self) {
        self.pool.checked_out.fetch_sub(1, Ordering::SeqCst);
        if !self.retired {
            self.pool.push(self.tab.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBrowser, TabScript};
    use std::collections::HashSet;
    use tokio_test::{assert_pending, assert_ready};

    async fn filled_pool(n: usize) -> TabPool {
        let browser = MockBrowser::new(TabScript::default());
        let pool = TabPool::new(n);
        for tab in browser.tabs(n).await {
            pool.put_new(tab);
        }
        pool
    }

    #[tokio::test]
    async fn test_acquire_release_balanced() {
        let pool = filled_pool(2).await;
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.idle(), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.checked_out(), 2);
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.size(), 2);

        a.release();
        drop(b);
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = filled_pool(1).await;
        let held = pool.acquire().await.unwrap();

        let mut waiter = tokio_test::task::spawn(pool.acquire());
        assert_pending!(waiter.poll());

        held.release();
        assert!(waiter.is_woken());
        let tab = assert_ready!(waiter.poll()).unwrap();
        assert_eq!(tab.id(), "mock-0");
        assert_eq!(format!("{:?}", tab), r#"PooledTab { tab: "mock-0", retired: false }"#);
    }

    #[tokio::test]
    async fn test_retire_and_replace() {
        let browser = MockBrowser::new(TabScript::default());
        let pool = TabPool::new(1);
        for tab in browser.tabs(1).await {
            pool.put_new(tab);
        }

        let old = pool.acquire().await.unwrap().retire();
        assert_eq!(old.id(), "mock-0");
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(pool.idle(), 0);

        for tab in browser.tabs(1).await {
            pool.put_new(tab);
        }
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.acquire().await.unwrap().id(), "mock-1");
    }

    #[tokio::test]
    async fn test_drain_closes_pool() {
        let pool = filled_pool(3).await;
        let held = pool.acquire().await.unwrap();

        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.acquire().await.err(), Some(PoolError::Closed));
        drop(held);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkout_never_double_hands() {
        let pool = filled_pool(3).await;
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let pool = pool.clone();
            let in_use = in_use.clone();
            handles.push(tokio::spawn(async move {
                let tab = pool.acquire().await.unwrap();
                assert!(in_use.lock().unwrap().insert(tab.id().to_string()));
                assert!(pool.checked_out() <= pool.capacity());
                tokio::task::yield_now().await;
                in_use.lock().unwrap().remove(tab.id());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(pool.size(), 3);
        assert_eq!(pool.idle(), 3);
        assert_eq!(pool.checked_out(), 0);
    }
}
