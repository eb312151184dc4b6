use crate::backup::shutdown::Shutdown;

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Counting semaphore bounding how many games back up at once.
///
/// Built fresh for every scheduler pass, so a config change to the limit
/// takes effect on the next pass.
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<SlotInner>,
}

struct SlotInner {
    limit: usize,
    in_use: Mutex<usize>,
    released: Condvar,
}

impl SlotPool {
    pub fn new(limit: usize) -> SlotPool {
        Self {
            inner: Arc::new(SlotInner {
                limit: limit.max(1),
                in_use: Mutex::new(0),
                released: Condvar::new(),
            }),
        }
    }

    /// Blocks until a slot frees up; gives up with `None` once shutdown is
    /// requested.
    pub fn acquire(&self, shutdown: &Shutdown) -> Option<SlotGuard> {
        let mut in_use = self
            .inner
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if shutdown.is_requested() {
                return None;
            }
            if *in_use < self.inner.limit {
                *in_use += 1;
                return Some(SlotGuard {
                    inner: Arc::clone(&self.inner),
                });
            }
            // The shutdown flag has its own condvar, so wake periodically
            // to recheck it.
            let (guard, _) = self
                .inner
                .released
                .wait_timeout(in_use, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner);
            in_use = guard;
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn in_use(&self) -> usize {
        *self
            .inner
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its slot on drop.
pub struct SlotGuard {
    inner: Arc<SlotInner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut in_use = self
            .inner
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *in_use = in_use.saturating_sub(1);
        self.inner.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_concurrent_holders_never_exceed_limit() {
        let pool = SlotPool::new(3);
        let shutdown = Shutdown::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let shutdown = shutdown.clone();
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    let guard = pool.acquire(&shutdown).unwrap();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    current.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_acquire_after_shutdown_returns_none() {
        let pool = SlotPool::new(2);
        let shutdown = Shutdown::new();
        shutdown.request();

        assert!(pool.acquire(&shutdown).is_none());
    }

    #[test]
    fn test_shutdown_interrupts_a_waiting_acquire() {
        let pool = SlotPool::new(1);
        let shutdown = Shutdown::new();
        let held = pool.acquire(&shutdown).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiting_pool = pool.clone();
        let waiting_shutdown = shutdown.clone();
        let handle = std::thread::spawn(move || {
            let acquired = waiting_pool.acquire(&waiting_shutdown).is_some();
            tx.send(acquired).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        shutdown.request();

        let acquired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!acquired);
        handle.join().unwrap();
        drop(held);
    }

    #[test]
    fn test_dropping_a_guard_frees_its_slot() {
        let pool = SlotPool::new(1);
        let shutdown = Shutdown::new();

        let first = pool.acquire(&shutdown).unwrap();
        assert_eq!(pool.in_use(), 1);
        drop(first);
        assert_eq!(pool.in_use(), 0);

        assert!(pool.acquire(&shutdown).is_some());
    }

    #[test]
    fn test_zero_limit_is_clamped_to_one() {
        let pool = SlotPool::new(0);
        let shutdown = Shutdown::new();
        assert_eq!(pool.limit(), 1);
        assert!(pool.acquire(&shutdown).is_some());
    }
}
