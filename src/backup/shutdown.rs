use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Cooperative stop flag shared between the scheduler loop and its workers.
///
/// `request` is sticky: once set, every `sleep` returns immediately and
/// pending slot waits give up.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    requested: Mutex<bool>,
    wakeup: Condvar,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Self::default()
    }

    pub fn request(&self) {
        let mut requested = self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *requested = true;
        self.inner.wakeup.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps up to `duration`, waking early on shutdown. Returns true when
    /// the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let requested = self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (requested, _) = self
            .inner
            .wakeup
            .wait_timeout_while(requested, duration, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);
        !*requested
    }
}
