//! Cooperative cancellation for callers blocked on the applier cursor.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Callback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, Callback>>,
}

/// Cloneable flag observed at well-defined wait points, never preemptively.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token cancelled and wakes every registered waiter.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = self.inner.callbacks.lock().unwrap();
        for callback in callbacks.values() {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Runs `callback` on cancellation for as long as the returned guard lives.
    ///
    /// Fires immediately when the token is already cancelled.
    pub fn on_cancel<F>(&self, callback: F) -> CancellationRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            callbacks.insert(id, Box::new(callback));
        }
        if self.is_cancelled() {
            if let Some(callback) = self.inner.callbacks.lock().unwrap().get(&id) {
                callback();
            }
        }
        CancellationRegistration {
            token: self.clone(),
            id,
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Unregisters its callback on drop.
pub struct CancellationRegistration {
    token: CancellationToken,
    id: u64,
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        self.token.inner.callbacks.lock().unwrap().remove(&self.id);
    }
}
