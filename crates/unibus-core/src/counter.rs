//! Live-byte accounting.
//!
//! A [`Counter`] tracks the total size of messages that have been parsed
//! but not yet released by the application. The transport registers a
//! notify hook at its receive threshold; the hook fires whenever the value
//! crosses the threshold in either direction.
//!
//! The hook may run on whatever thread adjusts the counter (typically the
//! thread dropping a message), so it is restricted by contract to flipping
//! a flag. The transport observes the flag under the connection lock on
//! its next iteration and re-evaluates the read watch there.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Mutex;

/// Hook invoked on threshold crossings. Must only flip a flag.
pub type NotifyHook = std::sync::Arc<dyn Fn() + Send + Sync>;

struct Notify {
    threshold: usize,
    hook: NotifyHook,
}

/// Thread-safe byte counter with threshold notification.
#[derive(Default)]
pub struct Counter {
    value: AtomicIsize,
    notify: Mutex<Option<Notify>>,
}

impl Counter {
    /// Creates a counter at zero with no notify hook.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, clamped at zero.
    #[must_use]
    pub fn value(&self) -> usize {
        self.value.load(Ordering::SeqCst).max(0).unsigned_abs()
    }

    /// Adds `delta` (may be negative) and fires the notify hook if the
    /// threshold was crossed in either direction.
    pub fn adjust(&self, delta: isize) {
        let old = self.value.fetch_add(delta, Ordering::SeqCst);
        let new = old + delta;

        let hook = {
            let slot = self.notify.lock().expect("counter notify lock poisoned");
            slot.as_ref().and_then(|n| {
                #[allow(clippy::cast_possible_wrap)]
                let threshold = n.threshold as isize;
                let crossed = (old >= threshold) != (new >= threshold);
                crossed.then(|| n.hook.clone())
            })
        };
        if let Some(hook) = hook {
            tracing::trace!(old, new, "live-byte counter crossed threshold");
            hook();
        }
    }

    /// Installs or clears the notify hook and its threshold.
    pub fn set_notify(&self, threshold: usize, hook: Option<NotifyHook>) {
        let mut slot = self.notify.lock().expect("counter notify lock poisoned");
        *slot = hook.map(|hook| Notify { threshold, hook });
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("value", &self.value.load(Ordering::SeqCst))
            .finish()
    }
}
