//! File-descriptor watches and timers.
//!
//! The transport never talks to an event loop directly. It creates
//! [`Watch`]es (and, for consumers that need them, [`Timeout`]s) and
//! registers them through the owning connection's [`Connection`]
//! contract; the host loop polls whatever is registered and calls back
//! into the transport with the observed [`Condition`].
//!
//! A watch can outlive its file descriptor: when the backend closes the
//! socket it *invalidates* the watch, so a stale callback from a loop
//! that has not yet processed the removal finds `fd() == -1` and is
//! dropped on the floor instead of touching a recycled descriptor.
//!
//! [`Connection`]: crate::connection::Connection

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

/// Readiness bit-set for a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Condition(u8);

impl Condition {
    /// No readiness at all.
    pub const NONE: Self = Self(0);
    /// The descriptor is readable.
    pub const READABLE: Self = Self(1);
    /// The descriptor is writable.
    pub const WRITABLE: Self = Self(1 << 1);
    /// The descriptor is in an error state.
    pub const ERROR: Self = Self(1 << 2);
    /// The peer hung up.
    pub const HANGUP: Self = Self(1 << 3);

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Condition {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Condition {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for Condition {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// A registration for readiness callbacks on one file descriptor.
#[derive(Debug)]
pub struct Watch {
    fd: AtomicI32,
    interest: Condition,
    enabled: AtomicBool,
}

impl Watch {
    /// Creates a watch on `fd` for the given interest set.
    #[must_use]
    pub fn new(fd: RawFd, interest: Condition, enabled: bool) -> Self {
        Self {
            fd: AtomicI32::new(fd),
            interest,
            enabled: AtomicBool::new(enabled),
        }
    }

    /// The watched descriptor, or -1 once invalidated.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    /// Severs the watch from its descriptor. Called by the backend right
    /// before the descriptor is closed.
    pub fn invalidate(&self) {
        self.fd.store(-1, Ordering::SeqCst);
    }

    /// The readiness bits this watch wants callbacks for.
    #[must_use]
    pub fn interest(&self) -> Condition {
        self.interest
    }

    /// Whether the host loop should currently poll this watch.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flips the enabled state. The backend pairs this with a
    /// [`Connection::watch_toggled`] notification.
    ///
    /// [`Connection::watch_toggled`]: crate::connection::Connection::watch_toggled
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Strips readiness bits the watch never asked for. Error and hangup
    /// always pass through; a loop may report them regardless of
    /// interest.
    #[must_use]
    pub fn sanitize_condition(&self, condition: Condition) -> Condition {
        let mut sanitized = condition & (Condition::ERROR | Condition::HANGUP);
        if self.interest.contains(Condition::READABLE) && condition.contains(Condition::READABLE) {
            sanitized |= Condition::READABLE;
        }
        if self.interest.contains(Condition::WRITABLE) && condition.contains(Condition::WRITABLE) {
            sanitized |= Condition::WRITABLE;
        }
        sanitized
    }
}

/// A registration for a timer callback with the host loop.
#[derive(Debug)]
pub struct Timeout {
    interval_ms: AtomicU64,
    enabled: AtomicBool,
}

impl Timeout {
    /// Creates an enabled timeout firing every `interval_ms`.
    #[must_use]
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: AtomicU64::new(interval_ms),
            enabled: AtomicBool::new(true),
        }
    }

    /// Current interval in milliseconds.
    #[must_use]
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::SeqCst)
    }

    /// Changes the interval; takes effect at the loop's next arming.
    pub fn set_interval_ms(&self, interval_ms: u64) {
        self.interval_ms.store(interval_ms, Ordering::SeqCst);
    }

    /// Whether the loop should currently arm this timeout.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flips the enabled state.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_unrequested_io_bits() {
        let watch = Watch::new(3, Condition::READABLE, true);
        let cond = Condition::READABLE | Condition::WRITABLE | Condition::HANGUP;
        let sanitized = watch.sanitize_condition(cond);
        assert!(sanitized.contains(Condition::READABLE));
        assert!(sanitized.contains(Condition::HANGUP));
        assert!(!sanitized.contains(Condition::WRITABLE));
    }

    #[test]
    fn invalidation_is_permanent() {
        let watch = Watch::new(5, Condition::WRITABLE, false);
        assert_eq!(watch.fd(), 5);
        watch.invalidate();
        assert_eq!(watch.fd(), -1);
    }

    #[test]
    fn enabled_state_toggles() {
        let watch = Watch::new(4, Condition::READABLE, true);
        assert!(watch.is_enabled());
        watch.set_enabled(false);
        assert!(!watch.is_enabled());
    }

    #[test]
    fn timeout_interval_and_enable() {
        let timeout = Timeout::new(250);
        assert_eq!(timeout.interval_ms(), 250);
        assert!(timeout.is_enabled());
        timeout.set_interval_ms(1000);
        timeout.set_enabled(false);
        assert_eq!(timeout.interval_ms(), 1000);
        assert!(!timeout.is_enabled());
    }
}
