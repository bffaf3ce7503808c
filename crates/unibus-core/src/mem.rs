//! Fallible allocation facade.
//!
//! Every allocation the message path performs goes through this module so
//! that out-of-memory is an ordinary, testable error instead of an abort.
//! The raw [`malloc`]/[`malloc0`]/[`realloc`]/[`free`] quartet wraps the
//! libc allocator; [`HeapBuf`] and [`fallible_reserve`] are the safe seams
//! the rest of the crate allocates through.
//!
//! With the `mem-debug` feature enabled, three orthogonal debug facilities
//! are available, configured from the environment (read exactly once) or
//! programmatically:
//!
//! - **Nth-failure injection** (`DBUS_MALLOC_FAIL_NTH`): a countdown; when
//!   it reaches zero the next allocation fails and the countdown resets to
//!   the configured interval, or to "never" if no interval was configured.
//! - **Size-cap injection** (`DBUS_MALLOC_FAIL_GREATER_THAN`): allocations
//!   strictly larger than the cap fail immediately.
//! - **Guard bands** (`DBUS_MALLOC_GUARDS`): every block is bracketed by a
//!   header recording the requested size and allocation source plus
//!   magic-word padding on both sides, verified on free and realloc.
//!   Corruption aborts the process.
//!
//! `DBUS_DISABLE_MEM_POOLS` is also parsed and exposed via
//! [`pools_disabled`] for harness compatibility; unibus keeps no pools of
//! its own.
//!
//! Without `mem-debug` the facade compiles down to the plain libc calls
//! plus the portable zero-size rule.

use std::ptr;

use thiserror::Error;

/// An allocation failed, either for real or by injection.
///
/// Callers are expected to unwind cleanly and may retry the operation
/// later; the error is never demoted to a logical failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("not enough memory")]
pub struct OomError;

/// Where a guarded block came from, recorded in its header.
#[cfg(feature = "mem-debug")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum BlockSource {
    Malloc = 1,
    MallocZero = 2,
    Realloc = 3,
    ReallocNull = 4,
}

#[cfg(feature = "mem-debug")]
mod debug {
    //! Process-wide debug-allocator state, initialized from the
    //! environment exactly once.

    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Once;

    /// Countdown value meaning "never fail".
    pub const NEVER_FAIL: u64 = u64::MAX;

    static INIT: Once = Once::new();
    static FAIL_INTERVAL: AtomicU64 = AtomicU64::new(NEVER_FAIL);
    static FAIL_COUNTER: AtomicU64 = AtomicU64::new(NEVER_FAIL);
    static FAIL_SIZE_CAP: AtomicUsize = AtomicUsize::new(0);
    static GUARDS: AtomicBool = AtomicBool::new(false);
    static DISABLE_POOLS: AtomicBool = AtomicBool::new(false);

    fn env_u64(name: &str) -> Option<u64> {
        std::env::var(name).ok().and_then(|v| v.parse().ok())
    }

    pub fn init() {
        INIT.call_once(|| {
            if let Some(n) = env_u64("DBUS_MALLOC_FAIL_NTH") {
                FAIL_INTERVAL.store(n, Ordering::SeqCst);
                FAIL_COUNTER.store(n, Ordering::SeqCst);
                tracing::debug!(every = n, "will fail malloc every nth time");
            }
            if let Some(n) = env_u64("DBUS_MALLOC_FAIL_GREATER_THAN") {
                #[allow(clippy::cast_possible_truncation)]
                FAIL_SIZE_CAP.store(n as usize, Ordering::SeqCst);
                tracing::debug!(over = n, "will fail mallocs over size");
            }
            if std::env::var_os("DBUS_MALLOC_GUARDS").is_some() {
                GUARDS.store(true, Ordering::SeqCst);
                tracing::debug!("will use malloc guards");
            }
            if std::env::var_os("DBUS_DISABLE_MEM_POOLS").is_some() {
                DISABLE_POOLS.store(true, Ordering::SeqCst);
            }
        });
    }

    pub fn pools_disabled() -> bool {
        init();
        DISABLE_POOLS.load(Ordering::SeqCst)
    }

    pub fn guards_enabled() -> bool {
        init();
        GUARDS.load(Ordering::SeqCst)
    }

    /// Turns guard bands on or off for subsequent raw allocations.
    ///
    /// Blocks must be freed under the same setting they were allocated
    /// with; [`super::HeapBuf`] records the setting per buffer.
    pub fn set_guards_enabled(enabled: bool) {
        init();
        GUARDS.store(enabled, Ordering::SeqCst);
    }

    /// Sets how many allocations succeed before one fails. Zero fails
    /// the very next allocation; [`NEVER_FAIL`] disables injection.
    pub fn set_fail_alloc_counter(until_next_fail: u64) {
        init();
        FAIL_COUNTER.store(until_next_fail, Ordering::SeqCst);
    }

    /// Current countdown value.
    pub fn get_fail_alloc_counter() -> u64 {
        init();
        FAIL_COUNTER.load(Ordering::SeqCst)
    }

    /// Sets the value the countdown resets to after an injected
    /// failure; `None` means the countdown resets to never-fail.
    pub fn set_fail_alloc_interval(every_nth: Option<u64>) {
        init();
        FAIL_INTERVAL.store(every_nth.unwrap_or(NEVER_FAIL), Ordering::SeqCst);
    }

    /// Fails every allocation strictly larger than `cap`; `None`
    /// disables the cap.
    pub fn set_fail_size_cap(cap: Option<usize>) {
        init();
        FAIL_SIZE_CAP.store(cap.unwrap_or(0), Ordering::SeqCst);
    }

    /// Decides whether the allocation about to happen should fail.
    ///
    /// Decrements the countdown; at zero the allocation fails and the
    /// countdown resets to the configured interval.
    pub fn should_fail(bytes: usize) -> bool {
        init();
        let cap = FAIL_SIZE_CAP.load(Ordering::SeqCst);
        if cap != 0 && bytes > cap {
            return true;
        }
        loop {
            let current = FAIL_COUNTER.load(Ordering::SeqCst);
            if current == 0 {
                let reset = FAIL_INTERVAL.load(Ordering::SeqCst);
                if FAIL_COUNTER
                    .compare_exchange(0, reset, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    tracing::debug!(reset, "fail alloc counter expired, failing allocation");
                    return true;
                }
            } else {
                if current == NEVER_FAIL {
                    return false;
                }
                if FAIL_COUNTER
                    .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return false;
                }
            }
        }
    }
}

#[cfg(feature = "mem-debug")]
pub use debug::{
    get_fail_alloc_counter, set_fail_alloc_counter, set_fail_alloc_interval, set_fail_size_cap,
    set_guards_enabled, NEVER_FAIL,
};

/// Whether allocator pooling should be bypassed (`DBUS_DISABLE_MEM_POOLS`).
///
/// unibus carries no pools; the knob is parsed so harnesses that set the
/// whole debug-env set behave identically here.
#[must_use]
pub fn pools_disabled() -> bool {
    #[cfg(feature = "mem-debug")]
    {
        debug::pools_disabled()
    }
    #[cfg(not(feature = "mem-debug"))]
    {
        false
    }
}

/// Consults the failure-injection policy for an allocation of `bytes`.
///
/// This is the check every fallible allocation seam in the crate runs
/// before touching real memory. Always succeeds without `mem-debug`.
///
/// # Errors
///
/// Returns [`OomError`] when the injection policy says this allocation
/// must fail.
pub fn check_alloc(bytes: usize) -> Result<(), OomError> {
    #[cfg(feature = "mem-debug")]
    {
        if debug::should_fail(bytes) {
            tracing::trace!(bytes, "failing allocation by injection");
            return Err(OomError);
        }
    }
    let _ = bytes;
    Ok(())
}

/// Grows a [`bytes::BytesMut`] by `additional` through the failure policy.
///
/// # Errors
///
/// Returns [`OomError`] on injected failure; the buffer is untouched.
pub fn fallible_reserve(buf: &mut bytes::BytesMut, additional: usize) -> Result<(), OomError> {
    check_alloc(additional)?;
    buf.reserve(additional);
    Ok(())
}

#[cfg(feature = "mem-debug")]
mod guards {
    //! Guard-band layout: `[size u32][source u32][16B magic] data [16B magic]`.

    use super::BlockSource;

    pub const GUARD_VALUE: u32 = 0xdead_beef;
    pub const GUARD_INFO_SIZE: usize = 8;
    pub const GUARD_START_PAD: usize = 16;
    pub const GUARD_END_PAD: usize = 16;
    pub const GUARD_START_OFFSET: usize = GUARD_INFO_SIZE + GUARD_START_PAD;
    pub const GUARD_EXTRA_SIZE: usize = GUARD_START_OFFSET + GUARD_END_PAD;

    /// Writes the header and both magic bands around a freshly allocated
    /// raw block, returning the caller-visible pointer.
    ///
    /// # Safety
    ///
    /// `block` must be null or point to at least
    /// `requested + GUARD_EXTRA_SIZE` writable bytes.
    pub unsafe fn set_guards(
        block: *mut u8,
        requested: usize,
        source: BlockSource,
    ) -> *mut u8 {
        if block.is_null() {
            return std::ptr::null_mut();
        }
        #[allow(clippy::cast_possible_truncation)]
        std::ptr::write_unaligned(block.cast::<u32>(), requested as u32);
        std::ptr::write_unaligned(block.add(4).cast::<u32>(), source as u32);

        let mut i = GUARD_INFO_SIZE;
        while i < GUARD_START_OFFSET {
            std::ptr::write_unaligned(block.add(i).cast::<u32>(), GUARD_VALUE);
            i += 4;
        }
        let mut i = GUARD_START_OFFSET + requested;
        while i < GUARD_START_OFFSET + requested + GUARD_END_PAD {
            std::ptr::write_unaligned(block.add(i).cast::<u32>(), GUARD_VALUE);
            i += 4;
        }
        block.add(GUARD_START_OFFSET)
    }

    /// Verifies both bands of a guarded block. Aborts on corruption.
    ///
    /// # Safety
    ///
    /// `memory` must be null or a pointer previously returned by
    /// [`set_guards`] whose block is still live.
    pub unsafe fn check_guards(memory: *mut u8) -> usize {
        if memory.is_null() {
            return 0;
        }
        let block = memory.sub(GUARD_START_OFFSET);
        let requested = std::ptr::read_unaligned(block.cast::<u32>()) as usize;
        let source = std::ptr::read_unaligned(block.add(4).cast::<u32>());
        let mut failed = false;

        let mut i = GUARD_INFO_SIZE;
        while i < GUARD_START_OFFSET {
            let value = std::ptr::read_unaligned(block.add(i).cast::<u32>());
            if value != GUARD_VALUE {
                tracing::error!(
                    requested,
                    source,
                    offset = i,
                    value = format_args!("{value:#x}"),
                    "start guard corrupted"
                );
                failed = true;
            }
            i += 4;
        }
        let mut i = GUARD_START_OFFSET + requested;
        while i < GUARD_START_OFFSET + requested + GUARD_END_PAD {
            let value = std::ptr::read_unaligned(block.add(i).cast::<u32>());
            if value != GUARD_VALUE {
                tracing::error!(
                    requested,
                    source,
                    offset = i,
                    value = format_args!("{value:#x}"),
                    "end guard corrupted"
                );
                failed = true;
            }
            i += 4;
        }
        if failed {
            std::process::abort();
        }
        requested
    }
}

fn guards_active() -> bool {
    #[cfg(feature = "mem-debug")]
    {
        debug::guards_enabled()
    }
    #[cfg(not(feature = "mem-debug"))]
    {
        false
    }
}

/// Allocates `bytes` of uninitialized memory.
///
/// Returns null when `bytes` is zero (portably, independent of the libc
/// behavior), when the allocator fails, or when failure was injected.
/// Release with [`free`].
#[must_use]
pub fn malloc(bytes: usize) -> *mut u8 {
    if check_alloc(bytes).is_err() || bytes == 0 {
        return ptr::null_mut();
    }
    #[cfg(feature = "mem-debug")]
    if guards_active() {
        // SAFETY: the block is freshly allocated with room for the bands.
        unsafe {
            let block = libc::malloc(bytes + guards::GUARD_EXTRA_SIZE).cast::<u8>();
            return guards::set_guards(block, bytes, BlockSource::Malloc);
        }
    }
    // SAFETY: plain libc allocation of a nonzero size.
    unsafe { libc::malloc(bytes).cast::<u8>() }
}

/// Allocates `bytes` of zero-initialized memory. Same contract as
/// [`malloc`].
#[must_use]
pub fn malloc0(bytes: usize) -> *mut u8 {
    if check_alloc(bytes).is_err() || bytes == 0 {
        return ptr::null_mut();
    }
    #[cfg(feature = "mem-debug")]
    if guards_active() {
        // SAFETY: as in malloc; calloc zeroes the whole block.
        unsafe {
            let block = libc::calloc(bytes + guards::GUARD_EXTRA_SIZE, 1).cast::<u8>();
            return guards::set_guards(block, bytes, BlockSource::MallocZero);
        }
    }
    // SAFETY: plain libc allocation of a nonzero size.
    unsafe { libc::calloc(bytes, 1).cast::<u8>() }
}

/// Resizes a block from [`malloc`]/[`malloc0`].
///
/// `bytes == 0` frees the block and returns null. A null `memory` behaves
/// like [`malloc`]. On failure the original block is left intact and null
/// is returned.
///
/// # Safety
///
/// `memory` must be null or a live pointer previously returned by this
/// module, allocated under the same guard setting.
#[must_use]
pub unsafe fn realloc(memory: *mut u8, bytes: usize) -> *mut u8 {
    if bytes == 0 {
        free(memory);
        return ptr::null_mut();
    }
    if check_alloc(bytes).is_err() {
        return ptr::null_mut();
    }
    #[cfg(feature = "mem-debug")]
    if guards_active() {
        if memory.is_null() {
            let block = libc::malloc(bytes + guards::GUARD_EXTRA_SIZE).cast::<u8>();
            return guards::set_guards(block, bytes, BlockSource::ReallocNull);
        }
        guards::check_guards(memory);
        let old_block = memory.sub(guards::GUARD_START_OFFSET);
        let block = libc::realloc(old_block.cast(), bytes + guards::GUARD_EXTRA_SIZE).cast::<u8>();
        return guards::set_guards(block, bytes, BlockSource::Realloc);
    }
    libc::realloc(memory.cast(), bytes).cast::<u8>()
}

/// Releases a block from [`malloc`]/[`malloc0`]/[`realloc`]. Null is a
/// no-op. Verifies guard bands when they are enabled.
///
/// # Safety
///
/// `memory` must be null or a live pointer previously returned by this
/// module, allocated under the same guard setting.
pub unsafe fn free(memory: *mut u8) {
    free_raw(memory, guards_active());
}

unsafe fn free_raw(memory: *mut u8, guarded: bool) {
    if memory.is_null() {
        return;
    }
    #[cfg(feature = "mem-debug")]
    if guarded {
        guards::check_guards(memory);
        libc::free(memory.sub(guards::GUARD_START_OFFSET).cast());
        return;
    }
    let _ = guarded;
    libc::free(memory.cast());
}

/// An owning, fixed-size byte buffer allocated through the fallible
/// facade.
///
/// Message payloads live in `HeapBuf`s so that every parsed message is a
/// single injectable allocation and, under guards, overrun-checked. The
/// guard setting is captured at allocation time, so toggling guards does
/// not confuse live buffers.
pub struct HeapBuf {
    ptr: *mut u8,
    len: usize,
    guarded: bool,
}

// SAFETY: HeapBuf exclusively owns its block; no interior sharing.
unsafe impl Send for HeapBuf {}
// SAFETY: shared access only reads the immutable block.
unsafe impl Sync for HeapBuf {}

impl HeapBuf {
    /// Copies `bytes` into a freshly allocated buffer.
    ///
    /// # Errors
    ///
    /// Returns [`OomError`] when the allocation fails or is injected to
    /// fail.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, OomError> {
        if bytes.is_empty() {
            return Ok(Self {
                ptr: ptr::null_mut(),
                len: 0,
                guarded: false,
            });
        }
        let guarded = guards_active();
        let ptr = malloc(bytes.len());
        if ptr.is_null() {
            return Err(OomError);
        }
        // SAFETY: ptr points to len writable bytes; ranges are disjoint.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        Ok(Self {
            ptr,
            len: bytes.len(),
            guarded,
        })
    }

    /// Buffer length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::ops::Deref for HeapBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: ptr/len describe a live allocation we own.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl AsRef<[u8]> for HeapBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for HeapBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBuf").field("len", &self.len).finish()
    }
}

impl Drop for HeapBuf {
    fn drop(&mut self) {
        // SAFETY: ptr came from malloc with the recorded guard setting.
        unsafe { free_raw(self.ptr, self.guarded) }
    }
}
