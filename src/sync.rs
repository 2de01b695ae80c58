//! The only synchronization in the driver: single-writer flags shared between
//! the foreground and the DMA-complete interrupt.
//!
//! Each flag has exactly one side that raises it and one side that lowers
//! it, so no read-modify-write is ever needed and plain loads and stores
//! suffice even on cores without compare-and-swap.

use core::sync::atomic::{fence, Ordering};

use portable_atomic::{AtomicBool, AtomicU8};

/// A "work in progress" flag. The foreground raises it before handing work
/// to the interrupt; the interrupt lowers it when the work is done.
pub struct Flag(AtomicBool);

impl Flag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Raise the flag and make sure the store is visible before anything
    /// that may trigger the interrupt observing it.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    pub fn lower(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

/// One byte handed from interrupt context to the foreground.
///
/// The producer stores the payload and then sets `ready`; the consumer reads
/// the payload only after it has observed `ready`, and clears `ready` once it
/// has taken the value.
pub struct Latch {
    ready: AtomicBool,
    value: AtomicU8,
}

impl Latch {
    pub const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            value: AtomicU8::new(0),
        }
    }

    /// Producer side.
    pub fn publish(&self, value: u8) {
        self.value.store(value, Ordering::Relaxed);
        fence(Ordering::Release);
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Consumer side; `None` until something has been published.
    pub fn take(&self) -> Option<u8> {
        if !self.ready.load(Ordering::Acquire) {
            return None;
        }
        // the payload must not be read ahead of the flag
        fence(Ordering::Acquire);
        let value = self.value.load(Ordering::Relaxed);
        self.ready.store(false, Ordering::Release);
        Some(value)
    }

    pub fn clear(&self) {
        self.ready.store(false, Ordering::Release);
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
