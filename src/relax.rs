//! Cooperative suspension used by every wait loop in the driver.

/// Called by the foreground whenever it has nothing to do but wait for the
/// bus, the DMA engine or the card.
///
/// Implementations must be callable with interrupts disabled and must not
/// rely on interrupts to return.
pub trait Relax {
    fn relax(&mut self);
}

impl<R: Relax + ?Sized> Relax for &mut R {
    fn relax(&mut self) {
        (**self).relax()
    }
}

/// Busy loop. Never sleeps, so it is always safe.
#[derive(Clone, Copy, Debug, Default)]
pub struct Spin;

impl Relax for Spin {
    fn relax(&mut self) {
        core::hint::spin_loop();
    }
}

/// Sleeps the core until the next event. With SEVONPEND set, any pending
/// interrupt wakes the core even while interrupts are masked.
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitForEvent;

impl Relax for WaitForEvent {
    fn relax(&mut self) {
        cortex_m::asm::dsb();
        cortex_m::asm::wfe();
    }
}

/// Gives the rest of the time slice to other threads on hosted builds.
#[cfg(any(test, feature = "std"))]
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadYield;

#[cfg(any(test, feature = "std"))]
impl Relax for ThreadYield {
    fn relax(&mut self) {
        std::thread::yield_now();
    }
}
