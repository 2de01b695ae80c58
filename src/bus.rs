//! The seam between protocol logic and one board's SPI peripheral, DMA
//! channels and chip-select pin.

use core::ptr::NonNull;

use fugit::HertzU32;

use crate::Block;

/// Something a polled binding has to report instead of raising an interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    /// The DMA transfer started by [`Bus::start_block_write`] has finished.
    BlockSent,
    /// One byte sampled by the background busy poll.
    BusySample(u8),
}

/// Hardware binding for one card on one SPI bus.
///
/// Interrupt-driven bindings call [`crate::irq::on_block_sent`] from their
/// DMA-complete handler and [`crate::irq::on_busy_sample`] from their
/// busy-poll handler, and never return anything from [`Bus::poll_event`].
/// Bindings without usable interrupts return the equivalent [`BusEvent`]s
/// from `poll_event`, and the foreground runs the same handlers itself.
pub trait Bus {
    type Error: core::fmt::Debug;

    /// Enable the peripheral (if needed) and run it at `clock`.
    fn set_clock(&mut self, clock: HertzU32) -> Result<(), Self::Error>;

    /// Disable the peripheral and stop driving the clock.
    fn disable(&mut self);

    fn select(&mut self);

    fn deselect(&mut self);

    /// Clock out `bytes`, discarding whatever comes back.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Clock out one byte and return the byte clocked in.
    fn transfer(&mut self, byte: u8) -> Result<u8, Self::Error>;

    /// Clock in a full data block with MOSI held high and return the CRC16
    /// accumulated over the bytes actually received.
    fn read_block(&mut self, block: &mut [u8; 512]) -> Result<u16, Self::Error>;

    /// Start clocking out `block` with the CRC accumulator armed. Returns as
    /// soon as the transfer is underway.
    fn start_block_write(&mut self, block: &StableBlock) -> Result<(), Self::Error>;

    /// CRC16 accumulated by the last block write. Only meaningful once that
    /// transfer has completed.
    fn block_write_crc(&mut self) -> u16;

    /// Start clocking 0xff in the background to sample the card's busy line.
    fn start_busy_poll(&mut self) -> Result<(), Self::Error>;

    /// Polled bindings report completed background work here.
    fn poll_event(&mut self) -> Option<BusEvent> {
        None
    }
}

/// A block whose contents its creator promises to keep alive and unchanged
/// until the write that carries it has completed.
///
/// This is the only way to hand a buffer to [`crate::SdCard::submit_stable`],
/// which returns before the DMA engine is done reading it.
#[derive(Clone, Copy, Debug)]
pub struct StableBlock {
    ptr: NonNull<Block>,
}

impl StableBlock {
    /// # Safety
    ///
    /// `block` must stay allocated and must not be written to until the card
    /// driver has observed completion of the write it is submitted to (the
    /// next `submit`, `end` or `shutdown` call returning).
    pub unsafe fn new(block: &Block) -> Self {
        Self {
            ptr: NonNull::from(block),
        }
    }

    /// Immutable statics can never change under the DMA engine.
    pub fn from_static(block: &'static Block) -> Self {
        Self {
            ptr: NonNull::from(block),
        }
    }

    /// Start address for the DMA source descriptor.
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes().as_ptr()
    }

    /// Contents of the block, valid under the contract given at construction.
    pub fn bytes(&self) -> &[u8; 512] {
        // Safety: the constructor's contract keeps the pointee alive and
        // unchanged for as long as this handle is in use.
        let block: &Block = unsafe { self.ptr.as_ref() };
        block
    }
}

// Safety: a `StableBlock` is only a read-only view of memory its creator
// keeps stable.
unsafe impl Send for StableBlock {}
