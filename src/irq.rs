//! Interrupt-context half of the write pipeline.
//!
//! Once the DMA engine has clocked out a block, the interrupt (not the
//! caller) sends the block's CRC, collects the card's data response token and
//! starts watching for the card to finish programming. The foreground only
//! ever looks at [`WriteSignals`].
//!
//! ```ignore
//! static SIGNALS: WriteSignals = WriteSignals::new();
//!
//! #[interrupt]
//! fn DMAC_2() {
//!     let mut bus = unsafe { BoardBus::steal() };
//!     spi_sd_dma::irq::on_block_sent(&mut bus, &SIGNALS, 4);
//! }
//! ```

use crate::bus::Bus;
use crate::sync::{Flag, Latch};

/// Response recorded when the bus fails during the interrupt's work, which
/// the foreground then treats like a rejected block.
pub const RESPONSE_BUS_FAULT: u8 = 0x00;

/// State shared between the foreground and the DMA-complete interrupt.
pub struct WriteSignals {
    /// Raised by the foreground before starting a block's DMA transfer,
    /// lowered by the interrupt once the card's response token is in.
    pub writing: Flag,
    /// Raised by the interrupt when the card is still programming after the
    /// fast-path samples, lowered by the busy-poll interrupt.
    pub card_busy: Flag,
    /// The data response token of the last block.
    pub response: Latch,
}

impl WriteSignals {
    pub const fn new() -> Self {
        Self {
            writing: Flag::new(),
            card_busy: Flag::new(),
            response: Latch::new(),
        }
    }

    /// Forget everything. Only call with no transfer in flight.
    pub fn reset(&self) {
        critical_section::with(|_| {
            self.writing.lower();
            self.card_busy.lower();
            self.response.clear();
        });
    }
}

impl Default for WriteSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// DMA-complete handler for a block write.
///
/// `fast_path` is how many busy samples to take inline before handing the
/// wait to background polling.
pub fn on_block_sent<B: Bus>(bus: &mut B, signals: &WriteSignals, fast_path: u32) {
    let crc = bus.block_write_crc();

    let mut response = match finish_block(bus, crc) {
        Ok(response) => response,
        Err(_) => {
            signals.response.publish(RESPONSE_BUS_FAULT);
            signals.writing.lower();
            return;
        }
    };

    let mut ready = false;
    for _ in 0..fast_path {
        match bus.transfer(0xff) {
            Ok(0xff) => {
                ready = true;
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    if !ready {
        signals.card_busy.raise();
        if bus.start_busy_poll().is_err() {
            // nothing would ever lower the flag, and the card may still be
            // programming: fail the block so the foreground aborts
            signals.card_busy.lower();
            response = RESPONSE_BUS_FAULT;
        }
    }

    signals.response.publish(response);
    signals.writing.lower();
}

fn finish_block<B: Bus>(bus: &mut B, crc: u16) -> Result<u8, B::Error> {
    // the card wants the high byte first
    bus.write(&crc.to_be_bytes())?;
    bus.transfer(0xff)
}

/// Busy-poll handler: `sample` is the byte clocked in by the background poll.
pub fn on_busy_sample<B: Bus>(bus: &mut B, signals: &WriteSignals, sample: u8) {
    if sample == 0xff {
        signals.card_busy.lower();
    } else if bus.start_busy_poll().is_err() {
        // the flag stays raised, so the foreground's wait times out
        warn!("busy poll could not be restarted");
    }
}
