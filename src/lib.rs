//! SPI-mode SD card block driver with a DMA-pipelined write path.
//!
//! [`SdCard`] speaks the card protocol over a board-specific [`Bus`]:
//! power-up negotiation, block reads, and multi-block writes whose DMA
//! transfers overlap with the caller preparing the next block. The second
//! half of each block write runs in the board's DMA-complete interrupt via
//! [`irq`]. [`Disk`] puts a speed governor, a sector cache and deferral of
//! all-zero writes on top, behind the small status / initialize / read /
//! write / ioctl interface a FAT filesystem expects.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

// must come first so the logging macros are visible everywhere
mod fmt;

pub mod bus;
pub mod cache;
pub mod card;
pub mod command;
pub mod config;
pub mod crc;
pub mod disk;
pub mod governor;
pub mod hal;
pub mod irq;
pub mod relax;
pub mod retry;
pub mod sync;

mod fs;
mod write;

#[cfg(test)]
mod sim;

pub use bus::{Bus, BusEvent, StableBlock};
pub use cache::BlockCache;
pub use card::{CardState, Error, NegotiationStep, SdCard};
pub use config::Config;
pub use disk::{Disk, IoError, IoctlCmd, Stats, Status};
pub use governor::{GaveUp, Governor};
pub use hal::HalBus;
pub use irq::WriteSignals;
pub use relax::{Relax, Spin, WaitForEvent};

pub const BLOCK_LEN: usize = 512;

/// One sector, aligned for word-wide DMA.
pub type Block = aligned::Aligned<aligned::A4, [u8; BLOCK_LEN]>;

pub const ZEROED_BLOCK: Block = aligned::Aligned([0; BLOCK_LEN]);

#[cfg(feature = "log-blocks")]
fn print_blocks(start: u64, blocks: &[Block]) {
    for (idx, block) in blocks.iter().enumerate() {
        let start_byte = (start + idx as u64) * BLOCK_LEN as u64;
        for (row, bytes) in block.chunks(0x20).enumerate() {
            defmt::trace!("{=u64:08x} :: {=[u8]:02x}", start_byte + row as u64 * 0x20, bytes);
        }
    }
}
