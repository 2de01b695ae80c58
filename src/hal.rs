//! [`Bus`] over any `embedded-hal` 1.0 SPI bus and chip-select pin.
//!
//! There is no DMA here: a block write runs to completion inside
//! [`Bus::start_block_write`] with the CRC computed in software, and the
//! completion and busy samples are reported through [`Bus::poll_event`] for
//! the foreground to handle. Slower than a DMA binding, but it runs on
//! anything.

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use fugit::HertzU32;

use crate::bus::{Bus, BusEvent, StableBlock};
use crate::crc::{crc16, Crc16};

pub struct HalBus<SPI, CS, F> {
    spi: SPI,
    cs: CS,
    /// Reconfigures `spi` for a new clock rate.
    set_clock: F,
    write_crc: u16,
    block_sent: bool,
    busy_poll: bool,
}

impl<SPI, CS, F> HalBus<SPI, CS, F>
where
    SPI: SpiBus,
    CS: OutputPin,
    F: FnMut(&mut SPI, HertzU32) -> Result<(), SPI::Error>,
{
    pub fn new(spi: SPI, cs: CS, set_clock: F) -> Self {
        Self {
            spi,
            cs,
            set_clock,
            write_crc: 0,
            block_sent: false,
            busy_poll: false,
        }
    }

    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }
}

impl<SPI, CS, F> Bus for HalBus<SPI, CS, F>
where
    SPI: SpiBus,
    CS: OutputPin,
    F: FnMut(&mut SPI, HertzU32) -> Result<(), SPI::Error>,
{
    type Error = SPI::Error;

    fn set_clock(&mut self, clock: HertzU32) -> Result<(), Self::Error> {
        (self.set_clock)(&mut self.spi, clock)
    }

    fn disable(&mut self) {
        self.deselect();
        self.block_sent = false;
        self.busy_poll = false;
    }

    fn select(&mut self) {
        // pins that can fail have nowhere to report it from here
        let _ = self.cs.set_low();
    }

    fn deselect(&mut self) {
        let _ = self.spi.flush();
        let _ = self.cs.set_high();
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.spi.write(bytes)?;
        self.spi.flush()
    }

    fn transfer(&mut self, byte: u8) -> Result<u8, Self::Error> {
        let mut buf = [byte];
        self.spi.transfer_in_place(&mut buf)?;
        Ok(buf[0])
    }

    fn read_block(&mut self, block: &mut [u8; 512]) -> Result<u16, Self::Error> {
        block.fill(0xff);
        self.spi.transfer_in_place(block)?;
        Ok(crc16(block))
    }

    fn start_block_write(&mut self, block: &StableBlock) -> Result<(), Self::Error> {
        let mut crc = Crc16::new();
        crc.update(block.bytes());
        self.write_crc = crc.value();

        self.spi.write(block.bytes())?;
        self.spi.flush()?;
        self.block_sent = true;
        Ok(())
    }

    fn block_write_crc(&mut self) -> u16 {
        self.write_crc
    }

    fn start_busy_poll(&mut self) -> Result<(), Self::Error> {
        self.busy_poll = true;
        Ok(())
    }

    fn poll_event(&mut self) -> Option<BusEvent> {
        if self.block_sent {
            self.block_sent = false;
            return Some(BusEvent::BlockSent);
        }
        if self.busy_poll {
            // left armed on failure so the next poll samples again
            let sample = self.transfer(0xff).ok()?;
            self.busy_poll = false;
            return Some(BusEvent::BusySample(sample));
        }
        None
    }
}
