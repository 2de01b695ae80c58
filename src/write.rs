//! Foreground half of the write pipeline.
//!
//! A write session is opened with [`SdCard::begin`], fed one block at a time
//! and closed with [`SdCard::end`]. Each block's DMA transfer runs while the
//! caller prepares the next one; the DMA-complete interrupt finishes the block
//! (see [`crate::irq`]) and this side only waits on its flags. At most one
//! block is ever in flight.

use crate::bus::{Bus, BusEvent, StableBlock};
use crate::card::{block_address, Cursor, Error, SdCard};
use crate::command::{
    Cmd, DATA_RES_ACCEPTED, DATA_RES_MASK, DATA_START_BLOCK, R1_READY_STATE, STOP_TRAN_TOKEN,
    WRITE_MULTIPLE_TOKEN,
};
use crate::irq::{self, WriteSignals, RESPONSE_BUS_FAULT};
use crate::relax::Relax;
use crate::retry::{self, Attempt, Exhausted};
use crate::Block;

impl<B: Bus, R: Relax> SdCard<B, R> {
    /// Open a write session at `start`.
    ///
    /// If a multi-block session is already open and its next address is
    /// `start`, that session simply continues. Any other open session is
    /// closed first. `expected` is the number of blocks the caller is about to
    /// write, if known: more than one sends a pre-erase hint, exactly one
    /// opens a single-block session.
    pub fn begin(&mut self, start: u64, expected: Option<u32>) -> Result<(), Error<B::Error>> {
        self.require_ready()?;

        if let Some(cursor) = self.cursor {
            if cursor.multi && cursor.next == start {
                trace!("continuing write session at {}", start);
                return Ok(());
            }
            self.end()?;
        }

        let address = block_address(start, expected.unwrap_or(1) as usize)?;
        let multi = expected != Some(1);

        self.bus.select();
        if let Err(e) = self.open(address, expected, multi) {
            self.deselect();
            return Err(e);
        }
        self.cursor = Some(Cursor {
            next: start,
            multi,
            blocks: 0,
        });
        debug!("write session open at {}, multi {}", start, multi);
        Ok(())
    }

    fn open(&mut self, address: u32, expected: Option<u32>, multi: bool) -> Result<(), Error<B::Error>> {
        if let Some(count) = expected.filter(|&count| count > 1) {
            self.send_pre_erase(count)?;
        }
        let cmd = if multi {
            Cmd::cmd25(address)
        } else {
            Cmd::cmd24(address)
        };
        self.expect_ready(cmd)?;
        // one byte gap before the first data token
        self.bus.write(&[0xff]).map_err(Error::Bus)
    }

    /// Tell the card how many blocks the next multi-block write will carry so
    /// it can erase them up front.
    pub fn pre_erase(&mut self, count: u32) -> Result<(), Error<B::Error>> {
        self.require_ready()?;
        self.end()?;
        self.with_select(|card| card.send_pre_erase(count))
    }

    fn send_pre_erase(&mut self, count: u32) -> Result<(), Error<B::Error>> {
        match self.app_command(Cmd::acmd23(count))? {
            R1_READY_STATE => Ok(()),
            r1 => Err(Error::Command { cmd: 23, r1 }),
        }
    }

    /// Write `block` at the session's next address.
    ///
    /// Returns once the card has answered for this block, so `block` may be
    /// reused right away.
    ///
    /// # Panics
    ///
    /// Without an open session, or on a second block in a single-block session.
    pub fn submit(&mut self, block: &Block) -> Result<(), Error<B::Error>> {
        // Safety: `block` outlives this call and this call does not return
        // before the transfer has completed.
        let stable = unsafe { StableBlock::new(block) };
        self.start_block(stable)?;
        self.await_response().map_err(|e| {
            self.abort();
            e
        })
    }

    /// Start writing `block` at the session's next address and return while
    /// the transfer is still running. Its data response is checked by the
    /// next `submit`, `submit_stable` or `end`.
    ///
    /// # Panics
    ///
    /// Same as [`SdCard::submit`].
    pub fn submit_stable(&mut self, block: StableBlock) -> Result<(), Error<B::Error>> {
        self.start_block(block)?;
        self.in_flight = true;
        Ok(())
    }

    /// Write `blocks` at the session's next addresses. Each block's transfer
    /// overlaps with handing over the next one; returns once the card has
    /// answered for all of them.
    pub fn submit_all(&mut self, blocks: &[Block]) -> Result<(), Error<B::Error>> {
        let Some((last, rest)) = blocks.split_last() else {
            return Ok(());
        };
        for block in rest {
            // Safety: `blocks` stays borrowed until the `submit` below has
            // checked every earlier block's response.
            let stable = unsafe { StableBlock::new(block) };
            self.submit_stable(stable)?;
        }
        self.submit(last)
    }

    /// Close the open write session, if any, once its last block is on the
    /// card.
    pub fn end(&mut self) -> Result<(), Error<B::Error>> {
        let Some(cursor) = self.cursor.take() else {
            return Ok(());
        };
        match self.close(cursor) {
            Ok(()) => {
                self.deselect();
                debug!("write session closed after {} blocks", cursor.blocks);
                Ok(())
            }
            Err(e) => {
                self.cursor = Some(cursor);
                self.abort();
                Err(e)
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), Error<B::Error>> {
        self.end()
    }

    /// Write `blocks` at consecutive sectors from `start`, waiting for the
    /// card to finish before returning.
    pub fn write_blocks(&mut self, blocks: &[Block], start: u64) -> Result<(), Error<B::Error>> {
        if blocks.is_empty() {
            return Ok(());
        }
        let count = u32::try_from(blocks.len()).unwrap_or(u32::MAX);
        self.begin(start, Some(count))?;
        self.submit_all(blocks)?;
        self.end()
    }

    /// A block transfer is underway or its response has not come in yet.
    pub fn is_writing(&self) -> bool {
        self.signals.writing.is_raised()
    }

    /// Sector the next submitted block would land on, if a session is open.
    pub fn next_write_address(&self) -> Option<u64> {
        self.cursor.map(|cursor| cursor.next)
    }

    fn start_block(&mut self, block: StableBlock) -> Result<(), Error<B::Error>> {
        let Some(mut cursor) = self.cursor else {
            panic!("block submitted without an open write session");
        };
        assert!(
            cursor.multi || cursor.blocks == 0,
            "single-block write session already carries its block"
        );

        if let Err(e) = self.send_block(cursor.multi, block) {
            self.abort();
            return Err(e);
        }
        cursor.next += 1;
        cursor.blocks += 1;
        self.cursor = Some(cursor);
        Ok(())
    }

    fn send_block(&mut self, multi: bool, block: StableBlock) -> Result<(), Error<B::Error>> {
        if self.in_flight {
            self.in_flight = false;
            self.pipelined += 1;
            self.await_response()?;
        }
        self.await_not_busy()?;

        let token = if multi {
            WRITE_MULTIPLE_TOKEN
        } else {
            DATA_START_BLOCK
        };
        self.bus.write(&[token]).map_err(Error::Bus)?;

        self.signals.response.clear();
        self.signals.writing.raise();
        if let Err(e) = self.bus.start_block_write(&block) {
            self.signals.writing.lower();
            return Err(Error::Bus(e));
        }
        Ok(())
    }

    fn close(&mut self, cursor: Cursor) -> Result<(), Error<B::Error>> {
        if self.in_flight {
            self.in_flight = false;
            self.await_response()?;
        }
        self.await_not_busy()?;

        if cursor.multi {
            self.bus
                .write(&[STOP_TRAN_TOKEN, 0xff])
                .map_err(Error::Bus)?;
            let busy_waits = self.config.busy_waits;
            retry::bounded(busy_waits, |attempt| {
                if attempt > 0 {
                    self.relax.relax();
                }
                match self.bus.transfer(0xff) {
                    Ok(0xff) => Attempt::Done(()),
                    Ok(_) => Attempt::Again,
                    Err(e) => Attempt::Fail(Error::Bus(e)),
                }
            })
            .map_err(|e| match e {
                Exhausted::Budget => Error::BusyTimeout,
                Exhausted::Failed(e) => e,
            })?;
        }
        Ok(())
    }

    /// Give up on the open session after an error.
    fn abort(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            warn!("abandoning write session at {}", cursor.next);
            // the card may still be waiting for data; only the stop token
            // gets it out of a multi-block write
            if cursor.multi && !self.signals.writing.is_raised() {
                let _ = self.bus.write(&[STOP_TRAN_TOKEN, 0xff]);
            }
        }
        self.in_flight = false;
        self.deselect();
    }

    fn await_response(&mut self) -> Result<(), Error<B::Error>> {
        self.wait_while(|signals| signals.writing.is_raised())?;
        let response = self.signals.response.take().unwrap_or(RESPONSE_BUS_FAULT);
        if response & DATA_RES_MASK == DATA_RES_ACCEPTED {
            Ok(())
        } else {
            warn!("block rejected, response {:#x}", response);
            Err(Error::WriteRejected(response))
        }
    }

    fn await_not_busy(&mut self) -> Result<(), Error<B::Error>> {
        self.wait_while(|signals| signals.card_busy.is_raised())
    }

    fn wait_while(&mut self, pending: impl Fn(&WriteSignals) -> bool) -> Result<(), Error<B::Error>> {
        let signals = self.signals;
        for _ in 0..self.config.busy_waits {
            if !pending(signals) {
                return Ok(());
            }
            self.service();
            if pending(signals) {
                self.relax.relax();
            }
        }
        if pending(signals) {
            Err(Error::BusyTimeout)
        } else {
            Ok(())
        }
    }

    /// Run the interrupt-side handlers for events a polled binding reports.
    fn service(&mut self) {
        match self.bus.poll_event() {
            Some(BusEvent::BlockSent) => {
                irq::on_block_sent(&mut self.bus, self.signals, self.config.busy_fast_path)
            }
            Some(BusEvent::BusySample(sample)) => {
                irq::on_busy_sample(&mut self.bus, self.signals, sample)
            }
            None => {}
        }
    }
}
