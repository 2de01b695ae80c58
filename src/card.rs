//! One SD card on one SPI bus: power-up negotiation, command plumbing and the
//! block read engine. The write pipeline lives in [`crate::write`].

use crate::bus::Bus;
use crate::command::{Cmd, DATA_START_BLOCK, IF_COND_PATTERN, R1_IDLE_STATE, R1_READY_STATE};
use crate::config::Config;
use crate::fmt::Dbg;
use crate::irq::WriteSignals;
use crate::relax::Relax;
use crate::retry::{self, Attempt, Exhausted};
use crate::{Block, BLOCK_LEN};

/// R1 bit set when the card could not even parse a command.
const R1_ERROR_MASK: u8 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    Bus(E),
    /// GO_IDLE_STATE never got a reply.
    NoCard,
    /// A power-up handshake did not reach the expected reply in its budget.
    Negotiation(NegotiationStep),
    /// The card refused to turn command CRC checking back on.
    CrcEnable,
    /// The card answered a data command with something other than "ready".
    Command { cmd: u8, r1: u8 },
    /// Unexpected byte where a data token was due; `0xff` if none came at all.
    Framing(u8),
    /// The block's trailing CRC disagrees with the CRC of what was received.
    DataCrc { card: u16, host: u16 },
    /// Data response token of a block the card did not accept.
    WriteRejected(u8),
    /// The card (or the DMA engine) stayed busy past its wait budget.
    BusyTimeout,
    /// Sector number not expressible as a block address.
    AddressRange(u64),
    /// Block I/O attempted before a successful [`SdCard::initialize`].
    NotReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NegotiationStep {
    GoIdle,
    InterfaceCondition,
    OperatingCondition,
    ReadOcr,
    BlockLength,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardState {
    Uninitialized,
    /// GO_IDLE_STATE answered with the idle bit.
    ResetAcknowledged,
    /// SEND_IF_COND echoed the check pattern.
    VoltageNegotiated,
    Ready,
}

/// Position of an open write session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Cursor {
    /// Sector the next submitted block lands on.
    pub next: u64,
    /// Opened with WRITE_MULTIPLE_BLOCK.
    pub multi: bool,
    /// Blocks started so far in this session.
    pub blocks: u32,
}

pub struct SdCard<B: Bus, R: Relax> {
    pub(crate) bus: B,
    pub(crate) relax: R,
    pub(crate) signals: &'static WriteSignals,
    pub(crate) config: Config,
    state: CardState,
    speed_level: u8,
    ocr: Option<u32>,
    pub(crate) cursor: Option<Cursor>,
    /// A block from `submit_stable` whose response token is still unchecked.
    pub(crate) in_flight: bool,
    pub(crate) pipelined: u32,
}

impl<B: Bus, R: Relax> SdCard<B, R> {
    /// `signals` must be the same instance the board's interrupt handlers
    /// pass to [`crate::irq`].
    pub fn new(bus: B, relax: R, signals: &'static WriteSignals, config: Config) -> Self {
        Self {
            bus,
            relax,
            signals,
            config,
            state: CardState::Uninitialized,
            speed_level: 0,
            ocr: None,
            cursor: None,
            in_flight: false,
            pipelined: 0,
        }
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == CardState::Ready
    }

    /// Speed reduction level of the last successful initialization.
    pub fn speed_level(&self) -> u8 {
        self.speed_level
    }

    /// Operating conditions register read during the last successful
    /// initialization.
    pub fn ocr(&self) -> Option<u32> {
        self.ocr
    }

    /// Blocks whose transfer was still running when the next block was
    /// handed over, since this driver was created.
    pub fn pipelined_blocks(&self) -> u32 {
        self.pipelined
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn release(self) -> (B, R) {
        (self.bus, self.relax)
    }

    /// Bring the card from power-on (or any state) to ready for block I/O,
    /// running the bus at speed reduction `level` once negotiated.
    ///
    /// On failure the card is left uninitialized and the bus disabled.
    pub fn initialize(&mut self, level: u8) -> Result<(), Error<B::Error>> {
        let level = level.min(self.config.max_speed_reduction);
        info!("initializing card, speed reduction {}", level);

        self.cursor = None;
        self.in_flight = false;
        self.signals.reset();
        self.state = CardState::Uninitialized;
        self.ocr = None;

        let result = self.negotiate(level);
        self.deselect();

        match result {
            Ok(()) => {
                self.state = CardState::Ready;
                self.speed_level = level;
                info!("card ready at {} Hz", self.config.clock_at(level).raw());
                Ok(())
            }
            Err(e) => {
                self.state = CardState::Uninitialized;
                self.bus.disable();
                warn!("initialization failed: {:?}", Dbg(&e));
                Err(e)
            }
        }
    }

    fn negotiate(&mut self, level: u8) -> Result<(), Error<B::Error>> {
        let config = self.config;

        // at least 74 clocks with the card deselected
        self.bus.deselect();
        self.bus
            .set_clock(config.negotiation_clock)
            .map_err(Error::Bus)?;
        self.bus.write(&[0xff; 10]).map_err(Error::Bus)?;
        self.bus.select();

        retry::bounded(config.cmd0_attempts, |attempt| {
            if attempt > 0 {
                self.relax.relax();
            }
            match self.command(Cmd::cmd0()) {
                Ok(R1_IDLE_STATE) => Attempt::Done(()),
                Ok(0xff) if attempt + 1 >= config.cmd0_absent_after => Attempt::Fail(Error::NoCard),
                Ok(_) => Attempt::Again,
                Err(e) => Attempt::Fail(e),
            }
        })
        .map_err(gave_up(NegotiationStep::GoIdle))?;
        self.state = CardState::ResetAcknowledged;
        trace!("card idle");

        retry::bounded(config.cmd8_attempts, |attempt| {
            if attempt > 0 {
                self.relax.relax();
            }
            match self.command_with_trailer(Cmd::cmd8()) {
                Ok((_, echo)) if echo & 0xfff == IF_COND_PATTERN => Attempt::Done(()),
                Ok(_) => Attempt::Again,
                Err(e) => Attempt::Fail(e),
            }
        })
        .map_err(gave_up(NegotiationStep::InterfaceCondition))?;
        self.state = CardState::VoltageNegotiated;
        trace!("interface condition accepted");

        // GO_IDLE_STATE switched CRC checking off
        let r1 = self.command(Cmd::cmd59(true))?;
        if r1 & !R1_IDLE_STATE != 0 {
            return Err(Error::CrcEnable);
        }

        retry::bounded(config.acmd41_attempts, |attempt| {
            if attempt > 0 {
                self.relax.relax();
            }
            match self.app_command(Cmd::acmd41()) {
                Ok(R1_READY_STATE) => Attempt::Done(()),
                Ok(_) => Attempt::Again,
                Err(e) => Attempt::Fail(e),
            }
        })
        .map_err(gave_up(NegotiationStep::OperatingCondition))?;
        trace!("card left idle state");

        self.bus
            .set_clock(config.clock_at(level))
            .map_err(Error::Bus)?;

        let ocr = retry::bounded(config.register_attempts, |_| {
            match self.command_with_trailer(Cmd::cmd58()) {
                Ok((R1_READY_STATE, ocr)) => Attempt::Done(ocr),
                Ok(_) => Attempt::Again,
                Err(e) => Attempt::Fail(e),
            }
        })
        .map_err(gave_up(NegotiationStep::ReadOcr))?;
        self.ocr = Some(ocr);
        trace!("ocr {:#x}", ocr);

        retry::bounded(config.register_attempts, |_| {
            match self.command(Cmd::cmd16(BLOCK_LEN as u32)) {
                Ok(R1_READY_STATE) => Attempt::Done(()),
                Ok(_) => Attempt::Again,
                Err(e) => Attempt::Fail(e),
            }
        })
        .map_err(gave_up(NegotiationStep::BlockLength))
    }

    /// Close any write session, deselect the card and turn the bus off.
    /// The card needs a fresh [`SdCard::initialize`] afterwards.
    pub fn shutdown(&mut self) -> Result<(), Error<B::Error>> {
        let result = self.end();
        self.signals.reset();
        self.bus.deselect();
        self.bus.disable();
        self.state = CardState::Uninitialized;
        info!("card shut down");
        result
    }

    /// Read `blocks.len()` consecutive sectors starting at `start`.
    pub fn read_blocks(&mut self, blocks: &mut [Block], start: u64) -> Result<(), Error<B::Error>> {
        if blocks.is_empty() {
            return Ok(());
        }
        self.require_ready()?;
        self.end()?;

        let address = block_address(start, blocks.len())?;
        debug!("reading {} blocks at {}", blocks.len(), start);

        let result = self.with_select(|card| {
            if blocks.len() == 1 {
                card.expect_ready(Cmd::cmd17(address))?;
                return card.read_data(&mut blocks[0]);
            }

            card.expect_ready(Cmd::cmd18(address))?;
            let mut result = Ok(());
            for block in blocks.iter_mut() {
                result = card.read_data(block);
                if result.is_err() {
                    break;
                }
            }
            // the card keeps streaming until told to stop, error or not
            let stopped = card.expect_ready(Cmd::cmd12());
            result.and(stopped)
        });

        #[cfg(feature = "log-blocks")]
        if result.is_ok() {
            crate::print_blocks(start, blocks);
        }

        result
    }

    fn read_data(&mut self, block: &mut Block) -> Result<(), Error<B::Error>> {
        retry::bounded(self.config.token_polls, |_| match self.bus.transfer(0xff) {
            Ok(DATA_START_BLOCK) => Attempt::Done(()),
            Ok(0xff) => Attempt::Again,
            Ok(other) => Attempt::Fail(Error::Framing(other)),
            Err(e) => Attempt::Fail(Error::Bus(e)),
        })
        .map_err(|e| match e {
            Exhausted::Budget => Error::Framing(0xff),
            Exhausted::Failed(e) => e,
        })?;

        let host = self.bus.read_block(block).map_err(Error::Bus)?;
        let mut trailer = [0u8; 2];
        for byte in trailer.iter_mut() {
            *byte = self.bus.transfer(0xff).map_err(Error::Bus)?;
        }
        let card = u16::from_be_bytes(trailer);
        if card != host {
            return Err(Error::DataCrc { card, host });
        }
        Ok(())
    }

    pub(crate) fn require_ready(&self) -> Result<(), Error<B::Error>> {
        if self.state == CardState::Ready {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    /// Run `f` with the card selected, releasing it on every path.
    pub(crate) fn with_select<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Error<B::Error>>,
    ) -> Result<T, Error<B::Error>> {
        self.bus.select();
        let result = f(self);
        self.deselect();
        result
    }

    /// Release chip-select and give the card the clocks it needs to let go
    /// of MISO.
    pub(crate) fn deselect(&mut self) {
        self.bus.deselect();
        let _ = self.bus.write(&[0xff]);
    }

    /// Send `cmd` and return its R1, or the last byte clocked if the card
    /// never produced one.
    pub(crate) fn command(&mut self, cmd: Cmd) -> Result<u8, Error<B::Error>> {
        // STOP_TRANSMISSION goes out in the middle of a read stream, where
        // MISO carries data rather than a ready signal
        if cmd.index != 0 && cmd.index != 12 {
            self.wait_ready()?;
        }
        trace!("cmd{} arg {:#x}", cmd.index, cmd.arg);
        self.bus.write(&cmd.frame()).map_err(Error::Bus)?;

        if cmd.index == 12 {
            // stuff byte
            self.bus.transfer(0xff).map_err(Error::Bus)?;
        }

        let mut r1 = 0xff;
        for _ in 0..self.config.r1_polls {
            r1 = self.bus.transfer(0xff).map_err(Error::Bus)?;
            if r1 & R1_ERROR_MASK == 0 {
                break;
            }
        }
        Ok(r1)
    }

    /// Send `cmd` and read the 32-bit trailer of an R3 or R7.
    fn command_with_trailer(&mut self, cmd: Cmd) -> Result<(u8, u32), Error<B::Error>> {
        debug_assert!(cmd.has_trailer());
        let r1 = self.command(cmd)?;
        let mut trailer = [0u8; 4];
        for byte in trailer.iter_mut() {
            *byte = self.bus.transfer(0xff).map_err(Error::Bus)?;
        }
        Ok((r1, u32::from_be_bytes(trailer)))
    }

    pub(crate) fn app_command(&mut self, cmd: Cmd) -> Result<u8, Error<B::Error>> {
        let r1 = self.command(Cmd::cmd55())?;
        if r1 & !R1_IDLE_STATE != 0 {
            return Ok(r1);
        }
        self.command(cmd)
    }

    /// Send a data command that must be answered with a clean R1.
    pub(crate) fn expect_ready(&mut self, cmd: Cmd) -> Result<(), Error<B::Error>> {
        match self.command(cmd)? {
            R1_READY_STATE => Ok(()),
            r1 => Err(Error::Command { cmd: cmd.index, r1 }),
        }
    }

    /// Wait for the card to release MISO.
    pub(crate) fn wait_ready(&mut self) -> Result<(), Error<B::Error>> {
        retry::bounded(self.config.ready_polls, |_| match self.bus.transfer(0xff) {
            Ok(0xff) => Attempt::Done(()),
            Ok(_) => Attempt::Again,
            Err(e) => Attempt::Fail(Error::Bus(e)),
        })
        .map_err(|e| match e {
            Exhausted::Budget => Error::BusyTimeout,
            Exhausted::Failed(e) => e,
        })
    }
}

fn gave_up<E>(step: NegotiationStep) -> impl FnOnce(Exhausted<Error<E>>) -> Error<E> {
    move |e| match e {
        Exhausted::Budget => Error::Negotiation(step),
        Exhausted::Failed(e) => e,
    }
}

/// Block address argument for a run of `count` sectors from `start`.
pub(crate) fn block_address<E>(start: u64, count: usize) -> Result<u32, Error<E>> {
    let last = start.saturating_add(count.saturating_sub(1) as u64);
    if last > u32::MAX as u64 {
        return Err(Error::AddressRange(last));
    }
    Ok(start as u32)
}
