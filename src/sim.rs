//! A simulated card that speaks SPI mode one byte at a time, and a [`Bus`]
//! wired to it that can deliver its completion events either through
//! [`Bus::poll_event`] or from a [`Relax`] standing in for the interrupt.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use fugit::HertzU32;

use crate::bus::{Bus, BusEvent, StableBlock};
use crate::card::SdCard;
use crate::config::Config;
use crate::crc::{crc16, crc7};
use crate::irq::{self, WriteSignals};
use crate::relax::Relax;

pub const OCR: u32 = 0xc0ff_8000;
pub const RESPONSE_ACCEPTED: u8 = 0xe5;
pub const RESPONSE_CRC_ERROR: u8 = 0xeb;
pub const RESPONSE_WRITE_ERROR: u8 = 0xed;

/// Byte the card puts out in the slot after STOP_TRANSMISSION, which the
/// host must skip.
const STUFF_BYTE: u8 = 0x3c;

/// Idle byte, token, data and CRC of one block as the card streams it.
const STREAMED_BLOCK_LEN: usize = 1 + 1 + 512 + 2;

const R1_ILLEGAL_COMMAND: u8 = 0x04;
const R1_COM_CRC_ERROR: u8 = 0x08;
const R1_PARAMETER_ERROR: u8 = 0x40;

/// Distinct, never all-zero contents for `sector`.
pub fn pattern(sector: u64) -> [u8; 512] {
    let mut block = [0u8; 512];
    for (i, byte) in block.iter_mut().enumerate() {
        *byte = (sector as usize).wrapping_mul(31).wrapping_add(i * 7 + 1) as u8;
    }
    block[0] |= 0x80;
    block
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Events come back from `poll_event`.
    Polled,
    /// Events are handled by [`SimRelax`], as an interrupt would.
    Interrupt,
}

/// Tight bounds so failing tests fail fast.
pub fn config() -> Config {
    Config {
        ready_polls: 1 << 12,
        token_polls: 1 << 12,
        busy_waits: 1 << 16,
        ..Config::default()
    }
}

pub fn card(sim: &SimCard, mode: Mode) -> SdCard<SimBus, SimRelax> {
    card_with(sim, mode, config())
}

pub fn card_with(sim: &SimCard, mode: Mode, config: Config) -> SdCard<SimBus, SimRelax> {
    let signals: &'static WriteSignals = Box::leak(Box::new(WriteSignals::new()));
    let bus = SimBus {
        card: sim.clone(),
        mode,
    };
    let relax = SimRelax {
        bus: bus.clone(),
        signals,
        fast_path: config.busy_fast_path,
    };
    SdCard::new(bus, relax, signals, config)
}

pub fn ready_card(sim: &SimCard, mode: Mode) -> SdCard<SimBus, SimRelax> {
    let mut card = card(sim, mode);
    card.initialize(0).unwrap();
    card
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Command,
    /// Streaming blocks after READ_MULTIPLE_BLOCK.
    MultiRead { next: u64 },
    /// Waiting for a data token (or the stop token) of a write.
    WriteWait { next: u64, multi: bool },
    WriteData { sector: u64, multi: bool },
}

struct State {
    storage: HashMap<u64, [u8; 512]>,

    selected: bool,
    enabled: bool,
    clock: u32,

    absent: bool,
    refuse_crc: bool,
    acmd41_busy: u32,
    acmd41_left: u32,
    clock_ceiling: Option<u32>,
    corrupt_reads: u32,
    read_token: u8,
    reject_writes: u32,
    write_busy: u32,

    idle: bool,
    crc_enabled: bool,
    app_next: bool,
    phase: Phase,
    frame: Vec<u8>,
    data: Vec<u8>,
    out: VecDeque<u8>,
    busy: u32,

    commands: Vec<u8>,
    clocks: Vec<u32>,
    stop_tokens: usize,
    pre_erase: Option<u32>,
    busy_samples: usize,
    busy_polls: usize,
    stop_lag: Option<usize>,

    // bus side
    block_sent: bool,
    busy_poll_starts: Option<u32>,
    busy_poll: bool,
    write_crc: u16,
}

/// Handle to the shared simulated card; clones see the same card.
#[derive(Clone)]
pub struct SimCard(Rc<RefCell<State>>);

impl SimCard {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(State {
            storage: HashMap::new(),
            selected: false,
            enabled: false,
            clock: 0,
            absent: false,
            refuse_crc: false,
            acmd41_busy: 2,
            acmd41_left: 2,
            clock_ceiling: None,
            corrupt_reads: 0,
            read_token: 0xfe,
            reject_writes: 0,
            write_busy: 2,
            idle: true,
            crc_enabled: false,
            app_next: false,
            phase: Phase::Command,
            frame: Vec::with_capacity(6),
            data: Vec::with_capacity(514),
            out: VecDeque::new(),
            busy: 0,
            commands: Vec::new(),
            clocks: Vec::new(),
            stop_tokens: 0,
            pre_erase: None,
            busy_samples: 0,
            busy_polls: 0,
            stop_lag: None,
            block_sent: false,
            busy_poll_starts: None,
            busy_poll: false,
            write_crc: 0,
        })))
    }

    pub fn store(&self, sector: u64, data: [u8; 512]) {
        self.0.borrow_mut().storage.insert(sector, data);
    }

    pub fn sector(&self, sector: u64) -> Option<[u8; 512]> {
        self.0.borrow().storage.get(&sector).copied()
    }

    pub fn set_absent(&self, absent: bool) {
        self.0.borrow_mut().absent = absent;
    }

    pub fn set_refuse_crc(&self, refuse: bool) {
        self.0.borrow_mut().refuse_crc = refuse;
    }

    /// SD_SEND_OP_COND attempts answered "still idle" after each reset.
    pub fn set_acmd41_busy(&self, attempts: u32) {
        let mut state = self.0.borrow_mut();
        state.acmd41_busy = attempts;
        state.acmd41_left = attempts;
    }

    /// Above this clock everything the card sends is lost.
    pub fn set_clock_ceiling(&self, ceiling: Option<u32>) {
        self.0.borrow_mut().clock_ceiling = ceiling;
    }

    /// Send a wrong CRC with the next `count` blocks read.
    pub fn corrupt_reads(&self, count: u32) {
        self.0.borrow_mut().corrupt_reads = count;
    }

    /// Token sent ahead of each read block; `0xff` keeps the card silent
    /// after a read command.
    pub fn set_read_token(&self, token: u8) {
        self.0.borrow_mut().read_token = token;
    }

    pub fn reject_writes(&self, reject: bool) {
        self.0.borrow_mut().reject_writes = if reject { u32::MAX } else { 0 };
    }

    pub fn reject_next_writes(&self, count: u32) {
        self.0.borrow_mut().reject_writes = count;
    }

    /// Bytes the card stays busy for after each block and after a stop token.
    pub fn set_write_busy(&self, bytes: u32) {
        self.0.borrow_mut().write_busy = bytes;
    }

    pub fn is_selected(&self) -> bool {
        self.0.borrow().selected
    }

    pub fn is_enabled(&self) -> bool {
        self.0.borrow().enabled
    }

    pub fn clock(&self) -> u32 {
        self.0.borrow().clock
    }

    /// Clock changes down to a negotiation speed, i.e. power-up attempts.
    pub fn negotiations(&self) -> usize {
        self.0
            .borrow()
            .clocks
            .iter()
            .filter(|&&clock| clock <= 400_000)
            .count()
    }

    /// Indices of every command frame seen on the bus, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.0.borrow().commands.clone()
    }

    pub fn count_commands(&self, index: u8) -> usize {
        self.0
            .borrow()
            .commands
            .iter()
            .filter(|&&seen| seen == index)
            .count()
    }

    pub fn stop_tokens(&self) -> usize {
        self.0.borrow().stop_tokens
    }

    /// Argument of the last SET_WR_BLK_ERASE_COUNT.
    pub fn pre_erase(&self) -> Option<u32> {
        self.0.borrow().pre_erase
    }

    /// Bytes answered with the busy signal.
    pub fn busy_samples(&self) -> usize {
        self.0.borrow().busy_samples
    }

    /// Samples taken by the background busy poll.
    pub fn busy_polls(&self) -> usize {
        self.0.borrow().busy_polls
    }

    /// Only `starts` more background busy polls can be started on the bus.
    pub fn limit_busy_poll_starts(&self, starts: u32) {
        self.0.borrow_mut().busy_poll_starts = Some(starts);
    }

    /// Bytes clocked out of a multi-block read stream after the host's last
    /// block and before its STOP_TRANSMISSION frame.
    pub fn clocks_before_stop(&self) -> Option<usize> {
        self.0.borrow().stop_lag
    }

    pub fn set_selected(&self, selected: bool) {
        self.0.borrow_mut().set_selected(selected);
    }

    pub fn set_clock(&self, clock: u32) {
        let mut state = self.0.borrow_mut();
        state.clock = clock;
        state.enabled = true;
        state.clocks.push(clock);
    }

    /// One full-duplex byte: `mosi` goes in, the card's answer comes out.
    pub fn exchange(&self, mosi: u8) -> u8 {
        self.0.borrow_mut().exchange(mosi)
    }
}

impl Default for SimCard {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn set_selected(&mut self, selected: bool) {
        if self.selected && !selected {
            self.frame.clear();
            self.out.clear();
            self.phase = Phase::Command;
        }
        self.selected = selected;
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected || !self.enabled {
            return 0xff;
        }
        let miso = if self.absent { 0xff } else { self.next_out() };
        self.absorb(mosi);

        match self.clock_ceiling {
            Some(ceiling) if self.clock > ceiling => 0xff,
            _ => miso,
        }
    }

    fn next_out(&mut self) -> u8 {
        if self.out.is_empty() {
            if let Phase::MultiRead { next } = self.phase {
                self.queue_block(next);
                self.phase = Phase::MultiRead { next: next + 1 };
            }
        }
        if let Some(byte) = self.out.pop_front() {
            return byte;
        }
        if self.busy > 0 {
            self.busy -= 1;
            self.busy_samples += 1;
            return 0x00;
        }
        0xff
    }

    fn absorb(&mut self, mosi: u8) {
        match self.phase {
            Phase::WriteData { sector, multi } => {
                self.data.push(mosi);
                if self.data.len() == 514 {
                    self.finish_write(sector, multi);
                }
            }
            Phase::WriteWait { next, multi } => match mosi {
                0xfe if !multi => {
                    self.data.clear();
                    self.phase = Phase::WriteData {
                        sector: next,
                        multi,
                    };
                }
                0xfc if multi => {
                    self.data.clear();
                    self.phase = Phase::WriteData {
                        sector: next,
                        multi,
                    };
                }
                0xfd if multi => {
                    self.stop_tokens += 1;
                    self.phase = Phase::Command;
                    self.out.push_back(0xff);
                    self.busy = self.write_busy;
                }
                _ => {}
            },
            Phase::Command | Phase::MultiRead { .. } => {
                if self.frame.is_empty() && mosi & 0xc0 != 0x40 {
                    return;
                }
                self.frame.push(mosi);
                if self.frame.len() == 6 {
                    let frame = core::mem::take(&mut self.frame);
                    self.execute(&frame);
                }
            }
        }
    }

    fn finish_write(&mut self, sector: u64, multi: bool) {
        let mut block = [0u8; 512];
        block.copy_from_slice(&self.data[..512]);
        let crc = u16::from_be_bytes([self.data[512], self.data[513]]);

        let response = if self.reject_writes > 0 {
            self.reject_writes -= 1;
            RESPONSE_WRITE_ERROR
        } else if self.crc_enabled && crc16(&block) != crc {
            RESPONSE_CRC_ERROR
        } else {
            self.storage.insert(sector, block);
            RESPONSE_ACCEPTED
        };
        self.out.push_back(response);
        self.busy = self.write_busy;

        self.phase = if multi {
            Phase::WriteWait {
                next: sector + 1,
                multi,
            }
        } else {
            Phase::Command
        };
    }

    fn queue_block(&mut self, sector: u64) {
        if self.read_token == 0xff {
            return;
        }
        let data = self.storage.get(&sector).copied().unwrap_or([0; 512]);
        let mut crc = crc16(&data);
        if self.corrupt_reads > 0 {
            self.corrupt_reads -= 1;
            crc ^= 0x0001;
        }
        self.out.push_back(0xff);
        self.out.push_back(self.read_token);
        self.out.extend(data);
        self.out.extend(crc.to_be_bytes());
    }

    fn r1(&self) -> u8 {
        if self.idle {
            0x01
        } else {
            0x00
        }
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.out.push_back(0xff);
        self.out.extend(bytes.iter().copied());
    }

    fn execute(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3f;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.commands.push(index);
        if self.absent {
            return;
        }
        if index == 12 && matches!(self.phase, Phase::MultiRead { .. }) && !self.out.is_empty() {
            // the frame itself was clocked against the next block
            let clocked = STREAMED_BLOCK_LEN - self.out.len();
            self.stop_lag = Some(clocked.saturating_sub(frame.len()));
        }
        self.out.clear();

        if index == 12 {
            self.phase = Phase::Command;
            self.out.extend([STUFF_BYTE, 0x00]);
            return;
        }

        if (index == 0 || self.crc_enabled) && crc7(&frame[..5]) != frame[5] {
            let r1 = self.r1() | R1_COM_CRC_ERROR;
            self.reply(&[r1]);
            return;
        }

        let app = core::mem::take(&mut self.app_next);
        match (app, index) {
            (_, 0) => {
                self.idle = true;
                self.crc_enabled = false;
                self.acmd41_left = self.acmd41_busy;
                self.phase = Phase::Command;
                self.reply(&[0x01]);
            }
            (_, 8) => {
                let r1 = self.r1();
                self.reply(&[r1, 0, 0, (arg >> 8) as u8 & 0x0f, arg as u8]);
            }
            (_, 59) => {
                let r1 = self.r1();
                if self.refuse_crc {
                    self.reply(&[r1 | R1_ILLEGAL_COMMAND]);
                } else {
                    self.crc_enabled = arg & 1 == 1;
                    self.reply(&[r1]);
                }
            }
            (_, 55) => {
                self.app_next = true;
                let r1 = self.r1();
                self.reply(&[r1]);
            }
            (true, 41) => {
                if self.acmd41_left > 0 {
                    self.acmd41_left -= 1;
                } else {
                    self.idle = false;
                }
                let r1 = self.r1();
                self.reply(&[r1]);
            }
            (true, 23) => {
                self.pre_erase = Some(arg);
                let r1 = self.r1();
                self.reply(&[r1]);
            }
            (_, 58) => {
                let r1 = self.r1();
                let [a, b, c, d] = OCR.to_be_bytes();
                self.reply(&[r1, a, b, c, d]);
            }
            (_, 16) => {
                let r1 = if arg == 512 {
                    self.r1()
                } else {
                    self.r1() | R1_PARAMETER_ERROR
                };
                self.reply(&[r1]);
            }
            (_, 17) if !self.idle => {
                self.reply(&[0x00]);
                self.queue_block(arg as u64);
            }
            (_, 18) if !self.idle => {
                self.reply(&[0x00]);
                self.phase = Phase::MultiRead { next: arg as u64 };
            }
            (_, 24) if !self.idle => {
                self.reply(&[0x00]);
                self.phase = Phase::WriteWait {
                    next: arg as u64,
                    multi: false,
                };
            }
            (_, 25) if !self.idle => {
                self.reply(&[0x00]);
                self.phase = Phase::WriteWait {
                    next: arg as u64,
                    multi: true,
                };
            }
            _ => {
                let r1 = self.r1() | R1_ILLEGAL_COMMAND;
                self.reply(&[r1]);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimError;

/// Bus wired to a [`SimCard`]. The "DMA" transfer happens immediately; only
/// its completion is deferred.
#[derive(Clone)]
pub struct SimBus {
    card: SimCard,
    mode: Mode,
}

impl SimBus {
    fn enabled(&self) -> Result<(), SimError> {
        if self.card.is_enabled() {
            Ok(())
        } else {
            Err(SimError)
        }
    }

    /// Deliver one pending completion the way the interrupt handlers would.
    fn interrupt(&mut self, signals: &WriteSignals, fast_path: u32) {
        let (sent, poll) = {
            let mut state = self.card.0.borrow_mut();
            let sent = core::mem::take(&mut state.block_sent);
            let poll = !sent && core::mem::take(&mut state.busy_poll);
            (sent, poll)
        };
        if sent {
            irq::on_block_sent(self, signals, fast_path);
        } else if poll {
            self.card.0.borrow_mut().busy_polls += 1;
            let sample = self.card.exchange(0xff);
            irq::on_busy_sample(self, signals, sample);
        }
    }
}

impl Bus for SimBus {
    type Error = SimError;

    fn set_clock(&mut self, clock: HertzU32) -> Result<(), SimError> {
        self.card.set_clock(clock.raw());
        Ok(())
    }

    fn disable(&mut self) {
        let mut state = self.card.0.borrow_mut();
        state.set_selected(false);
        state.enabled = false;
        state.block_sent = false;
        state.busy_poll = false;
    }

    fn select(&mut self) {
        self.card.set_selected(true);
    }

    fn deselect(&mut self) {
        self.card.set_selected(false);
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SimError> {
        self.enabled()?;
        for &byte in bytes {
            self.card.exchange(byte);
        }
        Ok(())
    }

    fn transfer(&mut self, byte: u8) -> Result<u8, SimError> {
        self.enabled()?;
        Ok(self.card.exchange(byte))
    }

    fn read_block(&mut self, block: &mut [u8; 512]) -> Result<u16, SimError> {
        self.enabled()?;
        for byte in block.iter_mut() {
            *byte = self.card.exchange(0xff);
        }
        Ok(crc16(block))
    }

    fn start_block_write(&mut self, block: &StableBlock) -> Result<(), SimError> {
        self.enabled()?;
        for &byte in block.bytes() {
            self.card.exchange(byte);
        }
        let mut state = self.card.0.borrow_mut();
        assert!(
            !state.block_sent,
            "block started while the previous one is still in flight"
        );
        state.write_crc = crc16(block.bytes());
        state.block_sent = true;
        Ok(())
    }

    fn block_write_crc(&mut self) -> u16 {
        self.card.0.borrow().write_crc
    }

    fn start_busy_poll(&mut self) -> Result<(), SimError> {
        self.enabled()?;
        let mut state = self.card.0.borrow_mut();
        match state.busy_poll_starts {
            Some(0) => return Err(SimError),
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        state.busy_poll = true;
        Ok(())
    }

    fn poll_event(&mut self) -> Option<BusEvent> {
        if self.mode == Mode::Interrupt {
            return None;
        }
        let mut state = self.card.0.borrow_mut();
        if core::mem::take(&mut state.block_sent) {
            return Some(BusEvent::BlockSent);
        }
        if core::mem::take(&mut state.busy_poll) {
            state.busy_polls += 1;
            let sample = state.exchange(0xff);
            return Some(BusEvent::BusySample(sample));
        }
        None
    }
}

/// Stands in for sleeping until an interrupt: in interrupt mode it runs the
/// handler for whatever completion is pending.
pub struct SimRelax {
    bus: SimBus,
    signals: &'static WriteSignals,
    fast_path: u32,
}

impl Relax for SimRelax {
    fn relax(&mut self) {
        if self.bus.mode == Mode::Interrupt {
            self.bus.interrupt(self.signals, self.fast_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Cmd;

    fn send(sim: &SimCard, frame: [u8; 6]) -> Vec<u8> {
        for byte in frame {
            sim.exchange(byte);
        }
        (0..8).map(|_| sim.exchange(0xff)).collect()
    }

    #[test]
    fn deselected_card_stays_silent() {
        let sim = SimCard::new();
        sim.set_clock(250_000);
        assert_eq!(send(&sim, Cmd::cmd0().frame()), vec![0xff; 8]);
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn go_idle_with_bad_crc_is_flagged() {
        let sim = SimCard::new();
        sim.set_clock(250_000);
        sim.set_selected(true);

        let mut frame = Cmd::cmd0().frame();
        frame[5] ^= 0x02;
        let reply = send(&sim, frame);
        assert_eq!(reply[1], 0x01 | R1_COM_CRC_ERROR);

        let reply = send(&sim, Cmd::cmd0().frame());
        assert_eq!(reply[1], 0x01);
    }

    #[test]
    fn interface_condition_is_echoed() {
        let sim = SimCard::new();
        sim.set_clock(250_000);
        sim.set_selected(true);
        let reply = send(&sim, Cmd::cmd8().frame());
        assert_eq!(&reply[1..6], &[0x01, 0x00, 0x00, 0x01, 0xaa]);
    }
}
