//! The sector-level interface a filesystem sits on.
//!
//! On top of the card this adds the speed governor around every transfer,
//! a cache of recently transferred sectors and deferral of all-zero writes,
//! which filesystems issue in long runs when formatting or extending files.
//! Errors are collapsed into [`IoError`] after being logged.

use crate::bus::{Bus, StableBlock};
use crate::cache::BlockCache;
use crate::card::{Error, SdCard};
use crate::fmt::Dbg;
use crate::governor::{GaveUp, Governor};
use crate::relax::Relax;
use crate::{Block, ZEROED_BLOCK};

/// Source of every deferred zero block sent to the card.
static ZERO_BLOCK: Block = ZEROED_BLOCK;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Ready,
    NoInit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoctlCmd {
    /// Push everything deferred or still in flight out to the card.
    Sync,
    /// Erase block size in sectors.
    GetBlockSize,
    GetSectorCount,
}

/// The device failed; details went to the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IoError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    pub sectors_read: u64,
    pub sectors_written: u64,
}

/// All-zero sectors written but not yet sent.
#[derive(Clone, Copy, Debug)]
struct ZeroRun {
    start: u64,
    count: u64,
}

impl ZeroRun {
    fn end(&self) -> u64 {
        self.start + self.count
    }
}

pub struct Disk<B: Bus, R: Relax, const N: usize = 64> {
    card: SdCard<B, R>,
    governor: Governor,
    cache: BlockCache<N>,
    zeros: Option<ZeroRun>,
    stats: Stats,
}

impl<B: Bus, R: Relax, const N: usize> Disk<B, R, N> {
    pub fn new(card: SdCard<B, R>) -> Self {
        let governor = Governor::new(card.config().max_speed_reduction);
        Self {
            card,
            governor,
            cache: BlockCache::new(),
            zeros: None,
            stats: Stats::default(),
        }
    }

    pub fn status(&self) -> Status {
        if self.card.is_ready() {
            Status::Ready
        } else {
            Status::NoInit
        }
    }

    /// Bring the card up if it is not already, and forget cached sectors.
    pub fn initialize(&mut self) -> Result<(), IoError> {
        if !self.card.is_ready() {
            self.zeros = None;
            self.governor.establish(&mut self.card).map_err(collapse)?;
        }
        self.cache.clear();
        Ok(())
    }

    /// Read `blocks.len()` sectors starting at `sector`.
    ///
    /// Sectors past the end of the card are not caught here.
    pub fn read(&mut self, blocks: &mut [Block], sector: u64) -> Result<(), IoError> {
        if blocks.is_empty() {
            return Ok(());
        }
        self.flush_zeros()?;
        self.close_session()?;

        if let [block] = blocks {
            if let Some(cached) = self.cache.lookup(sector) {
                debug!("reusing cached block {}", sector);
                *block = *cached;
                return Ok(());
            }
        }

        debug!("reading {} blocks at {}", blocks.len(), sector);
        self.governor
            .run(&mut self.card, |card| card.read_blocks(blocks, sector))
            .map_err(collapse)?;

        self.stats.sectors_read += blocks.len() as u64;
        for (offset, block) in (0u64..).zip(blocks.iter()) {
            self.cache.store(sector + offset, block);
        }
        Ok(())
    }

    /// Write `blocks` to consecutive sectors starting at `sector`.
    ///
    /// All-zero data contiguous with earlier all-zero data is held back and
    /// sent as one run later. Other data goes out immediately, but the write
    /// session is left open so that a directly following write continues it.
    pub fn write(&mut self, blocks: &[Block], sector: u64) -> Result<(), IoError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let count = blocks.len() as u64;

        if blocks.iter().all(|block| block.iter().all(|&byte| byte == 0)) {
            match self.zeros {
                Some(run) if run.end() == sector => {
                    self.zeros = Some(ZeroRun {
                        count: run.count + count,
                        ..run
                    });
                }
                _ => {
                    self.flush_zeros()?;
                    self.zeros = Some(ZeroRun {
                        start: sector,
                        count,
                    });
                }
            }
            for offset in 0..count {
                self.cache.invalidate(sector + offset);
            }
            trace!("deferring {} zero blocks at {}", count, sector);
            return Ok(());
        }

        self.flush_zeros()?;
        if self.card.next_write_address() != Some(sector) {
            self.close_session()?;
        }

        debug!("writing {} blocks at {}", count, sector);
        let expected = if count > 1 { Some(clamp(count)) } else { None };
        self.governor
            .run(&mut self.card, |card| {
                card.begin(sector, expected)?;
                card.submit_all(blocks)
            })
            .map_err(collapse)?;

        self.stats.sectors_written += count;
        for (offset, block) in (0u64..).zip(blocks.iter()) {
            self.cache.store(sector + offset, block);
        }
        Ok(())
    }

    pub fn ioctl(&mut self, cmd: IoctlCmd) -> Result<u64, IoError> {
        match cmd {
            IoctlCmd::Sync => {
                self.flush_zeros()?;
                self.close_session()?;
                Ok(0)
            }
            IoctlCmd::GetBlockSize => Ok(1),
            IoctlCmd::GetSectorCount => Ok(self.card.config().sector_count),
        }
    }

    /// Sync, then power the card down.
    pub fn shutdown(&mut self) -> Result<(), IoError> {
        let flushed = self.flush_zeros();
        let result = self.card.shutdown().map_err(|e| collapse(GaveUp(e)));
        self.cache.clear();
        flushed.and(result)
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn card(&self) -> &SdCard<B, R> {
        &self.card
    }

    pub fn card_mut(&mut self) -> &mut SdCard<B, R> {
        &mut self.card
    }

    fn flush_zeros(&mut self) -> Result<(), IoError> {
        // dropped even if it fails to go out, like any failed write
        let Some(run) = self.zeros.take() else {
            return Ok(());
        };

        self.close_session()?;
        debug!("writing {} deferred zero blocks at {}", run.count, run.start);
        self.governor
            .run(&mut self.card, |card| {
                card.begin(run.start, Some(clamp(run.count)))?;
                for _ in 0..run.count {
                    card.submit_stable(StableBlock::from_static(&ZERO_BLOCK))?;
                }
                card.end()
            })
            .map_err(collapse)?;

        self.stats.sectors_written += run.count;
        Ok(())
    }

    /// End the open write session outside the governor, so that a failure
    /// to finish earlier blocks is reported instead of retried away.
    fn close_session(&mut self) -> Result<(), IoError> {
        self.card.end().map_err(|e| collapse(GaveUp(e)))
    }
}

fn clamp(count: u64) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

fn collapse<E: core::fmt::Debug>(e: GaveUp<Error<E>>) -> IoError {
    error!("disk i/o failed: {:?}", Dbg(&e));
    IoError
}
