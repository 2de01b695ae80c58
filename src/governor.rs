//! Retry at progressively lower bus speeds.
//!
//! Some cards (or some wiring) only behave below the nominal bus clock.
//! Rather than guess, the governor starts at full speed and, whenever the
//! card misbehaves, renegotiates from scratch one speed reduction level lower
//! and tries again.

use crate::bus::Bus;
use crate::card::{Error, SdCard};
use crate::fmt::Dbg;
use crate::relax::Relax;

/// Every speed reduction level was tried; carries the last error seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GaveUp<E>(pub E);

#[derive(Clone, Copy, Debug)]
pub struct Governor {
    max_level: u8,
    level: u8,
    initializations: u32,
}

impl Governor {
    pub fn new(max_level: u8) -> Self {
        Self {
            max_level,
            level: 0,
            initializations: 0,
        }
    }

    /// Speed reduction level the card was last brought up at.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Calls to [`SdCard::initialize`] made so far.
    pub fn initializations(&self) -> u32 {
        self.initializations
    }

    /// Bring the card up at the fastest level that works.
    pub fn establish<B: Bus, R: Relax>(
        &mut self,
        card: &mut SdCard<B, R>,
    ) -> Result<(), GaveUp<Error<B::Error>>> {
        let mut last = Error::NotReady;
        for level in 0..=self.max_level {
            if level > 0 {
                info!("retrying initialization at speed reduction {}", level);
            }
            match self.initialize(card, level) {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
        }
        error!("card could not be initialized: {:?}", Dbg(&last));
        Err(GaveUp(last))
    }

    /// Run `op` against the card. After a failure the card is renegotiated
    /// one level slower than it is running now and `op` runs again from the
    /// start, down to the last level; a level whose renegotiation fails moves
    /// straight on to the next. A card already at the last level gets no
    /// retry.
    ///
    /// A level reached here stays in effect until the next
    /// [`Governor::establish`].
    pub fn run<B: Bus, R: Relax, T>(
        &mut self,
        card: &mut SdCard<B, R>,
        mut op: impl FnMut(&mut SdCard<B, R>) -> Result<T, Error<B::Error>>,
    ) -> Result<T, GaveUp<Error<B::Error>>> {
        let mut last = match op(card) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let first = card.speed_level().saturating_add(1);
        for pass in first..=self.max_level {
            warn!("retrying at speed reduction {} after {:?}", pass, Dbg(&last));
            if let Err(e) = self.initialize(card, pass) {
                last = e;
                continue;
            }
            match op(card) {
                Ok(value) => return Ok(value),
                Err(e) => last = e,
            }
        }

        error!("giving up: {:?}", Dbg(&last));
        Err(GaveUp(last))
    }

    fn initialize<B: Bus, R: Relax>(
        &mut self,
        card: &mut SdCard<B, R>,
        level: u8,
    ) -> Result<(), Error<B::Error>> {
        self.initializations += 1;
        card.initialize(level)?;
        self.level = level;
        Ok(())
    }
}
