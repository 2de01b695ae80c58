use fugit::HertzU32;

/// Driver tuning. `Default` matches a microSD socket wired directly to the
/// MCU with short traces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Bus clock during power-up negotiation; must stay within 100-400 kHz.
    pub negotiation_clock: HertzU32,
    /// Bus clock once the card is ready, at speed reduction level 0.
    pub operating_clock: HertzU32,
    /// Highest speed reduction level the governor may fall back to.
    pub max_speed_reduction: u8,

    /// GO_IDLE_STATE attempts before giving up on the card.
    pub cmd0_attempts: u32,
    /// After this many GO_IDLE_STATE attempts, an all-ones reply means there
    /// is no card in the socket.
    pub cmd0_absent_after: u32,
    pub cmd8_attempts: u32,
    pub acmd41_attempts: u32,
    /// Attempts for READ_OCR, SET_BLOCKLEN and APP_CMD prefixes.
    pub register_attempts: u32,

    /// Bytes clocked while waiting for an R1 reply.
    pub r1_polls: u32,
    /// Bytes clocked while waiting for the card to release MISO before a command.
    pub ready_polls: u32,
    /// Bytes clocked while waiting for a read data token.
    pub token_polls: u32,
    /// Busy samples taken inline after a block write before falling back to
    /// background polling.
    pub busy_fast_path: u32,
    /// Relax calls allowed while waiting for a write to complete or the
    /// card to stop being busy.
    pub busy_waits: u32,

    /// Reported by the sector-count ioctl.
    pub sector_count: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            negotiation_clock: HertzU32::kHz(250),
            operating_clock: HertzU32::MHz(24),
            max_speed_reduction: 3,

            cmd0_attempts: 4096,
            cmd0_absent_after: 1024,
            cmd8_attempts: 256,
            acmd41_attempts: 65_536,
            register_attempts: 256,

            r1_polls: 8,
            ready_polls: 262_144,
            token_polls: 1 << 20,
            busy_fast_path: 4,
            busy_waits: 1 << 22,

            sector_count: 0x7fff_ffff,
        }
    }
}

impl Config {
    /// Bus clock at a given speed reduction level.
    pub fn clock_at(&self, level: u8) -> HertzU32 {
        HertzU32::from_raw(self.operating_clock.raw() / (level as u32 + 1))
    }
}
