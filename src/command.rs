//! SPI-mode command frames and the framing bytes that surround data phases.

use crate::crc::crc7;

/// Data token preceding a read block and a single-block write.
pub const DATA_START_BLOCK: u8 = 0xfe;
/// Data token preceding each block of a multi-block write.
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xfc;
/// Ends a multi-block write.
pub const STOP_TRAN_TOKEN: u8 = 0xfd;
/// Mask and value of an accepted data response token.
pub const DATA_RES_MASK: u8 = 0x1f;
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// R1 with only the idle bit set.
pub const R1_IDLE_STATE: u8 = 0x01;
pub const R1_READY_STATE: u8 = 0x00;

/// Check pattern and supply voltage (2.7-3.6 V) sent with SEND_IF_COND.
pub const IF_COND_PATTERN: u32 = 0x1aa;

/// R1 replies after which a response also carries a 32-bit trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Response {
    R1,
    /// R1 followed by the OCR
    R3,
    /// R1 followed by the echoed interface condition
    R7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cmd {
    pub index: u8,
    pub arg: u32,
    pub resp: Response,
}

impl Cmd {
    /// GO_IDLE_STATE
    pub const fn cmd0() -> Self {
        Self {
            index: 0,
            arg: 0,
            resp: Response::R1,
        }
    }
    /// SEND_IF_COND
    pub const fn cmd8() -> Self {
        Self {
            index: 8,
            arg: IF_COND_PATTERN,
            resp: Response::R7,
        }
    }
    /// STOP_TRANSMISSION
    pub const fn cmd12() -> Self {
        Self {
            index: 12,
            arg: 0,
            resp: Response::R1,
        }
    }
    /// SET_BLOCKLEN
    pub const fn cmd16(block_len: u32) -> Self {
        Self {
            index: 16,
            arg: block_len,
            resp: Response::R1,
        }
    }
    /// READ_SINGLE_BLOCK
    pub const fn cmd17(address: u32) -> Self {
        Self {
            index: 17,
            arg: address,
            resp: Response::R1,
        }
    }
    /// READ_MULTIPLE_BLOCK
    pub const fn cmd18(address: u32) -> Self {
        Self {
            index: 18,
            arg: address,
            resp: Response::R1,
        }
    }
    /// WRITE_BLOCK
    pub const fn cmd24(address: u32) -> Self {
        Self {
            index: 24,
            arg: address,
            resp: Response::R1,
        }
    }
    /// WRITE_MULTIPLE_BLOCK
    pub const fn cmd25(address: u32) -> Self {
        Self {
            index: 25,
            arg: address,
            resp: Response::R1,
        }
    }
    /// APP_CMD
    pub const fn cmd55() -> Self {
        Self {
            index: 55,
            arg: 0,
            resp: Response::R1,
        }
    }
    /// READ_OCR
    pub const fn cmd58() -> Self {
        Self {
            index: 58,
            arg: 0,
            resp: Response::R3,
        }
    }
    /// CRC_ON_OFF
    pub const fn cmd59(enable: bool) -> Self {
        Self {
            index: 59,
            arg: enable as u32,
            resp: Response::R1,
        }
    }
    /// SET_WR_BLK_ERASE_COUNT (application-specific command)
    pub const fn acmd23(blocks: u32) -> Self {
        Self {
            index: 23,
            arg: blocks & 0x7f_ffff,
            resp: Response::R1,
        }
    }
    /// SD_SEND_OP_COND (application-specific command), advertising high
    /// capacity support
    pub const fn acmd41() -> Self {
        Self {
            index: 41,
            arg: 1 << 30,
            resp: Response::R1,
        }
    }

    /// The six bytes clocked out on MOSI.
    pub fn frame(&self) -> [u8; 6] {
        let mut frame = [0x40 | self.index, 0, 0, 0, 0, 0];
        frame[1..5].copy_from_slice(&self.arg.to_be_bytes());
        frame[5] = crc7(&frame[..5]);
        frame
    }

    pub const fn has_trailer(&self) -> bool {
        !matches!(self.resp, Response::R1)
    }
}
