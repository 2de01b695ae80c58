//! `block-device-driver` view of a [`Disk`], so filesystem crates built on
//! that trait can mount the card directly.

use block_device_driver::BlockDevice;

use crate::bus::Bus;
use crate::disk::{Disk, IoError, IoctlCmd};
use crate::relax::Relax;
use crate::BLOCK_LEN;

impl<B: Bus, R: Relax, const N: usize> BlockDevice<512> for Disk<B, R, N> {
    type Error = IoError;
    type Align = aligned::A4;

    async fn read(
        &mut self,
        block_address: u32,
        data: &mut [aligned::Aligned<Self::Align, [u8; 512]>],
    ) -> Result<(), Self::Error> {
        Disk::read(self, data, block_address as u64)
    }

    async fn write(
        &mut self,
        block_address: u32,
        data: &[aligned::Aligned<Self::Align, [u8; 512]>],
    ) -> Result<(), Self::Error> {
        Disk::write(self, data, block_address as u64)
    }

    /// Size in bytes.
    async fn size(&mut self) -> Result<u64, Self::Error> {
        let sectors = self.ioctl(IoctlCmd::GetSectorCount)?;
        Ok(sectors * BLOCK_LEN as u64)
    }
}
