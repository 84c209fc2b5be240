use core::fmt::Debug;
use core::pin::Pin;

use alloc::boxed::Box;
use thiserror::Error;

pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Error)]
pub enum IoErr {
    #[error("The device is unavailable")]
    Unavailable,
    #[error("Sector is out of range")]
    SectorOutOfRange,
    #[error("The IO process timed out")]
    IoTimeout,
}

/// A device exposing 512-byte sectors.
///
/// The async methods may suspend the caller while the transfer completes;
/// `read_sector_nosleep` must not, it is the probe path that runs before
/// interrupts are enabled.
pub trait BlockDevice: Send + Sync + Debug {
    fn sector_count(&mut self) -> u64;

    /// Reads one sector into `buf`, which must hold at least [`SECTOR_SIZE`]
    /// bytes.
    fn read_sector<'a>(
        &'a mut self,
        index: u64,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), IoErr>> + Send + Sync + 'a>>;

    /// Writes one sector from `buf`, which must hold at least
    /// [`SECTOR_SIZE`] bytes.
    fn write_sector<'a>(
        &'a mut self,
        index: u64,
        buf: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), IoErr>> + Send + Sync + 'a>>;

    fn read_sector_nosleep(&mut self, index: u64, buf: &mut [u8]) -> Result<(), IoErr>;
}

#[cfg(test)]
pub(crate) mod testdev {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    /// Memory-backed sector device for the test suites.
    #[derive(Debug)]
    pub struct RamDisk {
        data: Vec<u8>,
    }

    impl RamDisk {
        pub fn new(sector_count: u64) -> Self {
            Self {
                data: vec![0u8; sector_count as usize * SECTOR_SIZE],
            }
        }

        fn span(&self, index: u64) -> Result<core::ops::Range<usize>, IoErr> {
            let start = index as usize * SECTOR_SIZE;
            if start + SECTOR_SIZE > self.data.len() {
                return Err(IoErr::SectorOutOfRange);
            }
            Ok(start..start + SECTOR_SIZE)
        }
    }

    impl BlockDevice for RamDisk {
        fn sector_count(&mut self) -> u64 {
            (self.data.len() / SECTOR_SIZE) as u64
        }

        fn read_sector<'a>(
            &'a mut self,
            index: u64,
            buf: &'a mut [u8],
        ) -> Pin<Box<dyn Future<Output = Result<(), IoErr>> + Send + Sync + 'a>> {
            Box::pin(async move {
                let span = self.span(index)?;
                buf[..SECTOR_SIZE].copy_from_slice(&self.data[span]);
                Ok(())
            })
        }

        fn write_sector<'a>(
            &'a mut self,
            index: u64,
            buf: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = Result<(), IoErr>> + Send + Sync + 'a>> {
            Box::pin(async move {
                let span = self.span(index)?;
                self.data[span].copy_from_slice(&buf[..SECTOR_SIZE]);
                Ok(())
            })
        }

        fn read_sector_nosleep(&mut self, index: u64, buf: &mut [u8]) -> Result<(), IoErr> {
            let span = self.span(index)?;
            buf[..SECTOR_SIZE].copy_from_slice(&self.data[span]);
            Ok(())
        }
    }
}
