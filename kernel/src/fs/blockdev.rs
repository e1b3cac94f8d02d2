//! Block Device Abstraction
//!
//! Byte-addressed interface the page cache drives; implementations are
//! expected to be sector devices underneath. Errors are negative device
//! codes and propagate through the cache to the original requester
//! unchanged.

use alloc::{string::String, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    sync::IrqSpinlock,
};

/// Block device trait
pub trait BlockDevice: Send + Sync {
    /// Device name
    fn name(&self) -> &str;

    /// Sector size in bytes
    fn block_size(&self) -> usize;

    /// Total number of sectors
    fn block_count(&self) -> u64;

    /// Read `buf.len()` bytes starting at byte `offset`.
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> KernelResult<()>;

    /// Write `buf` starting at byte `offset`.
    fn write_bytes(&self, offset: u64, buf: &[u8]) -> KernelResult<()>;

    /// Total size in bytes.
    fn size(&self) -> u64 {
        self.block_count() * self.block_size() as u64
    }
}

/// RAM-backed block device, for the cache's own exercise and early boot
/// ramdisks.
pub struct RamDisk {
    name: String,
    block_size: usize,
    data: IrqSpinlock<Vec<u8>>,
}

impl RamDisk {
    pub fn new(name: String, block_size: usize, block_count: u64) -> Self {
        let size = block_size * block_count as usize;
        Self {
            name,
            block_size,
            data: IrqSpinlock::new(alloc::vec![0u8; size]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.lock().len() / self.block_size) as u64
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> KernelResult<()> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(KernelError::InvalidArgument)?;
        if end > data.len() {
            return Err(KernelError::DeviceError { code: -5 });
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> KernelResult<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(KernelError::InvalidArgument)?;
        if end > data.len() {
            return Err(KernelError::DeviceError { code: -5 });
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ramdisk_round_trips() {
        let disk = RamDisk::new(String::from("ram0"), 512, 16);
        let payload = [0xABu8; 100];
        disk.write_bytes(700, &payload).expect("write in range");

        let mut back = [0u8; 100];
        disk.read_bytes(700, &mut back).expect("read in range");
        assert_eq!(back, payload);
    }

    #[test]
    fn out_of_range_reports_device_error() {
        let disk = RamDisk::new(String::from("ram0"), 512, 2);
        let mut buf = [0u8; 512];
        assert_eq!(
            disk.read_bytes(1024, &mut buf),
            Err(KernelError::DeviceError { code: -5 })
        );
    }
}
