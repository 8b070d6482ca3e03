use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{LfsError, Result};
use crate::traits::block_device::BlockDevice;

/// How a block marked bad misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadBlock {
    /// Programs fail with `Corrupt`.
    ProgError,
    /// Erases fail with `Corrupt`.
    EraseError,
    /// Programs silently do nothing.
    ProgNoop,
    /// Erases silently do nothing.
    EraseNoop,
}

/// In-memory block device.
///
/// Besides plain storage it can simulate power loss (a budget of
/// program/erase operations after which the device stops accepting writes)
/// and bad blocks, which is what the crash and relocation tests build on.
#[derive(Debug, Clone)]
pub struct RamBlockDevice {
    data: Vec<u8>,
    block_size: u32,
    block_count: u32,
    erase_value: u8,
    power_budget: Option<u64>,
    bad_blocks: BTreeMap<u32, BadBlock>,
    wear: Vec<u32>,
    reads: u64,
    progs: u64,
    erases: u64,
}

impl RamBlockDevice {
    /// NOR-like device whose erased state reads as `0xff`.
    pub fn new(block_size: u32, block_count: u32) -> Self {
        Self::with_erase_value(block_size, block_count, 0xff)
    }

    pub fn with_erase_value(block_size: u32, block_count: u32, erase_value: u8) -> Self {
        Self {
            data: vec![erase_value; (block_size as usize) * (block_count as usize)],
            block_size,
            block_count,
            erase_value,
            power_budget: None,
            bad_blocks: BTreeMap::new(),
            wear: vec![0; block_count as usize],
            reads: 0,
            progs: 0,
            erases: 0,
        }
    }

    /// Allow `ops` more programs/erases, then "lose power".
    pub fn set_power_budget(&mut self, ops: u64) {
        self.power_budget = Some(ops);
    }

    /// Power restored, unlimited writes again.
    pub fn clear_power_budget(&mut self) {
        self.power_budget = None;
    }

    /// Whether the power budget ran out.
    pub fn lost_power(&self) -> bool {
        self.power_budget == Some(0)
    }

    pub fn set_bad_block(&mut self, block: u32, behavior: BadBlock) {
        self.bad_blocks.insert(block, behavior);
    }

    pub fn clear_bad_blocks(&mut self) {
        self.bad_blocks.clear();
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn progs(&self) -> u64 {
        self.progs
    }

    pub fn erases(&self) -> u64 {
        self.erases
    }

    /// How many times `block` was erased.
    pub fn erase_count(&self, block: u32) -> u32 {
        self.wear.get(block as usize).copied().unwrap_or(0)
    }

    /// Raw view of a block, for inspecting on-disk layout in tests.
    pub fn block(&self, block: u32) -> &[u8] {
        let start = (block as usize) * (self.block_size as usize);
        &self.data[start..start + self.block_size as usize]
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    fn range(&self, block: u32, off: u32, len: usize) -> Result<core::ops::Range<usize>> {
        if block >= self.block_count || off as usize + len > self.block_size as usize {
            return Err(LfsError::Inval);
        }
        let start = (block as usize) * (self.block_size as usize) + off as usize;
        Ok(start..start + len)
    }

    fn spend_power(&mut self) -> Result<()> {
        match self.power_budget {
            Some(0) => Err(LfsError::Io),
            Some(n) => {
                self.power_budget = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl BlockDevice for RamBlockDevice {
    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        let range = self.range(block, off, buf.len())?;
        self.reads += 1;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> Result<()> {
        let range = self.range(block, off, data.len())?;
        self.spend_power()?;
        self.progs += 1;
        match self.bad_blocks.get(&block) {
            Some(BadBlock::ProgError) => return Err(LfsError::Corrupt),
            Some(BadBlock::ProgNoop) => return Ok(()),
            _ => {}
        }
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        let range = self.range(block, 0, self.block_size as usize)?;
        self.spend_power()?;
        self.erases += 1;
        match self.bad_blocks.get(&block) {
            Some(BadBlock::EraseError) => return Err(LfsError::Corrupt),
            Some(BadBlock::EraseNoop) => return Ok(()),
            _ => {}
        }
        self.wear[block as usize] += 1;
        let erase_value = self.erase_value;
        self.data[range].fill(erase_value);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BadBlock, RamBlockDevice};
    use crate::error::LfsError;
    use crate::traits::block_device::BlockDevice;

    #[test]
    fn test_prog_and_read_back() {
        let mut dev = RamBlockDevice::new(128, 4);
        dev.erase(1).unwrap();
        dev.prog(1, 16, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 4];
        dev.read(1, 16, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 0xff]);
        assert_eq!(dev.erase_count(1), 1);
    }

    #[test]
    fn test_power_budget_stops_writes() {
        let mut dev = RamBlockDevice::with_erase_value(128, 4, 0);
        dev.set_power_budget(1);
        dev.prog(0, 0, &[9]).unwrap();
        assert_eq!(dev.prog(0, 1, &[9]), Err(LfsError::Io));
        assert!(dev.lost_power());
        assert_eq!(&dev.block(0)[..2], &[9u8, 0]);

        dev.clear_power_budget();
        dev.prog(0, 1, &[9]).unwrap();
    }

    #[test]
    fn test_bad_block_behaviors() {
        let mut dev = RamBlockDevice::new(128, 4);
        dev.set_bad_block(2, BadBlock::ProgError);
        dev.set_bad_block(3, BadBlock::EraseNoop);
        assert_eq!(dev.prog(2, 0, &[0]), Err(LfsError::Corrupt));
        dev.prog(3, 0, &[0]).unwrap();
        dev.erase(3).unwrap();
        assert_eq!(dev.block(3)[0], 0);
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        let mut dev = RamBlockDevice::new(128, 4);
        let mut buf = [0u8; 8];
        assert_eq!(dev.read(4, 0, &mut buf), Err(LfsError::Inval));
        assert_eq!(dev.read(0, 124, &mut buf), Err(LfsError::Inval));
    }
}
