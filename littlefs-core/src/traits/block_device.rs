use crate::error::Result;

/// Block device abstraction, the only way the filesystem touches storage.
///
/// Addresses are `(block, offset)` pairs. The filesystem only issues reads
/// aligned to `read_size`, programs aligned to `prog_size` on erased space, and
/// erases of whole blocks; geometry lives in [`crate::Config`].
pub trait BlockDevice {
    /// Read `buf.len()` bytes starting at `off` inside `block`.
    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `data` at `off` inside a previously erased `block`.
    ///
    /// Returning `Err(Corrupt)` marks the block as bad, the caller relocates.
    fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> Result<()>;

    /// Erase a block. Its content is undefined until programmed.
    fn erase(&mut self, block: u32) -> Result<()>;

    /// Flush all pending programs to stable storage.
    fn sync(&mut self) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(block, off, buf)
    }

    fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> Result<()> {
        (**self).prog(block, off, data)
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        (**self).erase(block)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }
}
