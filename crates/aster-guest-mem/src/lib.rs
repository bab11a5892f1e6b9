#![forbid(unsafe_code)]

//! Guest physical memory access for device-initiated DMA.
//!
//! The SMMU model fetches stream table entries, context descriptors and queue
//! entries directly from guest physical memory, and devices behind it DMA
//! through it. The backing store (RAM layout, MMIO holes, remapping) belongs
//! to the surrounding machine, so access goes through the [`GuestMemory`]
//! trait. Reads take `&mut self` because real backings may have side effects.
//!
//! Accesses are fallible: a fetch from an unbacked address must surface as an
//! error the device can turn into a typed fault record, never as a panic.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest physical access out of bounds: addr={addr:#x} len={len}")]
    OutOfBounds { addr: u64, len: usize },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

pub trait GuestMemory {
    fn read(&mut self, paddr: u64, buf: &mut [u8]) -> GuestMemoryResult<()>;
    fn write(&mut self, paddr: u64, buf: &[u8]) -> GuestMemoryResult<()>;

    fn read_u32(&mut self, paddr: u64) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self, paddr: u64) -> GuestMemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u32(&mut self, paddr: u64, val: u32) -> GuestMemoryResult<()> {
        self.write(paddr, &val.to_le_bytes())
    }

    fn write_u64(&mut self, paddr: u64, val: u64) -> GuestMemoryResult<()> {
        self.write(paddr, &val.to_le_bytes())
    }
}

/// Flat RAM backing starting at guest physical address zero.
///
/// Reference implementation used by tests and by machines without a memory
/// hole; anything past the end of the vector is unbacked.
#[derive(Debug, Clone)]
pub struct VecMemory {
    bytes: Vec<u8>,
}

impl VecMemory {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn range(&self, paddr: u64, len: usize) -> GuestMemoryResult<std::ops::Range<usize>> {
        let start = usize::try_from(paddr)
            .map_err(|_| GuestMemoryError::OutOfBounds { addr: paddr, len })?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(GuestMemoryError::OutOfBounds { addr: paddr, len })?;
        Ok(start..end)
    }
}

impl GuestMemory for VecMemory {
    fn read(&mut self, paddr: u64, buf: &mut [u8]) -> GuestMemoryResult<()> {
        let range = self.range(paddr, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, paddr: u64, buf: &[u8]) -> GuestMemoryResult<()> {
        let range = self.range(paddr, buf.len())?;
        self.bytes[range].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_helpers_are_little_endian() {
        let mut mem = VecMemory::new(0x100);
        mem.write_u32(0x10, 0x1122_3344).unwrap();
        let mut b = [0u8; 4];
        mem.read(0x10, &mut b).unwrap();
        assert_eq!(b, [0x44, 0x33, 0x22, 0x11]);
        assert_eq!(mem.read_u32(0x10).unwrap(), 0x1122_3344);

        mem.write_u64(0x20, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(mem.read_u64(0x20).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn out_of_bounds_access_fails() {
        let mut mem = VecMemory::new(0x10);
        let mut buf = [0u8; 4];
        assert_eq!(
            mem.read(0xe, &mut buf),
            Err(GuestMemoryError::OutOfBounds { addr: 0xe, len: 4 })
        );
        assert!(mem.write(u64::MAX - 2, &[0; 4]).is_err());
        // Right at the end is still fine.
        assert!(mem.read(0xc, &mut buf).is_ok());
    }
}
