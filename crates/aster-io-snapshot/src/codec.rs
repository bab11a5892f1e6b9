//! Little-endian scalar stream for nested snapshot blobs.
//!
//! Variable-length device sub-structures (queues, tables) are packed with
//! [`Encoder`] into a single TLV field and unpacked with [`Decoder`].

use crate::{SnapshotError, SnapshotResult};

#[derive(Debug, Default)]
pub struct Encoder {
    bytes: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.bytes.push(v);
        self
    }

    pub fn bool(self, v: bool) -> Self {
        self.u8(v as u8)
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug)]
pub struct Decoder<'a> {
    bytes: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take<const N: usize>(&mut self) -> SnapshotResult<[u8; N]> {
        if self.bytes.len() < N {
            return Err(SnapshotError::Truncated);
        }
        let (head, rest) = self.bytes.split_at(N);
        self.bytes = rest;
        let mut arr = [0u8; N];
        arr.copy_from_slice(head);
        Ok(arr)
    }

    pub fn u8(&mut self) -> SnapshotResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn bool(&mut self) -> SnapshotResult<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> SnapshotResult<u16> {
        Ok(u16::from_le_bytes(self.take::<2>()?))
    }

    pub fn u32(&mut self) -> SnapshotResult<u32> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    pub fn u64(&mut self) -> SnapshotResult<u64> {
        Ok(u64::from_le_bytes(self.take::<8>()?))
    }
}
