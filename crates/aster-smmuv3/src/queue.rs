//! Circular queue bookkeeping shared by the command and event queues.
//!
//! The queue storage itself lives in guest memory; the device only holds the
//! base/producer/consumer register values. Producer and consumer registers
//! carry an index in the low `log2size` bits and a wrap bit directly above
//! it; empty is "same index, same wrap", full is "same index, different
//! wrap".

use aster_io_snapshot::codec::{Decoder, Encoder};
use aster_io_snapshot::SnapshotResult;

use crate::bits::extract64;

/// Base-register bits that form the queue address (bits [51:5]).
const QUEUE_BASE_ADDR_MASK: u64 = 0x000f_ffff_ffff_ffe0;

#[derive(Debug, Clone)]
pub struct Queue {
    pub base: u64,
    pub prod: u32,
    pub cons: u32,
    pub log2size: u8,
    entry_size: usize,
    max_log2size: u8,
}

impl Queue {
    pub fn new(entry_size: usize, max_log2size: u8) -> Self {
        Self {
            base: 0,
            prod: 0,
            cons: 0,
            log2size: 0,
            entry_size,
            max_log2size,
        }
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Latch a guest write to the BASE register; LOG2SIZE is capped at the
    /// implementation maximum.
    pub fn set_base(&mut self, value: u64) {
        self.base = value;
        let log2size = extract64(value, 0, 5) as u8;
        self.log2size = log2size.min(self.max_log2size);
    }

    pub fn reset(&mut self) {
        self.base = u64::from(self.max_log2size);
        self.prod = 0;
        self.cons = 0;
        self.log2size = self.max_log2size;
    }

    fn index_mask(&self) -> u32 {
        (1 << self.log2size) - 1
    }

    fn wrap_bit(&self) -> u32 {
        1 << self.log2size
    }

    pub fn prod_index(&self) -> u32 {
        self.prod & self.index_mask()
    }

    pub fn cons_index(&self) -> u32 {
        self.cons & self.index_mask()
    }

    pub fn prod_wrap(&self) -> bool {
        self.prod & self.wrap_bit() != 0
    }

    pub fn cons_wrap(&self) -> bool {
        self.cons & self.wrap_bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.prod_wrap() == self.cons_wrap() && self.prod_index() == self.cons_index()
    }

    pub fn is_full(&self) -> bool {
        self.prod_wrap() != self.cons_wrap() && self.prod_index() == self.cons_index()
    }

    /// Advance the consumer past one fully-processed entry.
    pub fn cons_incr(&mut self) {
        let mask = (self.wrap_bit() << 1) - 1;
        self.cons = (self.cons.wrapping_add(1)) & mask;
    }

    /// Advance the producer past one written entry.
    pub fn prod_incr(&mut self) {
        let mask = (self.wrap_bit() << 1) - 1;
        self.prod = (self.prod.wrapping_add(1)) & mask;
    }

    fn base_addr(&self) -> u64 {
        self.base & QUEUE_BASE_ADDR_MASK
    }

    pub fn cons_entry_addr(&self) -> u64 {
        self.base_addr() + u64::from(self.cons_index()) * self.entry_size as u64
    }

    pub fn prod_entry_addr(&self) -> u64 {
        self.base_addr() + u64::from(self.prod_index()) * self.entry_size as u64
    }

    pub(crate) fn encode(&self, enc: Encoder) -> Encoder {
        enc.u64(self.base).u32(self.prod).u32(self.cons).u8(self.log2size)
    }

    pub(crate) fn decode(&mut self, dec: &mut Decoder<'_>) -> SnapshotResult<()> {
        self.base = dec.u64()?;
        self.prod = dec.u32()?;
        self.cons = dec.u32()?;
        self.log2size = dec.u8()?.min(self.max_log2size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(log2size: u8) -> Queue {
        let mut q = Queue::new(16, 19);
        q.set_base(0x1000 | u64::from(log2size));
        q
    }

    #[test]
    fn empty_full_wrap() {
        let mut q = q(2); // 4 entries
        assert!(q.is_empty());
        assert!(!q.is_full());

        // Guest produces 4 entries: full, producer wrap set.
        q.prod = 4; // index 0, wrap 1
        assert!(q.is_full());
        assert!(!q.is_empty());

        q.cons_incr();
        assert!(!q.is_full());
        for _ in 0..3 {
            q.cons_incr();
        }
        assert!(q.is_empty());
        assert!(q.cons_wrap());
        assert_eq!(q.cons_index(), 0);
    }

    #[test]
    fn cons_incr_wraps_including_wrap_bit() {
        let mut q = q(1); // 2 entries
        q.cons = 0b11; // index 1, wrap 1
        q.cons_incr();
        assert_eq!(q.cons, 0); // wrap bit toggles back to 0
    }

    #[test]
    fn entry_addresses_use_masked_base() {
        let mut q = Queue::new(32, 19);
        q.set_base(0x8000_0000_0005); // low bits are LOG2SIZE, not address
        assert_eq!(q.log2size, 5);
        q.cons = 3;
        assert_eq!(q.cons_entry_addr(), 0x8000_0000_0000 + 3 * 32);
    }

    #[test]
    fn log2size_capped_at_implementation_max() {
        let mut q = Queue::new(16, 19);
        q.set_base(31);
        assert_eq!(q.log2size, 19);
    }
}
