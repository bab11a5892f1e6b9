//! Power-of-two range covers for invalidation.
//!
//! Cache invalidations and unmap notifications are expressed as
//! naturally-aligned power-of-two spans. A ranged invalidation command can
//! name a span that is neither aligned nor a power of two, so it is broken
//! into a sequence of maximal aligned power-of-two subranges.

/// Largest naturally-aligned power-of-two mask usable from `start` without
/// leaving `[start, end]`, capped at `2^max_bits`. Returns the span size
/// minus one, so a 4K-aligned start with at least 4K to cover yields `0xfff`.
pub(crate) fn aligned_pow2_mask(start: u64, end: u64, max_bits: u32) -> u64 {
    let max_mask = u64::MAX >> (64 - max_bits);
    let alignment_mask = if start == 0 {
        max_mask
    } else {
        ((start & start.wrapping_neg()) - 1).min(max_mask)
    };
    let addr_mask = end - start;
    let size_mask = addr_mask.min(max_mask);

    if alignment_mask <= size_mask {
        // The alignment of start is the limiting factor.
        return alignment_mask;
    }

    if addr_mask == u64::MAX {
        return max_mask;
    }
    // Largest power of two no bigger than the span size.
    (1u64 << (63 - (addr_mask + 1).leading_zeros())) - 1
}

/// Iterator over the aligned power-of-two subranges covering
/// `[start, start + size)`. Spans reaching past the top of the address
/// space are clamped to it.
pub(crate) struct Pow2Cover {
    next: u64,
    end: u64,
    max_bits: u32,
    done: bool,
}

impl Pow2Cover {
    pub(crate) fn new(start: u64, size: u64, max_bits: u32) -> Self {
        Self {
            next: start,
            end: start.saturating_add(size.wrapping_sub(1)),
            max_bits,
            done: size == 0,
        }
    }
}

impl Iterator for Pow2Cover {
    /// (start, span size minus one).
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let start = self.next;
        let mask = aligned_pow2_mask(start, self.end, self.max_bits);
        // The mask never exceeds the remaining span, so equality means this
        // subrange is the last one.
        if mask >= self.end - start {
            self.done = true;
        } else {
            self.next = start + mask + 1;
        }
        Some((start, mask))
    }
}
