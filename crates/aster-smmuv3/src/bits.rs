//! Bitfield helpers for the guest-visible wire formats (registers, STE/CD,
//! commands, event records). Bit positions follow the architected layouts
//! and must not change.

pub(crate) const fn extract32(value: u32, start: u32, length: u32) -> u32 {
    debug_assert!(start + length <= 32);
    if length == 32 {
        value
    } else {
        (value >> start) & ((1 << length) - 1)
    }
}

pub(crate) const fn deposit32(value: u32, start: u32, length: u32, field: u32) -> u32 {
    debug_assert!(start + length <= 32);
    let mask = if length == 32 {
        u32::MAX
    } else {
        ((1u32 << length) - 1) << start
    };
    (value & !mask) | ((field << start) & mask)
}

pub(crate) const fn extract64(value: u64, start: u32, length: u32) -> u64 {
    debug_assert!(start + length <= 64);
    if length == 64 {
        value
    } else {
        (value >> start) & ((1 << length) - 1)
    }
}

pub(crate) const fn deposit64(value: u64, start: u32, length: u32, field: u64) -> u64 {
    debug_assert!(start + length <= 64);
    let mask = if length == 64 {
        u64::MAX
    } else {
        ((1u64 << length) - 1) << start
    };
    (value & !mask) | ((field << start) & mask)
}

/// Sign-extending variant of [`extract64`].
pub(crate) const fn sextract64(value: u64, start: u32, length: u32) -> i64 {
    debug_assert!(start + length <= 64);
    ((value << (64 - length - start)) as i64) >> (64 - length)
}

/// Contiguous mask of the low `length` bits.
pub(crate) const fn mask64(length: u32) -> u64 {
    if length == 64 {
        u64::MAX
    } else {
        (1u64 << length) - 1
    }
}
