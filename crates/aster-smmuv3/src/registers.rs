//! MMIO register map and architected field positions.
//!
//! Offsets are within the 128KB region; the device folds the page-1 alias
//! (bit 16) before dispatch, so only page-0 offsets appear here.

/// Size of the MMIO region (two 64KB pages; page 1 aliases page 0).
pub const REGION_SIZE: u64 = 0x20000;
pub(crate) const PAGE1_ALIAS_BIT: u64 = 0x10000;

pub const REG_IDR0: u64 = 0x0;
pub const REG_IDR1: u64 = 0x4;
pub const REG_IDR2: u64 = 0x8;
pub const REG_IDR3: u64 = 0xc;
pub const REG_IDR4: u64 = 0x10;
pub const REG_IDR5: u64 = 0x14;
pub const REG_IIDR: u64 = 0x18;
pub const REG_AIDR: u64 = 0x1c;
pub const REG_CR0: u64 = 0x20;
pub const REG_CR0ACK: u64 = 0x24;
pub const REG_CR1: u64 = 0x28;
pub const REG_CR2: u64 = 0x2c;
pub const REG_STATUSR: u64 = 0x40;
pub const REG_GBPA: u64 = 0x44;
pub const REG_IRQ_CTRL: u64 = 0x50;
pub const REG_IRQ_CTRL_ACK: u64 = 0x54;
pub const REG_GERROR: u64 = 0x60;
pub const REG_GERRORN: u64 = 0x64;
pub const REG_GERROR_IRQ_CFG0: u64 = 0x68;
pub const REG_GERROR_IRQ_CFG1: u64 = 0x70;
pub const REG_GERROR_IRQ_CFG2: u64 = 0x74;
pub const REG_STRTAB_BASE: u64 = 0x80;
pub const REG_STRTAB_BASE_CFG: u64 = 0x88;
pub const REG_CMDQ_BASE: u64 = 0x90;
pub const REG_CMDQ_PROD: u64 = 0x98;
pub const REG_CMDQ_CONS: u64 = 0x9c;
pub const REG_EVENTQ_BASE: u64 = 0xa0;
pub const REG_EVENTQ_PROD: u64 = 0xa8;
pub const REG_EVENTQ_CONS: u64 = 0xac;
pub const REG_EVENTQ_IRQ_CFG0: u64 = 0xb0;
pub const REG_EVENTQ_IRQ_CFG1: u64 = 0xb8;
pub const REG_EVENTQ_IRQ_CFG2: u64 = 0xbc;
/// CoreSight-style peripheral/component ID window (read-only zeroes here).
pub const REG_IDREGS: u64 = 0xfd0;
pub const REG_IDREGS_END: u64 = 0xfff;

// CR0
pub const CR0_SMMUEN: u32 = 1 << 0;
pub const CR0_PRIQEN: u32 = 1 << 1;
pub const CR0_EVENTQEN: u32 = 1 << 2;
pub const CR0_CMDQEN: u32 = 1 << 3;
/// Bits that never latch into CR0ACK.
pub const CR0_RESERVED: u32 = 0xffff_fc20;

// IRQ_CTRL
pub const IRQ_CTRL_GERROR_IRQEN: u32 = 1 << 0;
pub const IRQ_CTRL_PRIQ_IRQEN: u32 = 1 << 1;
pub const IRQ_CTRL_EVENTQ_IRQEN: u32 = 1 << 2;

// GERROR / GERRORN
pub const GERROR_CMDQ_ERR: u32 = 1 << 0;
pub const GERROR_EVENTQ_ABT_ERR: u32 = 1 << 2;
pub const GERROR_PRIQ_ABT_ERR: u32 = 1 << 3;
pub const GERROR_MSI_CMDQ_ABT_ERR: u32 = 1 << 4;
pub const GERROR_MSI_EVENTQ_ABT_ERR: u32 = 1 << 5;
pub const GERROR_MSI_PRIQ_ABT_ERR: u32 = 1 << 6;
pub const GERROR_MSI_GERROR_ABT_ERR: u32 = 1 << 7;
pub const GERROR_SFM_ERR: u32 = 1 << 8;

// GBPA
pub const GBPA_ABORT: u32 = 1 << 20;
pub const GBPA_UPDATE: u32 = 1 << 31;
/// Reset keeps the architected incoming-shareability default; ABORT clear
/// means transactions bypass while the SMMU is disabled.
pub const GBPA_RESET_VAL: u32 = 0x1000;

// STRTAB_BASE / STRTAB_BASE_CFG
pub const STRTAB_BASE_ADDR_MASK: u64 = 0x000f_ffff_ffff_ffc0;
pub const STRTAB_BASE_CFG_LOG2SIZE_SHIFT: u32 = 0;
pub const STRTAB_BASE_CFG_LOG2SIZE_LEN: u32 = 6;
pub const STRTAB_BASE_CFG_SPLIT_SHIFT: u32 = 6;
pub const STRTAB_BASE_CFG_SPLIT_LEN: u32 = 5;
pub const STRTAB_BASE_CFG_FMT_SHIFT: u32 = 16;
pub const STRTAB_BASE_CFG_FMT_LEN: u32 = 2;
pub const STRTAB_FMT_LINEAR: u32 = 0;
pub const STRTAB_FMT_2LVL: u32 = 1;

// CMDQ_CONS error field
pub const CMDQ_CONS_ERR_SHIFT: u32 = 24;
pub const CMDQ_CONS_ERR_LEN: u32 = 7;

// Implementation identity
pub const SMMU_IDR1_SIDSIZE: u32 = 16;
pub const SMMU_CMDQS: u8 = 19;
pub const SMMU_EVENTQS: u8 = 19;
/// IDR5.OAS encoding 4 = 44 output address bits.
pub const SMMU_IDR5_OAS: u32 = 4;

/// Translate an IDR5.OAS / CD.IPS / STE.S2PS encoding to a bit count.
pub const fn oas2bits(oas: u32) -> u32 {
    match oas {
        0 => 32,
        1 => 36,
        2 => 40,
        3 => 42,
        4 => 44,
        5 => 48,
        _ => 48,
    }
}
