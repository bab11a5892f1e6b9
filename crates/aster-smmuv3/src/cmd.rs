//! Command queue entry encoding.
//!
//! Commands are 16-byte little-endian records of four 32-bit words. Field
//! positions are the architected wire format consumed from guest memory.

use crate::bits::{deposit32, extract32};

/// Consumer-side error codes latched into CMDQ_CONS.ERR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdError {
    None,
    /// Illegal or unsupported command encoding.
    Ill,
    /// Queue entry fetch aborted.
    Abt,
}

impl CmdError {
    pub(crate) fn code(self) -> u32 {
        match self {
            CmdError::None => 0,
            CmdError::Ill => 1,
            CmdError::Abt => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    PrefetchConfig = 0x01,
    PrefetchAddr = 0x02,
    CfgiSte = 0x03,
    /// Also encodes CFGI_ALL (a maximal-range invalidation).
    CfgiSteRange = 0x04,
    CfgiCd = 0x05,
    CfgiCdAll = 0x06,
    TlbiNhAll = 0x10,
    TlbiNhAsid = 0x11,
    TlbiNhVa = 0x12,
    TlbiNhVaa = 0x13,
    TlbiEl3All = 0x18,
    TlbiEl3Va = 0x1a,
    TlbiEl2All = 0x20,
    TlbiEl2Asid = 0x21,
    TlbiEl2Va = 0x22,
    TlbiEl2Vaa = 0x23,
    TlbiS12Vmall = 0x28,
    TlbiS2Ipa = 0x2a,
    TlbiNsnhAll = 0x30,
    AtcInv = 0x40,
    PriResp = 0x41,
    Resume = 0x44,
    StallTerm = 0x45,
    Sync = 0x46,
}

impl CommandType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use CommandType::*;
        Some(match raw {
            0x01 => PrefetchConfig,
            0x02 => PrefetchAddr,
            0x03 => CfgiSte,
            0x04 => CfgiSteRange,
            0x05 => CfgiCd,
            0x06 => CfgiCdAll,
            0x10 => TlbiNhAll,
            0x11 => TlbiNhAsid,
            0x12 => TlbiNhVa,
            0x13 => TlbiNhVaa,
            0x18 => TlbiEl3All,
            0x1a => TlbiEl3Va,
            0x20 => TlbiEl2All,
            0x21 => TlbiEl2Asid,
            0x22 => TlbiEl2Va,
            0x23 => TlbiEl2Vaa,
            0x28 => TlbiS12Vmall,
            0x2a => TlbiS2Ipa,
            0x30 => TlbiNsnhAll,
            0x40 => AtcInv,
            0x41 => PriResp,
            0x44 => Resume,
            0x45 => StallTerm,
            0x46 => Sync,
            _ => return None,
        })
    }
}

/// SYNC.CS encoding: completion signalled by interrupt.
pub const SYNC_CS_IRQ: u32 = 1;
/// SYNC.CS encoding: completion signalled by wakeup event (not modelled).
pub const SYNC_CS_SEV: u32 = 2;

pub const CMD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cmd([u32; 4]);

impl Cmd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: [u8; CMD_SIZE]) -> Self {
        let mut words = [0u32; 4];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Self(words)
    }

    pub fn to_bytes(self) -> [u8; CMD_SIZE] {
        let mut bytes = [0u8; CMD_SIZE];
        for (i, w) in self.0.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    pub fn type_raw(&self) -> u32 {
        extract32(self.0[0], 0, 8)
    }

    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_raw(self.type_raw())
    }

    pub fn ssec(&self) -> bool {
        extract32(self.0[0], 10, 1) != 0
    }

    pub fn ssv(&self) -> bool {
        extract32(self.0[0], 11, 1) != 0
    }

    pub fn sync_cs(&self) -> u32 {
        extract32(self.0[0], 12, 2)
    }

    /// Range-invalidation page count operand (NUM).
    pub fn num(&self) -> u32 {
        extract32(self.0[0], 12, 5)
    }

    /// Range-invalidation scale operand (SCALE).
    pub fn scale(&self) -> u32 {
        extract32(self.0[0], 20, 5)
    }

    pub fn sid(&self) -> u32 {
        self.0[1]
    }

    pub fn vmid(&self) -> u16 {
        extract32(self.0[1], 0, 16) as u16
    }

    pub fn asid(&self) -> u16 {
        extract32(self.0[1], 16, 16) as u16
    }

    pub fn leaf(&self) -> bool {
        extract32(self.0[2], 0, 1) != 0
    }

    pub fn ttl(&self) -> u32 {
        extract32(self.0[2], 8, 2)
    }

    /// Translation granule operand; 0 means "non-range invalidation".
    pub fn tg(&self) -> u32 {
        extract32(self.0[2], 10, 2)
    }

    pub fn ste_range(&self) -> u32 {
        extract32(self.0[2], 0, 5)
    }

    pub fn addr(&self) -> u64 {
        let low = u64::from(self.0[2] & !0xfff);
        (u64::from(self.0[3]) << 32) | low
    }

    // Encoding side, used when driving the model from tests or tooling.

    pub fn set_type(&mut self, ty: CommandType) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 0, 8, ty as u32);
        self
    }

    pub fn set_type_raw(&mut self, raw: u32) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 0, 8, raw);
        self
    }

    pub fn set_ssec(&mut self, v: bool) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 10, 1, v as u32);
        self
    }

    pub fn set_sync_cs(&mut self, cs: u32) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 12, 2, cs);
        self
    }

    pub fn set_num(&mut self, num: u32) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 12, 5, num);
        self
    }

    pub fn set_scale(&mut self, scale: u32) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 20, 5, scale);
        self
    }

    pub fn set_sid(&mut self, sid: u32) -> &mut Self {
        self.0[1] = sid;
        self
    }

    pub fn set_vmid(&mut self, vmid: u16) -> &mut Self {
        self.0[1] = deposit32(self.0[1], 0, 16, u32::from(vmid));
        self
    }

    pub fn set_asid(&mut self, asid: u16) -> &mut Self {
        self.0[1] = deposit32(self.0[1], 16, 16, u32::from(asid));
        self
    }

    pub fn set_leaf(&mut self, v: bool) -> &mut Self {
        self.0[2] = deposit32(self.0[2], 0, 1, v as u32);
        self
    }

    pub fn set_ttl(&mut self, ttl: u32) -> &mut Self {
        self.0[2] = deposit32(self.0[2], 8, 2, ttl);
        self
    }

    pub fn set_tg(&mut self, tg: u32) -> &mut Self {
        self.0[2] = deposit32(self.0[2], 10, 2, tg);
        self
    }

    pub fn set_ste_range(&mut self, range: u32) -> &mut Self {
        self.0[2] = deposit32(self.0[2], 0, 5, range);
        self
    }

    pub fn set_addr(&mut self, addr: u64) -> &mut Self {
        self.0[2] = (self.0[2] & 0xfff) | (addr as u32 & !0xfff);
        self.0[3] = (addr >> 32) as u32;
        self
    }
}
