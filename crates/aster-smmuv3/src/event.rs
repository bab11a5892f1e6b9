//! Event queue records.
//!
//! Faults and configuration errors are reported to the guest as 32-byte
//! records pushed onto the event queue. [`EventInfo`] is the in-model
//! description of a fault; [`EventRecord`] is its wire encoding.

use crate::bits::deposit32;

pub const EVENT_SIZE: usize = 32;

/// CLASS field of translation-related events: which fetch faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultClass {
    #[default]
    Cd,
    Tt,
    In,
}

impl FaultClass {
    fn code(self) -> u32 {
        match self {
            FaultClass::Cd => 0,
            FaultClass::Tt => 1,
            FaultClass::In => 2,
        }
    }
}

/// Fields shared by the translation-stage fault events (F_TRANSLATION,
/// F_ADDR_SIZE, F_ACCESS, F_PERMISSION and F_WALK_EABT).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransFault {
    pub ssid: u32,
    pub ssv: bool,
    pub stall: bool,
    pub stag: u16,
    pub addr: u64,
    pub rnw: bool,
    pub pnu: bool,
    pub ind: bool,
    pub s2: bool,
    pub class: FaultClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Unsupported upstream transaction.
    Uut {
        ssid: u32,
        ssv: bool,
        addr: u64,
        rnw: bool,
        pnu: bool,
        ind: bool,
    },
    /// Stream id out of stream-table range.
    BadStreamId { ssid: u32, ssv: bool },
    /// Stream table entry (or L1 descriptor) fetch aborted.
    SteFetch {
        ssid: u32,
        ssv: bool,
        fetch_addr: u64,
    },
    /// Stream table entry failed validation.
    BadSte { ssid: u32, ssv: bool },
    BadAtsTreq,
    /// Transaction arrived while the stream was disabled.
    StreamDisabled,
    /// Transaction terminated by global bypass abort.
    TranslForbidden { addr: u64, rnw: bool },
    BadSubstreamId { ssid: u32 },
    /// Context descriptor fetch aborted.
    CdFetch {
        ssid: u32,
        ssv: bool,
        fetch_addr: u64,
    },
    /// Context descriptor failed validation.
    BadCd { ssid: u32, ssv: bool },
    /// External abort on a page-table walk access.
    WalkEabt {
        fault: TransFault,
        fetch_addr: u64,
    },
    Translation(TransFault),
    AddrSize(TransFault),
    Access(TransFault),
    Permission(TransFault),
    TlbConflict,
    CfgConflict,
    PageRequest,
}

impl EventKind {
    pub fn type_code(&self) -> u32 {
        use EventKind::*;
        match self {
            Uut { .. } => 0x01,
            BadStreamId { .. } => 0x02,
            SteFetch { .. } => 0x03,
            BadSte { .. } => 0x04,
            BadAtsTreq => 0x05,
            StreamDisabled => 0x06,
            TranslForbidden { .. } => 0x07,
            BadSubstreamId { .. } => 0x08,
            CdFetch { .. } => 0x09,
            BadCd { .. } => 0x0a,
            WalkEabt { .. } => 0x0b,
            Translation(_) => 0x10,
            AddrSize(_) => 0x11,
            Access(_) => 0x12,
            Permission(_) => 0x13,
            TlbConflict => 0x14,
            CfgConflict => 0x15,
            PageRequest => 0x24,
        }
    }

    /// Translation-stage faults whose recording is gated by STE/CD record
    /// settings; walk external aborts are always recorded.
    pub fn is_translation_fault(&self) -> bool {
        matches!(
            self,
            EventKind::Translation(_)
                | EventKind::AddrSize(_)
                | EventKind::Access(_)
                | EventKind::Permission(_)
        )
    }
}

/// A fault attributed to a stream, ready to be encoded and queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInfo {
    pub sid: u32,
    pub kind: EventKind,
}

impl EventInfo {
    pub fn new(sid: u32, kind: EventKind) -> Self {
        Self { sid, kind }
    }

    pub fn encode(&self) -> EventRecord {
        let mut rec = EventRecord::default();
        rec.set_type(self.kind.type_code());
        rec.set_sid(self.sid);
        match self.kind {
            EventKind::Uut {
                ssid,
                ssv,
                addr,
                rnw,
                pnu,
                ind,
            } => {
                rec.set_ssid(ssid);
                rec.set_ssv(ssv);
                rec.set_addr(addr);
                rec.set_rnw(rnw);
                rec.set_pnu(pnu);
                rec.set_ind(ind);
            }
            EventKind::BadStreamId { ssid, ssv }
            | EventKind::BadSte { ssid, ssv }
            | EventKind::BadCd { ssid, ssv } => {
                rec.set_ssid(ssid);
                rec.set_ssv(ssv);
            }
            EventKind::SteFetch {
                ssid,
                ssv,
                fetch_addr,
            } => {
                rec.set_ssid(ssid);
                rec.set_ssv(ssv);
                rec.set_addr2(fetch_addr);
            }
            EventKind::StreamDisabled => {}
            EventKind::TranslForbidden { addr, rnw } => {
                rec.set_addr(addr);
                rec.set_rnw(rnw);
            }
            EventKind::BadSubstreamId { ssid } => {
                rec.set_ssid(ssid);
            }
            EventKind::CdFetch {
                ssid,
                ssv,
                fetch_addr,
            } => {
                rec.set_ssid(ssid);
                rec.set_ssv(ssv);
                rec.set_addr(fetch_addr);
            }
            EventKind::WalkEabt { fault, fetch_addr } => {
                rec.set_trans_fault(&fault);
                rec.set_addr2(fetch_addr);
            }
            EventKind::Translation(f)
            | EventKind::AddrSize(f)
            | EventKind::Access(f)
            | EventKind::Permission(f) => {
                rec.set_trans_fault(&f);
            }
            // These event types are never produced by this model: ATS and
            // PRI are not advertised, and the caches cannot conflict.
            EventKind::BadAtsTreq
            | EventKind::TlbConflict
            | EventKind::CfgConflict
            | EventKind::PageRequest => unreachable!("unsupported event type"),
        }
        rec
    }
}

/// Wire form of an event queue entry: eight little-endian 32-bit words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventRecord([u32; 8]);

impl EventRecord {
    pub fn to_bytes(self) -> [u8; EVENT_SIZE] {
        let mut bytes = [0u8; EVENT_SIZE];
        for (i, w) in self.0.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    pub fn words(&self) -> &[u32; 8] {
        &self.0
    }

    fn set_type(&mut self, ty: u32) {
        self.0[0] = deposit32(self.0[0], 0, 8, ty);
    }

    fn set_ssv(&mut self, v: bool) {
        self.0[0] = deposit32(self.0[0], 11, 1, v as u32);
    }

    fn set_ssid(&mut self, ssid: u32) {
        self.0[0] = deposit32(self.0[0], 12, 20, ssid);
    }

    fn set_sid(&mut self, sid: u32) {
        self.0[1] = sid;
    }

    fn set_stag(&mut self, stag: u16) {
        self.0[2] = deposit32(self.0[2], 0, 16, u32::from(stag));
    }

    fn set_stall(&mut self, v: bool) {
        self.0[2] = deposit32(self.0[2], 31, 1, v as u32);
    }

    fn set_pnu(&mut self, v: bool) {
        self.0[3] = deposit32(self.0[3], 1, 1, v as u32);
    }

    fn set_ind(&mut self, v: bool) {
        self.0[3] = deposit32(self.0[3], 2, 1, v as u32);
    }

    fn set_rnw(&mut self, v: bool) {
        self.0[3] = deposit32(self.0[3], 3, 1, v as u32);
    }

    fn set_s2(&mut self, v: bool) {
        self.0[3] = deposit32(self.0[3], 7, 1, v as u32);
    }

    fn set_class(&mut self, class: FaultClass) {
        self.0[3] = deposit32(self.0[3], 8, 2, class.code());
    }

    fn set_addr(&mut self, addr: u64) {
        self.0[4] = addr as u32;
        self.0[5] = (addr >> 32) as u32;
    }

    fn set_addr2(&mut self, addr: u64) {
        self.0[6] = addr as u32;
        self.0[7] = (addr >> 32) as u32;
    }

    fn set_trans_fault(&mut self, f: &TransFault) {
        self.set_ssid(f.ssid);
        self.set_ssv(f.ssv);
        self.set_stall(f.stall);
        self.set_stag(f.stag);
        self.set_addr(f.addr);
        self.set_rnw(f.rnw);
        self.set_pnu(f.pnu);
        self.set_ind(f.ind);
        self.set_s2(f.s2);
        self.set_class(f.class);
    }
}
