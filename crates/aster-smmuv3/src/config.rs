//! Stream table and context descriptor decode.
//!
//! A transaction's stream id selects a stream table entry (STE); for stage-1
//! streams the STE points at a context descriptor (CD). Decoding both yields
//! a [`TranslationConfig`], the distilled per-stream state the translation
//! path and the config cache operate on. Malformed tables surface as typed
//! event records, never as model errors.

use aster_guest_mem::GuestMemory;

use crate::bits::{deposit32, extract32, extract64, mask64, sextract64};
use crate::event::EventKind;
use crate::registers::oas2bits;

/// Translation stage selected by the STE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Stage1,
    Stage2,
}

/// One stage-1 translation table region (TTB0 or TTB1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtInfo {
    pub tsz: u32,
    /// log2 of the granule size (12 or 16).
    pub granule_sz: u32,
    pub ttb: u64,
}

/// Stage-2 configuration decoded from the STE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S2Config {
    pub vmid: u16,
    pub vttb: u64,
    pub tsz: u32,
    pub granule_sz: u32,
    /// Raw SL0 start-level selector; interpreted by the walker.
    pub sl0: u32,
    /// Effective physical address size in bits (S2PS capped at the
    /// implementation output size).
    pub eff_ps: u32,
    /// Access-flag fault disable.
    pub affd: bool,
}

/// Per-stream translation state derived from the STE (and CD for stage 1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationConfig {
    pub stage: Stage,
    pub aborted: bool,
    pub bypassed: bool,
    /// Stage-1 address space id, from the CD.
    pub asid: Option<u16>,
    /// TTB0 / TTB1 regions; `None` when disabled by EPDx.
    pub tt: [Option<TtInfo>; 2],
    /// Top-byte-ignore bits (TBI0 in bit 0, TBI1 in bit 1).
    pub tbi: u32,
    /// Stage-1 output address size in bits.
    pub oas: u32,
    pub s2: Option<S2Config>,
    /// Whether translation faults on this stream produce event records.
    pub record_faults: bool,
}

impl TranslationConfig {
    pub(crate) fn abort() -> Self {
        Self {
            aborted: true,
            ..Default::default()
        }
    }

    pub(crate) fn bypass() -> Self {
        Self {
            bypassed: true,
            ..Default::default()
        }
    }

    /// ASID component of IOTLB keys for entries this config can produce.
    pub fn asid_key(&self) -> Option<u16> {
        self.asid
    }

    /// VMID component of IOTLB keys for entries this config can produce.
    pub fn vmid_key(&self) -> Option<u16> {
        self.s2.as_ref().map(|s2| s2.vmid)
    }

    /// Pick the stage-1 table region covering `iova`, honouring top-byte
    /// ignore. `None` means the address falls in the gap between regions.
    pub fn select_tt(&self, iova: u64) -> Option<&TtInfo> {
        let tbi = if extract64(iova, 55, 1) != 0 {
            extract32(self.tbi, 1, 1)
        } else {
            extract32(self.tbi, 0, 1)
        };
        let tbi_bits = tbi * 8;

        if let Some(tt) = &self.tt[0] {
            if extract64(iova, 64 - tt.tsz, tt.tsz - tbi_bits) == 0 {
                return Some(tt);
            }
        }
        if let Some(tt) = &self.tt[1] {
            if sextract64(iova, 64 - tt.tsz, tt.tsz - tbi_bits) == -1 {
                return Some(tt);
            }
        }
        None
    }
}

/// Snapshot of the stream table registers taken when a lookup starts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StrtabConfig {
    pub base: u64,
    pub log2size: u32,
    pub split: u32,
    pub two_level: bool,
}

const STE_SIZE: usize = 64;
const CD_SIZE: usize = 64;
const L1STD_SIZE: usize = 8;

/// Stream table entry wire format: sixteen little-endian 32-bit words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ste([u32; 16]);

/// STE.CONFIG encoding for terminate-with-abort.
pub const STE_CONFIG_ABORT: u32 = 0b000;
/// STE.CONFIG encoding for full bypass.
pub const STE_CONFIG_BYPASS: u32 = 0b100;

impl Ste {
    pub fn from_bytes(bytes: [u8; STE_SIZE]) -> Self {
        let mut words = [0u32; 16];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Self(words)
    }

    pub fn to_bytes(self) -> [u8; STE_SIZE] {
        let mut bytes = [0u8; STE_SIZE];
        for (i, w) in self.0.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    pub fn valid(&self) -> bool {
        extract32(self.0[0], 0, 1) != 0
    }

    pub fn config(&self) -> u32 {
        extract32(self.0[0], 1, 3)
    }

    fn s1_enabled(&self) -> bool {
        self.config() & 0b001 != 0
    }

    fn s2_enabled(&self) -> bool {
        self.config() & 0b010 != 0
    }

    pub fn ctxptr(&self) -> u64 {
        (u64::from(extract32(self.0[1], 0, 16)) << 32) | u64::from(self.0[0] & 0xffff_ffc0)
    }

    pub fn s1cdmax(&self) -> u32 {
        extract32(self.0[1], 27, 5)
    }

    pub fn s1stalld(&self) -> bool {
        extract32(self.0[2], 27, 1) != 0
    }

    pub fn s2vmid(&self) -> u16 {
        extract32(self.0[4], 0, 16) as u16
    }

    pub fn s2t0sz(&self) -> u32 {
        extract32(self.0[5], 0, 6)
    }

    pub fn s2sl0(&self) -> u32 {
        extract32(self.0[5], 6, 2)
    }

    pub fn s2tg(&self) -> u32 {
        extract32(self.0[5], 14, 2)
    }

    pub fn s2ps(&self) -> u32 {
        extract32(self.0[5], 16, 3)
    }

    pub fn s2aa64(&self) -> bool {
        extract32(self.0[5], 19, 1) != 0
    }

    pub fn s2endi(&self) -> bool {
        extract32(self.0[5], 20, 1) != 0
    }

    pub fn s2affd(&self) -> bool {
        extract32(self.0[5], 21, 1) != 0
    }

    pub fn s2hd(&self) -> bool {
        extract32(self.0[5], 23, 1) != 0
    }

    pub fn s2ha(&self) -> bool {
        extract32(self.0[5], 24, 1) != 0
    }

    pub fn s2s(&self) -> bool {
        extract32(self.0[5], 25, 1) != 0
    }

    pub fn s2r(&self) -> bool {
        extract32(self.0[5], 26, 1) != 0
    }

    pub fn s2ttb(&self) -> u64 {
        (u64::from(extract32(self.0[7], 0, 20)) << 32) | u64::from(self.0[6] & 0xffff_fff0)
    }

    // Guest-side encoders, for building tables from tests and tooling.

    pub fn set_valid(&mut self, v: bool) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 0, 1, v as u32);
        self
    }

    pub fn set_config(&mut self, config: u32) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 1, 3, config);
        self
    }

    pub fn set_ctxptr(&mut self, addr: u64) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 6, 26, (addr >> 6) as u32);
        self.0[1] = deposit32(self.0[1], 0, 16, (addr >> 32) as u32);
        self
    }

    pub fn set_s1cdmax(&mut self, v: u32) -> &mut Self {
        self.0[1] = deposit32(self.0[1], 27, 5, v);
        self
    }

    pub fn set_s1stalld(&mut self, v: bool) -> &mut Self {
        self.0[2] = deposit32(self.0[2], 27, 1, v as u32);
        self
    }

    pub fn set_s2vmid(&mut self, vmid: u16) -> &mut Self {
        self.0[4] = deposit32(self.0[4], 0, 16, u32::from(vmid));
        self
    }

    pub fn set_s2t0sz(&mut self, v: u32) -> &mut Self {
        self.0[5] = deposit32(self.0[5], 0, 6, v);
        self
    }

    pub fn set_s2sl0(&mut self, v: u32) -> &mut Self {
        self.0[5] = deposit32(self.0[5], 6, 2, v);
        self
    }

    pub fn set_s2tg(&mut self, v: u32) -> &mut Self {
        self.0[5] = deposit32(self.0[5], 14, 2, v);
        self
    }

    pub fn set_s2ps(&mut self, v: u32) -> &mut Self {
        self.0[5] = deposit32(self.0[5], 16, 3, v);
        self
    }

    pub fn set_s2aa64(&mut self, v: bool) -> &mut Self {
        self.0[5] = deposit32(self.0[5], 19, 1, v as u32);
        self
    }

    pub fn set_s2r(&mut self, v: bool) -> &mut Self {
        self.0[5] = deposit32(self.0[5], 26, 1, v as u32);
        self
    }

    pub fn set_s2ttb(&mut self, addr: u64) -> &mut Self {
        self.0[6] = addr as u32 & 0xffff_fff0;
        self.0[7] = deposit32(self.0[7], 0, 20, (addr >> 32) as u32);
        self
    }
}

/// Level-1 stream table descriptor for the two-level format.
#[derive(Debug, Clone, Copy, Default)]
pub struct L1StreamDesc(u64);

impl L1StreamDesc {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn new(l2ptr: u64, span: u32) -> Self {
        Self((l2ptr & 0x000f_ffff_ffff_ffc0) | u64::from(span & 0x1f))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Number of valid entries in the level-2 table is `2^(span - 1)`;
    /// zero marks the descriptor invalid.
    pub fn span(&self) -> u32 {
        extract64(self.0, 0, 5) as u32
    }

    pub fn l2ptr(&self) -> u64 {
        self.0 & 0x000f_ffff_ffff_ffc0
    }
}

/// Context descriptor wire format: sixteen little-endian 32-bit words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cd([u32; 16]);

impl Cd {
    pub fn from_bytes(bytes: [u8; CD_SIZE]) -> Self {
        let mut words = [0u32; 16];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Self(words)
    }

    pub fn to_bytes(self) -> [u8; CD_SIZE] {
        let mut bytes = [0u8; CD_SIZE];
        for (i, w) in self.0.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    pub fn valid(&self) -> bool {
        extract32(self.0[0], 31, 1) != 0
    }

    /// TxSZ for region `tt` (0 = TTB0, 1 = TTB1).
    pub fn tsz(&self, tt: usize) -> u32 {
        extract32(self.0[0], 16 * tt as u32, 6)
    }

    pub fn tg(&self, tt: usize) -> u32 {
        extract32(self.0[0], 6 + 16 * tt as u32, 2)
    }

    pub fn epd(&self, tt: usize) -> bool {
        extract32(self.0[0], 14 + 16 * tt as u32, 1) != 0
    }

    pub fn endi(&self) -> bool {
        extract32(self.0[0], 15, 1) != 0
    }

    pub fn ips(&self) -> u32 {
        extract32(self.0[1], 0, 3)
    }

    pub fn tbi(&self) -> u32 {
        extract32(self.0[1], 6, 2)
    }

    pub fn aa64(&self) -> bool {
        extract32(self.0[1], 9, 1) != 0
    }

    pub fn hd(&self) -> bool {
        extract32(self.0[1], 10, 1) != 0
    }

    pub fn ha(&self) -> bool {
        extract32(self.0[1], 11, 1) != 0
    }

    pub fn stall(&self) -> bool {
        extract32(self.0[1], 12, 1) != 0
    }

    pub fn record(&self) -> bool {
        extract32(self.0[1], 13, 1) != 0
    }

    /// Affinity bit; must be set under the terminate fault model.
    pub fn a(&self) -> bool {
        extract32(self.0[1], 14, 1) != 0
    }

    pub fn asid(&self) -> u16 {
        extract32(self.0[1], 16, 16) as u16
    }

    pub fn ttb(&self, tt: usize) -> u64 {
        let lo = u64::from(self.0[2 * tt + 2] & 0xffff_fff0);
        let hi = u64::from(extract32(self.0[2 * tt + 3], 0, 16)) << 32;
        hi | lo
    }

    pub fn set_valid(&mut self, v: bool) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 31, 1, v as u32);
        self
    }

    pub fn set_tsz(&mut self, tt: usize, v: u32) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 16 * tt as u32, 6, v);
        self
    }

    pub fn set_tg(&mut self, tt: usize, v: u32) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 6 + 16 * tt as u32, 2, v);
        self
    }

    pub fn set_epd(&mut self, tt: usize, v: bool) -> &mut Self {
        self.0[0] = deposit32(self.0[0], 14 + 16 * tt as u32, 1, v as u32);
        self
    }

    pub fn set_ips(&mut self, v: u32) -> &mut Self {
        self.0[1] = deposit32(self.0[1], 0, 3, v);
        self
    }

    pub fn set_tbi(&mut self, v: u32) -> &mut Self {
        self.0[1] = deposit32(self.0[1], 6, 2, v);
        self
    }

    pub fn set_aa64(&mut self, v: bool) -> &mut Self {
        self.0[1] = deposit32(self.0[1], 9, 1, v as u32);
        self
    }

    pub fn set_a(&mut self, v: bool) -> &mut Self {
        self.0[1] = deposit32(self.0[1], 14, 1, v as u32);
        self
    }

    pub fn set_record(&mut self, v: bool) -> &mut Self {
        self.0[1] = deposit32(self.0[1], 13, 1, v as u32);
        self
    }

    pub fn set_asid(&mut self, asid: u16) -> &mut Self {
        self.0[1] = deposit32(self.0[1], 16, 16, u32::from(asid));
        self
    }

    pub fn set_ttb(&mut self, tt: usize, addr: u64) -> &mut Self {
        self.0[2 * tt + 2] = addr as u32 & 0xffff_fff0;
        self.0[2 * tt + 3] = deposit32(self.0[2 * tt + 3], 0, 16, (addr >> 32) as u32);
        self
    }
}

/// TG field to log2 granule size. TTB1 uses a rotated encoding.
pub(crate) fn tg2granule(bits: u32, tt1: bool) -> u32 {
    if tt1 {
        match bits {
            1 => 14,
            2 => 12,
            3 => 16,
            _ => 12,
        }
    } else {
        match bits {
            0 => 12,
            1 => 16,
            2 => 14,
            _ => 12,
        }
    }
}

/// Stage-2 start level for an SL0 selector.
fn s2_start_level(sl0: u32, granule_sz: u32) -> i32 {
    if granule_sz == 12 {
        2 - sl0 as i32
    } else {
        3 - sl0 as i32
    }
}

/// Whether a stage-2 walk can cover the input size from the selected start
/// level. Input bits beyond a single start-level table come from
/// concatenated root tables, of which at most 16 are architected.
fn s2_table_geometry_valid(sl0: u32, t0sz: u32, granule_sz: u32) -> bool {
    if sl0 == 3 {
        return false;
    }
    let level = s2_start_level(sl0, granule_sz);
    // 64K tables have no level-0 walk.
    if level < 0 || (granule_sz == 16 && level == 0) {
        return false;
    }
    let ia_bits = 64 - t0sz as i32;
    let covered = granule_sz as i32 + (4 - level) * (granule_sz as i32 - 3);
    ia_bits - covered <= 4
}

/// Locate and fetch the STE for `sid`.
fn find_ste(
    mem: &mut dyn GuestMemory,
    strtab: &StrtabConfig,
    sid: u32,
) -> Result<Ste, EventKind> {
    let ssv = false;
    if sid >= 1u32 << strtab.log2size {
        return Err(EventKind::BadStreamId { ssid: 0, ssv });
    }

    let addr = if strtab.two_level {
        if !matches!(strtab.split, 6 | 8 | 10) {
            log::warn!("smmuv3: invalid STRTAB_BASE_CFG.SPLIT {}", strtab.split);
            return Err(EventKind::BadSte { ssid: 0, ssv });
        }
        let l1_index = sid >> strtab.split;
        let l2_index = sid & ((1 << strtab.split) - 1);
        let l1ptr = strtab.base + u64::from(l1_index) * L1STD_SIZE as u64;
        let raw = mem.read_u64(l1ptr).map_err(|_| EventKind::SteFetch {
            ssid: 0,
            ssv,
            fetch_addr: l1ptr,
        })?;
        let l1std = L1StreamDesc::from_raw(raw);
        let span = l1std.span();
        if span == 0 {
            return Err(EventKind::BadStreamId { ssid: 0, ssv });
        }
        let max_l2 = (1u32 << (span - 1)) - 1;
        if l2_index > max_l2 {
            log::warn!(
                "smmuv3: sid 0x{sid:x} indexes past level-2 span ({l2_index} > {max_l2})"
            );
            return Err(EventKind::BadSte { ssid: 0, ssv });
        }
        l1std.l2ptr() + u64::from(l2_index) * STE_SIZE as u64
    } else {
        strtab.base + u64::from(sid) * STE_SIZE as u64
    };

    let mut bytes = [0u8; STE_SIZE];
    mem.read(addr, &mut bytes).map_err(|_| EventKind::SteFetch {
        ssid: 0,
        ssv,
        fetch_addr: addr,
    })?;
    Ok(Ste::from_bytes(bytes))
}

fn decode_s2(ste: &Ste) -> Result<S2Config, EventKind> {
    let bad = EventKind::BadSte {
        ssid: 0,
        ssv: false,
    };
    if !ste.s2aa64() {
        log::warn!("smmuv3: AArch32 stage-2 tables are not supported");
        return Err(bad);
    }
    if ste.s2endi() {
        log::warn!("smmuv3: big-endian stage-2 tables are not supported");
        return Err(bad);
    }
    if ste.s2ha() || ste.s2hd() {
        log::warn!("smmuv3: stage-2 hardware table updates are not supported");
        return Err(bad);
    }
    if ste.s2s() {
        log::warn!("smmuv3: stage-2 stalling faults are not supported");
        return Err(bad);
    }

    let tsz = ste.s2t0sz();
    if !(16..=39).contains(&tsz) {
        return Err(bad);
    }
    let granule_sz = match ste.s2tg() {
        0 => 12,
        1 => 16,
        _ => return Err(bad),
    };
    let sl0 = ste.s2sl0();
    if !s2_table_geometry_valid(sl0, tsz, granule_sz) {
        return Err(bad);
    }
    let eff_ps = oas2bits(ste.s2ps()).min(oas2bits(crate::registers::SMMU_IDR5_OAS));
    let vttb = ste.s2ttb();
    if vttb & !mask64(eff_ps) != 0 {
        return Err(bad);
    }

    Ok(S2Config {
        vmid: ste.s2vmid(),
        vttb,
        tsz,
        granule_sz,
        sl0,
        eff_ps,
        affd: ste.s2affd(),
    })
}

fn decode_ste(ste: &Ste) -> Result<TranslationConfig, EventKind> {
    let bad = EventKind::BadSte {
        ssid: 0,
        ssv: false,
    };
    if !ste.valid() {
        return Err(bad);
    }
    let config = ste.config();
    if config == STE_CONFIG_ABORT {
        return Ok(TranslationConfig::abort());
    }
    if config == STE_CONFIG_BYPASS {
        return Ok(TranslationConfig::bypass());
    }

    let s1 = ste.s1_enabled();
    let s2 = ste.s2_enabled();
    if s1 && s2 {
        log::warn!("smmuv3: nested translation is not supported");
        return Err(bad);
    }
    if s1 {
        if ste.s1cdmax() != 0 {
            log::warn!("smmuv3: substream context descriptors are not supported");
            return Err(bad);
        }
        if ste.s1stalld() {
            log::warn!("smmuv3: stage-1 stalling fault model is not supported");
            return Err(bad);
        }
        // Stage-1 details come from the CD; caller fetches it next.
        return Ok(TranslationConfig {
            stage: Stage::Stage1,
            ..Default::default()
        });
    }
    if s2 {
        let s2cfg = decode_s2(ste)?;
        return Ok(TranslationConfig {
            stage: Stage::Stage2,
            record_faults: ste.s2r(),
            s2: Some(s2cfg),
            ..Default::default()
        });
    }
    Err(bad)
}

fn decode_cd(cfg: &mut TranslationConfig, cd: &Cd) -> Result<(), EventKind> {
    let bad = EventKind::BadCd {
        ssid: 0,
        ssv: false,
    };
    if !cd.valid() || !cd.aa64() {
        return Err(bad);
    }
    if cd.endi() {
        log::warn!("smmuv3: big-endian stage-1 tables are not supported");
        return Err(bad);
    }
    if cd.stall() {
        log::warn!("smmuv3: stalling faults are not supported");
        return Err(bad);
    }
    if cd.ha() || cd.hd() {
        log::warn!("smmuv3: hardware table updates are not supported");
        return Err(bad);
    }
    // Faults terminate rather than stall, which requires A set.
    if !cd.a() {
        return Err(bad);
    }

    cfg.oas = oas2bits(cd.ips()).min(oas2bits(crate::registers::SMMU_IDR5_OAS));
    cfg.tbi = cd.tbi();
    cfg.asid = Some(cd.asid());
    cfg.record_faults = cd.record();

    for i in 0..2 {
        if cd.epd(i) {
            continue;
        }
        let tsz = cd.tsz(i);
        if !(16..=39).contains(&tsz) {
            return Err(bad);
        }
        let granule_sz = tg2granule(cd.tg(i), i == 1);
        if granule_sz != 12 && granule_sz != 16 {
            return Err(bad);
        }
        let ttb = cd.ttb(i);
        if ttb & !mask64(cfg.oas) != 0 {
            log::warn!("smmuv3: TTB{i} exceeds the output address size");
            return Err(bad);
        }
        cfg.tt[i] = Some(TtInfo {
            tsz,
            granule_sz,
            ttb,
        });
    }
    Ok(())
}

/// Walk the stream table (and CD, for stage 1) and build the stream's
/// translation config. Failures name the event to report.
pub(crate) fn decode_config(
    mem: &mut dyn GuestMemory,
    strtab: &StrtabConfig,
    sid: u32,
) -> Result<TranslationConfig, EventKind> {
    let ste = find_ste(mem, strtab, sid)?;
    let mut cfg = decode_ste(&ste)?;
    if cfg.aborted || cfg.bypassed || cfg.stage == Stage::Stage2 {
        return Ok(cfg);
    }

    let cd_addr = ste.ctxptr();
    let mut bytes = [0u8; CD_SIZE];
    mem.read(cd_addr, &mut bytes).map_err(|_| EventKind::CdFetch {
        ssid: 0,
        ssv: false,
        fetch_addr: cd_addr,
    })?;
    let cd = Cd::from_bytes(bytes);
    decode_cd(&mut cfg, &cd)?;
    Ok(cfg)
}
