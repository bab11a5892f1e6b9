//! The SMMUv3 device model: MMIO register file, command queue consumer,
//! translation path with config cache and IOTLB, event reporting and
//! interrupt generation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use aster_guest_mem::GuestMemory;
use aster_interrupts::IrqSink;
use aster_io_snapshot::codec::{Decoder, Encoder};
use aster_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};

use crate::bits::{deposit32, deposit64, extract32, mask64};
use crate::cmd::{Cmd, CmdError, CommandType, CMD_SIZE, SYNC_CS_IRQ};
use crate::config::{decode_config, Stage, StrtabConfig, TranslationConfig};
use crate::event::{EventInfo, EventKind, FaultClass, TransFault, EVENT_SIZE};
use crate::iotlb::{Iotlb, IotlbEntry, IotlbKey};
use crate::notifier::{NotifierError, NotifierId, NotifierRegistry, UnmapNotifier};
use crate::ptw::{PageTableWalker, WalkFaultKind};
use crate::queue::Queue;
use crate::ranges::Pow2Cover;
use crate::registers::*;
use crate::{Perm, SmmuIrq};

/// Outcome classes for a translation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationStatus {
    /// Translated through the stream's tables.
    Success,
    /// SMMU disabled, GBPA.ABORT clear: identity passthrough.
    Disabled,
    /// Stream configured for bypass: identity passthrough.
    Bypass,
    /// Transaction terminated with an abort; no event is recorded.
    Abort,
    /// Transaction faulted; an event may have been recorded.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub status: TranslationStatus,
    pub translated_addr: u64,
    pub perm: Perm,
}

impl Translation {
    fn blocked(status: TranslationStatus) -> Self {
        Self {
            status,
            translated_addr: 0,
            perm: Perm::empty(),
        }
    }

    fn passthrough(status: TranslationStatus, iova: u64, perm: Perm) -> Self {
        Self {
            status,
            translated_addr: iova,
            perm,
        }
    }
}

/// Per-stream cache hit/miss counters; diagnostics only. Counters survive
/// cache eviction so they reflect the stream's whole history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub config_hits: u64,
    pub config_misses: u64,
    pub iotlb_hits: u64,
    pub iotlb_misses: u64,
}

pub struct Smmuv3 {
    idr: [u32; 6],
    iidr: u32,
    aidr: u32,
    cr: [u32; 3],
    cr0ack: u32,
    statusr: u32,
    gbpa: u32,
    irq_ctrl: u32,
    gerror: u32,
    gerrorn: u32,
    gerror_irq_cfg0: u64,
    gerror_irq_cfg1: u32,
    gerror_irq_cfg2: u32,
    strtab_base: u64,
    strtab_base_cfg: u32,
    sid_split: u32,
    two_level_strtab: bool,
    eventq_irq_cfg0: u64,
    eventq_irq_cfg1: u32,
    eventq_irq_cfg2: u32,
    cmdq: Queue,
    eventq: Queue,

    configs: HashMap<u32, Arc<TranslationConfig>>,
    stats: HashMap<u32, CacheStats>,
    iotlb: Iotlb,
    notifiers: NotifierRegistry,
    walker: Box<dyn PageTableWalker>,
}

impl Smmuv3 {
    pub fn new(walker: Box<dyn PageTableWalker>) -> Self {
        let mut s = Self {
            idr: [0; 6],
            iidr: 0,
            aidr: 0,
            cr: [0; 3],
            cr0ack: 0,
            statusr: 0,
            gbpa: 0,
            irq_ctrl: 0,
            gerror: 0,
            gerrorn: 0,
            gerror_irq_cfg0: 0,
            gerror_irq_cfg1: 0,
            gerror_irq_cfg2: 0,
            strtab_base: 0,
            strtab_base_cfg: 0,
            sid_split: 0,
            two_level_strtab: false,
            eventq_irq_cfg0: 0,
            eventq_irq_cfg1: 0,
            eventq_irq_cfg2: 0,
            cmdq: Queue::new(CMD_SIZE, SMMU_CMDQS),
            eventq: Queue::new(EVENT_SIZE, SMMU_EVENTQS),
            configs: HashMap::new(),
            stats: HashMap::new(),
            iotlb: Iotlb::new(),
            notifiers: NotifierRegistry::new(),
            walker,
        };
        s.reset();
        s
    }

    /// Restore the architected reset state. Identity registers advertise:
    /// stage 1 + stage 2, AArch64 tables, little-endian, 16-bit ASID/VMID,
    /// terminate fault model, two-level stream tables, range invalidation,
    /// 4K/64K granules and a 44-bit output size.
    pub fn reset(&mut self) {
        let mut idr0 = 0u32;
        idr0 |= 1 << 0; // S2P
        idr0 |= 1 << 1; // S1P
        idr0 = deposit32(idr0, 2, 2, 2); // TTF: AArch64
        idr0 |= 1 << 4; // COHACC
        idr0 |= 1 << 12; // ASID16
        idr0 |= 1 << 18; // VMID16
        idr0 = deposit32(idr0, 21, 2, 2); // TTENDIAN: little-endian
        idr0 = deposit32(idr0, 24, 2, 1); // STALL_MODEL: no stall
        idr0 |= 1 << 26; // TERM_MODEL
        idr0 = deposit32(idr0, 27, 2, 1); // STLEVEL: two-level supported
        self.idr[0] = idr0;

        let mut idr1 = 0u32;
        idr1 = deposit32(idr1, 0, 6, SMMU_IDR1_SIDSIZE);
        idr1 = deposit32(idr1, 16, 5, u32::from(SMMU_EVENTQS));
        idr1 = deposit32(idr1, 21, 5, u32::from(SMMU_CMDQS));
        self.idr[1] = idr1;

        self.idr[2] = 0;
        self.idr[3] = 1 << 10; // RIL
        self.idr[4] = 0;

        let mut idr5 = 0u32;
        idr5 = deposit32(idr5, 0, 3, SMMU_IDR5_OAS);
        idr5 |= 1 << 4; // GRAN4K
        idr5 |= 1 << 6; // GRAN64K
        self.idr[5] = idr5;

        self.iidr = 0;
        self.aidr = 0x1;

        self.cr = [0; 3];
        self.cr0ack = 0;
        self.statusr = 0;
        self.gbpa = GBPA_RESET_VAL;
        self.irq_ctrl = 0;
        self.gerror = 0;
        self.gerrorn = 0;
        self.gerror_irq_cfg0 = 0;
        self.gerror_irq_cfg1 = 0;
        self.gerror_irq_cfg2 = 0;
        self.strtab_base = 0;
        self.strtab_base_cfg = 0;
        self.sid_split = 0;
        self.two_level_strtab = false;
        self.eventq_irq_cfg0 = 0;
        self.eventq_irq_cfg1 = 0;
        self.eventq_irq_cfg2 = 0;
        self.cmdq.reset();
        self.eventq.reset();

        self.configs.clear();
        self.stats.clear();
        self.iotlb.inv_all();
    }

    fn smmu_enabled(&self) -> bool {
        self.cr[0] & CR0_SMMUEN != 0
    }

    fn cmdq_enabled(&self) -> bool {
        self.cr[0] & CR0_CMDQEN != 0
    }

    fn eventq_enabled(&self) -> bool {
        self.cr[0] & CR0_EVENTQEN != 0
    }

    fn gerror_irq_enabled(&self) -> bool {
        self.irq_ctrl & IRQ_CTRL_GERROR_IRQEN != 0
    }

    fn eventq_irq_enabled(&self) -> bool {
        self.irq_ctrl & IRQ_CTRL_EVENTQ_IRQEN != 0
    }

    // ---- interrupts and global errors ----

    /// Fire an output line. For the GERROR line, `gerror_mask` names the
    /// error bits to activate; bits already pending are not re-signalled.
    fn trigger_irq(&mut self, irq: SmmuIrq, gerror_mask: u32, sink: &mut dyn IrqSink) {
        let pulse = match irq {
            SmmuIrq::CmdSync => true,
            SmmuIrq::Priq => {
                log::warn!("smmuv3: PRI queue interrupts are not implemented");
                false
            }
            SmmuIrq::EventQ => self.eventq_irq_enabled(),
            SmmuIrq::Gerror => {
                let pending = self.gerror ^ self.gerrorn;
                let new_errors = !pending & gerror_mask;
                if new_errors == 0 {
                    return;
                }
                self.gerror ^= new_errors;
                self.gerror_irq_enabled()
            }
        };
        if pulse {
            sink.pulse(irq.line());
        }
    }

    /// GERRORN write: acknowledge by toggling bits back to GERROR's value.
    /// Toggling a bit that is not pending is ignored.
    fn write_gerrorn(&mut self, value: u32) {
        let pending = self.gerror ^ self.gerrorn;
        let toggled = self.gerrorn ^ value;
        if toggled & !pending != 0 {
            log::warn!(
                "smmuv3: guest toggled non-pending GERRORN bits 0x{:x}",
                toggled & !pending
            );
        }
        self.gerrorn ^= toggled & pending;
    }

    // ---- event queue ----

    fn write_eventq(
        &mut self,
        mem: &mut dyn GuestMemory,
        irq: &mut dyn IrqSink,
        record: &crate::event::EventRecord,
    ) -> Result<(), ()> {
        if self.eventq.is_full() {
            return Err(());
        }
        let addr = self.eventq.prod_entry_addr();
        mem.write(addr, &record.to_bytes()).map_err(|_| ())?;
        self.eventq.prod_incr();
        if !self.eventq.is_empty() {
            self.trigger_irq(SmmuIrq::EventQ, 0, irq);
        }
        Ok(())
    }

    /// Push a fault record onto the event queue. Dropped silently while the
    /// queue is disabled; a full queue or a failed write raises
    /// GERROR.EVENTQ_ABT_ERR.
    fn record_event(
        &mut self,
        mem: &mut dyn GuestMemory,
        irq: &mut dyn IrqSink,
        info: EventInfo,
    ) {
        if !self.eventq_enabled() {
            return;
        }
        let record = info.encode();
        if self.write_eventq(mem, irq, &record).is_err() {
            self.trigger_irq(SmmuIrq::Gerror, GERROR_EVENTQ_ABT_ERR, irq);
        }
    }

    // ---- config cache ----

    fn strtab_cfg(&self) -> StrtabConfig {
        StrtabConfig {
            base: self.strtab_base & STRTAB_BASE_ADDR_MASK,
            log2size: extract32(
                self.strtab_base_cfg,
                STRTAB_BASE_CFG_LOG2SIZE_SHIFT,
                STRTAB_BASE_CFG_LOG2SIZE_LEN,
            )
            .min(SMMU_IDR1_SIDSIZE),
            split: self.sid_split,
            two_level: self.two_level_strtab,
        }
    }

    fn get_config(
        &mut self,
        mem: &mut dyn GuestMemory,
        sid: u32,
    ) -> Result<Arc<TranslationConfig>, EventKind> {
        let stats = self.stats.entry(sid).or_default();
        if let Some(cfg) = self.configs.get(&sid) {
            stats.config_hits += 1;
            return Ok(Arc::clone(cfg));
        }
        stats.config_misses += 1;
        let strtab = self.strtab_cfg();
        let cfg = Arc::new(decode_config(mem, &strtab, sid)?);
        self.configs.insert(sid, Arc::clone(&cfg));
        Ok(cfg)
    }

    fn flush_config(&mut self, sid: u32) {
        self.configs.remove(&sid);
    }

    fn flush_config_range(&mut self, start: u32, end: u32) {
        self.configs.retain(|&sid, _| sid < start || sid > end);
    }

    pub fn cache_stats(&self, sid: u32) -> CacheStats {
        self.stats.get(&sid).copied().unwrap_or_default()
    }

    pub fn has_cached_config(&self, sid: u32) -> bool {
        self.configs.contains_key(&sid)
    }

    pub fn iotlb_len(&self) -> usize {
        self.iotlb.len()
    }

    // ---- notifiers ----

    pub fn register_unmap_notifier(
        &mut self,
        sid: u32,
        wants_map: bool,
        notifier: Box<dyn UnmapNotifier>,
    ) -> Result<NotifierId, NotifierError> {
        self.notifiers.register(sid, wants_map, notifier)
    }

    pub fn unregister_unmap_notifier(
        &mut self,
        id: NotifierId,
    ) -> Result<Box<dyn UnmapNotifier>, NotifierError> {
        self.notifiers.unregister(id)
    }

    /// Fan one unmap out to the streams whose translation context matches
    /// the invalidation scope. A stream without a cached config may be in
    /// any context, so it is notified unconditionally.
    fn notify_unmap_scoped(
        &mut self,
        asid: Option<u16>,
        vmid: Option<u16>,
        iova: u64,
        addr_mask: u64,
    ) {
        if self.notifiers.is_empty() {
            return;
        }
        for sid in self.notifiers.sids() {
            if let Some(cfg) = self.configs.get(&sid) {
                if asid.is_some() && cfg.asid_key() != asid {
                    continue;
                }
                if vmid.is_some() && cfg.vmid_key() != vmid {
                    continue;
                }
            }
            self.notifiers.notify_sid(sid, iova, addr_mask);
        }
    }

    // ---- command queue ----

    fn range_inval(&mut self, cmd: &Cmd, asid: Option<u16>, vmid: Option<u16>) {
        let addr = cmd.addr();
        let tg = cmd.tg();
        if tg == 0 {
            // Non-range form: one page of unknown granule; 4K covers the
            // smallest translation unit and the IOTLB match is by overlap.
            self.iotlb.inv_range(asid, vmid, addr, 0x1000);
            self.notify_unmap_scoped(asid, vmid, addr, 0xfff);
            return;
        }

        let granule = tg * 2 + 10;
        let num_pages = u64::from(cmd.num() + 1) << cmd.scale();
        let size = num_pages << granule;
        for (start, mask) in Pow2Cover::new(addr, size, 64) {
            self.iotlb.inv_range(asid, vmid, start, mask + 1);
            self.notify_unmap_scoped(asid, vmid, start, mask);
        }
    }

    fn handle_cmd(&mut self, cmd: &Cmd, irq: &mut dyn IrqSink) -> Result<(), CmdError> {
        let Some(ty) = cmd.command_type() else {
            log::warn!("smmuv3: illegal command type 0x{:x}", cmd.type_raw());
            return Err(CmdError::Ill);
        };
        match ty {
            CommandType::Sync => {
                if cmd.sync_cs() == SYNC_CS_IRQ {
                    self.trigger_irq(SmmuIrq::CmdSync, 0, irq);
                }
            }
            CommandType::PrefetchConfig | CommandType::PrefetchAddr => {}
            CommandType::CfgiSte => {
                if cmd.ssec() {
                    return Err(CmdError::Ill);
                }
                self.flush_config(cmd.sid());
            }
            CommandType::CfgiSteRange => {
                if cmd.ssec() {
                    return Err(CmdError::Ill);
                }
                let range = cmd.ste_range();
                let mask = (1u64 << (range + 1)) - 1;
                let start = cmd.sid() & !(mask as u32);
                let end = start | mask as u32;
                self.flush_config_range(start, end);
            }
            CommandType::CfgiCd | CommandType::CfgiCdAll => {
                if cmd.ssec() {
                    return Err(CmdError::Ill);
                }
                // CDs are folded into the stream's cached config.
                self.flush_config(cmd.sid());
            }
            CommandType::TlbiNhAll | CommandType::TlbiNsnhAll => {
                self.iotlb.inv_all();
                self.notifiers.notify_all(0, u64::MAX);
            }
            CommandType::TlbiNhAsid => {
                let asid = cmd.asid();
                self.iotlb.inv_asid(asid);
                self.notify_unmap_scoped(Some(asid), None, 0, u64::MAX);
            }
            CommandType::TlbiNhVa => {
                self.range_inval(cmd, Some(cmd.asid()), None);
            }
            CommandType::TlbiNhVaa => {
                self.range_inval(cmd, None, None);
            }
            CommandType::TlbiS12Vmall => {
                let vmid = cmd.vmid();
                self.iotlb.inv_vmid(vmid);
                self.notify_unmap_scoped(None, Some(vmid), 0, u64::MAX);
            }
            CommandType::TlbiS2Ipa => {
                self.range_inval(cmd, None, Some(cmd.vmid()));
            }
            CommandType::TlbiEl3All
            | CommandType::TlbiEl3Va
            | CommandType::TlbiEl2All
            | CommandType::TlbiEl2Asid
            | CommandType::TlbiEl2Va
            | CommandType::TlbiEl2Vaa
            | CommandType::AtcInv
            | CommandType::PriResp
            | CommandType::Resume
            | CommandType::StallTerm => {
                log::warn!("smmuv3: unhandled command type {ty:?}");
            }
        }
        Ok(())
    }

    /// Drain the command queue. Runs until the queue empties, the queue is
    /// disabled, or a command fails; a failure latches the error code into
    /// CMDQ_CONS.ERR and raises GERROR.CMDQ_ERR.
    fn cmdq_consume(&mut self, mem: &mut dyn GuestMemory, irq: &mut dyn IrqSink) {
        if !self.cmdq_enabled() {
            return;
        }

        let mut cmd_error = CmdError::None;
        while !self.cmdq.is_empty() {
            if (self.gerror ^ self.gerrorn) & GERROR_CMDQ_ERR != 0 {
                break;
            }
            let addr = self.cmdq.cons_entry_addr();
            let mut bytes = [0u8; CMD_SIZE];
            if mem.read(addr, &mut bytes).is_err() {
                cmd_error = CmdError::Abt;
                break;
            }
            let cmd = Cmd::from_bytes(bytes);
            if let Err(err) = self.handle_cmd(&cmd, irq) {
                cmd_error = err;
                break;
            }
            // Only a fully-processed entry moves the cursor.
            self.cmdq.cons_incr();
        }

        if cmd_error != CmdError::None {
            self.cmdq.cons = deposit32(
                self.cmdq.cons,
                CMDQ_CONS_ERR_SHIFT,
                CMDQ_CONS_ERR_LEN,
                cmd_error.code(),
            );
            self.trigger_irq(SmmuIrq::Gerror, GERROR_CMDQ_ERR, irq);
        }
    }

    // ---- translation ----

    pub fn translate(
        &mut self,
        mem: &mut dyn GuestMemory,
        irq: &mut dyn IrqSink,
        sid: u32,
        iova: u64,
        perm: Perm,
    ) -> Translation {
        let mut event = None;
        let result = self.translate_inner(mem, sid, iova, perm, &mut event);
        // Recording is ordered after all cache/state updates.
        if let Some(kind) = event {
            self.record_event(mem, irq, EventInfo::new(sid, kind));
        }
        result
    }

    fn translate_inner(
        &mut self,
        mem: &mut dyn GuestMemory,
        sid: u32,
        iova: u64,
        perm: Perm,
        event: &mut Option<EventKind>,
    ) -> Translation {
        if !self.smmu_enabled() {
            if self.gbpa & GBPA_ABORT != 0 {
                return Translation::blocked(TranslationStatus::Abort);
            }
            return Translation::passthrough(TranslationStatus::Disabled, iova, perm);
        }

        let cfg = match self.get_config(mem, sid) {
            Ok(cfg) => cfg,
            Err(kind) => {
                *event = Some(kind);
                return Translation::blocked(TranslationStatus::Error);
            }
        };
        if cfg.aborted {
            return Translation::blocked(TranslationStatus::Abort);
        }
        if cfg.bypassed {
            return Translation::passthrough(TranslationStatus::Bypass, iova, perm);
        }

        let fault = |kind: WalkFaultKind| TransFault {
            addr: iova,
            rnw: perm.read_not_write(),
            s2: cfg.stage == Stage::Stage2,
            class: match kind {
                WalkFaultKind::ExternalAbort => FaultClass::Tt,
                _ => FaultClass::In,
            },
            ..Default::default()
        };

        let granule_sz = match cfg.stage {
            Stage::Stage1 => match cfg.select_tt(iova) {
                Some(tt) => tt.granule_sz,
                None => {
                    if cfg.record_faults {
                        *event =
                            Some(EventKind::Translation(fault(WalkFaultKind::Translation)));
                    }
                    return Translation::blocked(TranslationStatus::Error);
                }
            },
            Stage::Stage2 => match &cfg.s2 {
                Some(s2) => s2.granule_sz,
                None => {
                    debug_assert!(false, "stage-2 config without S2 fields");
                    return Translation::blocked(TranslationStatus::Error);
                }
            },
        };

        let key = IotlbKey {
            asid: cfg.asid_key(),
            vmid: cfg.vmid_key(),
            iova: iova & !mask64(granule_sz),
            granule_sz,
        };
        let stats = self.stats.entry(sid).or_default();
        let entry = match self.iotlb.lookup(&key) {
            Some(entry) => {
                stats.iotlb_hits += 1;
                entry
            }
            None => {
                stats.iotlb_misses += 1;
                match self.walker.walk(mem, &cfg, iova, perm) {
                    Ok(page) => {
                        let entry = IotlbEntry {
                            page_addr: page.page_addr,
                            perm: page.perm,
                        };
                        self.iotlb.insert(key, entry);
                        entry
                    }
                    Err(walk_fault) => {
                        let mut f = fault(walk_fault.kind);
                        f.s2 = walk_fault.stage2 || f.s2;
                        let kind = match walk_fault.kind {
                            WalkFaultKind::ExternalAbort => EventKind::WalkEabt {
                                fault: f,
                                fetch_addr: walk_fault.fetch_addr,
                            },
                            WalkFaultKind::Translation => EventKind::Translation(f),
                            WalkFaultKind::AddrSize => EventKind::AddrSize(f),
                            WalkFaultKind::AccessFlag => EventKind::Access(f),
                            WalkFaultKind::Permission => EventKind::Permission(f),
                        };
                        // Walk external aborts are always reported.
                        if !kind.is_translation_fault() || cfg.record_faults {
                            *event = Some(kind);
                        }
                        return Translation::blocked(TranslationStatus::Error);
                    }
                }
            }
        };

        // A cached entry can never grant more than the walk produced: a
        // request the entry does not permit re-faults.
        if !entry.perm.contains(perm) {
            if cfg.record_faults {
                *event = Some(EventKind::Permission(fault(WalkFaultKind::Permission)));
            }
            return Translation::blocked(TranslationStatus::Error);
        }

        Translation {
            status: TranslationStatus::Success,
            translated_addr: entry.page_addr | (iova & mask64(granule_sz)),
            perm: entry.perm,
        }
    }

    // ---- MMIO ----

    pub fn mmio_read(&mut self, offset: u64, size: usize) -> u64 {
        let offset = offset & !PAGE1_ALIAS_BIT;
        match size {
            8 => match offset {
                REG_GERROR_IRQ_CFG0 => self.gerror_irq_cfg0,
                REG_STRTAB_BASE => self.strtab_base,
                REG_CMDQ_BASE => self.cmdq.base,
                REG_EVENTQ_BASE => self.eventq.base,
                REG_EVENTQ_IRQ_CFG0 => self.eventq_irq_cfg0,
                _ => {
                    log::warn!("smmuv3: unhandled 64-bit read at offset 0x{offset:x}");
                    0
                }
            },
            4 => u64::from(self.read32(offset)),
            _ => {
                log::warn!("smmuv3: unsupported {size}-byte read at offset 0x{offset:x}");
                0
            }
        }
    }

    fn read32(&mut self, offset: u64) -> u32 {
        match offset {
            REG_IDR0 | REG_IDR1 | REG_IDR2 | REG_IDR3 | REG_IDR4 | REG_IDR5 => {
                self.idr[(offset / 4) as usize]
            }
            REG_IIDR => self.iidr,
            REG_AIDR => self.aidr,
            REG_CR0 => self.cr[0],
            REG_CR0ACK => self.cr0ack,
            REG_CR1 => self.cr[1],
            REG_CR2 => self.cr[2],
            REG_STATUSR => self.statusr,
            REG_GBPA => self.gbpa,
            REG_IRQ_CTRL | REG_IRQ_CTRL_ACK => self.irq_ctrl,
            REG_GERROR => self.gerror,
            REG_GERRORN => self.gerrorn,
            REG_GERROR_IRQ_CFG0 => self.gerror_irq_cfg0 as u32,
            x if x == REG_GERROR_IRQ_CFG0 + 4 => (self.gerror_irq_cfg0 >> 32) as u32,
            REG_GERROR_IRQ_CFG1 => self.gerror_irq_cfg1,
            REG_GERROR_IRQ_CFG2 => self.gerror_irq_cfg2,
            REG_STRTAB_BASE => self.strtab_base as u32,
            x if x == REG_STRTAB_BASE + 4 => (self.strtab_base >> 32) as u32,
            REG_STRTAB_BASE_CFG => self.strtab_base_cfg,
            REG_CMDQ_BASE => self.cmdq.base as u32,
            x if x == REG_CMDQ_BASE + 4 => (self.cmdq.base >> 32) as u32,
            REG_CMDQ_PROD => self.cmdq.prod,
            REG_CMDQ_CONS => self.cmdq.cons,
            REG_EVENTQ_BASE => self.eventq.base as u32,
            x if x == REG_EVENTQ_BASE + 4 => (self.eventq.base >> 32) as u32,
            REG_EVENTQ_PROD => self.eventq.prod,
            REG_EVENTQ_CONS => self.eventq.cons,
            REG_EVENTQ_IRQ_CFG0 => self.eventq_irq_cfg0 as u32,
            x if x == REG_EVENTQ_IRQ_CFG0 + 4 => (self.eventq_irq_cfg0 >> 32) as u32,
            REG_EVENTQ_IRQ_CFG1 => self.eventq_irq_cfg1,
            REG_EVENTQ_IRQ_CFG2 => self.eventq_irq_cfg2,
            REG_IDREGS..=REG_IDREGS_END => 0,
            _ => {
                log::warn!("smmuv3: unhandled read at offset 0x{offset:x}");
                0
            }
        }
    }

    pub fn mmio_write(
        &mut self,
        offset: u64,
        size: usize,
        value: u64,
        mem: &mut dyn GuestMemory,
        irq: &mut dyn IrqSink,
    ) {
        let offset = offset & !PAGE1_ALIAS_BIT;
        match size {
            8 => match offset {
                REG_GERROR_IRQ_CFG0 => self.gerror_irq_cfg0 = value,
                REG_STRTAB_BASE => self.strtab_base = value,
                REG_CMDQ_BASE => self.cmdq.set_base(value),
                REG_EVENTQ_BASE => self.eventq.set_base(value),
                REG_EVENTQ_IRQ_CFG0 => self.eventq_irq_cfg0 = value,
                _ => {
                    log::warn!("smmuv3: unhandled 64-bit write at offset 0x{offset:x}");
                }
            },
            4 => self.write32(offset, value as u32, mem, irq),
            _ => {
                log::warn!("smmuv3: unsupported {size}-byte write at offset 0x{offset:x}");
            }
        }
    }

    fn write32(
        &mut self,
        offset: u64,
        value: u32,
        mem: &mut dyn GuestMemory,
        irq: &mut dyn IrqSink,
    ) {
        match offset {
            REG_CR0 => {
                self.cr[0] = value;
                self.cr0ack = value & !CR0_RESERVED;
                // The command queue may just have been enabled.
                self.cmdq_consume(mem, irq);
            }
            REG_CR1 => self.cr[1] = value,
            REG_CR2 => self.cr[2] = value,
            REG_IRQ_CTRL => self.irq_ctrl = value,
            REG_GERRORN => {
                self.write_gerrorn(value);
                // Acknowledging CMDQ_ERR unblocks the consumer.
                self.cmdq_consume(mem, irq);
            }
            REG_GBPA => {
                // Writes only take effect with UPDATE set; it reads back 0.
                if value & GBPA_UPDATE != 0 {
                    self.gbpa = value & !GBPA_UPDATE;
                }
            }
            REG_GERROR_IRQ_CFG0 => {
                self.gerror_irq_cfg0 = deposit64(self.gerror_irq_cfg0, 0, 32, u64::from(value));
            }
            x if x == REG_GERROR_IRQ_CFG0 + 4 => {
                self.gerror_irq_cfg0 = deposit64(self.gerror_irq_cfg0, 32, 32, u64::from(value));
            }
            REG_GERROR_IRQ_CFG1 => self.gerror_irq_cfg1 = value,
            REG_GERROR_IRQ_CFG2 => self.gerror_irq_cfg2 = value,
            REG_STRTAB_BASE => {
                self.strtab_base = deposit64(self.strtab_base, 0, 32, u64::from(value));
            }
            x if x == REG_STRTAB_BASE + 4 => {
                self.strtab_base = deposit64(self.strtab_base, 32, 32, u64::from(value));
            }
            REG_STRTAB_BASE_CFG => {
                self.strtab_base_cfg = value;
                if extract32(value, STRTAB_BASE_CFG_FMT_SHIFT, STRTAB_BASE_CFG_FMT_LEN)
                    == STRTAB_FMT_2LVL
                {
                    self.sid_split =
                        extract32(value, STRTAB_BASE_CFG_SPLIT_SHIFT, STRTAB_BASE_CFG_SPLIT_LEN);
                    self.two_level_strtab = true;
                }
            }
            REG_CMDQ_BASE => {
                self.cmdq
                    .set_base(deposit64(self.cmdq.base, 0, 32, u64::from(value)));
            }
            x if x == REG_CMDQ_BASE + 4 => {
                self.cmdq
                    .set_base(deposit64(self.cmdq.base, 32, 32, u64::from(value)));
            }
            REG_CMDQ_PROD => {
                self.cmdq.prod = value;
                self.cmdq_consume(mem, irq);
            }
            REG_CMDQ_CONS => self.cmdq.cons = value,
            REG_EVENTQ_BASE => {
                self.eventq
                    .set_base(deposit64(self.eventq.base, 0, 32, u64::from(value)));
            }
            x if x == REG_EVENTQ_BASE + 4 => {
                self.eventq
                    .set_base(deposit64(self.eventq.base, 32, 32, u64::from(value)));
            }
            REG_EVENTQ_PROD => self.eventq.prod = value,
            REG_EVENTQ_CONS => self.eventq.cons = value,
            REG_EVENTQ_IRQ_CFG0 => {
                self.eventq_irq_cfg0 = deposit64(self.eventq_irq_cfg0, 0, 32, u64::from(value));
            }
            x if x == REG_EVENTQ_IRQ_CFG0 + 4 => {
                self.eventq_irq_cfg0 = deposit64(self.eventq_irq_cfg0, 32, 32, u64::from(value));
            }
            REG_EVENTQ_IRQ_CFG1 => self.eventq_irq_cfg1 = value,
            REG_EVENTQ_IRQ_CFG2 => self.eventq_irq_cfg2 = value,
            _ => {
                log::warn!("smmuv3: unhandled write at offset 0x{offset:x}");
            }
        }
    }
}

// ---- snapshot ----

const TAG_CR0: u16 = 1;
const TAG_CR1: u16 = 2;
const TAG_CR2: u16 = 3;
const TAG_CR0ACK: u16 = 4;
const TAG_STATUSR: u16 = 5;
const TAG_GBPA: u16 = 6;
const TAG_IRQ_CTRL: u16 = 7;
const TAG_GERROR: u16 = 8;
const TAG_GERRORN: u16 = 9;
const TAG_GERROR_IRQ_CFG0: u16 = 10;
const TAG_GERROR_IRQ_CFG1: u16 = 11;
const TAG_GERROR_IRQ_CFG2: u16 = 12;
const TAG_STRTAB_BASE: u16 = 13;
const TAG_STRTAB_BASE_CFG: u16 = 14;
const TAG_SID_SPLIT: u16 = 15;
const TAG_TWO_LEVEL: u16 = 16;
const TAG_CMDQ: u16 = 17;
const TAG_EVENTQ: u16 = 18;
const TAG_EVENTQ_IRQ_CFG0: u16 = 19;
const TAG_EVENTQ_IRQ_CFG1: u16 = 20;
const TAG_EVENTQ_IRQ_CFG2: u16 = 21;

impl IoSnapshot for Smmuv3 {
    const DEVICE_ID: [u8; 4] = *b"SMM3";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u32(TAG_CR0, self.cr[0]);
        w.field_u32(TAG_CR1, self.cr[1]);
        w.field_u32(TAG_CR2, self.cr[2]);
        w.field_u32(TAG_CR0ACK, self.cr0ack);
        w.field_u32(TAG_STATUSR, self.statusr);
        w.field_u32(TAG_GBPA, self.gbpa);
        w.field_u32(TAG_IRQ_CTRL, self.irq_ctrl);
        w.field_u32(TAG_GERROR, self.gerror);
        w.field_u32(TAG_GERRORN, self.gerrorn);
        w.field_u64(TAG_GERROR_IRQ_CFG0, self.gerror_irq_cfg0);
        w.field_u32(TAG_GERROR_IRQ_CFG1, self.gerror_irq_cfg1);
        w.field_u32(TAG_GERROR_IRQ_CFG2, self.gerror_irq_cfg2);
        w.field_u64(TAG_STRTAB_BASE, self.strtab_base);
        w.field_u32(TAG_STRTAB_BASE_CFG, self.strtab_base_cfg);
        w.field_u32(TAG_SID_SPLIT, self.sid_split);
        w.field_bool(TAG_TWO_LEVEL, self.two_level_strtab);
        w.field_bytes(TAG_CMDQ, self.cmdq.encode(Encoder::new()).finish());
        w.field_bytes(TAG_EVENTQ, self.eventq.encode(Encoder::new()).finish());
        w.field_u64(TAG_EVENTQ_IRQ_CFG0, self.eventq_irq_cfg0);
        w.field_u32(TAG_EVENTQ_IRQ_CFG1, self.eventq_irq_cfg1);
        w.field_u32(TAG_EVENTQ_IRQ_CFG2, self.eventq_irq_cfg2);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        // Start from reset so absent fields keep their defaults; the caches
        // are rebuilt on demand and are not part of the snapshot.
        self.reset();
        if let Some(v) = r.u32(TAG_CR0)? {
            self.cr[0] = v;
        }
        if let Some(v) = r.u32(TAG_CR1)? {
            self.cr[1] = v;
        }
        if let Some(v) = r.u32(TAG_CR2)? {
            self.cr[2] = v;
        }
        if let Some(v) = r.u32(TAG_CR0ACK)? {
            self.cr0ack = v;
        }
        if let Some(v) = r.u32(TAG_STATUSR)? {
            self.statusr = v;
        }
        if let Some(v) = r.u32(TAG_GBPA)? {
            self.gbpa = v;
        }
        if let Some(v) = r.u32(TAG_IRQ_CTRL)? {
            self.irq_ctrl = v;
        }
        if let Some(v) = r.u32(TAG_GERROR)? {
            self.gerror = v;
        }
        if let Some(v) = r.u32(TAG_GERRORN)? {
            self.gerrorn = v;
        }
        if let Some(v) = r.u64(TAG_GERROR_IRQ_CFG0)? {
            self.gerror_irq_cfg0 = v;
        }
        if let Some(v) = r.u32(TAG_GERROR_IRQ_CFG1)? {
            self.gerror_irq_cfg1 = v;
        }
        if let Some(v) = r.u32(TAG_GERROR_IRQ_CFG2)? {
            self.gerror_irq_cfg2 = v;
        }
        if let Some(v) = r.u64(TAG_STRTAB_BASE)? {
            self.strtab_base = v;
        }
        if let Some(v) = r.u32(TAG_STRTAB_BASE_CFG)? {
            self.strtab_base_cfg = v;
        }
        if let Some(v) = r.u32(TAG_SID_SPLIT)? {
            self.sid_split = v;
        }
        if let Some(v) = r.bool(TAG_TWO_LEVEL)? {
            self.two_level_strtab = v;
        }
        if let Some(bytes) = r.bytes(TAG_CMDQ) {
            self.cmdq.decode(&mut Decoder::new(bytes))?;
        }
        if let Some(bytes) = r.bytes(TAG_EVENTQ) {
            self.eventq.decode(&mut Decoder::new(bytes))?;
        }
        if let Some(v) = r.u64(TAG_EVENTQ_IRQ_CFG0)? {
            self.eventq_irq_cfg0 = v;
        }
        if let Some(v) = r.u32(TAG_EVENTQ_IRQ_CFG1)? {
            self.eventq_irq_cfg1 = v;
        }
        if let Some(v) = r.u32(TAG_EVENTQ_IRQ_CFG2)? {
            self.eventq_irq_cfg2 = v;
        }
        Ok(())
    }
}

/// Shareable handle for platforms where device DMA and vCPU MMIO arrive on
/// different threads. One lock per SMMU instance.
///
/// A faulting [`translate`](Self::translate) records its event inside the
/// same critical section as the translation: the event queue and GERROR
/// state the record touches live behind this lock, and recording is already
/// ordered after all cache updates within [`Smmuv3::translate`].
#[derive(Clone)]
pub struct SharedSmmu {
    inner: Arc<Mutex<Smmuv3>>,
}

impl SharedSmmu {
    pub fn new(smmu: Smmuv3) -> Self {
        Self {
            inner: Arc::new(Mutex::new(smmu)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Smmuv3> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn translate(
        &self,
        mem: &mut dyn GuestMemory,
        irq: &mut dyn IrqSink,
        sid: u32,
        iova: u64,
        perm: Perm,
    ) -> Translation {
        self.lock().translate(mem, irq, sid, iova, perm)
    }
}
