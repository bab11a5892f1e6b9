#![allow(dead_code)]

//! Shared fixture for the integration tests: a device instance wired to
//! flat RAM, a recording interrupt sink and a scriptable page-table walker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aster_guest_mem::{GuestMemory, VecMemory};
use aster_interrupts::RecordingSink;
use aster_smmuv3::cmd::Cmd;
use aster_smmuv3::config::{Cd, Ste, STE_CONFIG_BYPASS};
use aster_smmuv3::registers::*;
use aster_smmuv3::{
    PageTableWalker, Perm, Smmuv3, TranslationConfig, WalkFault, WalkedPage,
};

pub const STRTAB_ADDR: u64 = 0x1_0000;
pub const CMDQ_ADDR: u64 = 0x2_0000;
pub const EVENTQ_ADDR: u64 = 0x3_0000;
pub const CD_ADDR: u64 = 0x4_0000;

/// 16 command queue entries, 16 event queue entries.
pub const QUEUE_LOG2SIZE: u64 = 4;

#[derive(Default)]
pub struct WalkerState {
    /// 4K-page iova -> resolved page.
    pub pages: HashMap<u64, WalkedPage>,
    /// Next walk fails with this fault.
    pub fault: Option<WalkFault>,
    pub walks: usize,
}

/// Walker double with a handle the test keeps after the device takes
/// ownership of the boxed copy.
#[derive(Clone, Default)]
pub struct FakeWalker(pub Arc<Mutex<WalkerState>>);

impl FakeWalker {
    pub fn map_page(&self, iova: u64, page_addr: u64, perm: Perm) {
        self.0.lock().unwrap().pages.insert(
            iova & !0xfff,
            WalkedPage { page_addr, perm },
        );
    }

    pub fn fail_next(&self, fault: WalkFault) {
        self.0.lock().unwrap().fault = Some(fault);
    }

    pub fn walks(&self) -> usize {
        self.0.lock().unwrap().walks
    }
}

impl PageTableWalker for FakeWalker {
    fn walk(
        &mut self,
        _mem: &mut dyn GuestMemory,
        _cfg: &TranslationConfig,
        iova: u64,
        _perm: Perm,
    ) -> Result<WalkedPage, WalkFault> {
        let mut state = self.0.lock().unwrap();
        state.walks += 1;
        if let Some(fault) = state.fault.take() {
            return Err(fault);
        }
        state
            .pages
            .get(&(iova & !0xfff))
            .copied()
            .ok_or_else(|| WalkFault::new(aster_smmuv3::WalkFaultKind::Translation))
    }
}

pub struct Rig {
    pub smmu: Smmuv3,
    pub mem: VecMemory,
    pub irq: RecordingSink,
    pub walker: FakeWalker,
}

impl Rig {
    pub fn new() -> Self {
        let walker = FakeWalker::default();
        Self {
            smmu: Smmuv3::new(Box::new(walker.clone())),
            mem: VecMemory::new(0x10_0000),
            irq: RecordingSink::new(),
            walker,
        }
    }

    pub fn reg_write(&mut self, offset: u64, size: usize, value: u64) {
        self.smmu
            .mmio_write(offset, size, value, &mut self.mem, &mut self.irq);
    }

    pub fn reg_read(&mut self, offset: u64, size: usize) -> u64 {
        self.smmu.mmio_read(offset, size)
    }

    /// Program a linear stream table, both queues and all IRQ enables, then
    /// enable the SMMU.
    pub fn enable(&mut self) {
        self.reg_write(REG_STRTAB_BASE, 8, STRTAB_ADDR);
        // Linear format, 256 stream ids.
        self.reg_write(REG_STRTAB_BASE_CFG, 4, 8);
        self.reg_write(REG_CMDQ_BASE, 8, CMDQ_ADDR | QUEUE_LOG2SIZE);
        self.reg_write(REG_EVENTQ_BASE, 8, EVENTQ_ADDR | QUEUE_LOG2SIZE);
        self.reg_write(
            REG_IRQ_CTRL,
            4,
            u64::from(IRQ_CTRL_GERROR_IRQEN | IRQ_CTRL_EVENTQ_IRQEN),
        );
        self.reg_write(
            REG_CR0,
            4,
            u64::from(CR0_SMMUEN | CR0_CMDQEN | CR0_EVENTQEN),
        );
    }

    /// Switch to a two-level stream table with the given split.
    pub fn enable_two_level(&mut self, log2size: u64, split: u64) {
        self.enable();
        self.reg_write(
            REG_STRTAB_BASE_CFG,
            4,
            (u64::from(STRTAB_FMT_2LVL) << 16) | (split << 6) | log2size,
        );
    }

    pub fn set_ste(&mut self, sid: u32, ste: &Ste) {
        self.mem
            .write(STRTAB_ADDR + u64::from(sid) * 64, &ste.to_bytes())
            .unwrap();
    }

    pub fn set_cd(&mut self, addr: u64, cd: &Cd) {
        self.mem.write(addr, &cd.to_bytes()).unwrap();
    }

    /// Append one command and ring the producer doorbell, which drains the
    /// queue synchronously.
    pub fn push_cmd(&mut self, cmd: &Cmd) {
        let prod = self.reg_read(REG_CMDQ_PROD, 4) as u32;
        let index = u64::from(prod) & ((1 << QUEUE_LOG2SIZE) - 1);
        self.mem
            .write(CMDQ_ADDR + index * 16, &cmd.to_bytes())
            .unwrap();
        let next = (prod + 1) & ((1 << (QUEUE_LOG2SIZE + 1)) - 1);
        self.reg_write(REG_CMDQ_PROD, 4, u64::from(next));
    }

    pub fn event_count(&mut self) -> u32 {
        self.reg_read(REG_EVENTQ_PROD, 4) as u32
    }

    /// Raw words of the `index`-th record written to the event queue.
    pub fn event_words(&mut self, index: u64) -> [u32; 8] {
        let mut bytes = [0u8; 32];
        self.mem.read(EVENTQ_ADDR + index * 32, &mut bytes).unwrap();
        let mut words = [0u32; 8];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        words
    }

    pub fn cmdq_err(&mut self) -> u32 {
        (self.reg_read(REG_CMDQ_CONS, 4) as u32 >> 24) & 0x7f
    }

    pub fn gerror_pending(&mut self) -> u32 {
        (self.reg_read(REG_GERROR, 4) ^ self.reg_read(REG_GERRORN, 4)) as u32
    }
}

/// A valid stage-1 STE pointing at `cd_addr`.
pub fn s1_ste(cd_addr: u64) -> Ste {
    let mut ste = Ste::default();
    ste.set_valid(true).set_config(0b101).set_ctxptr(cd_addr);
    ste
}

pub fn bypass_ste() -> Ste {
    let mut ste = Ste::default();
    ste.set_valid(true).set_config(STE_CONFIG_BYPASS);
    ste
}

pub fn abort_ste() -> Ste {
    let mut ste = Ste::default();
    ste.set_valid(true).set_config(0b000);
    ste
}

/// A valid 4K-granule AArch64 CD with TTB1 disabled.
pub fn valid_cd(asid: u16, record_faults: bool) -> Cd {
    let mut cd = Cd::default();
    cd.set_valid(true)
        .set_aa64(true)
        .set_a(true)
        .set_asid(asid)
        .set_ips(4)
        .set_tsz(0, 25)
        .set_tg(0, 0)
        .set_ttb(0, 0x8_0000)
        .set_epd(1, true)
        .set_record(record_faults);
    cd
}
