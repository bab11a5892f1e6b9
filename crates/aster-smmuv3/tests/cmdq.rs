//! Command queue consumer: SYNC completion, error latching and recovery,
//! config-cache and IOTLB invalidation commands.

mod common;

use std::sync::{Arc, Mutex};

use aster_smmuv3::cmd::{Cmd, CommandType, SYNC_CS_IRQ};
use aster_smmuv3::registers::*;
use aster_smmuv3::{Perm, SmmuIrq, TranslationStatus, UnmapNotifier};

use common::*;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<(u64, u64)>>>);

impl Capture {
    fn take(&self) -> Vec<(u64, u64)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl UnmapNotifier for Capture {
    fn notify_unmap(&mut self, iova: u64, addr_mask: u64) {
        self.0.lock().unwrap().push((iova, addr_mask));
    }
}

#[test]
fn sync_command_pulses_the_cmdsync_line() {
    let mut rig = Rig::new();
    rig.enable();

    let mut sync = Cmd::new();
    sync.set_type(CommandType::Sync).set_sync_cs(SYNC_CS_IRQ);
    rig.push_cmd(&sync);

    assert_eq!(rig.irq.pulses(SmmuIrq::CmdSync.line()), 1);
    assert_eq!(rig.cmdq_err(), 0);
    // Fully consumed.
    assert_eq!(
        rig.reg_read(REG_CMDQ_CONS, 4) as u32 & 0xff,
        rig.reg_read(REG_CMDQ_PROD, 4) as u32 & 0xff
    );

    // SEV completion does not use the interrupt line.
    let mut sync = Cmd::new();
    sync.set_type(CommandType::Sync).set_sync_cs(2);
    rig.push_cmd(&sync);
    assert_eq!(rig.irq.pulses(SmmuIrq::CmdSync.line()), 1);
}

#[test]
fn unknown_opcode_latches_cerror_ill_and_stalls_until_acknowledged() {
    let mut rig = Rig::new();
    rig.enable();

    let mut bad = Cmd::new();
    bad.set_type_raw(0x7f);
    rig.push_cmd(&bad);

    assert_eq!(rig.cmdq_err(), 1); // CERROR_ILL
    assert_eq!(rig.gerror_pending(), GERROR_CMDQ_ERR);
    assert_eq!(rig.irq.pulses(SmmuIrq::Gerror.line()), 1);

    // While the error is pending, later commands sit in the queue.
    let mut sync = Cmd::new();
    sync.set_type(CommandType::Sync).set_sync_cs(SYNC_CS_IRQ);
    rig.push_cmd(&sync);
    assert_eq!(rig.irq.pulses(SmmuIrq::CmdSync.line()), 0);

    // Recovery: skip the bad entry, then acknowledge the error. The
    // acknowledgement restarts the consumer.
    rig.reg_write(REG_CMDQ_CONS, 4, 1);
    rig.reg_write(REG_GERRORN, 4, u64::from(GERROR_CMDQ_ERR));
    assert_eq!(rig.gerror_pending(), 0);
    assert_eq!(rig.irq.pulses(SmmuIrq::CmdSync.line()), 1);
}

#[test]
fn command_fetch_outside_memory_latches_cerror_abt() {
    let mut rig = Rig::new();
    rig.enable();

    // Point the queue past the end of RAM; the fetch itself fails.
    rig.reg_write(REG_CMDQ_BASE, 8, 0x20_0000 | QUEUE_LOG2SIZE);
    rig.reg_write(REG_CMDQ_PROD, 4, 1);

    assert_eq!(rig.cmdq_err(), 2); // CERROR_ABT
    assert_eq!(rig.gerror_pending(), GERROR_CMDQ_ERR);
}

#[test]
fn security_scoped_invalidation_is_illegal() {
    let mut rig = Rig::new();
    rig.enable();

    let mut cmd = Cmd::new();
    cmd.set_type(CommandType::CfgiSte).set_sid(1).set_ssec(true);
    rig.push_cmd(&cmd);

    assert_eq!(rig.cmdq_err(), 1); // CERROR_ILL
}

#[test]
fn cfgi_ste_range_evicts_the_aligned_block() {
    let mut rig = Rig::new();
    rig.enable();
    for sid in [0x10, 0x12, 0x17, 0x20] {
        rig.set_ste(sid, &bypass_ste());
        rig.smmu
            .translate(&mut rig.mem, &mut rig.irq, sid, 0, Perm::READ);
        assert!(rig.smmu.has_cached_config(sid));
    }

    // range = 2 names a naturally-aligned block of 8 stream ids, so sid
    // 0x12 selects [0x10, 0x17].
    let mut cmd = Cmd::new();
    cmd.set_type(CommandType::CfgiSteRange)
        .set_sid(0x12)
        .set_ste_range(2);
    rig.push_cmd(&cmd);

    assert!(!rig.smmu.has_cached_config(0x10));
    assert!(!rig.smmu.has_cached_config(0x12));
    assert!(!rig.smmu.has_cached_config(0x17));
    assert!(rig.smmu.has_cached_config(0x20));

    // Repeating the invalidation changes nothing.
    rig.push_cmd(&cmd);
    assert!(rig.smmu.has_cached_config(0x20));
    assert_eq!(rig.cmdq_err(), 0);

    // Single-stream form takes out the survivor.
    let mut cmd = Cmd::new();
    cmd.set_type(CommandType::CfgiSte).set_sid(0x20);
    rig.push_cmd(&cmd);
    assert!(!rig.smmu.has_cached_config(0x20));
}

#[test]
fn cfgi_ste_forces_a_config_redecode() {
    let mut rig = Rig::new();
    rig.enable();
    rig.set_ste(4, &bypass_ste());
    rig.smmu
        .translate(&mut rig.mem, &mut rig.irq, 4, 0, Perm::READ);

    // Swap the in-memory STE to abort, then invalidate the cached copy.
    rig.set_ste(4, &abort_ste());
    let mut cmd = Cmd::new();
    cmd.set_type(CommandType::CfgiSte).set_sid(4);
    rig.push_cmd(&cmd);

    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 4, 0, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Abort);
}

#[test]
fn tlbi_commands_scope_the_iotlb_and_notifiers() {
    let mut rig = Rig::new();
    rig.enable();
    rig.set_ste(2, &s1_ste(CD_ADDR));
    rig.set_cd(CD_ADDR, &valid_cd(5, true));
    rig.walker.map_page(0x7000, 0xaa000, Perm::READ);

    let cap = Capture::default();
    rig.smmu
        .register_unmap_notifier(2, false, Box::new(cap.clone()))
        .unwrap();

    rig.smmu
        .translate(&mut rig.mem, &mut rig.irq, 2, 0x7000, Perm::READ);
    assert_eq!(rig.smmu.iotlb_len(), 1);

    // A different ASID leaves the entry and the stream alone.
    let mut cmd = Cmd::new();
    cmd.set_type(CommandType::TlbiNhAsid).set_asid(9);
    rig.push_cmd(&cmd);
    assert_eq!(rig.smmu.iotlb_len(), 1);
    assert!(cap.take().is_empty());

    // VMID invalidations do not touch stage-1 entries either.
    let mut cmd = Cmd::new();
    cmd.set_type(CommandType::TlbiS12Vmall).set_vmid(3);
    rig.push_cmd(&cmd);
    assert_eq!(rig.smmu.iotlb_len(), 1);
    assert!(cap.take().is_empty());

    // Ranged invalidation of the mapped page, 4K granule.
    let mut cmd = Cmd::new();
    cmd.set_type(CommandType::TlbiNhVa)
        .set_asid(5)
        .set_addr(0x7000)
        .set_tg(1);
    rig.push_cmd(&cmd);
    assert_eq!(rig.smmu.iotlb_len(), 0);
    assert_eq!(cap.take(), vec![(0x7000, 0xfff)]);

    // Repopulate, then the global form clears everything.
    rig.smmu
        .translate(&mut rig.mem, &mut rig.irq, 2, 0x7000, Perm::READ);
    assert_eq!(rig.smmu.iotlb_len(), 1);
    let mut cmd = Cmd::new();
    cmd.set_type(CommandType::TlbiNhAll);
    rig.push_cmd(&cmd);
    assert_eq!(rig.smmu.iotlb_len(), 0);
    assert_eq!(cap.take(), vec![(0, u64::MAX)]);
}

#[test]
fn ranged_invalidation_covers_multi_page_spans() {
    let mut rig = Rig::new();
    rig.enable();
    rig.set_ste(2, &s1_ste(CD_ADDR));
    rig.set_cd(CD_ADDR, &valid_cd(5, true));
    for page in 0..4u64 {
        rig.walker
            .map_page(0x10_000 + page * 0x1000, 0xa0_000 + page * 0x1000, Perm::READ);
        rig.smmu.translate(
            &mut rig.mem,
            &mut rig.irq,
            2,
            0x10_000 + page * 0x1000,
            Perm::READ,
        );
    }
    rig.walker.map_page(0x20_000, 0xb0_000, Perm::READ);
    rig.smmu
        .translate(&mut rig.mem, &mut rig.irq, 2, 0x20_000, Perm::READ);
    assert_eq!(rig.smmu.iotlb_len(), 5);

    // NUM=3, SCALE=0, 4K granule: 4 pages starting at 0x10000.
    let mut cmd = Cmd::new();
    cmd.set_type(CommandType::TlbiNhVa)
        .set_asid(5)
        .set_addr(0x10_000)
        .set_tg(1)
        .set_num(3);
    rig.push_cmd(&cmd);
    assert_eq!(rig.smmu.iotlb_len(), 1);
}

#[test]
fn ranged_invalidation_at_the_top_of_the_address_space() {
    let mut rig = Rig::new();
    rig.enable();
    rig.set_ste(2, &s1_ste(CD_ADDR));
    rig.set_cd(CD_ADDR, &valid_cd(5, true));
    rig.walker.map_page(0x7000, 0xaa000, Perm::READ);
    rig.smmu
        .translate(&mut rig.mem, &mut rig.irq, 2, 0x7000, Perm::READ);
    assert_eq!(rig.smmu.iotlb_len(), 1);

    // The last 4K page of the address space: the cover must clamp there
    // instead of wrapping around or ballooning to the whole space.
    let mut cmd = Cmd::new();
    cmd.set_type(CommandType::TlbiNhVa)
        .set_asid(5)
        .set_addr(0xffff_ffff_ffff_f000)
        .set_tg(1);
    rig.push_cmd(&cmd);

    assert_eq!(rig.cmdq_err(), 0);
    assert_eq!(rig.gerror_pending(), 0);
    // An unrelated low entry in the same ASID is untouched.
    assert_eq!(rig.smmu.iotlb_len(), 1);
}

#[test]
fn unhandled_command_classes_are_consumed_without_error() {
    let mut rig = Rig::new();
    rig.enable();

    for ty in [
        CommandType::PrefetchConfig,
        CommandType::TlbiEl2All,
        CommandType::AtcInv,
        CommandType::Resume,
    ] {
        let mut cmd = Cmd::new();
        cmd.set_type(ty);
        rig.push_cmd(&cmd);
    }
    assert_eq!(rig.cmdq_err(), 0);
    assert_eq!(rig.gerror_pending(), 0);
}
