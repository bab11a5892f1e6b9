//! Translation-path behavior: bypass/abort streams, IOTLB use, fault
//! recording and the two-level stream table.

mod common;

use aster_guest_mem::GuestMemory;
use aster_smmuv3::config::L1StreamDesc;
use aster_smmuv3::registers::*;
use aster_smmuv3::{Perm, SmmuIrq, TranslationStatus, WalkFault, WalkFaultKind};

use common::*;

#[test]
fn bypass_stream_is_identity_with_requested_perms() {
    let mut rig = Rig::new();
    rig.enable();
    rig.set_ste(1, &bypass_ste());

    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 1, 0xdead_b000, Perm::WRITE);
    assert_eq!(t.status, TranslationStatus::Bypass);
    assert_eq!(t.translated_addr, 0xdead_b000);
    assert_eq!(t.perm, Perm::WRITE);
    assert_eq!(rig.event_count(), 0);
}

#[test]
fn abort_stream_blocks_without_event() {
    let mut rig = Rig::new();
    rig.enable();
    rig.set_ste(1, &abort_ste());

    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 1, 0x1000, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Abort);
    assert_eq!(t.perm, Perm::empty());
    assert_eq!(rig.event_count(), 0);
    assert_eq!(rig.gerror_pending(), 0);
}

#[test]
fn stage1_walk_fills_iotlb_and_second_access_hits() {
    let mut rig = Rig::new();
    rig.enable();
    rig.set_ste(2, &s1_ste(CD_ADDR));
    rig.set_cd(CD_ADDR, &valid_cd(5, true));
    rig.walker.map_page(0x7000, 0xaa000, Perm::READ | Perm::WRITE);

    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 2, 0x7123, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Success);
    assert_eq!(t.translated_addr, 0xaa123);
    assert_eq!(rig.walker.walks(), 1);
    assert_eq!(rig.smmu.iotlb_len(), 1);

    // Second access to the same page must not walk again.
    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 2, 0x7fff, Perm::WRITE);
    assert_eq!(t.status, TranslationStatus::Success);
    assert_eq!(t.translated_addr, 0xaafff);
    assert_eq!(rig.walker.walks(), 1);

    let stats = rig.smmu.cache_stats(2);
    assert_eq!(stats.config_misses, 1);
    assert_eq!(stats.config_hits, 1);
    assert_eq!(stats.iotlb_misses, 1);
    assert_eq!(stats.iotlb_hits, 1);
}

#[test]
fn cached_entry_never_escalates_permissions() {
    let mut rig = Rig::new();
    rig.enable();
    rig.set_ste(2, &s1_ste(CD_ADDR));
    rig.set_cd(CD_ADDR, &valid_cd(5, true));
    rig.walker.map_page(0x9000, 0xbb000, Perm::READ);

    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 2, 0x9000, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Success);

    // The read-only entry is cached; a write must re-fault, not succeed.
    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 2, 0x9000, Perm::WRITE);
    assert_eq!(t.status, TranslationStatus::Error);
    assert_eq!(t.perm, Perm::empty());

    // One F_PERMISSION record with the faulting address.
    assert_eq!(rig.event_count(), 1);
    let words = rig.event_words(0);
    assert_eq!(words[0] & 0xff, 0x13);
    assert_eq!(words[1], 2); // stream id
    assert_eq!((words[3] >> 3) & 1, 0); // RnW: write
    assert_eq!(words[4], 0x9000);
}

#[test]
fn walk_faults_map_to_events_and_honour_record_flag() {
    let mut rig = Rig::new();
    rig.enable();
    rig.set_ste(3, &s1_ste(CD_ADDR));
    // Fault recording disabled in the CD.
    rig.set_cd(CD_ADDR, &valid_cd(5, false));

    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 3, 0x5000, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Error);
    assert_eq!(rig.event_count(), 0);

    // Walk external aborts are reported even with recording disabled.
    rig.walker
        .fail_next(WalkFault::new(WalkFaultKind::ExternalAbort).with_fetch_addr(0x8_1000));
    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 3, 0x6000, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Error);
    assert_eq!(rig.event_count(), 1);
    let words = rig.event_words(0);
    assert_eq!(words[0] & 0xff, 0x0b); // F_WALK_EABT
    assert_eq!(words[4], 0x6000);
    assert_eq!(words[6], 0x8_1000); // faulting descriptor address
    assert_eq!(rig.irq.pulses(SmmuIrq::EventQ.line()), 1);
}

#[test]
fn bad_stream_table_entries_produce_config_events() {
    let mut rig = Rig::new();
    rig.enable();

    // Invalid (all-zero) STE.
    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 7, 0x1000, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Error);
    assert_eq!(rig.event_count(), 1);
    assert_eq!(rig.event_words(0)[0] & 0xff, 0x04); // C_BAD_STE

    // Stream id beyond the table size.
    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 0x1_0000, 0x1000, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Error);
    assert_eq!(rig.event_words(1)[0] & 0xff, 0x02); // C_BAD_STREAMID
}

#[test]
fn two_level_stream_table_walk() {
    let mut rig = Rig::new();
    rig.enable_two_level(8, 6);

    // sid 0x41: level-1 slot 1, level-2 index 1.
    let l2_addr = 0x6_0000u64;
    rig.mem
        .write_u64(STRTAB_ADDR + 8, L1StreamDesc::new(l2_addr, 2).raw())
        .unwrap();
    rig.mem
        .write(l2_addr + 64, &bypass_ste().to_bytes())
        .unwrap();

    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 0x41, 0x3000, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Bypass);
    assert_eq!(rig.event_count(), 0);

    // A level-1 descriptor with span 0 is an invalid stream id.
    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 0x81, 0x3000, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Error);
    assert_eq!(rig.event_words(0)[0] & 0xff, 0x02); // C_BAD_STREAMID
}

#[test]
fn event_queue_overflow_raises_gerror() {
    let mut rig = Rig::new();
    rig.enable();

    // 16-entry event queue; each translate against the zero STE records one
    // C_BAD_STE event. The 17th is dropped and flags EVENTQ_ABT_ERR.
    for _ in 0..16 {
        rig.smmu
            .translate(&mut rig.mem, &mut rig.irq, 9, 0, Perm::READ);
    }
    assert_eq!(rig.event_count(), 16);
    assert_eq!(rig.gerror_pending(), 0);

    rig.smmu
        .translate(&mut rig.mem, &mut rig.irq, 9, 0, Perm::READ);
    assert_eq!(rig.event_count(), 16);
    assert_eq!(rig.gerror_pending(), GERROR_EVENTQ_ABT_ERR);
    assert_eq!(rig.irq.pulses(SmmuIrq::Gerror.line()), 1);
}

#[test]
fn disabled_event_queue_drops_records_silently() {
    let mut rig = Rig::new();
    rig.enable();
    rig.reg_write(REG_CR0, 4, u64::from(CR0_SMMUEN | CR0_CMDQEN));

    rig.smmu
        .translate(&mut rig.mem, &mut rig.irq, 9, 0, Perm::READ);
    assert_eq!(rig.event_count(), 0);
    assert_eq!(rig.gerror_pending(), 0);
}

#[test]
fn config_cache_survives_between_translations_until_invalidated() {
    let mut rig = Rig::new();
    rig.enable();
    rig.set_ste(4, &bypass_ste());

    rig.smmu
        .translate(&mut rig.mem, &mut rig.irq, 4, 0, Perm::READ);
    assert!(rig.smmu.has_cached_config(4));

    // Rewriting the STE in memory alone does not change behavior; the
    // cached config still says bypass.
    rig.set_ste(4, &abort_ste());
    let t = rig
        .smmu
        .translate(&mut rig.mem, &mut rig.irq, 4, 0, Perm::READ);
    assert_eq!(t.status, TranslationStatus::Bypass);
}
