#![forbid(unsafe_code)]

//! ARM SMMUv3 device model.
//!
//! Emulates the guest-visible half of an SMMUv3: the MMIO register file,
//! command and event queues, stream-table / context-descriptor decode, the
//! translation-config cache and IOTLB, range invalidation, and unmap
//! notifier fan-out. The pieces the surrounding machine owns are injected at
//! the seams: guest physical memory ([`aster_guest_mem::GuestMemory`]),
//! interrupt wiring ([`aster_interrupts::IrqSink`]) and the page-table
//! walker ([`PageTableWalker`]).
//!
//! Supported configuration: stage 1 (AArch64, 4K/64K granules) and stage 2,
//! linear and two-level stream tables, range invalidation (RIL). Not
//! modelled: ATS, PRI, MSIs, secure state, stalling faults, HTTU.

mod bits;
pub mod cmd;
pub mod config;
mod device;
pub mod event;
mod iotlb;
mod notifier;
mod ptw;
pub mod queue;
mod ranges;
pub mod registers;

pub use config::{S2Config, Stage, TranslationConfig, TtInfo};
pub use device::{CacheStats, SharedSmmu, Smmuv3, Translation, TranslationStatus};
pub use iotlb::{IotlbEntry, IotlbKey};
pub use notifier::{NotifierError, NotifierId, UnmapNotifier};
pub use ptw::{PageTableWalker, WalkFault, WalkFaultKind, WalkedPage};

bitflags::bitflags! {
    /// Access permissions for a translation request or a cached mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl Perm {
    /// True if this is a read request (used for the RnW event field).
    pub fn read_not_write(self) -> bool {
        !self.contains(Perm::WRITE)
    }
}

/// Output interrupt lines, in the order the platform wires them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmmuIrq {
    EventQ,
    Priq,
    CmdSync,
    Gerror,
}

impl SmmuIrq {
    pub const COUNT: usize = 4;

    pub const fn line(self) -> u32 {
        match self {
            SmmuIrq::EventQ => 0,
            SmmuIrq::Priq => 1,
            SmmuIrq::CmdSync => 2,
            SmmuIrq::Gerror => 3,
        }
    }
}
