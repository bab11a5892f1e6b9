//! Page-table walker seam.
//!
//! The device model owns the caches and fault reporting but not the walk
//! itself; the machine injects a walker for the page-table formats it
//! implements. A walk resolves one granule-sized page or fails with a typed
//! fault that the device turns into an event record.

use aster_guest_mem::GuestMemory;

use crate::config::TranslationConfig;
use crate::Perm;

/// A successfully resolved page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkedPage {
    /// Output address of the page, aligned to the granule.
    pub page_addr: u64,
    /// Permissions granted by the descriptors, independent of the
    /// permission the request asked for.
    pub perm: Perm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFaultKind {
    /// No valid descriptor for the input address.
    Translation,
    /// Input or output address outside the configured size.
    AddrSize,
    /// Access flag clear and hardware update disabled.
    AccessFlag,
    /// Descriptor denies the requested permission.
    Permission,
    /// A descriptor fetch itself failed.
    ExternalAbort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkFault {
    pub kind: WalkFaultKind,
    /// True if the fault was raised by stage-2 descriptors.
    pub stage2: bool,
    /// Descriptor address that faulted; meaningful for [`WalkFaultKind::ExternalAbort`].
    pub fetch_addr: u64,
}

impl WalkFault {
    pub fn new(kind: WalkFaultKind) -> Self {
        Self {
            kind,
            stage2: false,
            fetch_addr: 0,
        }
    }

    pub fn stage2(mut self) -> Self {
        self.stage2 = true;
        self
    }

    pub fn with_fetch_addr(mut self, addr: u64) -> Self {
        self.fetch_addr = addr;
        self
    }
}

pub trait PageTableWalker: Send {
    /// Resolve the page containing `iova` under `cfg`. `perm` is the access
    /// being performed; walkers may use it for access-flag handling but
    /// permission checks against the cached entry are the device's job.
    fn walk(
        &mut self,
        mem: &mut dyn GuestMemory,
        cfg: &TranslationConfig,
        iova: u64,
        perm: Perm,
    ) -> Result<WalkedPage, WalkFault>;
}
