//! IOTLB: a cache of completed page walks.
//!
//! Entries are keyed by the translation context (ASID for stage 1, VMID for
//! stage 2) plus the granule-aligned input address, so invalidations can be
//! scoped to an address space, a VM, an address range, or everything.

use std::collections::HashMap;

use crate::Perm;

/// Cache capacity; inserting into a full cache drops everything first.
const IOTLB_MAX_ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IotlbKey {
    pub asid: Option<u16>,
    pub vmid: Option<u16>,
    /// Input address, aligned down to the granule.
    pub iova: u64,
    /// log2 of the granule size.
    pub granule_sz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IotlbEntry {
    /// Output page address, aligned to the granule.
    pub page_addr: u64,
    pub perm: Perm,
}

#[derive(Debug, Default)]
pub(crate) struct Iotlb {
    entries: HashMap<IotlbKey, IotlbEntry>,
}

impl Iotlb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn lookup(&self, key: &IotlbKey) -> Option<IotlbEntry> {
        debug_assert_eq!(key.iova & ((1 << key.granule_sz) - 1), 0);
        self.entries.get(key).copied()
    }

    pub fn insert(&mut self, key: IotlbKey, entry: IotlbEntry) {
        if self.entries.len() >= IOTLB_MAX_ENTRIES {
            self.inv_all();
        }
        self.entries.insert(key, entry);
    }

    pub fn inv_all(&mut self) {
        self.entries.clear();
    }

    pub fn inv_asid(&mut self, asid: u16) {
        self.entries.retain(|k, _| k.asid != Some(asid));
    }

    pub fn inv_vmid(&mut self, vmid: u16) {
        self.entries.retain(|k, _| k.vmid != Some(vmid));
    }

    /// Drop entries overlapping `[start, start + len)`, optionally scoped to
    /// an ASID and/or VMID. `None` scopes match any entry.
    pub fn inv_range(
        &mut self,
        asid: Option<u16>,
        vmid: Option<u16>,
        start: u64,
        len: u64,
    ) {
        let end = start.saturating_add(len);
        self.entries.retain(|k, _| {
            if let Some(asid) = asid {
                if k.asid != Some(asid) {
                    return true;
                }
            }
            if let Some(vmid) = vmid {
                if k.vmid != Some(vmid) {
                    return true;
                }
            }
            let entry_end = k.iova.saturating_add(1 << k.granule_sz);
            // Keep entries that do not overlap the span.
            entry_end <= start || k.iova >= end
        });
    }
}
