//! Unmap notifier fan-out.
//!
//! Downstream device-side caches (vhost, ATS-like shadow tables in the
//! machine) register per-stream listeners and are told when cached
//! translations for that stream become stale. Only the unmap direction
//! exists; map notifications are refused at registration time.

use thiserror::Error;

pub type NotifierId = u32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifierError {
    /// Only unmap notifications are delivered; a listener asking for map
    /// events would silently miss traffic, so the registration is refused.
    #[error("map-direction notifications are not supported")]
    MapNotSupported,
    #[error("no notifier registered with id {0}")]
    UnknownNotifier(NotifierId),
}

pub trait UnmapNotifier: Send {
    /// A previously-translatable range went stale. `addr_mask` is the span
    /// size minus one; the range is `[iova, iova + addr_mask]`.
    fn notify_unmap(&mut self, iova: u64, addr_mask: u64);
}

struct Registration {
    id: NotifierId,
    sid: u32,
    notifier: Box<dyn UnmapNotifier>,
}

#[derive(Default)]
pub(crate) struct NotifierRegistry {
    next_id: NotifierId,
    entries: Vec<Registration>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        sid: u32,
        wants_map: bool,
        notifier: Box<dyn UnmapNotifier>,
    ) -> Result<NotifierId, NotifierError> {
        if wants_map {
            log::warn!("smmuv3: rejecting map-interest notifier for sid 0x{sid:x}");
            return Err(NotifierError::MapNotSupported);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Registration { id, sid, notifier });
        Ok(id)
    }

    pub fn unregister(
        &mut self,
        id: NotifierId,
    ) -> Result<Box<dyn UnmapNotifier>, NotifierError> {
        let pos = self
            .entries
            .iter()
            .position(|r| r.id == id)
            .ok_or(NotifierError::UnknownNotifier(id))?;
        Ok(self.entries.remove(pos).notifier)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver one unmap to every listener on `sid`.
    pub fn notify_sid(&mut self, sid: u32, iova: u64, addr_mask: u64) {
        for reg in self.entries.iter_mut().filter(|r| r.sid == sid) {
            reg.notifier.notify_unmap(iova, addr_mask);
        }
    }

    /// Deliver one unmap to every listener regardless of stream.
    pub fn notify_all(&mut self, iova: u64, addr_mask: u64) {
        for reg in &mut self.entries {
            reg.notifier.notify_unmap(iova, addr_mask);
        }
    }

    /// Streams that currently have listeners, deduplicated.
    pub fn sids(&self) -> Vec<u32> {
        let mut sids: Vec<u32> = self.entries.iter().map(|r| r.sid).collect();
        sids.sort_unstable();
        sids.dedup();
        sids
    }
}
