#![forbid(unsafe_code)]

//! Deterministic snapshot encoding for emulated device state.
//!
//! The format is a small tag-length-value (TLV) encoding providing:
//! - deterministic byte output (canonical ascending-tag ordering)
//! - forward compatibility (unknown tags are skipped on load)
//! - explicit versioning (major/minor) per device
//!
//! A device blob is `device id (4 bytes)` + `major (u16 LE)` + `minor
//! (u16 LE)` followed by `(tag u16, len u32, bytes)` fields.

use std::collections::BTreeMap;

use thiserror::Error;

pub mod codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot truncated")]
    Truncated,
    #[error("snapshot is for device {found:?}, expected {expected:?}")]
    WrongDevice { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported device major version {found} (supported: {supported})")]
    UnsupportedMajor { supported: u16, found: u16 },
    #[error("duplicate field tag {0}")]
    DuplicateTag(u16),
    #[error("field tag {tag} has length {len}, expected {expected}")]
    BadFieldLength { tag: u16, len: usize, expected: usize },
    #[error("field tag {tag} holds an invalid value")]
    BadFieldValue { tag: u16 },
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Snapshotting contract for emulated device state.
///
/// Implementations must keep `DEVICE_ID` stable forever and only perform
/// forward-compatible additions within the same major version by adding new
/// TLV fields.
pub trait IoSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}

#[derive(Debug)]
pub struct SnapshotWriter {
    id: [u8; 4],
    version: SnapshotVersion,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotWriter {
    pub fn new(id: [u8; 4], version: SnapshotVersion) -> Self {
        Self {
            id,
            version,
            fields: BTreeMap::new(),
        }
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        // Last write wins; the BTreeMap keeps output ordering canonical.
        self.fields.insert(tag, bytes);
    }

    pub fn field_u8(&mut self, tag: u16, v: u8) {
        self.field_bytes(tag, vec![v]);
    }

    pub fn field_bool(&mut self, tag: u16, v: bool) {
        self.field_u8(tag, v as u8);
    }

    pub fn field_u16(&mut self, tag: u16, v: u16) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn field_u32(&mut self, tag: u16, v: u32) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, v: u64) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&self.version.major.to_le_bytes());
        out.extend_from_slice(&self.version.minor.to_le_bytes());
        for (tag, bytes) in &self.fields {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        out
    }
}

#[derive(Debug)]
pub struct SnapshotReader {
    version: SnapshotVersion,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotReader {
    pub fn parse(bytes: &[u8], expected_id: [u8; 4]) -> SnapshotResult<Self> {
        if bytes.len() < 8 {
            return Err(SnapshotError::Truncated);
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[..4]);
        if id != expected_id {
            return Err(SnapshotError::WrongDevice {
                expected: expected_id,
                found: id,
            });
        }
        let major = u16::from_le_bytes([bytes[4], bytes[5]]);
        let minor = u16::from_le_bytes([bytes[6], bytes[7]]);

        let mut fields = BTreeMap::new();
        let mut rest = &bytes[8..];
        while !rest.is_empty() {
            if rest.len() < 6 {
                return Err(SnapshotError::Truncated);
            }
            let tag = u16::from_le_bytes([rest[0], rest[1]]);
            let len = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
            rest = &rest[6..];
            if rest.len() < len {
                return Err(SnapshotError::Truncated);
            }
            if fields.insert(tag, rest[..len].to_vec()).is_some() {
                return Err(SnapshotError::DuplicateTag(tag));
            }
            rest = &rest[len..];
        }

        Ok(Self {
            version: SnapshotVersion::new(major, minor),
            fields,
        })
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        if self.version.major > supported {
            return Err(SnapshotError::UnsupportedMajor {
                supported,
                found: self.version.major,
            });
        }
        Ok(())
    }

    pub fn bytes(&self, tag: u16) -> Option<&[u8]> {
        self.fields.get(&tag).map(Vec::as_slice)
    }

    fn fixed<const N: usize>(&self, tag: u16) -> SnapshotResult<Option<[u8; N]>> {
        match self.fields.get(&tag) {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; N] =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| SnapshotError::BadFieldLength {
                            tag,
                            len: bytes.len(),
                            expected: N,
                        })?;
                Ok(Some(arr))
            }
        }
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed::<1>(tag)?.map(|b| b[0]))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.u8(tag)? {
            None => Ok(None),
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::BadFieldValue { tag }),
        }
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self.fixed::<2>(tag)?.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self.fixed::<4>(tag)?.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed::<8>(tag)?.map(u64::from_le_bytes))
    }
}
