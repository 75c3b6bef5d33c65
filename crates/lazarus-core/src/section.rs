//! State snapshot capture and restore.
//!
//! The state section is an opaque byte blob to the runtime: it does not know
//! the types or identity of the variables the guest placed there. The only
//! compatibility check possible — and the only one made — is the shape
//! fingerprint: a snapshot is never restored into a region of a different
//! length, because any layout drift (a variable added, removed, or resized)
//! shifts every byte after it.

use crate::error::{Error, Result};
use crate::image::SectionRegion;

const SNAPSHOT_MAGIC: u32 = 0x4c5a_5354; // "LZST"
const HEADER_LEN: usize = 16;

/// Captured contents of a state region, prefixed with a fingerprint header:
/// magic, producing generation, payload length.
pub(crate) struct StateSnapshot {
    buf: Vec<u8>,
}

impl StateSnapshot {
    /// Copy the region's bytes out of the mapped image.
    pub fn capture(region: &SectionRegion, generation: u32) -> Self {
        let mut buf = Vec::with_capacity(HEADER_LEN + region.len);
        buf.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&generation.to_le_bytes());
        buf.extend_from_slice(&(region.len as u64).to_le_bytes());
        if !region.is_empty() {
            let bytes = unsafe { std::slice::from_raw_parts(region.base, region.len) };
            buf.extend_from_slice(bytes);
        }
        tracing::debug!("captured {} state bytes from generation {}", region.len, generation);
        Self { buf }
    }

    /// Generation that produced the snapshot.
    pub fn generation(&self) -> u32 {
        u32::from_le_bytes(self.buf[4..8].try_into().unwrap_or_default())
    }

    /// Re-tag the snapshot after a rollback hands it to an older generation.
    pub fn set_generation(&mut self, generation: u32) {
        self.buf[4..8].copy_from_slice(&generation.to_le_bytes());
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len() - HEADER_LEN
    }

    /// Whether the snapshot can be restored into `region`.
    pub fn fits(&self, region: &SectionRegion) -> bool {
        let header_len = u64::from_le_bytes(self.buf[8..16].try_into().unwrap_or_default());
        self.buf[0..4] == SNAPSHOT_MAGIC.to_le_bytes()
            && header_len as usize == self.len()
            && self.len() == region.len
    }

    /// Copy the snapshot over the region.
    ///
    /// Fails with `StateInvalidated` when the fingerprint does not match the
    /// region; the caller rolls back instead of corrupting the new image.
    pub fn restore(&self, region: &SectionRegion) -> Result<()> {
        if !self.fits(region) {
            return Err(Error::StateInvalidated(format!(
                "snapshot of generation {} holds {} bytes but the state section holds {}",
                self.generation(),
                self.len(),
                region.len
            )));
        }
        if !region.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.buf[HEADER_LEN..].as_ptr(),
                    region.base,
                    region.len,
                );
            }
        }
        tracing::debug!(
            "restored {} state bytes from generation {}",
            region.len,
            self.generation()
        );
        Ok(())
    }
}

impl std::fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSnapshot")
            .field("generation", &self.generation())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_of(buf: &mut [u8]) -> SectionRegion {
        SectionRegion {
            base: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    #[test]
    fn capture_then_restore_round_trips() {
        let mut source = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let snapshot = StateSnapshot::capture(&region_of(&mut source), 3);
        assert_eq!(snapshot.generation(), 3);
        assert_eq!(snapshot.len(), 8);

        let mut target = [0u8; 8];
        snapshot.restore(&region_of(&mut target)).unwrap();
        assert_eq!(target, source);
    }

    #[test]
    fn shape_mismatch_is_state_invalidated() {
        let mut source = [1u8, 2, 3, 4];
        let snapshot = StateSnapshot::capture(&region_of(&mut source), 1);

        let mut grown = [0u8; 8];
        let err = snapshot.restore(&region_of(&mut grown)).unwrap_err();
        assert!(matches!(err, Error::StateInvalidated(_)));
        assert_eq!(grown, [0u8; 8]);
    }

    #[test]
    fn empty_region_round_trips() {
        let snapshot = StateSnapshot::capture(&SectionRegion::empty(), 1);
        assert_eq!(snapshot.len(), 0);
        snapshot.restore(&SectionRegion::empty()).unwrap();
    }

    #[test]
    fn retagging_changes_generation_only() {
        let mut source = [9u8; 4];
        let mut snapshot = StateSnapshot::capture(&region_of(&mut source), 7);
        snapshot.set_generation(2);
        assert_eq!(snapshot.generation(), 2);

        let mut target = [0u8; 4];
        snapshot.restore(&region_of(&mut target)).unwrap();
        assert_eq!(target, source);
    }
}
