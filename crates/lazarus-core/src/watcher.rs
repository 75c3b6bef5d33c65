//! Artifact freshness detection.
//!
//! Freshness is last-write-time plus size, polled synchronously; that avoids
//! reading the artifact and needs no watcher thread. A spurious duplicate
//! detection is harmless because reloading an identical image is idempotent.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::error::Result;

/// Metadata observed on an artifact at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactStamp {
    /// Last-write time.
    pub modified: SystemTime,
    /// File size in bytes.
    pub len: u64,
}

impl ArtifactStamp {
    /// Read the current stamp of `path`.
    pub fn of(path: impl AsRef<Path>) -> Result<Self> {
        let meta = fs::metadata(path.as_ref())?;
        Ok(Self {
            modified: meta.modified()?,
            len: meta.len(),
        })
    }

    /// Whether the artifact at `path` differs from this stamp.
    ///
    /// An unreadable artifact (mid-rewrite, or deleted) reports unchanged;
    /// the next poll will see the finished write.
    pub fn is_stale(&self, path: impl AsRef<Path>) -> bool {
        match Self::of(path) {
            Ok(current) => current != *self,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn stamp_reflects_rewrite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("guest.so");
        fs::write(&path, b"generation one").unwrap();

        let stamp = ArtifactStamp::of(&path).unwrap();
        assert!(!stamp.is_stale(&path));

        fs::write(&path, b"generation two, longer").unwrap();
        assert!(stamp.is_stale(&path));
    }

    #[test]
    fn missing_artifact_reports_unchanged() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("guest.so");
        fs::write(&path, b"bytes").unwrap();
        let stamp = ArtifactStamp::of(&path).unwrap();

        fs::remove_file(&path).unwrap();
        assert!(!stamp.is_stale(&path));
    }

    #[test]
    fn stamp_of_missing_file_errors() {
        let temp = TempDir::new().unwrap();
        assert!(ArtifactStamp::of(temp.path().join("nope.so")).is_err());
    }
}
