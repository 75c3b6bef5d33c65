//! Versioned artifact staging and module mapping.
//!
//! The original artifact is never loaded. Every generation gets its own
//! on-disk copy (`libguest.so` → `libguest7.so`) and the copy is what gets
//! mapped, so the user can rebuild the original while an earlier generation
//! is still loaded — some platforms hold an exclusive lock on mapped files.

use std::fs;
use std::path::{Path, PathBuf};

use lazarus_abi::GuestEntryFn;
use libloading::Library;

use crate::error::{Error, Result};
use crate::image::{self, SectionRegion};

/// One mapped generation of the guest.
///
/// Owns the OS module handle through `library`; dropping the image releases
/// the handle exactly once. `entry` is only valid while `library` is alive.
pub(crate) struct LoadedImage {
    pub staged_path: PathBuf,
    pub generation: u32,
    pub library: Library,
    pub entry: GuestEntryFn,
    pub base: *mut u8,
    pub state_region: SectionRegion,
}

impl std::fmt::Debug for LoadedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedImage")
            .field("staged_path", &self.staged_path)
            .field("generation", &self.generation)
            .field("state_len", &self.state_region.len)
            .finish()
    }
}

/// Per-generation path: artifact stem + generation number + extension, in
/// the staging directory.
pub(crate) fn staged_path(artifact: &Path, temp_dir: &Path, generation: u32) -> PathBuf {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match artifact.extension() {
        Some(ext) => format!("{}{}.{}", stem, generation, ext.to_string_lossy()),
        None => format!("{}{}", stem, generation),
    };
    temp_dir.join(name)
}

/// Copy the artifact (and any debug sidecar) to its per-generation path.
pub(crate) fn stage(artifact: &Path, temp_dir: &Path, generation: u32) -> Result<PathBuf> {
    let staged = staged_path(artifact, temp_dir, generation);
    fs::copy(artifact, &staged).map_err(|e| {
        Error::BadImage(format!(
            "failed to stage {} as {}: {}",
            artifact.display(),
            staged.display(),
            e
        ))
    })?;
    tracing::debug!(
        "staged generation {}: {} -> {}",
        generation,
        artifact.display(),
        staged.display()
    );

    // Debug sidecars keep debuggers attached across reloads.
    let sidecar = artifact.with_extension("pdb");
    if sidecar.exists() {
        let _ = fs::copy(&sidecar, staged.with_extension("pdb"));
    }

    Ok(staged)
}

/// Map a staged copy and resolve the guest entry point and state section.
pub(crate) fn map(staged: &Path, generation: u32) -> Result<LoadedImage> {
    // Library::new runs module initializers, matching a plain dlopen.
    let library = unsafe { Library::new(staged) }?;
    let entry: GuestEntryFn = unsafe {
        *library
            .get::<GuestEntryFn>(lazarus_abi::ENTRY_SYMBOL.as_bytes())
            .map_err(|e| {
                Error::BadImage(format!(
                    "{} does not export {}: {}",
                    staged.display(),
                    lazarus_abi::ENTRY_SYMBOL,
                    e
                ))
            })?
    };

    let base = image::module_base(entry as usize)?;
    let state_region = image::state_section(staged, base)?;
    if state_region.is_empty() {
        tracing::debug!(
            "generation {} declares no state section, transfer is a no-op",
            generation
        );
    } else {
        tracing::debug!(
            "generation {} state section: {} bytes",
            generation,
            state_region.len
        );
    }

    Ok(LoadedImage {
        staged_path: staged.to_path_buf(),
        generation,
        library,
        entry,
        base,
        state_region,
    })
}

/// Delete the staged copies for generations `1..up_to` of this artifact.
pub(crate) fn remove_staged(artifact: &Path, temp_dir: &Path, up_to: u32) {
    for generation in 1..up_to {
        let staged = staged_path(artifact, temp_dir, generation);
        let _ = fs::remove_file(staged.with_extension("pdb"));
        let _ = fs::remove_file(staged);
    }
}

/// Remove leftover staged copies of `artifact` from a previous (possibly
/// crashed) host run. Staged files are disposable by contract.
pub(crate) fn sweep_stale(artifact: &Path, temp_dir: &Path) -> usize {
    let Some(stem) = artifact.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        return 0;
    };
    let suffix = artifact
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let Ok(entries) = fs::read_dir(temp_dir) else {
        return 0;
    };

    let mut swept = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(middle) = name
            .strip_prefix(&stem)
            .and_then(|rest| rest.strip_suffix(&suffix))
        else {
            continue;
        };
        if !middle.is_empty()
            && middle.bytes().all(|b| b.is_ascii_digit())
            && fs::remove_file(entry.path()).is_ok()
        {
            swept += 1;
        }
    }
    if swept > 0 {
        tracing::info!("swept {} stale staged copies of {}", swept, artifact.display());
    }
    swept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn staged_path_appends_generation_before_extension() {
        let staged = staged_path(Path::new("/p/libguest.so"), Path::new("/p"), 3);
        assert_eq!(staged, PathBuf::from("/p/libguest3.so"));

        let bare = staged_path(Path::new("/p/guest"), Path::new("/tmp/stage"), 12);
        assert_eq!(bare, PathBuf::from("/tmp/stage/guest12"));
    }

    #[test]
    fn stage_copies_bytes() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("libguest.so");
        fs::write(&artifact, b"image bytes").unwrap();

        let staged = stage(&artifact, temp.path(), 1).unwrap();
        assert_eq!(staged, temp.path().join("libguest1.so"));
        assert_eq!(fs::read(&staged).unwrap(), b"image bytes");
    }

    #[test]
    fn stage_missing_artifact_is_bad_image() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("libguest.so");
        assert!(matches!(
            stage(&artifact, temp.path(), 1),
            Err(Error::BadImage(_))
        ));
    }

    #[test]
    fn sweep_removes_only_generation_copies() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("libguest.so");
        fs::write(&artifact, b"original").unwrap();
        fs::write(temp.path().join("libguest1.so"), b"gen 1").unwrap();
        fs::write(temp.path().join("libguest17.so"), b"gen 17").unwrap();
        fs::write(temp.path().join("libguestX.so"), b"not a generation").unwrap();
        fs::write(temp.path().join("libother2.so"), b"different artifact").unwrap();

        assert_eq!(sweep_stale(&artifact, temp.path()), 2);

        assert!(artifact.exists());
        assert!(!temp.path().join("libguest1.so").exists());
        assert!(!temp.path().join("libguest17.so").exists());
        assert!(temp.path().join("libguestX.so").exists());
        assert!(temp.path().join("libother2.so").exists());
    }

    #[test]
    fn remove_staged_deletes_up_to_generation() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("libguest.so");
        for generation in 1..4 {
            let staged = staged_path(&artifact, temp.path(), generation);
            fs::write(&staged, b"copy").unwrap();
        }

        remove_staged(&artifact, temp.path(), 4);
        for generation in 1..4 {
            assert!(!staged_path(&artifact, temp.path(), generation).exists());
        }
    }
}
