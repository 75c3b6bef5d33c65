//! Reload controller: the state machine that drives a plugin context.
//!
//! One [`Plugin`] owns one guest artifact and walks it through
//!
//! ```text
//! STABLE -> DETECTED -> UNLOADING -> UNLOADED -> MAPPING -> RESTORING -> LOADING -> STABLE'
//!                           |            |          |           |           |
//!                           +------------+----------+-----------+-----------+--> ROLLBACK
//! ```
//!
//! Every guest call is fault-wrapped; any fault or typed failure during the
//! transaction rolls back to the last working generation, whose staged copy
//! is kept on disk exactly for this. `next_version` never decrements, so the
//! attempted generations form a strictly increasing log.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use lazarus_abi::{FailureKind, GuestEntryFn, OpCode, PluginContext};

use crate::context::{OpenOptions, PluginInternal, SafetyMode};
use crate::error::{Error, Result};
use crate::fault;
use crate::image;
use crate::section::StateSnapshot;
use crate::stage::{self, LoadedImage};
use crate::watcher::ArtifactStamp;

/// Sentinel returned by [`Plugin::update`] when a step faulted.
pub const STEP_FAULT: i32 = -1;
/// Sentinel returned by [`Plugin::update`] when a load, unload, or reload
/// transaction failed.
pub const RELOAD_FAULT: i32 = -2;

/// Handle to one live-reloadable guest.
///
/// All calls must come from one thread; the fault recovery point is
/// thread-scoped and the runtime does no locking of its own beyond the
/// shared handler installation.
pub struct Plugin {
    ctx: Box<PluginContext>,
}

impl Plugin {
    /// Open `artifact` with default options and perform the initial load.
    pub fn open(artifact: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(artifact, OpenOptions::default())
    }

    /// Legacy alias of [`Plugin::open`] kept for hosts that predate the
    /// `open`/`update`/`close` naming.
    pub fn load_safe(artifact: impl AsRef<Path>) -> Result<Self> {
        Self::open(artifact)
    }

    /// Open `artifact` and perform the initial load.
    ///
    /// # Errors
    ///
    /// Fails when the artifact cannot be staged or mapped, does not export
    /// the entry point, or faults in its first `LOAD` call. The context
    /// never becomes live in that case.
    pub fn open_with(artifact: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let requested = artifact.as_ref();
        let artifact = requested.canonicalize().map_err(|e| {
            Error::BadImage(format!(
                "artifact {} is not readable: {}",
                requested.display(),
                e
            ))
        })?;
        let temp_dir = options
            .temp_dir
            .clone()
            .unwrap_or_else(|| artifact.parent().unwrap_or(Path::new(".")).to_path_buf());

        fault::install()?;

        let internal = Box::new(PluginInternal::new(artifact, temp_dir, options.mode));
        // Copies left behind by a crashed host are disposable by contract.
        stage::sweep_stale(&internal.artifact_path, &internal.temp_dir);

        let ctx = Box::new(PluginContext {
            internal: Box::into_raw(internal) as *mut c_void,
            userdata: std::ptr::null_mut(),
            version: 0,
            failure: FailureKind::None,
            next_version: 1,
            last_working_version: 0,
        });

        let mut plugin = Plugin { ctx };
        if let Err(err) = plugin.load_fresh() {
            tracing::error!("initial load failed: {}", err);
            plugin.close();
            plugin.ctx.failure = FailureKind::InitialFailure;
            return Err(err);
        }
        Ok(plugin)
    }

    /// Pump the guest once.
    ///
    /// Polls the artifact, runs a reload transaction when it changed, and
    /// calls the guest's `STEP`. Returns the guest's status on success,
    /// [`STEP_FAULT`] when the step faulted (the context rolled back), or
    /// [`RELOAD_FAULT`] when loading or unloading failed. Never panics or
    /// aborts the process for conditions the runtime handles; the failure
    /// classification stays readable via [`Plugin::failure`] until the next
    /// successful operation.
    pub fn update(&mut self) -> i32 {
        if self.ctx.internal.is_null() {
            return RELOAD_FAULT;
        }
        if self.internal().unrecoverable {
            return self.internal().last_code;
        }

        if self.internal().current.is_none() {
            // Nothing mapped (rollback floor, or an earlier load attempt
            // failed): try a fresh generation from whatever is on disk now.
            if let Err(err) = self.load_fresh() {
                tracing::warn!("load attempt failed: {}", err);
                if !self.internal().unrecoverable {
                    self.ctx.failure = err.failure_kind();
                }
                return RELOAD_FAULT;
            }
        } else if !self.internal().in_transaction {
            let stale = {
                let internal = self.internal();
                internal
                    .seen
                    .map(|stamp| stamp.is_stale(&internal.artifact_path))
                    .unwrap_or(true)
            };
            if stale {
                tracing::info!("artifact changed, starting reload transaction");
                if let Err(err) = self.reload() {
                    if !self.internal().unrecoverable {
                        self.ctx.failure = err.failure_kind();
                    }
                    return RELOAD_FAULT;
                }
            }
        }

        // Arm the rollback snapshot with the state right before this step.
        self.capture_pending();

        let Some(entry) = self.internal().current.as_ref().map(|image| image.entry) else {
            return RELOAD_FAULT;
        };
        match self.call_guarded(entry, OpCode::Step) {
            Ok(status) => {
                self.ctx.failure = FailureKind::None;
                status
            }
            Err(err) => {
                let kind = err.failure_kind();
                tracing::warn!("step of generation {} faulted: {:?}", self.ctx.version, kind);
                self.ctx.failure = kind;
                let dead = self.ctx.version;
                self.internal_mut().current = None;
                self.rollback(dead, true);
                STEP_FAULT
            }
        }
    }

    /// Close the context: terminal guest call, unmap, delete staged copies,
    /// zero the public fields. Also runs on drop.
    pub fn close(&mut self) {
        if self.ctx.internal.is_null() {
            return;
        }

        let entry = self.internal().current.as_ref().map(|image| image.entry);
        if let Some(entry) = entry
            && let Err(err) = self.call_guarded(entry, OpCode::Close)
        {
            tracing::warn!("guest close call failed: {}", err);
        }

        let internal_ptr = self.ctx.internal as *mut PluginInternal;
        self.ctx.internal = std::ptr::null_mut();
        let mut internal = unsafe { Box::from_raw(internal_ptr) };

        internal.current = None; // releases the module handle
        internal.previous_snapshot = None;
        internal.pending_snapshot = None;
        stage::remove_staged(
            &internal.artifact_path,
            &internal.temp_dir,
            self.ctx.next_version,
        );
        drop(internal);

        self.ctx.version = 0;
        self.ctx.next_version = 0;
        self.ctx.last_working_version = 0;
        self.ctx.failure = FailureKind::None;

        fault::uninstall();
    }

    /// Generation number of the currently live guest (1-based, 0 when none).
    pub fn version(&self) -> u32 {
        self.ctx.version
    }

    /// Generation number the next load attempt will be assigned.
    pub fn next_version(&self) -> u32 {
        self.ctx.next_version
    }

    /// Highest generation that went live.
    pub fn last_working_version(&self) -> u32 {
        self.ctx.last_working_version
    }

    /// Last failure classification, cleared by the next successful operation.
    pub fn failure(&self) -> FailureKind {
        self.ctx.failure
    }

    /// Opaque pointer handed to the guest on every call.
    pub fn userdata(&self) -> *mut c_void {
        self.ctx.userdata
    }

    /// Set the opaque pointer handed to the guest on every call.
    pub fn set_userdata(&mut self, userdata: *mut c_void) {
        self.ctx.userdata = userdata;
    }

    /// The raw context, as the guest sees it.
    pub fn context(&self) -> &PluginContext {
        &self.ctx
    }

    /// Whether the context has been closed.
    pub fn is_closed(&self) -> bool {
        self.ctx.internal.is_null()
    }

    fn internal(&self) -> &PluginInternal {
        unsafe { &*(self.ctx.internal as *const PluginInternal) }
    }

    fn internal_mut(&mut self) -> &mut PluginInternal {
        unsafe { &mut *(self.ctx.internal as *mut PluginInternal) }
    }

    fn paths(&self) -> (PathBuf, PathBuf, SafetyMode) {
        let internal = self.internal();
        (
            internal.artifact_path.clone(),
            internal.temp_dir.clone(),
            internal.mode,
        )
    }

    /// Stage and load a brand-new generation from the artifact on disk.
    ///
    /// Used for the initial load and for recovery once nothing is mapped.
    /// Saved state is carried in when its shape still fits.
    fn load_fresh(&mut self) -> Result<()> {
        let (artifact, temp_dir, mode) = self.paths();

        let generation = self.ctx.next_version;
        let staged = stage::stage(&artifact, &temp_dir, generation)?;
        self.ctx.next_version = generation + 1; // attempt number is consumed
        let image = stage::map(&staged, generation)?;

        {
            let internal = self.internal_mut();
            if internal.mode != SafetyMode::Disable
                && let Some(snapshot) = internal.previous_snapshot.take()
            {
                if snapshot.fits(&image.state_region) {
                    let _ = snapshot.restore(&image.state_region);
                    internal.previous_snapshot = Some(snapshot);
                } else {
                    tracing::warn!("discarding saved state: shape differs from the fresh image");
                }
            }
        }

        if mode == SafetyMode::Unsafe && self.internal().initial_ranges.is_empty() {
            match image::writable_data_ranges(&staged, image.base) {
                Ok(ranges) => self.internal_mut().initial_ranges = ranges,
                Err(err) => tracing::warn!("could not record writable ranges: {}", err),
            }
        }

        self.call_guarded(image.entry, OpCode::Load)?;

        let stamp = ArtifactStamp::of(&artifact).ok();
        {
            let internal = self.internal_mut();
            internal.current = Some(image);
            internal.seen = stamp;
        }
        let previous_working = self.ctx.last_working_version;
        self.internal_mut().prior_working_version = previous_working;
        self.ctx.last_working_version = generation;
        self.ctx.version = generation;
        self.ctx.failure = FailureKind::None;
        tracing::info!("generation {} live", generation);
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        self.internal_mut().in_transaction = true;
        let result = self.reload_transaction();
        self.internal_mut().in_transaction = false;
        result
    }

    /// The reload transaction: unload, capture, stage, map, restore, load.
    /// Any failure rolls back to the last working generation.
    fn reload_transaction(&mut self) -> Result<()> {
        let (artifact, temp_dir, mode) = self.paths();

        // The change is consumed now: a failed transaction does not retry
        // until the artifact is rebuilt again.
        if let Ok(stamp) = ArtifactStamp::of(&artifact) {
            self.internal_mut().seen = Some(stamp);
        }

        // Arm the rollback snapshot before the guest runs any unload code.
        self.capture_pending();

        let old_generation = self.ctx.version;
        let Some(old_entry) = self.internal().current.as_ref().map(|image| image.entry) else {
            return Ok(());
        };

        if let Err(err) = self.call_guarded(old_entry, OpCode::Unload) {
            tracing::warn!("unload of generation {} failed: {}", old_generation, err);
            self.ctx.failure = err.failure_kind();
            // No further code from the dead generation runs.
            self.internal_mut().current = None;
            self.rollback(old_generation, true);
            return Err(err);
        }

        // Capture the outgoing generation's final state.
        {
            let internal = self.internal_mut();
            if internal.mode != SafetyMode::Disable
                && let Some(region) = internal.current.as_ref().map(|image| image.state_region)
            {
                internal.previous_snapshot =
                    Some(StateSnapshot::capture(&region, old_generation));
            }
        }

        let generation = self.ctx.next_version;
        let staged = match stage::stage(&artifact, &temp_dir, generation) {
            Ok(staged) => {
                self.ctx.next_version = generation + 1;
                staged
            }
            Err(err) => {
                self.ctx.failure = err.failure_kind();
                self.recover_in_place();
                return Err(err);
            }
        };

        let new_image = match stage::map(&staged, generation) {
            Ok(image) => image,
            Err(err) => {
                self.ctx.failure = err.failure_kind();
                self.recover_in_place();
                return Err(err);
            }
        };

        // Restore into the new image before its load hook runs.
        if mode != SafetyMode::Disable {
            let restored = self
                .internal()
                .previous_snapshot
                .as_ref()
                .map(|snapshot| snapshot.restore(&new_image.state_region))
                .unwrap_or(Ok(()));
            if let Err(err) = restored {
                tracing::warn!("generation {} rejected: {}", generation, err);
                self.ctx.failure = err.failure_kind();
                drop(new_image);
                self.recover_in_place();
                return Err(err);
            }
            if mode == SafetyMode::Unsafe {
                self.unsafe_transfer(&new_image);
            }
        }

        // Replace the mapping; the old handle is released exactly once, here.
        self.internal_mut().current = None;

        if let Err(err) = self.call_guarded(new_image.entry, OpCode::Load) {
            tracing::warn!("load of generation {} failed: {}", generation, err);
            self.ctx.failure = err.failure_kind();
            drop(new_image);
            self.rollback(generation, false);
            return Err(err);
        }

        {
            let internal = self.internal_mut();
            internal.current = Some(new_image);
            internal.pending_snapshot = None;
        }
        let previous_working = self.ctx.last_working_version;
        self.internal_mut().prior_working_version = previous_working;
        self.ctx.last_working_version = generation;
        self.ctx.version = generation;
        self.ctx.failure = FailureKind::None;
        tracing::info!("generation {} live (was {})", generation, old_generation);
        Ok(())
    }

    /// A transaction failed after the old generation unloaded cleanly but
    /// while it was still mapped: put its state back and re-run its load
    /// hook instead of remapping from disk.
    fn recover_in_place(&mut self) {
        let Some((entry, region)) = self
            .internal()
            .current
            .as_ref()
            .map(|image| (image.entry, image.state_region))
        else {
            return;
        };

        {
            let internal = self.internal_mut();
            if internal.mode != SafetyMode::Disable
                && let Some(snapshot) = internal.previous_snapshot.as_ref()
            {
                let _ = snapshot.restore(&region);
            }
        }

        if let Err(err) = self.call_guarded(entry, OpCode::Load) {
            self.mark_unrecoverable(err.failure_kind());
        }
    }

    /// Return to the last working generation after `dead_generation` failed.
    ///
    /// `use_pending` selects the snapshot captured at the top of this pump
    /// (step and unload faults) over the one captured at the last clean
    /// unload (failures after it).
    fn rollback(&mut self, dead_generation: u32, use_pending: bool) {
        let (artifact, temp_dir, _) = self.paths();

        let target = if dead_generation == self.ctx.last_working_version {
            // The working generation itself died; fall back one more level.
            let prior = self.internal().prior_working_version;
            self.internal_mut().prior_working_version = 0;
            prior
        } else {
            self.ctx.last_working_version
        };

        self.internal_mut().current = None;

        if target == 0 {
            self.ctx.version = 0;
            self.ctx.last_working_version = 0;
            tracing::warn!("rollback floor: no earlier generation to return to");
            return;
        }

        tracing::warn!(
            "rolling back from generation {} to {}",
            dead_generation,
            target
        );
        let staged = stage::staged_path(&artifact, &temp_dir, target);
        let image = match stage::map(&staged, target) {
            Ok(image) => image,
            Err(err) => {
                tracing::error!("rollback remap failed: {}", err);
                self.mark_unrecoverable(err.failure_kind());
                return;
            }
        };

        {
            let internal = self.internal_mut();
            if internal.mode != SafetyMode::Disable {
                let snapshot = if use_pending {
                    internal.pending_snapshot.take()
                } else {
                    internal.previous_snapshot.take()
                };
                if let Some(mut snapshot) = snapshot {
                    if snapshot.fits(&image.state_region) {
                        let _ = snapshot.restore(&image.state_region);
                        snapshot.set_generation(target);
                        internal.previous_snapshot = Some(snapshot);
                    } else {
                        tracing::warn!(
                            "discarding snapshot: shape differs from generation {}",
                            target
                        );
                    }
                }
            }
        }

        if let Err(err) = self.call_guarded(image.entry, OpCode::Load) {
            tracing::error!("rollback load failed: {}", err);
            self.mark_unrecoverable(err.failure_kind());
            return;
        }

        self.internal_mut().current = Some(image);
        self.ctx.version = target;
        self.ctx.last_working_version = target;
    }

    fn mark_unrecoverable(&mut self, kind: FailureKind) {
        tracing::error!("context unrecoverable after failed rollback: {:?}", kind);
        self.ctx.failure = kind;
        let internal = self.internal_mut();
        internal.current = None;
        internal.unrecoverable = true;
        internal.last_code = RELOAD_FAULT;
    }

    fn capture_pending(&mut self) {
        let version = self.ctx.version;
        let internal = self.internal_mut();
        if internal.mode == SafetyMode::Disable {
            return;
        }
        internal.pending_snapshot = internal
            .current
            .as_ref()
            .map(|image| StateSnapshot::capture(&image.state_region, version));
    }

    /// Copy matching writable data ranges from the old image into the new
    /// one. Best effort: ranges that drifted are skipped.
    fn unsafe_transfer(&self, new_image: &LoadedImage) {
        let internal = self.internal();
        let Some(old_image) = internal.current.as_ref() else {
            return;
        };

        let new_ranges = match image::writable_data_ranges(&new_image.staged_path, new_image.base)
        {
            Ok(ranges) => ranges,
            Err(err) => {
                tracing::warn!("skipping unsafe transfer: {}", err);
                return;
            }
        };
        let old_ranges = match image::writable_data_ranges(&old_image.staged_path, old_image.base)
        {
            Ok(ranges) => ranges,
            Err(err) => {
                tracing::warn!("skipping unsafe transfer: {}", err);
                return;
            }
        };

        for range in &internal.initial_ranges {
            if new_ranges.contains(range) && old_ranges.contains(range) {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        old_image.base.add(range.offset),
                        new_image.base.add(range.offset),
                        range.len,
                    );
                }
                tracing::debug!(
                    "unsafe transfer: {} bytes at offset {:#x}",
                    range.len,
                    range.offset
                );
            } else {
                tracing::debug!("unsafe transfer skipped drifted range at {:#x}", range.offset);
            }
        }
    }

    fn call_guarded(&mut self, entry: GuestEntryFn, op: OpCode) -> Result<i32> {
        let ctx_ptr: *mut PluginContext = &mut *self.ctx;
        match unsafe { fault::protected_call(entry, ctx_ptr, op) } {
            Ok(status) if matches!(op, OpCode::Load | OpCode::Unload) && status != 0 => {
                Err(Error::GuestRejected(op, status))
            }
            Ok(status) => Ok(status),
            Err(kind) => Err(Error::GuestFault(kind)),
        }
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("version", &self.ctx.version)
            .field("next_version", &self.ctx.next_version)
            .field("failure", &self.ctx.failure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_artifact_is_bad_image() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = Plugin::open(temp.path().join("libnothing.so")).unwrap_err();
        assert!(matches!(err, Error::BadImage(_)));
    }

    #[test]
    fn open_non_module_artifact_fails_without_panicking() {
        let temp = tempfile::TempDir::new().unwrap();
        let artifact = temp.path().join("libtext.so");
        std::fs::write(&artifact, b"not a shared object").unwrap();

        assert!(Plugin::open(&artifact).is_err());
        // The failed open must not leave staged copies around.
        assert!(!temp.path().join("libtext1.so").exists());
    }

    #[test]
    fn sentinels_are_distinct() {
        assert_ne!(STEP_FAULT, RELOAD_FAULT);
        assert!(STEP_FAULT < 0 && RELOAD_FAULT < 0);
    }
}
