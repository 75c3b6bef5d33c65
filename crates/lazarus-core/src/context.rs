//! Host-side data model backing a plugin context.

use std::path::PathBuf;

use crate::image::DataRange;
use crate::section::StateSnapshot;
use crate::stage::LoadedImage;
use crate::watcher::ArtifactStamp;

/// What the runtime transfers between generations beyond nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyMode {
    /// Only the declared state section is carried across reloads.
    #[default]
    Safe,
    /// Additionally copy the writable data ranges recorded from the initial
    /// image into each new image when their layout lines up. Best effort:
    /// preserves undeclared statics at the cost of correctness when the
    /// layouts only happen to match.
    Unsafe,
    /// No cross-generation transfer at all; a reload is a fresh load.
    Disable,
}

/// Options for opening a plugin context.
///
/// ```no_run
/// use lazarus_core::{OpenOptions, Plugin, SafetyMode};
///
/// let plugin = Plugin::open_with(
///     "target/debug/libguest.so",
///     OpenOptions::default().mode(SafetyMode::Safe),
/// )?;
/// # Ok::<(), lazarus_core::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub(crate) mode: SafetyMode,
    pub(crate) temp_dir: Option<PathBuf>,
}

impl OpenOptions {
    /// Select the safety mode. Constant for the life of the context.
    pub fn mode(mut self, mode: SafetyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Stage per-generation copies in `dir` instead of the artifact's own
    /// directory.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }
}

/// Private state of one plugin context.
///
/// Owned by the public context through its `internal` pointer; the reload
/// controller is the only code that touches it.
pub(crate) struct PluginInternal {
    /// Artifact the host asked for. Never loaded directly.
    pub artifact_path: PathBuf,
    /// Where staged copies live.
    pub temp_dir: PathBuf,
    pub mode: SafetyMode,
    /// The mapped generation, if any.
    pub current: Option<LoadedImage>,
    /// State captured at the most recent successful unload.
    pub previous_snapshot: Option<StateSnapshot>,
    /// State captured at the top of the current pump, for step rollback.
    pub pending_snapshot: Option<StateSnapshot>,
    /// Artifact metadata observed when the live generation was staged.
    pub seen: Option<ArtifactStamp>,
    /// Working generation one behind `last_working_version`, so a generation
    /// that dies in its own unload can roll back past itself.
    pub prior_working_version: u32,
    /// Writable data ranges of the initial image (unsafe mode only).
    pub initial_ranges: Vec<DataRange>,
    /// Set while a reload transaction is running; change polling is ignored
    /// until the transaction finishes.
    pub in_transaction: bool,
    /// A rollback itself failed; every further update is a no-op.
    pub unrecoverable: bool,
    /// Value `update` returns once the context is unrecoverable.
    pub last_code: i32,
}

impl PluginInternal {
    pub fn new(artifact_path: PathBuf, temp_dir: PathBuf, mode: SafetyMode) -> Self {
        Self {
            artifact_path,
            temp_dir,
            mode,
            current: None,
            previous_snapshot: None,
            pending_snapshot: None,
            seen: None,
            prior_working_version: 0,
            initial_ranges: Vec::new(),
            in_transaction: false,
            unrecoverable: false,
            last_code: 0,
        }
    }
}
