//! Live-code-reloading runtime for native shared libraries.
//!
//! A long-running host links this crate, opens a [`Plugin`] on a guest
//! cdylib, and pumps [`Plugin::update`] from its main loop. The runtime:
//!
//! - detects that the artifact was rebuilt (last-write time + size),
//! - stages each generation as its own on-disk copy so the original can be
//!   rewritten while an older generation is still mapped,
//! - carries the guest's declared state section across generations,
//! - wraps every guest call in a fault isolator and rolls back to the last
//!   working generation when the guest crashes.
//!
//! # Architecture
//!
//! ```text
//! Plugin (reload controller)
//!     |
//!     +-- watcher   : artifact freshness polling
//!     +-- stage     : per-generation copies, mapping, entry resolution
//!     |       +-- image : platform section-table walkers
//!     +-- section   : state snapshot capture/restore
//!     +-- fault     : signal/exception handlers around guest calls
//! ```
//!
//! The guest side of the contract lives in `lazarus-abi`: one exported
//! `cr_main` entry point and statics declared into the `cr_state` section.
//!
//! # Example
//!
//! ```no_run
//! use lazarus_core::Plugin;
//!
//! let mut plugin = Plugin::open("target/debug/libguest.so")?;
//! while plugin.update() >= 0 {
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! eprintln!("guest asked to stop, or failed: {:?}", plugin.failure());
//! # Ok::<(), lazarus_core::Error>(())
//! ```

pub mod context;
pub mod error;
mod fault;
mod image;
pub mod reload;
mod section;
mod stage;
pub mod watcher;

pub use context::{OpenOptions, SafetyMode};
pub use error::{Error, Result};
pub use lazarus_abi::{FailureKind, GuestEntryFn, OpCode, PluginContext};
pub use reload::{Plugin, RELOAD_FAULT, STEP_FAULT};
pub use watcher::ArtifactStamp;
