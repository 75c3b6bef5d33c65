//! Shared ABI between a lazarus host and its reloadable guests.
//!
//! A guest is an ordinary `cdylib` that exports one entry point:
//!
//! ```c
//! int cr_main(PluginContext *ctx, OpCode op);
//! ```
//!
//! The host calls it with [`OpCode::Load`] after mapping a new generation,
//! [`OpCode::Step`] on every pump, [`OpCode::Unload`] before replacing the
//! generation, and [`OpCode::Close`] on teardown. Statics the guest wants
//! carried across reloads are declared with [`persistent!`], which places
//! them in the well-known `cr_state` section.
//!
//! This crate is dependency-free so guests pay nothing for linking it.

#![cfg_attr(not(test), no_std)]

use core::ffi::c_void;

/// Symbol name of the guest entry point.
pub const ENTRY_SYMBOL: &str = "cr_main";

/// Name of the section holding guest state that survives reloads.
///
/// On Mach-O the section lives in the `__DATA` segment under the same name.
pub const STATE_SECTION: &str = "cr_state";

/// Operation the host is asking the guest to perform.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// A new generation was mapped and its state restored.
    Load = 0,
    /// One pump of the host loop.
    Step = 1,
    /// The current generation is about to be replaced.
    Unload = 2,
    /// The context is being closed for good.
    Close = 3,
}

/// Classification of the last failure observed on a context.
///
/// `Segfault` through `OtherException` are produced by the fault isolator;
/// `StateInvalidated`, `BadImage`, `InitialFailure`, and `User` are typed
/// failures of the reload transaction itself.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureKind {
    /// No failure recorded.
    #[default]
    None = 0,
    /// Invalid memory access.
    Segfault = 1,
    /// Illegal instruction.
    IllegalOp = 2,
    /// Arithmetic fault (divide by zero and friends).
    Arithmetic = 3,
    /// The guest aborted.
    Abort = 4,
    /// Misaligned access.
    Misalign = 5,
    /// The saved state no longer fits the new image's state section.
    StateInvalidated = 6,
    /// The artifact could not be staged, mapped, or resolved.
    BadImage = 7,
    /// The very first load failed; the context never became live.
    InitialFailure = 8,
    /// A fault the isolator could not classify further.
    OtherException = 9,
    /// The guest rejected a `Load`/`Unload` with a non-zero status.
    User = 10,
}

/// The context a host hands to the guest on every call.
///
/// Field order and types are the wire contract; the host allocates and owns
/// the struct, the guest only reads it (and may stash a pointer of its own
/// in `userdata` via the host).
#[repr(C)]
#[derive(Debug)]
pub struct PluginContext {
    /// Host-private state. Null once the context is closed.
    pub internal: *mut c_void,
    /// Opaque host pointer passed through untouched.
    pub userdata: *mut c_void,
    /// Generation number of the currently live guest (1-based).
    pub version: u32,
    /// Last failure classification, or [`FailureKind::None`].
    pub failure: FailureKind,
    /// Generation number the next successful load will be assigned.
    pub next_version: u32,
    /// Highest generation that completed a load and was pumped.
    pub last_working_version: u32,
}

/// Signature of the exported guest entry point.
pub type GuestEntryFn = unsafe extern "C" fn(*mut PluginContext, OpCode) -> i32;

/// Declare one or more statics that survive reloads.
///
/// Expands to `static mut` items placed in the `cr_state` section, so the
/// runtime can capture their bytes on unload and restore them into the next
/// generation. Layout is the contract: adding, removing, or reordering
/// persistent statics between generations changes the section shape and the
/// reload fails with `StateInvalidated` instead of corrupting state.
///
/// ```ignore
/// lazarus_abi::persistent! {
///     static mut FRAME_COUNT: u64 = 0;
///     static mut PAUSED: bool = false;
/// }
/// ```
#[macro_export]
macro_rules! persistent {
    ($($(#[$meta:meta])* $vis:vis static mut $name:ident : $ty:ty = $init:expr;)+) => {
        $(
            $(#[$meta])*
            #[used]
            #[cfg_attr(target_os = "macos", unsafe(link_section = "__DATA,cr_state"))]
            #[cfg_attr(not(target_os = "macos"), unsafe(link_section = "cr_state"))]
            $vis static mut $name: $ty = $init;
        )+
    };
}
