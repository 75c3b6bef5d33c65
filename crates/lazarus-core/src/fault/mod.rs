//! Fault isolation around guest calls.
//!
//! Every call into guest code is bracketed by a recovery point so a
//! synchronous CPU exception (invalid access, illegal instruction, divide by
//! zero, abort, stack overflow) turns into a [`FailureKind`] value instead of
//! killing the host. The guarantees:
//!
//! 1. a faulting guest call returns control to the runtime,
//! 2. the fault is classified,
//! 3. no further code from the faulting generation runs after the return,
//! 4. handlers stay armed for future calls.
//!
//! What is *not* guaranteed: heap consistency after the guest scribbled over
//! allocator structures. That failure mode is diagnosable, not recoverable.
//!
//! Handler installation is process-global and reference-counted, so multiple
//! contexts share one installation and closing one context does not disarm
//! the handlers another still needs. The recovery point itself is
//! thread-scoped.
//!
//! [`FailureKind`]: lazarus_abi::FailureKind

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub(crate) use posix::{install, protected_call, uninstall};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::{install, protected_call, uninstall};
