//! POSIX fault isolation: signal handlers plus non-local return.
//!
//! Before each guest call a recovery point is recorded with `sigsetjmp`; the
//! signal handler classifies the fault and `siglongjmp`s back to it, which
//! makes the guarded call return an error. Handlers run on an alternate
//! stack so a guest stack overflow can still be caught.
//!
//! glibc only exports the dunder spelling of `sigsetjmp`, hence the
//! `link_name` below; musl and the BSDs export the plain name.

use std::cell::Cell;
use std::sync::Mutex;

use lazarus_abi::{FailureKind, GuestEntryFn, OpCode, PluginContext};

use crate::error::{Error, Result};

const GUARDED_SIGNALS: [libc::c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
];

const ALT_STACK_SIZE: usize = 64 * 1024;

/// Opaque storage for a `sigjmp_buf`. Oversized relative to every supported
/// libc so the FFI below never writes out of bounds.
#[repr(C, align(16))]
struct JmpBuf([u8; 512]);

unsafe extern "C" {
    #[cfg_attr(target_env = "gnu", link_name = "__sigsetjmp")]
    fn sigsetjmp(env: *mut JmpBuf, savemask: libc::c_int) -> libc::c_int;
    fn siglongjmp(env: *mut JmpBuf, val: libc::c_int) -> !;
}

thread_local! {
    /// Recovery point for the guest call currently running on this thread.
    static ACTIVE_ENV: Cell<*mut JmpBuf> = const { Cell::new(std::ptr::null_mut()) };
    /// Signal number recorded by the handler before jumping back.
    static FAULT_SIGNAL: Cell<libc::c_int> = const { Cell::new(0) };
}

struct Installation {
    count: usize,
    saved: [libc::sigaction; GUARDED_SIGNALS.len()],
    stack: *mut libc::c_void,
}

// The saved sigactions and the stack pointer are only touched under the lock.
unsafe impl Send for Installation {}

static INSTALLATION: Mutex<Option<Installation>> = Mutex::new(None);

/// Install the fault handlers, or bump the reference count if another
/// context already did.
pub(crate) fn install() -> Result<()> {
    let mut guard = INSTALLATION.lock().unwrap();
    if let Some(installation) = guard.as_mut() {
        installation.count += 1;
        return Ok(());
    }

    let stack = unsafe { libc::malloc(ALT_STACK_SIZE) };
    if stack.is_null() {
        return Err(Error::Handler(
            "failed to allocate the alternate signal stack".to_string(),
        ));
    }
    let alt = libc::stack_t {
        ss_sp: stack,
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE,
    };
    if unsafe { libc::sigaltstack(&alt, std::ptr::null_mut()) } != 0 {
        unsafe { libc::free(stack) };
        return Err(Error::Handler(format!(
            "sigaltstack failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut saved: [libc::sigaction; GUARDED_SIGNALS.len()] = unsafe { std::mem::zeroed() };
    for (index, signal) in GUARDED_SIGNALS.iter().enumerate() {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };

        if unsafe { libc::sigaction(*signal, &action, &mut saved[index]) } != 0 {
            let err = std::io::Error::last_os_error();
            for (signal, previous) in GUARDED_SIGNALS.iter().zip(saved.iter()).take(index) {
                unsafe { libc::sigaction(*signal, previous, std::ptr::null_mut()) };
            }
            unsafe { libc::free(stack) };
            return Err(Error::Handler(format!("sigaction failed: {}", err)));
        }
    }

    *guard = Some(Installation {
        count: 1,
        saved,
        stack,
    });
    tracing::debug!("fault handlers installed");
    Ok(())
}

/// Drop one reference; the last one restores the previous dispositions.
pub(crate) fn uninstall() {
    let mut guard = INSTALLATION.lock().unwrap();
    let Some(installation) = guard.as_mut() else {
        return;
    };
    installation.count -= 1;
    if installation.count > 0 {
        return;
    }

    let installation = guard.take().expect("checked above");
    for (signal, previous) in GUARDED_SIGNALS.iter().zip(installation.saved.iter()) {
        unsafe { libc::sigaction(*signal, previous, std::ptr::null_mut()) };
    }
    let disable = libc::stack_t {
        ss_sp: std::ptr::null_mut(),
        ss_flags: libc::SS_DISABLE,
        ss_size: ALT_STACK_SIZE,
    };
    unsafe {
        libc::sigaltstack(&disable, std::ptr::null_mut());
        libc::free(installation.stack);
    }
    tracing::debug!("fault handlers removed");
}

/// Call the guest entry point with a recovery point armed.
///
/// # Safety
///
/// `entry` must be the entry point of a currently mapped image and `ctx`
/// must point at the live context that owns it.
#[inline(never)]
pub(crate) unsafe fn protected_call(
    entry: GuestEntryFn,
    ctx: *mut PluginContext,
    op: OpCode,
) -> std::result::Result<i32, FailureKind> {
    let mut env = JmpBuf([0; 512]);
    let env_ptr: *mut JmpBuf = &mut env;
    let previous = ACTIVE_ENV.with(|cell| cell.replace(env_ptr));

    let outcome = if unsafe { sigsetjmp(env_ptr, 1) } == 0 {
        Ok(unsafe { entry(ctx, op) })
    } else {
        Err(classify(FAULT_SIGNAL.with(|cell| cell.get())))
    };

    ACTIVE_ENV.with(|cell| cell.set(previous));
    outcome
}

fn classify(signal: libc::c_int) -> FailureKind {
    match signal {
        libc::SIGSEGV => FailureKind::Segfault,
        libc::SIGILL => FailureKind::IllegalOp,
        libc::SIGFPE => FailureKind::Arithmetic,
        libc::SIGABRT => FailureKind::Abort,
        libc::SIGBUS => FailureKind::Misalign,
        _ => FailureKind::OtherException,
    }
}

extern "C" fn fault_handler(
    signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let env = ACTIVE_ENV.with(|cell| cell.get());
    if env.is_null() {
        // Fault outside any guarded call. Not ours: restore the default
        // disposition and let the re-raised signal take its course.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(signal, &action, std::ptr::null_mut());
        }
        return;
    }

    FAULT_SIGNAL.with(|cell| cell.set(signal));
    // Disarm before jumping so nothing re-enters this recovery point.
    ACTIVE_ENV.with(|cell| cell.set(std::ptr::null_mut()));
    unsafe { siglongjmp(env, 1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn well_behaved(_ctx: *mut PluginContext, _op: OpCode) -> i32 {
        42
    }

    unsafe extern "C" fn null_write(_ctx: *mut PluginContext, _op: OpCode) -> i32 {
        unsafe { std::ptr::null_mut::<i32>().write_volatile(1) };
        0
    }

    #[test]
    fn guarded_call_passes_through_return_values() {
        install().unwrap();
        let outcome =
            unsafe { protected_call(well_behaved, std::ptr::null_mut(), OpCode::Step) };
        assert_eq!(outcome, Ok(42));
        uninstall();
    }

    #[test]
    fn segfault_becomes_a_value_and_handlers_stay_armed() {
        install().unwrap();

        let faulted = unsafe { protected_call(null_write, std::ptr::null_mut(), OpCode::Step) };
        assert_eq!(faulted, Err(FailureKind::Segfault));

        // A later call on the same thread must still be protected.
        let faulted = unsafe { protected_call(null_write, std::ptr::null_mut(), OpCode::Step) };
        assert_eq!(faulted, Err(FailureKind::Segfault));

        let fine = unsafe { protected_call(well_behaved, std::ptr::null_mut(), OpCode::Step) };
        assert_eq!(fine, Ok(42));

        uninstall();
    }

    #[test]
    fn installation_is_reference_counted() {
        install().unwrap();
        install().unwrap();
        uninstall();

        // Still installed for the first reference.
        let faulted = unsafe { protected_call(null_write, std::ptr::null_mut(), OpCode::Step) };
        assert_eq!(faulted, Err(FailureKind::Segfault));

        uninstall();
    }

    #[test]
    fn classification_covers_the_guarded_set() {
        assert_eq!(classify(libc::SIGSEGV), FailureKind::Segfault);
        assert_eq!(classify(libc::SIGILL), FailureKind::IllegalOp);
        assert_eq!(classify(libc::SIGFPE), FailureKind::Arithmetic);
        assert_eq!(classify(libc::SIGABRT), FailureKind::Abort);
        assert_eq!(classify(libc::SIGBUS), FailureKind::Misalign);
        assert_eq!(classify(libc::SIGHUP), FailureKind::OtherException);
    }
}
