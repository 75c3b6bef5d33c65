//! Windows fault isolation via vectored exception handling.
//!
//! The vectored handler sees the exception before any frame-based SEH,
//! records the code, and long-jumps to the recovery point armed around the
//! guest call. `_setjmp` is called with a null frame pointer so the CRT
//! `longjmp` performs no local unwinding on the way out of the handler.

use std::cell::Cell;
use std::ffi::c_void;
use std::sync::Mutex;

use lazarus_abi::{FailureKind, GuestEntryFn, OpCode, PluginContext};

use crate::error::{Error, Result};

const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
const EXCEPTION_IN_PAGE_ERROR: u32 = 0xC000_0006;
const EXCEPTION_STACK_OVERFLOW: u32 = 0xC000_00FD;
const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
const EXCEPTION_PRIV_INSTRUCTION: u32 = 0xC000_0096;
const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
const EXCEPTION_INT_OVERFLOW: u32 = 0xC000_0095;
const EXCEPTION_FLT_DIVIDE_BY_ZERO: u32 = 0xC000_008E;
const EXCEPTION_FLT_INVALID_OPERATION: u32 = 0xC000_0090;
const EXCEPTION_FLT_OVERFLOW: u32 = 0xC000_0091;
const EXCEPTION_DATATYPE_MISALIGNMENT: u32 = 0x8000_0002;

/// Opaque storage for a CRT `jmp_buf` (16-byte aligned `_JUMP_BUFFER`).
#[repr(C, align(16))]
struct JmpBuf([u8; 512]);

unsafe extern "C" {
    fn _setjmp(env: *mut JmpBuf, frame: *mut c_void) -> i32;
    fn longjmp(env: *mut JmpBuf, val: i32) -> !;
}

#[repr(C)]
struct ExceptionRecord {
    code: i32,
    flags: u32,
    record: *mut ExceptionRecord,
    address: *mut c_void,
    number_parameters: u32,
    information: [usize; 15],
}

#[repr(C)]
struct ExceptionPointers {
    exception_record: *mut ExceptionRecord,
    context_record: *mut c_void,
}

type VectoredHandler = unsafe extern "system" fn(*mut ExceptionPointers) -> i32;

#[link(name = "kernel32")]
unsafe extern "system" {
    fn AddVectoredExceptionHandler(first: u32, handler: VectoredHandler) -> *mut c_void;
    fn RemoveVectoredExceptionHandler(handle: *mut c_void) -> u32;
}

thread_local! {
    /// Recovery point for the guest call currently running on this thread.
    static ACTIVE_ENV: Cell<*mut JmpBuf> = const { Cell::new(std::ptr::null_mut()) };
    /// Exception code recorded by the handler before jumping back.
    static FAULT_CODE: Cell<u32> = const { Cell::new(0) };
}

struct Installation {
    count: usize,
    handle: *mut c_void,
}

unsafe impl Send for Installation {}

static INSTALLATION: Mutex<Option<Installation>> = Mutex::new(None);

/// Install the vectored handler, or bump the reference count if another
/// context already did.
pub(crate) fn install() -> Result<()> {
    let mut guard = INSTALLATION.lock().unwrap();
    if let Some(installation) = guard.as_mut() {
        installation.count += 1;
        return Ok(());
    }

    let handle = unsafe { AddVectoredExceptionHandler(1, exception_handler) };
    if handle.is_null() {
        return Err(Error::Handler(
            "AddVectoredExceptionHandler failed".to_string(),
        ));
    }
    *guard = Some(Installation { count: 1, handle });
    tracing::debug!("vectored exception handler installed");
    Ok(())
}

/// Drop one reference; the last one removes the handler.
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
    unsafe { RemoveVectoredExceptionHandler(installation.handle) };
    tracing::debug!("vectored exception handler removed");
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

    let outcome = if unsafe { _setjmp(env_ptr, std::ptr::null_mut()) } == 0 {
        Ok(unsafe { entry(ctx, op) })
    } else {
        Err(classify(FAULT_CODE.with(|cell| cell.get())))
    };

    ACTIVE_ENV.with(|cell| cell.set(previous));
    outcome
}

fn classify(code: u32) -> FailureKind {
    match code {
        EXCEPTION_ACCESS_VIOLATION | EXCEPTION_IN_PAGE_ERROR | EXCEPTION_STACK_OVERFLOW => {
            FailureKind::Segfault
        }
        EXCEPTION_ILLEGAL_INSTRUCTION | EXCEPTION_PRIV_INSTRUCTION => FailureKind::IllegalOp,
        EXCEPTION_INT_DIVIDE_BY_ZERO
        | EXCEPTION_INT_OVERFLOW
        | EXCEPTION_FLT_DIVIDE_BY_ZERO
        | EXCEPTION_FLT_INVALID_OPERATION
        | EXCEPTION_FLT_OVERFLOW => FailureKind::Arithmetic,
        EXCEPTION_DATATYPE_MISALIGNMENT => FailureKind::Misalign,
        _ => FailureKind::OtherException,
    }
}

fn is_guarded(code: u32) -> bool {
    matches!(
        code,
        EXCEPTION_ACCESS_VIOLATION
            | EXCEPTION_IN_PAGE_ERROR
            | EXCEPTION_STACK_OVERFLOW
            | EXCEPTION_ILLEGAL_INSTRUCTION
            | EXCEPTION_PRIV_INSTRUCTION
            | EXCEPTION_INT_DIVIDE_BY_ZERO
            | EXCEPTION_INT_OVERFLOW
            | EXCEPTION_FLT_DIVIDE_BY_ZERO
            | EXCEPTION_FLT_INVALID_OPERATION
            | EXCEPTION_FLT_OVERFLOW
            | EXCEPTION_DATATYPE_MISALIGNMENT
    )
}

unsafe extern "system" fn exception_handler(info: *mut ExceptionPointers) -> i32 {
    let env = ACTIVE_ENV.with(|cell| cell.get());
    if env.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let code = unsafe { (*(*info).exception_record).code } as u32;
    if !is_guarded(code) {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    FAULT_CODE.with(|cell| cell.set(code));
    // Disarm before jumping so nothing re-enters this recovery point.
    ACTIVE_ENV.with(|cell| cell.set(std::ptr::null_mut()));
    unsafe { longjmp(env, 1) }
}
