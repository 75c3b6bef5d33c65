//! Loaded-module image inspection.
//!
//! Locates the guest's state section (and, for the unsafe transfer mode, the
//! writable data ranges) of a mapped module. Each platform walks its own
//! table format:
//!
//! | Platform | Mechanism |
//! |----------|-----------|
//! | Linux    | ELF64 section headers read from the staged file |
//! | macOS    | `getsectiondata` on the Mach-O header |
//! | Windows  | `IMAGE_SECTION_HEADER` walk from the module base |
//!
//! The in-process base address comes from the resolved entry pointer
//! (`dladdr` on Unix, `GetModuleHandleExW` on Windows), so the walkers never
//! guess at relocation.

use std::path::Path;

use crate::error::Result;

#[cfg(target_os = "linux")]
mod elf;
#[cfg(target_os = "macos")]
mod macho;
#[cfg(windows)]
mod pe;

/// A contiguous region inside a mapped module.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SectionRegion {
    /// In-process address of the first byte, null when empty.
    pub base: *mut u8,
    /// Length in bytes.
    pub len: usize,
}

impl SectionRegion {
    /// A region for images that declare no state section.
    pub fn empty() -> Self {
        Self {
            base: std::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A writable data range, as an offset from the module base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataRange {
    pub offset: usize,
    pub len: usize,
}

/// Base address of the module containing `addr`.
#[cfg(unix)]
pub(crate) fn module_base(addr: usize) -> Result<*mut u8> {
    use crate::error::Error;

    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::dladdr(addr as *const libc::c_void, &mut info) };
    if rc == 0 || info.dli_fbase.is_null() {
        return Err(Error::ImageParse(
            "dladdr could not resolve the module base".to_string(),
        ));
    }
    Ok(info.dli_fbase as *mut u8)
}

/// Base address of the module containing `addr`.
#[cfg(windows)]
pub(crate) fn module_base(addr: usize) -> Result<*mut u8> {
    use crate::error::Error;

    const GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS: u32 = 0x0000_0004;
    const GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT: u32 = 0x0000_0002;

    unsafe extern "system" {
        fn GetModuleHandleExW(
            flags: u32,
            addr: *const std::ffi::c_void,
            module: *mut *mut std::ffi::c_void,
        ) -> i32;
    }

    let mut module = std::ptr::null_mut();
    let rc = unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            addr as *const std::ffi::c_void,
            &mut module,
        )
    };
    if rc == 0 || module.is_null() {
        return Err(Error::ImageParse(
            "GetModuleHandleExW could not resolve the module base".to_string(),
        ));
    }
    Ok(module as *mut u8)
}

/// Locate the state section of the image staged at `staged_path` and mapped
/// at `base`. Missing section is not an error; the region comes back empty.
pub(crate) fn state_section(staged_path: &Path, base: *mut u8) -> Result<SectionRegion> {
    #[cfg(target_os = "linux")]
    return elf::state_section(staged_path, base);
    #[cfg(target_os = "macos")]
    return macho::state_section(staged_path, base);
    #[cfg(windows)]
    return pe::state_section(staged_path, base);
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = (staged_path, base);
        tracing::warn!("no section walker for this platform, state transfer disabled");
        Ok(SectionRegion::empty())
    }
}

/// Writable data ranges (`.data`/`.bss`-equivalent) of the image, as offsets
/// from the module base. Used only by the unsafe transfer mode.
pub(crate) fn writable_data_ranges(staged_path: &Path, base: *mut u8) -> Result<Vec<DataRange>> {
    #[cfg(target_os = "linux")]
    {
        let _ = base;
        return elf::writable_data_ranges(staged_path);
    }
    #[cfg(target_os = "macos")]
    return macho::writable_data_ranges(staged_path, base);
    #[cfg(windows)]
    return pe::writable_data_ranges(staged_path, base);
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = (staged_path, base);
        Ok(Vec::new())
    }
}
