//! Mach-O section lookup via the dyld runtime API.
//!
//! Unlike the ELF walker, there is nothing to parse: `getsectiondata` takes
//! the mapped `mach_header_64` (which is what `dladdr` reports as the module
//! base) and returns slide-adjusted in-process addresses directly.

use std::path::Path;

use crate::error::Result;
use super::{DataRange, SectionRegion};

unsafe extern "C" {
    fn getsectiondata(
        mhp: *const libc::c_void,
        segname: *const libc::c_char,
        sectname: *const libc::c_char,
        size: *mut libc::size_t,
    ) -> *mut u8;
}

const SEG_DATA: &[u8] = b"__DATA\0";
const SECT_STATE: &[u8] = b"cr_state\0";

pub(crate) fn state_section(_staged_path: &Path, base: *mut u8) -> Result<SectionRegion> {
    let mut size: libc::size_t = 0;
    let data = unsafe {
        getsectiondata(
            base as *const libc::c_void,
            SEG_DATA.as_ptr() as *const libc::c_char,
            SECT_STATE.as_ptr() as *const libc::c_char,
            &mut size,
        )
    };
    if data.is_null() || size == 0 {
        return Ok(SectionRegion::empty());
    }
    Ok(SectionRegion {
        base: data,
        len: size,
    })
}

pub(crate) fn writable_data_ranges(_staged_path: &Path, base: *mut u8) -> Result<Vec<DataRange>> {
    let eligible: [&[u8]; 3] = [b"__data\0", b"__bss\0", b"__common\0"];
    let mut ranges = Vec::new();
    for sect in eligible {
        let mut size: libc::size_t = 0;
        let data = unsafe {
            getsectiondata(
                base as *const libc::c_void,
                SEG_DATA.as_ptr() as *const libc::c_char,
                sect.as_ptr() as *const libc::c_char,
                &mut size,
            )
        };
        if !data.is_null() && size > 0 {
            ranges.push(DataRange {
                offset: data as usize - base as usize,
                len: size,
            });
        }
    }
    Ok(ranges)
}
