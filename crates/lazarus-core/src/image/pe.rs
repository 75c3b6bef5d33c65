//! PE section-table walker.
//!
//! On Windows the headers stay mapped with the image, so the walk happens
//! directly at the module base (the `HMODULE` is the base address).

use std::path::Path;

use lazarus_abi::STATE_SECTION;

use crate::error::{Error, Result};
use super::{DataRange, SectionRegion};

const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;
const SECTION_HEADER_SIZE: usize = 40;

/// One parsed section header, reduced to the fields the runtime needs.
#[derive(Debug, Clone)]
struct Section {
    name: String,
    virtual_address: u32,
    virtual_size: u32,
    characteristics: u32,
}

pub(crate) fn state_section(staged_path: &Path, base: *mut u8) -> Result<SectionRegion> {
    for section in unsafe { sections(base) }.map_err(|e| annotate(e, staged_path))? {
        if section.name == STATE_SECTION {
            return Ok(SectionRegion {
                base: unsafe { base.add(section.virtual_address as usize) },
                len: section.virtual_size as usize,
            });
        }
    }
    Ok(SectionRegion::empty())
}

pub(crate) fn writable_data_ranges(staged_path: &Path, base: *mut u8) -> Result<Vec<DataRange>> {
    let eligible = [".data", ".bss"];
    let mut ranges = Vec::new();
    for section in unsafe { sections(base) }.map_err(|e| annotate(e, staged_path))? {
        if eligible.contains(&section.name.as_str())
            && section.characteristics & IMAGE_SCN_MEM_WRITE != 0
            && section.virtual_size > 0
        {
            ranges.push(DataRange {
                offset: section.virtual_address as usize,
                len: section.virtual_size as usize,
            });
        }
    }
    Ok(ranges)
}

fn annotate(err: Error, staged_path: &Path) -> Error {
    match err {
        Error::ImageParse(msg) => {
            Error::ImageParse(format!("{}: {}", staged_path.display(), msg))
        }
        other => other,
    }
}

/// Walk the section headers of the image mapped at `base`.
///
/// # Safety
///
/// `base` must be the base address of a module currently mapped into this
/// process (its headers are guaranteed readable by the loader).
unsafe fn sections(base: *mut u8) -> Result<Vec<Section>> {
    unsafe {
        let e_lfanew = read_u32(base, 0x3c) as usize;
        if read_u32(base, e_lfanew) != PE_SIGNATURE {
            return Err(Error::ImageParse("missing PE signature".to_string()));
        }

        let file_header = e_lfanew + 4;
        let number_of_sections = read_u16(base, file_header + 2) as usize;
        let size_of_optional_header = read_u16(base, file_header + 16) as usize;
        let first_section = file_header + 20 + size_of_optional_header;

        let mut sections = Vec::with_capacity(number_of_sections);
        for index in 0..number_of_sections {
            let at = first_section + index * SECTION_HEADER_SIZE;
            let mut name = [0u8; 8];
            std::ptr::copy_nonoverlapping(base.add(at), name.as_mut_ptr(), 8);
            let end = name.iter().position(|&b| b == 0).unwrap_or(8);

            sections.push(Section {
                name: String::from_utf8_lossy(&name[..end]).into_owned(),
                virtual_size: read_u32(base, at + 8),
                virtual_address: read_u32(base, at + 12),
                characteristics: read_u32(base, at + 36),
            });
        }
        Ok(sections)
    }
}

unsafe fn read_u16(base: *mut u8, at: usize) -> u16 {
    unsafe { (base.add(at) as *const u16).read_unaligned() }
}

unsafe fn read_u32(base: *mut u8, at: usize) -> u32 {
    unsafe { (base.add(at) as *const u32).read_unaligned() }
}
