//! ELF64 section-table walker.
//!
//! Reads the staged file's section headers instead of the process mappings:
//! section headers are not mapped at run time, but the staged copy is exactly
//! the file the loader mapped, so `base + sh_addr` is the in-process address
//! of any allocated section.
//!
//! Only little-endian ELF64 is supported, which covers every target the
//! runtime loads guests on.

use std::fs;
use std::path::Path;

use lazarus_abi::STATE_SECTION;

use crate::error::{Error, Result};
use super::{DataRange, SectionRegion};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;

/// One parsed section header, reduced to the fields the runtime needs.
#[derive(Debug, Clone)]
struct Section {
    name: String,
    flags: u64,
    addr: u64,
    size: u64,
}

pub(crate) fn state_section(staged_path: &Path, base: *mut u8) -> Result<SectionRegion> {
    for section in sections(staged_path)? {
        if section.name == STATE_SECTION {
            return Ok(SectionRegion {
                base: unsafe { base.add(section.addr as usize) },
                len: section.size as usize,
            });
        }
    }
    Ok(SectionRegion::empty())
}

pub(crate) fn writable_data_ranges(staged_path: &Path) -> Result<Vec<DataRange>> {
    // Only plain data sections are eligible; GOT/PLT and relocated read-only
    // data must keep the values the dynamic linker wrote for the new image.
    let eligible = [".data", ".bss"];
    let mut ranges = Vec::new();
    for section in sections(staged_path)? {
        if eligible.contains(&section.name.as_str())
            && section.flags & (SHF_WRITE | SHF_ALLOC) == (SHF_WRITE | SHF_ALLOC)
            && section.size > 0
        {
            ranges.push(DataRange {
                offset: section.addr as usize,
                len: section.size as usize,
            });
        }
    }
    Ok(ranges)
}

/// Parse the section-header table of `path`.
fn sections(path: &Path) -> Result<Vec<Section>> {
    let bytes = fs::read(path)?;

    if bytes.len() < 64 || bytes[..4] != ELF_MAGIC {
        return Err(Error::ImageParse(format!(
            "{} is not an ELF image",
            path.display()
        )));
    }
    if bytes[4] != ELFCLASS64 || bytes[5] != ELFDATA2LSB {
        return Err(Error::ImageParse(format!(
            "{} is not little-endian ELF64",
            path.display()
        )));
    }

    let shoff = u64_at(&bytes, 0x28)? as usize;
    let shentsize = u16_at(&bytes, 0x3a)? as usize;
    let shnum = u16_at(&bytes, 0x3c)? as usize;
    let shstrndx = u16_at(&bytes, 0x3e)? as usize;

    if shentsize < 0x40 || shnum == 0 || shstrndx >= shnum {
        return Err(Error::ImageParse(format!(
            "{} has a malformed section-header table",
            path.display()
        )));
    }

    let header = |index: usize| -> Result<(u32, u64, u64, u64, u64)> {
        let at = shoff + index * shentsize;
        Ok((
            u32_at(&bytes, at)?,      // sh_name
            u64_at(&bytes, at + 8)?,  // sh_flags
            u64_at(&bytes, at + 16)?, // sh_addr
            u64_at(&bytes, at + 24)?, // sh_offset
            u64_at(&bytes, at + 32)?, // sh_size
        ))
    };

    let (_, _, _, strtab_off, strtab_size) = header(shstrndx)?;

    let mut sections = Vec::with_capacity(shnum);
    for index in 0..shnum {
        let (name_off, flags, addr, _, size) = header(index)?;
        sections.push(Section {
            name: string_at(&bytes, strtab_off as usize, strtab_size as usize, name_off as usize)?,
            flags,
            addr,
            size,
        });
    }
    Ok(sections)
}

fn u16_at(bytes: &[u8], at: usize) -> Result<u16> {
    let raw: [u8; 2] = bytes
        .get(at..at + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::ImageParse("truncated ELF header".to_string()))?;
    Ok(u16::from_le_bytes(raw))
}

fn u32_at(bytes: &[u8], at: usize) -> Result<u32> {
    let raw: [u8; 4] = bytes
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::ImageParse("truncated ELF header".to_string()))?;
    Ok(u32::from_le_bytes(raw))
}

fn u64_at(bytes: &[u8], at: usize) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .get(at..at + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::ImageParse("truncated ELF header".to_string()))?;
    Ok(u64::from_le_bytes(raw))
}

fn string_at(bytes: &[u8], strtab_off: usize, strtab_size: usize, name_off: usize) -> Result<String> {
    let strtab = bytes
        .get(strtab_off..strtab_off + strtab_size)
        .ok_or_else(|| Error::ImageParse("section string table out of bounds".to_string()))?;
    let tail = strtab
        .get(name_off..)
        .ok_or_else(|| Error::ImageParse("section name out of bounds".to_string()))?;
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn rejects_non_elf_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("not-an-image.so");
        fs::write(&path, b"definitely not an object file").unwrap();

        assert!(matches!(sections(&path), Err(Error::ImageParse(_))));
    }

    #[test]
    fn walks_a_real_image() {
        // The test executable is itself an ELF64 image with the usual
        // sections but no state section.
        let exe = std::env::current_exe().unwrap();
        let sections = sections(&exe).unwrap();

        assert!(sections.iter().any(|s| s.name == ".text"));
        assert!(!sections.iter().any(|s| s.name == STATE_SECTION));
    }

    #[test]
    fn finds_writable_data_in_a_real_image() {
        let exe = std::env::current_exe().unwrap();
        let ranges = writable_data_ranges(&exe).unwrap();
        assert!(!ranges.is_empty());
    }
}
