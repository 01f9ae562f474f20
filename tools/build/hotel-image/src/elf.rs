// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Read-side ELF helpers: section lookup and the flash view of a kernel ELF.

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_NOBITS};
use goblin::elf::{Elf, ProgramHeader, SectionHeader};
use log::debug;

use crate::error::{ImageError, Result};
use crate::image::BinaryImage;
use crate::section::{Section, SectionFlags};

/// Refuse to flatten images spanning more than this many bytes of flash.
const MAX_FLAT_SPAN: u64 = 64 * 1024 * 1024;

pub fn is_elf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"\x7fELF")
}

pub fn parse(bytes: &[u8]) -> Result<Elf<'_>> {
    if !is_elf(bytes) {
        return Err(ImageError::InvalidElf("missing ELF magic".into()));
    }
    Ok(Elf::parse(bytes)?)
}

pub(crate) fn section_name<'a>(elf: &'a Elf<'_>, sh: &SectionHeader) -> &'a str {
    elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("")
}

pub(crate) fn section_flags(sh: &SectionHeader) -> SectionFlags {
    let mut flags = SectionFlags::empty();
    if sh.sh_flags & u64::from(SHF_ALLOC) != 0 {
        flags |= SectionFlags::ALLOC;
    }
    if sh.sh_flags & u64::from(SHF_EXECINSTR) != 0 {
        flags |= SectionFlags::CODE;
    }
    if sh.sh_type != SHT_NOBITS {
        flags |= SectionFlags::CONTENTS;
    }
    flags
}

/// The `PT_LOAD` whose file bytes hold `[off, off + size)`.
pub(crate) fn segment_containing_offset<'a>(
    elf: &'a Elf<'_>,
    off: u64,
    size: u64,
) -> Option<&'a ProgramHeader> {
    elf.program_headers.iter().find(|ph| {
        ph.p_type == PT_LOAD
            && ph.p_filesz > 0
            && off >= ph.p_offset
            && off + size <= ph.p_offset + ph.p_filesz
    })
}

/// Physical (flash) address of a section: taken from its segment when it has
/// one, otherwise the section's own address.
pub(crate) fn load_address(elf: &Elf<'_>, sh: &SectionHeader) -> u64 {
    if sh.sh_type == SHT_NOBITS {
        return sh.sh_addr;
    }
    match segment_containing_offset(elf, sh.sh_offset, sh.sh_size) {
        Some(ph) => ph.p_paddr + (sh.sh_offset - ph.p_offset),
        None => sh.sh_addr,
    }
}

fn to_section(elf: &Elf<'_>, sh: &SectionHeader) -> Section {
    Section {
        name: section_name(elf, sh).to_string(),
        offset: sh.sh_offset,
        size: sh.sh_size,
        address: load_address(elf, sh),
        align: sh.sh_addralign,
        flags: section_flags(sh),
    }
}

/// Section table in header order, without the null entry.
pub fn sections(bytes: &[u8]) -> Result<Vec<Section>> {
    let elf = parse(bytes)?;
    Ok(elf
        .section_headers
        .iter()
        .skip(1)
        .map(|sh| to_section(&elf, sh))
        .collect())
}

/// Locate `name` and return its description together with its stored bytes.
pub fn read_section(bytes: &[u8], name: &str) -> Result<(Section, Vec<u8>)> {
    let elf = parse(bytes)?;
    let sh = elf
        .section_headers
        .iter()
        .find(|sh| section_name(&elf, sh) == name)
        .ok_or_else(|| ImageError::SectionNotFound {
            section: name.to_string(),
        })?;
    let section = to_section(&elf, sh);
    let range = section.file_range();
    let (start, end) = (range.start as usize, range.end() as usize);
    let data = bytes
        .get(start..end)
        .ok_or_else(|| ImageError::InvalidElf(format!("{name} extends beyond file")))?;
    Ok((section, data.to_vec()))
}

/// Flash view of an ELF: what `objcopy -O binary` would emit, plus the
/// sections mapped to offsets inside it.
#[derive(Debug, Clone)]
pub struct FlatImage {
    pub image: BinaryImage,
    pub sections: Vec<Section>,
}

/// Lay every file-backed `PT_LOAD` at its physical address, starting at the
/// lowest one. Gaps between segments are filled with `fill`.
pub fn flatten(bytes: &[u8], fill: u8) -> Result<FlatImage> {
    let elf = parse(bytes)?;

    let mut loads: Vec<_> = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD && ph.p_filesz > 0)
        .cloned()
        .collect();
    loads.sort_by_key(|ph| ph.p_paddr);

    let first = loads
        .first()
        .ok_or_else(|| ImageError::InvalidElf("no loadable segments".into()))?;
    let base = first.p_paddr;
    let end = loads
        .iter()
        .map(|ph| ph.p_paddr + ph.p_filesz)
        .max()
        .unwrap_or(base);
    if end - base > MAX_FLAT_SPAN {
        return Err(ImageError::InvalidElf(format!(
            "loadable segments span 0x{base:08x}..0x{end:08x}, too sparse to flatten"
        )));
    }

    let mut flat = vec![fill; (end - base) as usize];
    let mut cursor = base;
    for ph in &loads {
        if ph.p_paddr < cursor {
            return Err(ImageError::InvalidElf(format!(
                "segment at 0x{:08x} overlaps the previous one",
                ph.p_paddr
            )));
        }
        let src_start = ph.p_offset as usize;
        let src_end = src_start + ph.p_filesz as usize;
        let data = bytes.get(src_start..src_end).ok_or_else(|| {
            ImageError::InvalidElf(format!("segment at 0x{:08x} extends beyond file", ph.p_paddr))
        })?;
        let dst = (ph.p_paddr - base) as usize;
        flat[dst..dst + data.len()].copy_from_slice(data);
        debug!(
            "flatten: segment 0x{:08x}..0x{:08x} from file offset 0x{:x}",
            ph.p_paddr,
            ph.p_paddr + ph.p_filesz,
            ph.p_offset
        );
        cursor = ph.p_paddr + ph.p_filesz;
    }

    let sections = elf
        .section_headers
        .iter()
        .filter(|sh| sh.sh_size > 0 && sh.sh_type != SHT_NOBITS)
        .filter(|sh| segment_containing_offset(&elf, sh.sh_offset, sh.sh_size).is_some())
        .map(|sh| {
            let mut section = to_section(&elf, sh);
            section.offset = section.address - base;
            section
        })
        .collect();

    Ok(FlatImage {
        image: BinaryImage::new(flat, base),
        sections,
    })
}
