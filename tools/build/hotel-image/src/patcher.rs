// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Section patcher: replace the contents of one ELF section (normally
//! `.apps`) with an application payload, the way
//! `objcopy --update-section --set-section-flags` does, while keeping the
//! rest of the file loadable.
//!
//! The section keeps its file offset and address. Its footprint becomes the
//! payload rounded up to the platform alignment unit, and everything stored
//! after it in the file (sections, segments, header tables) slides by the
//! smallest amount that keeps each moved item's alignment.

use goblin::container::{Container, Ctx};
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_NOBITS, SHT_PROGBITS};
use log::{debug, info, warn};
use scroll::ctx::TryIntoCtx;

use crate::board::AppFormat;
use crate::elf;
use crate::error::{ImageError, Result};
use crate::image::{align_up, is_power_of_two, ERASED_FLASH, MAX_GRANULARITY};
use crate::section::SectionFlags;
use crate::tbf;

/// What to put where.
#[derive(Clone, Debug)]
pub struct PatchRequest<'a> {
    pub section: &'a str,
    pub payload: &'a [u8],
    pub flags: SectionFlags,
}

/// Platform constraints applied while patching.
#[derive(Clone, Debug)]
pub struct PatchOptions {
    /// Minimum alignment unit for the section's footprint and load address.
    pub alignment: u64,
    /// Hard ceiling on the payload, e.g. the flash reserved for apps.
    pub max_payload: usize,
    pub fill: u8,
    pub app_format: AppFormat,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            alignment: 512,
            max_payload: 0x2_0000,
            fill: ERASED_FLASH,
            app_format: AppFormat::Raw,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PatchOutcome {
    pub bytes: Vec<u8>,
    /// Bytes the section now occupies in the file.
    pub footprint: u64,
    /// How far the data after the section moved (negative when it shrank).
    pub shift: i64,
}

/// An item stored after the patched section that has to move with the tail.
struct Mover {
    what: String,
    align: u64,
}

pub fn patch_section(
    bytes: &[u8],
    request: &PatchRequest<'_>,
    options: &PatchOptions,
) -> Result<PatchOutcome> {
    let name = request.section;
    let violation = |detail: String| ImageError::AlignmentViolation {
        section: name.to_string(),
        detail,
    };

    if !is_power_of_two(options.alignment) || options.alignment > MAX_GRANULARITY {
        return Err(violation(format!(
            "alignment unit {} is not a power of two up to {MAX_GRANULARITY}",
            options.alignment
        )));
    }

    let elf = elf::parse(bytes)?;
    let idx = elf
        .section_headers
        .iter()
        .position(|sh| elf::section_name(&elf, sh) == name)
        .filter(|&i| i != 0)
        .ok_or_else(|| ImageError::SectionNotFound {
            section: name.to_string(),
        })?;

    if request.payload.len() > options.max_payload {
        return Err(ImageError::PayloadTooLarge {
            section: name.to_string(),
            size: request.payload.len(),
            limit: options.max_payload,
        });
    }

    if options.app_format == AppFormat::Tbf {
        let apps = tbf::validate(request.payload)?;
        info!("Payload holds {} TBF app(s)", apps.len());
    }

    let target = elf.section_headers[idx].clone();
    let load_addr = elf::load_address(&elf, &target);
    if load_addr % options.alignment != 0 {
        return Err(violation(format!(
            "load address 0x{load_addr:08x} is not aligned to {}",
            options.alignment
        )));
    }

    let old_off = target.sh_offset;
    let old_foot = if target.sh_type == SHT_NOBITS { 0 } else { target.sh_size };
    let old_tail = old_off + old_foot;
    if old_tail > bytes.len() as u64 {
        return Err(ImageError::InvalidElf(format!("{name} extends beyond file")));
    }

    let payload_len = request.payload.len() as u64;
    let with_contents = payload_len > 0 || request.flags.contains(SectionFlags::CONTENTS);
    let new_foot = if with_contents {
        align_up(payload_len, options.alignment)
            .ok_or_else(|| violation(format!("{payload_len} bytes cannot be aligned")))?
    } else {
        0
    };

    // Everything at or after the old tail moves. Collect what it is and how
    // it must stay aligned.
    let mut movers = Vec::new();
    for (i, sh) in elf.section_headers.iter().enumerate().skip(1) {
        if i == idx {
            continue;
        }
        let foot = if sh.sh_type == SHT_NOBITS { 0 } else { sh.sh_size };
        if sh.sh_offset >= old_tail {
            movers.push(Mover {
                what: format!("section {}", elf::section_name(&elf, sh)),
                align: sh.sh_addralign,
            });
        } else if foot > 0 && sh.sh_offset < old_tail && sh.sh_offset + foot > old_off {
            return Err(ImageError::InvalidElf(format!(
                "section {} overlaps {name}",
                elf::section_name(&elf, sh)
            )));
        }
    }
    for ph in &elf.program_headers {
        if ph.p_offset >= old_tail && !(ph.p_offset == 0 && ph.p_filesz == 0) {
            movers.push(Mover {
                what: format!("segment at 0x{:08x}", ph.p_paddr),
                align: ph.p_align,
            });
        }
    }
    let table_align = if elf.is_64 { 8 } else { 4 };
    if elf.header.e_shoff >= old_tail {
        movers.push(Mover {
            what: "section header table".into(),
            align: table_align,
        });
    }
    if elf.header.e_phoff >= old_tail {
        movers.push(Mover {
            what: "program header table".into(),
            align: table_align,
        });
    }

    let mut modulus = 1u64;
    for mover in &movers {
        if mover.align > 1 {
            if !is_power_of_two(mover.align) {
                return Err(violation(format!(
                    "{} has non power-of-two alignment {}",
                    mover.what, mover.align
                )));
            }
            modulus = modulus.max(mover.align);
        }
    }

    // Smallest tail start at or after the new footprint that is congruent to
    // the old one, so every mover keeps its alignment.
    let new_tail_min = old_off + new_foot;
    let pad = (i128::from(old_tail) - i128::from(new_tail_min)).rem_euclid(i128::from(modulus));
    let new_tail = new_tail_min + pad as u64;
    let shift = i128::from(new_tail) - i128::from(old_tail);
    let moved = |off: u64| (i128::from(off) + shift) as u64;

    debug!(
        "patch {name}: offset 0x{old_off:x}, footprint {old_foot} -> {new_foot}, tail 0x{old_tail:x} -> 0x{new_tail:x}"
    );

    let mut header = elf.header;
    let mut shdrs = elf.section_headers.clone();
    let mut phdrs = elf.program_headers.clone();

    let mut resized_segment = false;
    for ph in phdrs.iter_mut() {
        if ph.p_offset >= old_tail && !(ph.p_offset == 0 && ph.p_filesz == 0) {
            ph.p_offset = moved(ph.p_offset);
            continue;
        }
        let seg_end = ph.p_offset + ph.p_filesz;
        if ph.p_filesz == 0 || (seg_end <= old_off && old_foot > 0) {
            continue;
        }
        let ends_with_target = ph.p_offset <= old_off
            && seg_end == old_tail
            && (old_foot > 0 || ph.p_vaddr + (old_off - ph.p_offset) == target.sh_addr);
        if ends_with_target {
            let grow = i128::from(new_foot) - i128::from(old_foot);
            let filesz = (i128::from(ph.p_filesz) + grow) as u64;
            let memsz = ((i128::from(ph.p_memsz) + grow).max(0) as u64).max(filesz);
            debug!(
                "patch {name}: segment 0x{:08x} filesz {} -> {filesz}",
                ph.p_paddr, ph.p_filesz
            );
            ph.p_filesz = filesz;
            ph.p_memsz = memsz;
            resized_segment = true;
        } else if seg_end <= old_off {
            continue;
        } else if shift != 0 || new_foot != old_foot {
            return Err(violation(format!(
                "segment at 0x{:08x} spans the section and later data",
                ph.p_paddr
            )));
        }
    }
    if !resized_segment {
        warn!("{name} is not covered by a loadable segment; it will not be flashed");
    }

    for (i, sh) in shdrs.iter_mut().enumerate().skip(1) {
        if i == idx {
            sh.sh_size = payload_len;
            sh.sh_type = if with_contents { SHT_PROGBITS } else { SHT_NOBITS };
            let mut flags = sh.sh_flags & !u64::from(SHF_ALLOC | SHF_EXECINSTR);
            if request.flags.contains(SectionFlags::ALLOC) {
                flags |= u64::from(SHF_ALLOC);
            }
            if request.flags.contains(SectionFlags::CODE) {
                flags |= u64::from(SHF_EXECINSTR);
            }
            sh.sh_flags = flags;
        } else if sh.sh_offset >= old_tail {
            sh.sh_offset = moved(sh.sh_offset);
        }
    }
    if header.e_shoff >= old_tail {
        header.e_shoff = moved(header.e_shoff);
    }
    if header.e_phoff >= old_tail {
        header.e_phoff = moved(header.e_phoff);
    }

    let mut out = Vec::with_capacity((i128::from(bytes.len() as u64) + shift) as usize);
    out.extend_from_slice(&bytes[..old_off as usize]);
    out.extend_from_slice(request.payload);
    out.resize(new_tail as usize, options.fill);
    out.extend_from_slice(&bytes[old_tail as usize..]);

    let ctx = Ctx::new(
        if elf.is_64 {
            Container::Big
        } else {
            Container::Little
        },
        if elf.little_endian {
            scroll::Endian::Little
        } else {
            scroll::Endian::Big
        },
    );
    write_tables(&mut out, header, phdrs, shdrs, ctx)?;

    info!(
        "Patched {name}: {} bytes, flags {}, footprint {new_foot} bytes, tail moved by {shift}",
        payload_len, request.flags
    );

    Ok(PatchOutcome {
        bytes: out,
        footprint: new_foot,
        shift: shift as i64,
    })
}

fn table_slot(out: &mut [u8], table: u64, entsize: u16, index: usize) -> Result<&mut [u8]> {
    let start = table as usize + index * entsize as usize;
    let end = start + entsize as usize;
    out.get_mut(start..end)
        .ok_or_else(|| ImageError::InvalidElf(format!("header table entry {index} beyond file")))
}

fn write_tables(
    out: &mut [u8],
    header: goblin::elf::Header,
    phdrs: Vec<goblin::elf::ProgramHeader>,
    shdrs: Vec<goblin::elf::SectionHeader>,
    ctx: Ctx,
) -> Result<()> {
    header.try_into_ctx(&mut out[..], ctx.le)?;
    for (i, ph) in phdrs.into_iter().enumerate() {
        let slot = table_slot(out, header.e_phoff, header.e_phentsize, i)?;
        ph.try_into_ctx(slot, ctx)?;
    }
    for (i, sh) in shdrs.into_iter().enumerate() {
        let slot = table_slot(out, header.e_shoff, header.e_shentsize, i)?;
        sh.try_into_ctx(slot, ctx)?;
    }
    Ok(())
}
