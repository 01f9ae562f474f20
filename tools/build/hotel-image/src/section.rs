// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Sections and their permission flags.

use std::fmt;
use std::str::FromStr;

use crate::image::ByteRange;

bitflags::bitflags! {
    /// Loader-visible permission flags, spelled the way `objcopy
    /// --set-section-flags` spells them.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SectionFlags: u8 {
        /// Occupies memory at runtime (`SHF_ALLOC`).
        const ALLOC = 1 << 0;
        /// Executable (`SHF_EXECINSTR`).
        const CODE = 1 << 1;
        /// Has bytes in the file (anything but `SHT_NOBITS`).
        const CONTENTS = 1 << 2;
    }
}

impl FromStr for SectionFlags {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = SectionFlags::empty();
        for word in s.split(',').map(str::trim).filter(|w| !w.is_empty()) {
            flags |= match word {
                "alloc" => SectionFlags::ALLOC,
                "code" => SectionFlags::CODE,
                "contents" => SectionFlags::CONTENTS,
                "none" => SectionFlags::empty(),
                other => return Err(format!("unknown section flag `{other}`")),
            };
        }
        Ok(flags)
    }
}

impl fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (SectionFlags::ALLOC, "alloc"),
            (SectionFlags::CODE, "code"),
            (SectionFlags::CONTENTS, "contents"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// A named contiguous sub-range of an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    /// Offset within the containing file or flat image.
    pub offset: u64,
    pub size: u64,
    /// Load (physical) address.
    pub address: u64,
    pub align: u64,
    pub flags: SectionFlags,
}

impl Section {
    /// Bytes the section occupies in its container.
    pub fn file_range(&self) -> ByteRange {
        let len = if self.flags.contains(SectionFlags::CONTENTS) {
            self.size
        } else {
            0
        };
        ByteRange::new(self.offset, len)
    }

    pub fn address_range(&self) -> ByteRange {
        ByteRange::new(self.address, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_objcopy_flag_lists() {
        let flags: SectionFlags = "alloc,code,contents".parse().unwrap();
        assert_eq!(
            flags,
            SectionFlags::ALLOC | SectionFlags::CODE | SectionFlags::CONTENTS
        );
        assert_eq!("none".parse::<SectionFlags>().unwrap(), SectionFlags::empty());
        assert_eq!(" alloc , code".parse::<SectionFlags>().unwrap().to_string(), "alloc,code");
        assert!("alloc,readonly".parse::<SectionFlags>().is_err());
    }

    #[test]
    fn nobits_section_has_no_file_bytes() {
        let section = Section {
            name: ".bss".into(),
            offset: 0x400,
            size: 0x100,
            address: 0x2000_0000,
            align: 4,
            flags: SectionFlags::ALLOC,
        };
        assert!(section.file_range().is_empty());
        assert_eq!(section.address_range().len, 0x100);
    }
}
