// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Per-board layout and format choices, selected once per pipeline.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::image::{ByteRange, ERASED_FLASH};
use crate::signer::RegionKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardVariant {
    Golf,
    Golf2,
}

impl fmt::Display for BoardVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BoardVariant::Golf => "golf",
            BoardVariant::Golf2 => "golf2",
        })
    }
}

/// Layout of the application payload stored in `.apps`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppFormat {
    #[default]
    Raw,
    Tbf,
}

impl FromStr for AppFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(AppFormat::Raw),
            "tbf" => Ok(AppFormat::Tbf),
            other => Err(format!("unknown app format `{other}` (expected raw or tbf)")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoardProfile {
    pub variant: BoardVariant,
    pub app_format: AppFormat,
    /// The bootloader is flashed as part of the composed image.
    pub discrete_bootloader_stage: bool,
    /// Address of the first byte of flash.
    pub flash_base: u64,
    /// Size of the bootloader's reserved range at `flash_base`.
    pub bootloader_region: u64,
    pub program_granularity: u64,
    pub app_alignment: u64,
    pub max_app_size: u64,
    pub region_kind: RegionKind,
    pub fill: u8,
}

impl BoardProfile {
    pub fn for_variant(variant: BoardVariant) -> Self {
        match variant {
            BoardVariant::Golf => BoardProfile {
                variant,
                app_format: AppFormat::Raw,
                discrete_bootloader_stage: false,
                flash_base: 0x4_0000,
                bootloader_region: 0x4000,
                program_granularity: 2048,
                app_alignment: 2048,
                max_app_size: 0x2_0000,
                region_kind: RegionKind::Code,
                fill: ERASED_FLASH,
            },
            BoardVariant::Golf2 => BoardProfile {
                variant,
                app_format: AppFormat::Tbf,
                discrete_bootloader_stage: true,
                flash_base: 0x4_0000,
                bootloader_region: 0x4000,
                program_granularity: 2048,
                app_alignment: 512,
                max_app_size: 0x2_0000,
                region_kind: RegionKind::Data,
                fill: ERASED_FLASH,
            },
        }
    }

    /// Flash reserved for the bootloader.
    pub fn bootloader_range(&self) -> ByteRange {
        ByteRange::new(self.flash_base, self.bootloader_region)
    }

    /// Where the signed kernel image starts once a bootloader precedes it.
    pub fn kernel_base(&self) -> u64 {
        self.flash_base + self.bootloader_region
    }
}
