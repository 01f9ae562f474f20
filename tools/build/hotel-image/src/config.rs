// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Pipeline configuration, read from a per-board TOML file.
//!
//! ```toml
//! [board]
//! variant = "golf2"
//!
//! [[stages]]
//! kind = "patch"
//! payload = "app.tbf"
//!
//! [[stages]]
//! kind = "sign"
//! key = "signing-key.pem"
//!
//! [[stages]]
//! kind = "compose"
//! bootloader = "bootloader.bin"
//! ```

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::algorithm::Algorithm;
use crate::board::{AppFormat, BoardProfile, BoardVariant};
use crate::error::{ImageError, Result, StageKind};
use crate::image::{check_granularity, is_power_of_two};
use crate::section::SectionFlags;
use crate::signer::{RegionKind, SigningRange};

fn from_str<'de, D, T>(deserializer: D) -> core::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let text = String::deserialize(deserializer)?;
    text.parse().map_err(serde::de::Error::custom)
}

fn default_section() -> String {
    ".apps".to_string()
}

fn default_flags() -> SectionFlags {
    SectionFlags::ALLOC | SectionFlags::CODE | SectionFlags::CONTENTS
}

/// `[board]`: a variant plus optional overrides of its defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardConfig {
    pub variant: BoardVariant,
    pub app_format: Option<AppFormat>,
    pub discrete_bootloader_stage: Option<bool>,
    pub flash_base: Option<u64>,
    pub bootloader_region: Option<u64>,
    pub program_granularity: Option<u64>,
    pub app_alignment: Option<u64>,
    pub max_app_size: Option<u64>,
    pub region_kind: Option<RegionKind>,
    pub fill: Option<u8>,
}

impl BoardConfig {
    pub fn profile(&self) -> Result<BoardProfile> {
        let mut profile = BoardProfile::for_variant(self.variant);
        if let Some(v) = self.app_format {
            profile.app_format = v;
        }
        if let Some(v) = self.discrete_bootloader_stage {
            profile.discrete_bootloader_stage = v;
        }
        if let Some(v) = self.flash_base {
            profile.flash_base = v;
        }
        if let Some(v) = self.bootloader_region {
            profile.bootloader_region = v;
        }
        if let Some(v) = self.program_granularity {
            profile.program_granularity = v;
        }
        if let Some(v) = self.app_alignment {
            profile.app_alignment = v;
        }
        if let Some(v) = self.max_app_size {
            profile.max_app_size = v;
        }
        if let Some(v) = self.region_kind {
            profile.region_kind = v;
        }
        if let Some(v) = self.fill {
            profile.fill = v;
        }

        for (name, value) in [
            ("program_granularity", profile.program_granularity),
            ("app_alignment", profile.app_alignment),
        ] {
            if !is_power_of_two(value) {
                return Err(ImageError::Config(format!(
                    "board.{name} = {value} is not a power of two"
                )));
            }
            check_granularity(&format!("board.{name}"), value)?;
        }
        Ok(profile)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PatchStage {
    #[serde(default = "default_section")]
    pub section: String,
    pub payload: PathBuf,
    #[serde(default = "default_flags", deserialize_with = "from_str")]
    pub flags: SectionFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamedRange {
    Whole,
    ExcludeReserved,
}

/// `range = "whole"`, `range = "exclude-reserved"` or `range = { start, len }`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RangeConfig {
    Named(NamedRange),
    Explicit { start: u64, len: u64 },
}

impl RangeConfig {
    pub fn to_signing_range(self, reserved: u64) -> SigningRange {
        match self {
            RangeConfig::Named(NamedRange::Whole) => SigningRange::Whole,
            RangeConfig::Named(NamedRange::ExcludeReserved) => {
                SigningRange::ExcludeReserved { len: reserved }
            }
            RangeConfig::Explicit { start, len } => SigningRange::Explicit { start, len },
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SignStage {
    pub key: PathBuf,
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Unset: exclude the bootloader's reserved range if the image covers it.
    pub range: Option<RangeConfig>,
    /// Unset: the board's default.
    pub region_kind: Option<RegionKind>,
    #[serde(default)]
    pub embed_public_key: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ComposeStage {
    pub bootloader: PathBuf,
    pub origin: Option<u64>,
    pub max_gap: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StageConfig {
    Patch(PatchStage),
    Sign(SignStage),
    Compose(ComposeStage),
}

impl StageConfig {
    pub fn kind(&self) -> StageKind {
        match self {
            StageConfig::Patch(_) => StageKind::Patch,
            StageConfig::Sign(_) => StageKind::Sign,
            StageConfig::Compose(_) => StageKind::Compose,
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        let path = match self {
            StageConfig::Patch(stage) => &mut stage.payload,
            StageConfig::Sign(stage) => &mut stage.key,
            StageConfig::Compose(stage) => &mut stage.bootloader,
        };
        if path.is_relative() {
            *path = base.join(&*path);
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    board: BoardConfig,
    #[serde(default)]
    stages: Vec<StageConfig>,
}

/// Everything a pipeline run needs besides the kernel image.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub board: BoardProfile,
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    pub fn new(board: BoardProfile, stages: Vec<StageConfig>) -> Self {
        Self { board, stages }
    }

    /// Parse `text`; relative paths are taken relative to `base_dir`.
    pub fn from_toml_str(text: &str, base_dir: &Path) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| ImageError::Config(e.to_string()))?;
        let board = file.board.profile()?;
        let mut stages = file.stages;
        for stage in &mut stages {
            stage.resolve_paths(base_dir);
        }
        Ok(Self { board, stages })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ImageError::io(path, e))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base_dir)
    }
}
