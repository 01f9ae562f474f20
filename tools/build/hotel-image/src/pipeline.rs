// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Runs the configured patch, sign and compose stages over a kernel image.
//!
//! The stage list is checked against the state machine below before anything
//! runs. Each stage consumes the previous stage's artifact and the first
//! failure stops the run.
//!
//! | stage   | accepted input states      | output state |
//! |---------|----------------------------|--------------|
//! | patch   | Pending, Patched           | Patched      |
//! | sign    | Pending, Patched, Composed | Signed       |
//! | compose | Signed                     | Composed     |

use std::fmt;

use log::{error, info};

use crate::algorithm::LoadedKey;
use crate::board::BoardProfile;
use crate::composer::{compose, ComposeOptions, ComposePart, DEFAULT_MAX_GAP};
use crate::config::{ComposeStage, PatchStage, PipelineConfig, SignStage, StageConfig};
use crate::elf;
use crate::error::{ImageError, Result, StageKind};
use crate::image::{BinaryImage, ByteRange};
use crate::patcher::{patch_section, PatchOptions, PatchRequest};
use crate::record::SignatureRecord;
use crate::signer::{sign_with_key, verify_image, SignOptions, SigningRange};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Pending,
    Patched,
    Signed,
    Composed,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn accepts(stage: StageKind, state: PipelineState) -> bool {
    use PipelineState::*;
    match stage {
        StageKind::Patch => matches!(state, Pending | Patched),
        StageKind::Sign => matches!(state, Pending | Patched | Composed),
        StageKind::Compose => matches!(state, Signed),
    }
}

fn output_state(stage: StageKind) -> PipelineState {
    match stage {
        StageKind::Patch => PipelineState::Patched,
        StageKind::Sign => PipelineState::Signed,
        StageKind::Compose => PipelineState::Composed,
    }
}

/// What flows between stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Artifact {
    Elf(Vec<u8>),
    Flat(BinaryImage),
}

impl Artifact {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Artifact::Elf(bytes) => bytes,
            Artifact::Flat(image) => image.bytes(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StageReport {
    pub stage: StageKind,
    pub state: PipelineState,
    pub len: usize,
}

#[derive(Clone, Debug)]
pub struct PipelineReport {
    pub artifact: Artifact,
    pub stages: Vec<StageReport>,
    /// Record of the last signing stage, if any ran.
    pub record: Option<SignatureRecord>,
}

/// Check the stage order against the state machine and the board's
/// bootloader arrangement.
pub fn validate_plan(board: &BoardProfile, stages: &[StageConfig]) -> Result<()> {
    if stages.is_empty() {
        return Err(ImageError::Config("pipeline has no stages".into()));
    }

    let mut state = PipelineState::Pending;
    let mut previous = "start";
    for stage in stages {
        let kind = stage.kind();
        if !accepts(kind, state) {
            return Err(ImageError::PipelineContractViolation {
                previous: previous.to_string(),
                next: kind.name().to_string(),
                reason: format!("{kind} cannot consume a {state} image"),
            });
        }
        state = output_state(kind);
        previous = kind.name();
    }

    let composes = stages.iter().any(|s| s.kind() == StageKind::Compose);
    if composes != board.discrete_bootloader_stage {
        let reason = if composes {
            format!("board {} has no discrete bootloader stage", board.variant)
        } else {
            format!("board {} requires a compose stage for its bootloader", board.variant)
        };
        return Err(ImageError::PipelineContractViolation {
            previous: previous.to_string(),
            next: StageKind::Compose.name().to_string(),
            reason,
        });
    }
    Ok(())
}

pub struct Pipeline {
    config: PipelineConfig,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        validate_plan(&config.board, &config.stages)?;
        Ok(Self {
            config,
            state: PipelineState::Pending,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn board(&self) -> &BoardProfile {
        &self.config.board
    }

    /// Run every stage over `kernel` (an ELF, or a flat image at the
    /// board's kernel base).
    pub fn run(&mut self, kernel: &[u8]) -> Result<PipelineReport> {
        self.state = PipelineState::Pending;
        let mut artifact = if elf::is_elf(kernel) {
            Artifact::Elf(kernel.to_vec())
        } else {
            Artifact::Flat(BinaryImage::new(kernel.to_vec(), self.default_base()))
        };
        let mut stages = Vec::new();
        let mut record = None;

        for stage in &self.config.stages {
            let kind = stage.kind();
            let result = match stage {
                StageConfig::Patch(cfg) => self.patch(cfg, &artifact),
                StageConfig::Sign(cfg) => self.sign(cfg, &artifact).map(|(next, rec)| {
                    record = Some(rec);
                    next
                }),
                StageConfig::Compose(cfg) => self.compose(cfg, &artifact),
            };
            match result {
                Ok(next) => {
                    artifact = next;
                    self.state = output_state(kind);
                    stages.push(StageReport {
                        stage: kind,
                        state: self.state,
                        len: artifact.bytes().len(),
                    });
                    info!("Stage {kind} done: {} bytes, state {}", artifact.bytes().len(), self.state);
                }
                Err(err) => {
                    self.state = PipelineState::Failed;
                    let err = err.in_stage(kind);
                    error!("{err}");
                    return Err(err);
                }
            }
        }

        Ok(PipelineReport {
            artifact,
            stages,
            record,
        })
    }

    fn default_base(&self) -> u64 {
        let board = &self.config.board;
        if board.discrete_bootloader_stage {
            board.kernel_base()
        } else {
            board.flash_base
        }
    }

    fn patch(&self, cfg: &PatchStage, artifact: &Artifact) -> Result<Artifact> {
        let Artifact::Elf(kernel) = artifact else {
            return Err(ImageError::InvalidElf("patching needs an ELF kernel".into()));
        };
        let payload = std::fs::read(&cfg.payload).map_err(|e| ImageError::io(&cfg.payload, e))?;
        let board = &self.config.board;
        let options = PatchOptions {
            alignment: board.app_alignment,
            max_payload: board.max_app_size as usize,
            fill: board.fill,
            app_format: board.app_format,
        };
        let request = PatchRequest {
            section: &cfg.section,
            payload: &payload,
            flags: cfg.flags,
        };
        let outcome = patch_section(kernel, &request, &options)?;
        Ok(Artifact::Elf(outcome.bytes))
    }

    fn sign(&self, cfg: &SignStage, artifact: &Artifact) -> Result<(Artifact, SignatureRecord)> {
        let board = &self.config.board;
        let (image, sections) = match artifact {
            Artifact::Elf(bytes) => {
                let flat = elf::flatten(bytes, board.fill)?;
                (flat.image, flat.sections)
            }
            Artifact::Flat(image) => (image.clone(), Vec::new()),
        };

        let reserved = board
            .bootloader_range()
            .intersection(&image.address_range());
        let range = match cfg.range {
            Some(range) => range.to_signing_range(board.bootloader_region),
            None => match reserved {
                Some(r) if r.start == image.base() => SigningRange::ExcludeReserved { len: r.len },
                _ => SigningRange::Whole,
            },
        };
        let options = SignOptions {
            range,
            region_kind: cfg.region_kind.unwrap_or(board.region_kind),
            mutable_regions: reserved.into_iter().collect(),
            granularity: board.program_granularity,
            fill: board.fill,
            embed_public_key: cfg.embed_public_key,
            sections,
        };

        let (signed, public_key) = {
            let key = LoadedKey::from_file(&cfg.key, cfg.algorithm)?;
            let signed = sign_with_key(&image, &key, &options)?;
            (signed, key.public_key())
        };

        // The next stage only ever sees images that verify.
        verify_image(signed.image.bytes(), Some(&public_key))?;
        Ok((Artifact::Flat(signed.image), signed.record))
    }

    fn compose(&self, cfg: &ComposeStage, artifact: &Artifact) -> Result<Artifact> {
        let board = &self.config.board;
        let Artifact::Flat(signed) = artifact else {
            return Err(ImageError::InvalidElf("compose needs a signed flat image".into()));
        };
        if signed.base() != board.kernel_base() {
            return Err(ImageError::BaseAddressMismatch {
                part: "signed image".into(),
                expected: board.kernel_base(),
                actual: signed.base(),
            });
        }

        let bootloader = std::fs::read(&cfg.bootloader)
            .map_err(|e| ImageError::io(&cfg.bootloader, e))?;
        let bootloader = BinaryImage::new(bootloader, board.flash_base);
        let reserved: ByteRange = board.bootloader_range();
        if bootloader.len() as u64 > reserved.len {
            return Err(ImageError::OverlapDetected {
                first: "bootloader".into(),
                first_range: bootloader.address_range(),
                second: "bootloader region".into(),
                second_range: reserved,
            });
        }

        let parts = [
            ComposePart::new("bootloader", bootloader),
            ComposePart::new("signed image", signed.clone()),
        ];
        let options = ComposeOptions {
            origin: Some(cfg.origin.unwrap_or(board.flash_base)),
            granularity: board.program_granularity,
            max_gap: cfg.max_gap.unwrap_or(DEFAULT_MAX_GAP),
            fill: board.fill,
        };
        Ok(Artifact::Flat(compose(&parts, &options)?))
    }
}
