// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Errors produced while patching, signing and composing images.
//!
//! Every variant maps to a distinct process exit code so the surrounding build
//! can tell configuration mistakes (10..=12, 20..=23, 40..=41) apart from bad
//! input data (13, 14, 24, 25, 30..=32), signing backend failures (26) and I/O failures (74).

use std::fmt;
use std::path::PathBuf;

use crate::image::ByteRange;

/// Name of the pipeline stage an error originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Patch,
    Sign,
    Compose,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Patch => "patch",
            StageKind::Sign => "sign",
            StageKind::Compose => "compose",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    // Section patcher
    #[error("section `{section}` not found")]
    SectionNotFound { section: String },

    #[error("payload for `{section}` is {size} bytes, limit is {limit} bytes")]
    PayloadTooLarge {
        section: String,
        size: usize,
        limit: usize,
    },

    #[error("alignment violation in `{section}`: {detail}")]
    AlignmentViolation { section: String, detail: String },

    #[error("malformed ELF: {0}")]
    InvalidElf(String),

    #[error("malformed application payload at offset 0x{offset:x}: {reason}")]
    InvalidPayload { offset: usize, reason: String },

    // Code signer
    #[error("cannot load signing key: {0}")]
    KeyLoadError(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("signing range {range} overlaps mutable region {region}")]
    SigningRangeOverlapsMutableRegion { range: ByteRange, region: ByteRange },

    #[error("invalid signing range {range} for a {image_len}-byte image")]
    InvalidRange { range: ByteRange, image_len: usize },

    #[error("no entry point in code region {range}: {detail}")]
    EntryPointNotFound { range: ByteRange, detail: String },

    #[error("malformed signature record: {0}")]
    InvalidRecord(String),

    #[error("signature over {range} does not verify: {reason}")]
    SignatureInvalid { range: ByteRange, reason: String },

    // Image composer
    #[error("`{first}` at {first_range} overlaps `{second}` at {second_range}")]
    OverlapDetected {
        first: String,
        first_range: ByteRange,
        second: String,
        second_range: ByteRange,
    },

    #[error("gap of {gap} bytes before `{part}` at 0x{address:08x} exceeds budget of {budget} bytes")]
    GapExceedsBudget {
        part: String,
        address: u64,
        gap: u64,
        budget: u64,
    },

    #[error("`{part}` is linked at 0x{actual:08x} but must start at 0x{expected:08x}")]
    BaseAddressMismatch {
        part: String,
        expected: u64,
        actual: u64,
    },

    // Pipeline driver
    #[error("stage `{next}` cannot follow `{previous}`: {reason}")]
    PipelineContractViolation {
        previous: String,
        next: String,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: StageKind,
        #[source]
        source: Box<ImageError>,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ImageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ImageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap `self` with the stage it came from. Already wrapped errors are kept.
    pub fn in_stage(self, stage: StageKind) -> Self {
        match self {
            ImageError::Stage { .. } => self,
            other => ImageError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping stage wrappers.
    pub fn root(&self) -> &ImageError {
        match self {
            ImageError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Map each error kind to its process exit code.
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            ImageError::SectionNotFound { .. } => 10,
            ImageError::PayloadTooLarge { .. } => 11,
            ImageError::AlignmentViolation { .. } => 12,
            ImageError::InvalidElf(_) => 13,
            ImageError::InvalidPayload { .. } => 14,
            ImageError::KeyLoadError(_) => 20,
            ImageError::SigningRangeOverlapsMutableRegion { .. } => 21,
            ImageError::InvalidRange { .. } => 22,
            ImageError::EntryPointNotFound { .. } => 23,
            ImageError::InvalidRecord(_) => 24,
            ImageError::SignatureInvalid { .. } => 25,
            ImageError::SigningFailed(_) => 26,
            ImageError::OverlapDetected { .. } => 30,
            ImageError::GapExceedsBudget { .. } => 31,
            ImageError::BaseAddressMismatch { .. } => 32,
            ImageError::PipelineContractViolation { .. } => 40,
            ImageError::Config(_) => 41,
            ImageError::Io { .. } => 74,
            // `root` never returns a stage wrapper.
            ImageError::Stage { .. } => 1,
        }
    }
}

impl From<goblin::error::Error> for ImageError {
    fn from(err: goblin::error::Error) -> Self {
        ImageError::InvalidElf(err.to_string())
    }
}

pub type Result<T, E = ImageError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapper_keeps_inner_exit_code() {
        let err = ImageError::SectionNotFound {
            section: ".apps".into(),
        }
        .in_stage(StageKind::Patch);
        assert_eq!(err.exit_code(), 10);
        assert!(err.to_string().starts_with("patch stage failed"));
    }

    #[test]
    fn signing_failure_is_not_a_key_error() {
        let err = ImageError::SigningFailed("P-256 sign_prehash: rejected".into())
            .in_stage(StageKind::Sign);
        assert_eq!(err.exit_code(), 26);
        assert_ne!(err.exit_code(), ImageError::KeyLoadError(String::new()).exit_code());
        assert!(err.to_string().contains("signing failed"));
    }

    #[test]
    fn stage_wrapper_is_not_nested() {
        let err = ImageError::Config("x".into())
            .in_stage(StageKind::Sign)
            .in_stage(StageKind::Compose);
        match err {
            ImageError::Stage { stage, .. } => assert_eq!(stage, StageKind::Sign),
            other => panic!("unexpected {other:?}"),
        }
    }
}
