// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Lay independently built images out in one flash image.

use log::{debug, info};

use crate::error::{ImageError, Result};
use crate::image::{align_up, check_granularity, BinaryImage, ByteRange, ERASED_FLASH};

#[derive(Clone, Debug)]
pub struct ComposePart {
    pub name: String,
    pub image: BinaryImage,
}

impl ComposePart {
    pub fn new(name: impl Into<String>, image: BinaryImage) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }

    fn range(&self) -> ByteRange {
        self.image.address_range()
    }
}

/// Fill allowed between parts unless the caller raises it.
pub const DEFAULT_MAX_GAP: u64 = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ComposeOptions {
    /// Address of the first output byte; the lowest part base when unset.
    pub origin: Option<u64>,
    pub granularity: u64,
    /// Largest run of fill allowed between parts.
    pub max_gap: u64,
    pub fill: u8,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            origin: None,
            granularity: 2048,
            max_gap: DEFAULT_MAX_GAP,
            fill: ERASED_FLASH,
        }
    }
}

pub fn compose(parts: &[ComposePart], options: &ComposeOptions) -> Result<BinaryImage> {
    check_granularity("program granularity", options.granularity)?;

    let mut sorted: Vec<&ComposePart> = parts.iter().filter(|p| !p.image.is_empty()).collect();
    sorted.sort_by_key(|p| p.image.base());

    let Some(first) = sorted.first() else {
        return Err(ImageError::Config("nothing to compose".into()));
    };
    let origin = options.origin.unwrap_or(first.image.base());
    if first.image.base() < origin {
        return Err(ImageError::Config(format!(
            "`{}` at 0x{:08x} lies below origin 0x{origin:08x}",
            first.name,
            first.image.base()
        )));
    }

    let mut cursor = origin;
    let mut previous: Option<&ComposePart> = None;
    for part in &sorted {
        let range = part.range();
        if let Some(prev) = previous {
            if prev.range().intersects(&range) {
                return Err(ImageError::OverlapDetected {
                    first: prev.name.clone(),
                    first_range: prev.range(),
                    second: part.name.clone(),
                    second_range: range,
                });
            }
        }
        let gap = range.start - cursor;
        if gap > options.max_gap {
            return Err(ImageError::GapExceedsBudget {
                part: part.name.clone(),
                address: range.start,
                gap,
                budget: options.max_gap,
            });
        }
        cursor = range.end();
        previous = Some(part);
    }

    let total = align_up(cursor - origin, options.granularity)
        .and_then(|total| usize::try_from(total).ok())
        .ok_or_else(|| {
            ImageError::Config(format!(
                "composed image from 0x{origin:08x} to 0x{cursor:08x} is too large"
            ))
        })?;
    let mut bytes = vec![options.fill; total];
    for part in &sorted {
        let at = (part.image.base() - origin) as usize;
        bytes[at..at + part.image.len()].copy_from_slice(part.image.bytes());
        debug!("compose: `{}` at {}", part.name, part.range());
    }

    info!(
        "Composed {} part(s) into {total} bytes at 0x{origin:08x}",
        sorted.len()
    );
    Ok(BinaryImage::new(bytes, origin))
}
