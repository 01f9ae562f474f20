// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Sign a flat image over an explicit byte range and attach a
//! [`SignatureRecord`]; verify such images.

use std::str::FromStr;

use log::{debug, info};
use serde::Deserialize;

use crate::algorithm::{
    key_id, Algorithm, EcdsaP256Sha256, Ed25519, LoadedKey, SignatureAlgorithm,
};
use crate::error::{ImageError, Result};
use crate::image::{align_up, check_granularity, BinaryImage, ByteRange, ERASED_FLASH};
use crate::record::SignatureRecord;
use crate::section::{Section, SectionFlags};

/// Whether the signed bytes are executed by the bootloader's target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    #[default]
    Code,
    Data,
}

impl FromStr for RegionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(RegionKind::Code),
            "data" => Ok(RegionKind::Data),
            other => Err(format!("unknown region kind `{other}` (expected code or data)")),
        }
    }
}

/// Which bytes of the image the signature covers, as image offsets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SigningRange {
    #[default]
    Whole,
    Explicit { start: u64, len: u64 },
    /// Everything after a reserved region of `len` bytes at the image start.
    ExcludeReserved { len: u64 },
}

impl SigningRange {
    pub fn resolve(&self, image_len: usize) -> Result<ByteRange> {
        let total = image_len as u64;
        let range = match *self {
            SigningRange::Whole => ByteRange::new(0, total),
            SigningRange::Explicit { start, len } => ByteRange::new(start, len),
            SigningRange::ExcludeReserved { len } => {
                ByteRange::new(len, total.saturating_sub(len))
            }
        };
        if range.is_empty() || range.start.checked_add(range.len).map_or(true, |end| end > total)
        {
            return Err(ImageError::InvalidRange { range, image_len });
        }
        Ok(range)
    }
}

#[derive(Clone, Debug)]
pub struct SignOptions {
    pub range: SigningRange,
    pub region_kind: RegionKind,
    /// Absolute address ranges that a later stage rewrites.
    pub mutable_regions: Vec<ByteRange>,
    /// Program granularity the signed output is padded to.
    pub granularity: u64,
    pub fill: u8,
    pub embed_public_key: bool,
    /// Section map of the image (offsets relative to the image start), if
    /// it came from an ELF.
    pub sections: Vec<Section>,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            range: SigningRange::Whole,
            region_kind: RegionKind::Code,
            mutable_regions: Vec::new(),
            granularity: 2048,
            fill: ERASED_FLASH,
            embed_public_key: false,
            sections: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SignedImage {
    pub image: BinaryImage,
    pub record: SignatureRecord,
    /// Offset of the record within `image`.
    pub record_offset: usize,
}

/// Locate the reset handler of a Cortex-M vector table at the start of
/// `range`. Returns the reset vector as stored (Thumb bit set).
pub fn find_entry_point(image: &BinaryImage, range: ByteRange, sections: &[Section]) -> Result<u32> {
    let not_found = |detail: String| ImageError::EntryPointNotFound { range, detail };

    if range.len < 8 {
        return Err(not_found("range too short for a vector table".into()));
    }
    let reset = image
        .read_u32(range.start + 4)
        .ok_or_else(|| not_found("vector table beyond the image".into()))?;
    if reset & 1 == 0 {
        return Err(not_found(format!("reset vector 0x{reset:08x} lacks the Thumb bit")));
    }
    let target = u64::from(reset & !1);
    let inside = target
        .checked_sub(image.base())
        .map_or(false, |offset| range.contains(offset));
    if !inside {
        return Err(not_found(format!(
            "reset vector 0x{reset:08x} points outside the signed range"
        )));
    }

    if !sections.is_empty() {
        let first = sections
            .iter()
            .filter(|s| s.size > 0 && range.contains(s.offset))
            .min_by_key(|s| s.offset)
            .ok_or_else(|| not_found("no section starts inside the range".into()))?;
        if !first.flags.contains(SectionFlags::CODE) {
            return Err(not_found(format!(
                "first section `{}` is not flagged code ({})",
                first.name, first.flags
            )));
        }
    }
    Ok(reset)
}

fn check_mutable_regions(image: &BinaryImage, range: ByteRange, regions: &[ByteRange]) -> Result<()> {
    let absolute = ByteRange::new(image.base() + range.start, range.len);
    for region in regions {
        if absolute.intersects(region) {
            return Err(ImageError::SigningRangeOverlapsMutableRegion {
                range: absolute,
                region: *region,
            });
        }
    }
    Ok(())
}

/// Bytes the signature is computed over: the signed range, then the record's
/// attribute TLVs.
fn signed_message(image: &[u8], record: &SignatureRecord) -> Result<Vec<u8>> {
    let range = record.range;
    let covered = image
        .get(range.start as usize..range.end() as usize)
        .ok_or_else(|| ImageError::InvalidRecord(format!("signed range {range} is outside the image")))?;
    let mut message = covered.to_vec();
    message.extend(record.attributes()?);
    Ok(message)
}

/// Sign `image` with `key`. The output is the image, fill padding, then the
/// record, sized to a multiple of the granularity.
pub fn sign_image<A: SignatureAlgorithm>(
    image: &BinaryImage,
    key: &A::PrivateKey,
    options: &SignOptions,
) -> Result<SignedImage> {
    check_granularity("program granularity", options.granularity)?;
    let range = options.range.resolve(image.len())?;
    check_mutable_regions(image, range, &options.mutable_regions)?;

    let entry_point = match options.region_kind {
        RegionKind::Code => Some(find_entry_point(image, range, &options.sections)?),
        RegionKind::Data => None,
    };

    let absolute = ByteRange::new(image.base() + range.start, range.len);
    info!(
        "Hashing flash region {absolute} ({} bytes) with {}",
        range.len,
        A::NAME
    );

    let public_key = A::public_key(key);
    let algorithm = Algorithm::from_id(A::ID)
        .ok_or_else(|| ImageError::InvalidRecord(format!("unregistered algorithm id {}", A::ID)))?;

    let mut record = SignatureRecord {
        algorithm,
        key_id: key_id(&public_key),
        public_key: options.embed_public_key.then_some(public_key),
        range,
        entry_point,
        signature: Vec::new(),
    };
    let message = signed_message(image.bytes(), &record)?;
    record.signature = A::sign(key, &message)?;
    let encoded = record.encode()?;

    let unpadded = (image.len() + encoded.len()) as u64;
    let padding = align_up(unpadded, options.granularity)
        .and_then(|total| usize::try_from(total - unpadded).ok())
        .ok_or_else(|| {
            ImageError::Config(format!(
                "cannot pad {unpadded} bytes to granularity {}",
                options.granularity
            ))
        })?;
    let mut bytes = Vec::with_capacity(unpadded as usize + padding);
    bytes.extend_from_slice(image.bytes());
    bytes.resize(image.len() + padding, options.fill);
    let record_offset = bytes.len();
    bytes.extend_from_slice(&encoded);

    debug!(
        "sign: {} image bytes, {padding} bytes padding, {}-byte record at 0x{record_offset:x}",
        image.len(),
        encoded.len()
    );

    Ok(SignedImage {
        image: BinaryImage::new(bytes, image.base()),
        record,
        record_offset,
    })
}

/// Sign with whichever algorithm `key` belongs to.
pub fn sign_with_key(image: &BinaryImage, key: &LoadedKey, options: &SignOptions) -> Result<SignedImage> {
    match key {
        LoadedKey::P256(k) => sign_image::<EcdsaP256Sha256>(image, k, options),
        LoadedKey::Ed25519(k) => sign_image::<Ed25519>(image, k, options),
    }
}

/// Check the record at the end of `image`. With `public_key` the record's key
/// id must match it; without, the embedded key is used.
pub fn verify_image(image: &[u8], public_key: Option<&[u8]>) -> Result<SignatureRecord> {
    let (record, record_offset) = SignatureRecord::decode(image)?;
    let range = record.range;
    if range.is_empty() || range.end() > record_offset as u64 {
        return Err(ImageError::InvalidRecord(format!(
            "signed range {range} does not lie before the record at 0x{record_offset:x}"
        )));
    }

    let key = match (public_key, record.public_key.as_deref()) {
        (Some(pk), _) => pk,
        (None, Some(embedded)) => embedded,
        (None, None) => {
            return Err(ImageError::InvalidRecord(
                "no public key supplied and none embedded".into(),
            ))
        }
    };
    if key_id(key) != record.key_id {
        return Err(ImageError::SignatureInvalid {
            range,
            reason: format!(
                "record names key {}, public key is {}",
                hex::encode(record.key_id),
                hex::encode(key_id(key))
            ),
        });
    }

    let message = signed_message(image, &record)?;
    if !record.algorithm.verify(&message, &record.signature, key) {
        return Err(ImageError::SignatureInvalid {
            range,
            reason: format!("{} signature mismatch", record.algorithm),
        });
    }
    info!(
        "Verified {} signature over {range} (key {})",
        record.algorithm,
        hex::encode(record.key_id)
    );
    Ok(record)
}
