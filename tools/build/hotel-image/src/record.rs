// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Signature record appended to signed images.
//!
//! The record ends the image and is read backwards from the last byte, the
//! same way the kernel attributes trailer is:
//!
//! ```text
//! ... [value][type:u16][len:u16] ... [version:u8][reserved:u8][tlv_bytes:u16]["SIGR"]
//! ```
//!
//! All integers are little-endian.

use log::debug;

use crate::algorithm::{Algorithm, KEY_ID_LEN};
use crate::error::{ImageError, Result};
use crate::image::ByteRange;

pub const RECORD_MAGIC: &[u8; 4] = b"SIGR";
pub const RECORD_VERSION: u8 = 1;
const TRAILER_LEN: usize = 8;

const TLV_TYPE_ALGORITHM: u16 = 0x0201;
const TLV_TYPE_KEY_ID: u16 = 0x0202;
const TLV_TYPE_PUBLIC_KEY: u16 = 0x0203;
const TLV_TYPE_SIGNED_RANGE: u16 = 0x0204;
const TLV_TYPE_ENTRY_POINT: u16 = 0x0205;
const TLV_TYPE_SIGNATURE: u16 = 0x0206;

/// Guard against looping on a corrupted chain.
const MAX_TLVS: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureRecord {
    pub algorithm: Algorithm,
    pub key_id: [u8; KEY_ID_LEN],
    pub public_key: Option<Vec<u8>>,
    /// Signed bytes, as offsets into the image the record is attached to.
    pub range: ByteRange,
    pub entry_point: Option<u32>,
    pub signature: Vec<u8>,
}

fn push_tlv(out: &mut Vec<u8>, tlv_type: u16, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| ImageError::InvalidRecord(format!("TLV 0x{tlv_type:04x} too long")))?;
    out.extend_from_slice(value);
    out.extend_from_slice(&tlv_type.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn u32_value(tlv_type: u16, value: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| {
        ImageError::InvalidRecord(format!(
            "TLV 0x{tlv_type:04x} length {}, expected 4",
            value.len()
        ))
    })?;
    Ok(u32::from_le_bytes(bytes))
}

impl SignatureRecord {
    /// Every TLV except the signature, in encoding order. The signature is
    /// computed over the signed range followed by these bytes, so a verifier
    /// can trust the entry point and range it reads from the record.
    pub fn attributes(&self) -> Result<Vec<u8>> {
        let start = u32::try_from(self.range.start);
        let len = u32::try_from(self.range.len);
        let (Ok(start), Ok(len)) = (start, len) else {
            return Err(ImageError::InvalidRecord(format!(
                "range {} does not fit a 32-bit descriptor",
                self.range
            )));
        };

        let mut out = Vec::new();
        push_tlv(&mut out, TLV_TYPE_ALGORITHM, &self.algorithm.id().to_le_bytes())?;
        push_tlv(&mut out, TLV_TYPE_KEY_ID, &self.key_id)?;
        if let Some(pk) = &self.public_key {
            push_tlv(&mut out, TLV_TYPE_PUBLIC_KEY, pk)?;
        }
        let mut range = [0u8; 8];
        range[..4].copy_from_slice(&start.to_le_bytes());
        range[4..].copy_from_slice(&len.to_le_bytes());
        push_tlv(&mut out, TLV_TYPE_SIGNED_RANGE, &range)?;
        if let Some(entry) = self.entry_point {
            push_tlv(&mut out, TLV_TYPE_ENTRY_POINT, &entry.to_le_bytes())?;
        }
        Ok(out)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = self.attributes()?;
        push_tlv(&mut out, TLV_TYPE_SIGNATURE, &self.signature)?;

        let tlv_bytes = u16::try_from(out.len())
            .map_err(|_| ImageError::InvalidRecord("record too long".into()))?;
        out.push(RECORD_VERSION);
        out.push(0);
        out.extend_from_slice(&tlv_bytes.to_le_bytes());
        out.extend_from_slice(RECORD_MAGIC);
        Ok(out)
    }

    /// Decode the record at the end of `image`. Returns it with the offset
    /// where the record starts.
    pub fn decode(image: &[u8]) -> Result<(SignatureRecord, usize)> {
        let invalid = |msg: &str| ImageError::InvalidRecord(msg.to_string());

        if image.len() < TRAILER_LEN {
            return Err(invalid("image too small for a signature record"));
        }
        let tail = &image[image.len() - TRAILER_LEN..];
        if tail[4..8] != *RECORD_MAGIC {
            return Err(invalid("record sentinel 'SIGR' not found at end"));
        }
        if tail[0] != RECORD_VERSION {
            return Err(ImageError::InvalidRecord(format!(
                "unsupported record version {}",
                tail[0]
            )));
        }
        let tlv_bytes = u16::from_le_bytes([tail[2], tail[3]]) as usize;
        let tlv_end = image.len() - TRAILER_LEN;
        let record_start = tlv_end
            .checked_sub(tlv_bytes)
            .ok_or_else(|| invalid("record length exceeds image"))?;
        let tlvs = &image[record_start..tlv_end];

        let mut algorithm = None;
        let mut key_id = None;
        let mut public_key = None;
        let mut range = None;
        let mut entry_point = None;
        let mut signature = None;

        // Walk TLVs backwards.
        let mut pos = tlvs.len();
        let mut count = 0;
        while pos > 0 {
            count += 1;
            if count > MAX_TLVS || pos < 4 {
                return Err(invalid("malformed TLV chain in record"));
            }
            let tlv_type = u16::from_le_bytes([tlvs[pos - 4], tlvs[pos - 3]]);
            let tlv_len = u16::from_le_bytes([tlvs[pos - 2], tlvs[pos - 1]]) as usize;
            if pos < 4 + tlv_len {
                return Err(invalid("malformed TLV chain in record"));
            }
            let value_start = pos - 4 - tlv_len;
            let value = &tlvs[value_start..pos - 4];

            let duplicate = match tlv_type {
                TLV_TYPE_ALGORITHM => {
                    let id = u32_value(tlv_type, value)?;
                    let alg = Algorithm::from_id(id).ok_or_else(|| {
                        ImageError::InvalidRecord(format!("unknown algorithm id {id}"))
                    })?;
                    algorithm.replace(alg).is_some()
                }
                TLV_TYPE_KEY_ID => {
                    let id: [u8; KEY_ID_LEN] = value
                        .try_into()
                        .map_err(|_| invalid("key id TLV has wrong length"))?;
                    key_id.replace(id).is_some()
                }
                TLV_TYPE_PUBLIC_KEY => public_key.replace(value.to_vec()).is_some(),
                TLV_TYPE_SIGNED_RANGE => {
                    if value.len() != 8 {
                        return Err(invalid("signed range TLV has wrong length"));
                    }
                    let start = u32_value(tlv_type, &value[..4])?;
                    let len = u32_value(tlv_type, &value[4..])?;
                    range
                        .replace(ByteRange::new(u64::from(start), u64::from(len)))
                        .is_some()
                }
                TLV_TYPE_ENTRY_POINT => entry_point.replace(u32_value(tlv_type, value)?).is_some(),
                TLV_TYPE_SIGNATURE => signature.replace(value.to_vec()).is_some(),
                other => {
                    debug!("record: skipping unknown TLV 0x{other:04x}");
                    false
                }
            };
            if duplicate {
                return Err(ImageError::InvalidRecord(format!(
                    "duplicate TLV 0x{tlv_type:04x}"
                )));
            }
            pos = value_start;
        }

        let algorithm = algorithm.ok_or_else(|| invalid("algorithm TLV missing"))?;
        let signature = signature.ok_or_else(|| invalid("signature TLV missing"))?;
        if signature.len() != algorithm.signature_len() {
            return Err(ImageError::InvalidRecord(format!(
                "{algorithm} signature is {} bytes, expected {}",
                signature.len(),
                algorithm.signature_len()
            )));
        }
        if let Some(pk) = &public_key {
            if pk.len() != algorithm.public_key_len() {
                return Err(invalid("embedded public key has wrong length"));
            }
        }

        let record = SignatureRecord {
            algorithm,
            key_id: key_id.ok_or_else(|| invalid("key id TLV missing"))?,
            public_key,
            range: range.ok_or_else(|| invalid("signed range TLV missing"))?,
            entry_point,
            signature,
        };
        Ok((record, record_start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SignatureRecord {
        SignatureRecord {
            algorithm: Algorithm::Ed25519,
            key_id: [1, 2, 3, 4, 5, 6, 7, 8],
            public_key: Some(vec![0xAB; 32]),
            range: ByteRange::new(0, 2048),
            entry_point: Some(0x4_0041),
            signature: vec![0x5A; 64],
        }
    }

    #[test]
    fn decodes_behind_image_bytes() {
        let mut image = vec![0xFFu8; 100];
        let record = sample();
        image.extend(record.encode().unwrap());

        let (decoded, start) = SignatureRecord::decode(&image).unwrap();
        assert_eq!(start, 100);
        assert_eq!(decoded, record);
    }

    #[test]
    fn trailer_layout() {
        let encoded = sample().encode().unwrap();
        assert_eq!(&encoded[encoded.len() - 4..], b"SIGR");
        assert_eq!(encoded[encoded.len() - 8], RECORD_VERSION);
        // Last TLV before the trailer is the signature.
        let hdr = &encoded[encoded.len() - 12..encoded.len() - 8];
        assert_eq!(u16::from_le_bytes([hdr[0], hdr[1]]), TLV_TYPE_SIGNATURE);
        assert_eq!(u16::from_le_bytes([hdr[2], hdr[3]]), 64);
    }

    #[test]
    fn attributes_exclude_the_signature() {
        let record = sample();
        let attributes = record.attributes().unwrap();
        let encoded = record.encode().unwrap();
        assert!(encoded.starts_with(&attributes));
        assert_eq!(encoded.len(), attributes.len() + 64 + 4 + TRAILER_LEN);

        let mut unsigned = record.clone();
        unsigned.signature.clear();
        assert_eq!(unsigned.attributes().unwrap(), attributes);

        let mut moved = record;
        moved.entry_point = Some(0xDEAD_BEEF);
        assert_ne!(moved.attributes().unwrap(), attributes);
    }

    #[test]
    fn missing_sentinel() {
        assert!(matches!(
            SignatureRecord::decode(&[0xFF; 64]),
            Err(ImageError::InvalidRecord(_))
        ));
    }

    #[test]
    fn truncated_record() {
        let encoded = sample().encode().unwrap();
        assert!(SignatureRecord::decode(&encoded[20..]).is_err());
    }

    #[test]
    fn wrong_signature_length() {
        let mut record = sample();
        record.signature.truncate(10);
        let encoded = record.encode().unwrap();
        assert!(matches!(
            SignatureRecord::decode(&encoded),
            Err(ImageError::InvalidRecord(msg)) if msg.contains("signature")
        ));
    }
}
