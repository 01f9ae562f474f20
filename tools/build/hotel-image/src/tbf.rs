// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Tock Binary Format checks for application payloads.
//!
//! Apps are stored back-to-back; each starts with a base header
//! `[version:2][header_size:2][total_size:4][flags:4][checksum:4]` followed by
//! TLVs. The kernel walks the chain until it hits a header it cannot parse,
//! so anything after the last app must be erased or zeroed flash.

use log::debug;

use crate::error::{ImageError, Result};

const TBF_VERSION: u16 = 2;
const BASE_HEADER_LEN: usize = 16;
const CHECKSUM_WORD: usize = 3;

const TLV_PACKAGE_NAME: u16 = 3;

const FLAG_ENABLED: u32 = 1 << 0;

/// One application found in a TBF payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TbfApp {
    pub offset: usize,
    pub header_size: usize,
    pub total_size: usize,
    pub enabled: bool,
    pub package_name: Option<String>,
}

fn u16_at(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

fn u32_at(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

fn is_filler(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0xFF) || data.iter().all(|&b| b == 0x00)
}

/// XOR of every header word, with the checksum word taken as zero.
pub fn header_checksum(header: &[u8]) -> u32 {
    header
        .chunks_exact(4)
        .enumerate()
        .filter(|(i, _)| *i != CHECKSUM_WORD)
        .fold(0, |acc, (_, w)| acc ^ u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
}

/// Walk the TBF chain in `payload` and return the apps it describes.
pub fn validate(payload: &[u8]) -> Result<Vec<TbfApp>> {
    let mut apps = Vec::new();
    let mut offset = 0usize;

    while offset < payload.len() {
        let rest = &payload[offset..];
        let invalid = |reason: String| ImageError::InvalidPayload { offset, reason };

        if rest.len() < BASE_HEADER_LEN {
            if is_filler(rest) {
                break;
            }
            return Err(invalid(format!("{} trailing bytes are not a TBF header", rest.len())));
        }

        let version = u16_at(rest, 0);
        if version != TBF_VERSION {
            // End of the app list.
            if is_filler(rest) {
                break;
            }
            return Err(invalid(format!("unsupported TBF version {version}")));
        }

        let header_size = u16_at(rest, 2) as usize;
        let total_size = u32_at(rest, 4) as usize;
        if header_size < BASE_HEADER_LEN || header_size % 4 != 0 {
            return Err(invalid(format!("bad header size {header_size}")));
        }
        if total_size < header_size {
            return Err(invalid(format!(
                "total size {total_size} smaller than header size {header_size}"
            )));
        }
        if total_size > rest.len() {
            return Err(invalid(format!(
                "app of {total_size} bytes runs past the end of the payload"
            )));
        }

        let header = &rest[..header_size];
        let flags = u32_at(header, 8);
        let stored = u32_at(header, 12);
        let computed = header_checksum(header);
        if stored != computed {
            return Err(invalid(format!(
                "header checksum 0x{stored:08x}, expected 0x{computed:08x}"
            )));
        }

        let package_name = package_name(header).map_err(invalid)?;
        debug!(
            "tbf: app {:?} at 0x{offset:x}, {total_size} bytes",
            package_name.as_deref().unwrap_or("<unnamed>")
        );

        apps.push(TbfApp {
            offset,
            header_size,
            total_size,
            enabled: flags & FLAG_ENABLED != 0,
            package_name,
        });
        offset += total_size;
    }

    Ok(apps)
}

/// Scan the header TLVs for a package name.
fn package_name(header: &[u8]) -> core::result::Result<Option<String>, String> {
    let mut pos = BASE_HEADER_LEN;
    while pos + 4 <= header.len() {
        let tlv_type = u16_at(header, pos);
        let tlv_len = u16_at(header, pos + 2) as usize;
        let value_start = pos + 4;
        let value_end = value_start + tlv_len;
        if value_end > header.len() {
            return Err(format!("TLV 0x{tlv_type:04x} runs past the header"));
        }
        if tlv_type == TLV_PACKAGE_NAME {
            let name = String::from_utf8_lossy(&header[value_start..value_end]);
            return Ok(Some(name.trim_end_matches('\0').to_string()));
        }
        pos = value_start + ((tlv_len + 3) & !3);
    }
    Ok(None)
}
