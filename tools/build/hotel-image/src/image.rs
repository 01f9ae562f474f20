// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Flat binary images and the byte ranges used to describe them.

use std::fmt;

use crate::error::{ImageError, Result};

/// Erased flash reads as all ones.
pub const ERASED_FLASH: u8 = 0xFF;

/// A half-open range `[start, start + len)` of bytes or addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

impl ByteRange {
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value < self.end()
    }

    /// True if both ranges share at least one byte.
    pub fn intersects(&self, other: &ByteRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }

    pub fn intersection(&self, other: &ByteRange) -> Option<ByteRange> {
        if !self.intersects(other) {
            return None;
        }
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        Some(ByteRange::new(start, end - start))
    }

    /// Shift the range down by `origin`, e.g. to turn addresses into offsets.
    pub fn relative_to(&self, origin: u64) -> ByteRange {
        ByteRange::new(self.start - origin, self.len)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}..0x{:08x}", self.start, self.end())
    }
}

pub fn is_power_of_two(value: u64) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Largest program granularity or alignment unit accepted anywhere.
pub const MAX_GRANULARITY: u64 = 1024 * 1024;

/// Round `value` up to the next multiple of `align` (a power of two, or 0/1
/// for no alignment). `None` on overflow.
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    if align <= 1 {
        return Some(value);
    }
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Accept 0 or 1 (no padding) or a power of two up to [`MAX_GRANULARITY`].
pub fn check_granularity(what: &str, value: u64) -> Result<()> {
    if value > 1 && !is_power_of_two(value) {
        return Err(ImageError::Config(format!("{what} {value} is not a power of two")));
    }
    if value > MAX_GRANULARITY {
        return Err(ImageError::Config(format!(
            "{what} {value} exceeds the {MAX_GRANULARITY}-byte ceiling"
        )));
    }
    Ok(())
}

/// An ordered sequence of bytes loaded at a fixed base address.
#[derive(Clone, PartialEq, Eq)]
pub struct BinaryImage {
    bytes: Vec<u8>,
    base: u64,
}

impl BinaryImage {
    pub fn new(bytes: Vec<u8>, base: u64) -> Self {
        Self { bytes, base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Address range covered by the image.
    pub fn address_range(&self) -> ByteRange {
        ByteRange::new(self.base, self.bytes.len() as u64)
    }

    /// Read a little-endian word at `offset`, if it lies inside the image.
    pub fn read_u32(&self, offset: u64) -> Option<u32> {
        let off = usize::try_from(offset).ok()?;
        let word = self.bytes.get(off..off.checked_add(4)?)?;
        Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
    }
}

impl fmt::Debug for BinaryImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryImage")
            .field("base", &format_args!("0x{:08x}", self.base))
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 512), Some(0));
        assert_eq!(align_up(1, 512), Some(512));
        assert_eq!(align_up(400, 512), Some(512));
        assert_eq!(align_up(512, 512), Some(512));
        assert_eq!(align_up(513, 512), Some(1024));
        assert_eq!(align_up(100, 0), Some(100));
        assert_eq!(align_up(100, 1), Some(100));
        assert_eq!(align_up(u64::MAX - 10, 2048), None);
        assert_eq!(align_up(1, 1 << 63), Some(1 << 63));
    }

    #[test]
    fn test_granularity_ceiling() {
        assert!(check_granularity("granularity", 0).is_ok());
        assert!(check_granularity("granularity", 2048).is_ok());
        assert!(check_granularity("granularity", MAX_GRANULARITY).is_ok());
        for bad in [1000, MAX_GRANULARITY * 2, 1 << 63] {
            assert!(matches!(
                check_granularity("granularity", bad),
                Err(ImageError::Config(_))
            ));
        }
    }

    #[test]
    fn test_range_intersection() {
        let a = ByteRange::new(0, 1024);
        let b = ByteRange::new(1024, 4096);
        assert!(!a.intersects(&b));
        let c = ByteRange::new(1000, 100);
        assert_eq!(a.intersection(&c), Some(ByteRange::new(1000, 24)));
        assert!(!a.intersects(&ByteRange::new(10, 0)));
    }

    #[test]
    fn test_read_u32_bounds() {
        let image = BinaryImage::new(vec![1, 0, 0, 0, 0xFF, 0xFF], 0x4_0000);
        assert_eq!(image.read_u32(0), Some(1));
        assert_eq!(image.read_u32(4), None);
        assert_eq!(image.read_u32(u64::MAX), None);
        assert_eq!(image.address_range(), ByteRange::new(0x4_0000, 6));
    }

    #[test]
    fn test_range_display() {
        assert_eq!(ByteRange::new(0x8000, 0x100).to_string(), "0x00008000..0x00008100");
    }
}
