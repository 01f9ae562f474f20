// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Build flashable images for hotel boards.
//!
//! A kernel ELF gets its `.apps` section replaced by the application payload
//! ([`patcher`]), is flattened to the bytes that land in flash ([`elf`]),
//! signed over an explicit range ([`signer`]) and, on boards that flash the
//! bootloader together with the kernel, placed behind the bootloader
//! ([`composer`]). [`pipeline`] runs these steps from a per-board
//! configuration.

pub mod algorithm;
pub mod board;
pub mod composer;
pub mod config;
pub mod elf;
pub mod error;
pub mod image;
pub mod output;
pub mod patcher;
pub mod pipeline;
pub mod record;
pub mod section;
pub mod signer;
pub mod tbf;

pub use error::{ImageError, Result};
