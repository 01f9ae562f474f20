// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Command line front end: patch, sign, compose and verify hotel images.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use log::info;

use hotel_image::algorithm::{key_id, read_public_key, Algorithm, LoadedKey};
use hotel_image::board::AppFormat;
use hotel_image::composer::{compose, ComposeOptions, ComposePart, DEFAULT_MAX_GAP};
use hotel_image::config::PipelineConfig;
use hotel_image::elf;
use hotel_image::image::{BinaryImage, ByteRange};
use hotel_image::output::write_atomic;
use hotel_image::patcher::{patch_section, PatchOptions, PatchRequest};
use hotel_image::pipeline::Pipeline;
use hotel_image::section::SectionFlags;
use hotel_image::signer::{sign_with_key, verify_image, RegionKind, SignOptions, SigningRange};
use hotel_image::ImageError;

#[derive(Parser, Debug)]
#[command(name = "hotel-image", author, version)]
#[command(about = "Patch, sign and compose flashable firmware images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replace an ELF section's contents with a payload.
    Patch {
        /// Kernel ELF to patch.
        #[arg(long)]
        target: PathBuf,
        #[arg(long, default_value = ".apps")]
        section: String,
        /// Application payload (raw blob or concatenated TBFs).
        #[arg(long)]
        payload: PathBuf,
        /// Comma separated subset of alloc, code, contents.
        #[arg(long, default_value = "alloc,code,contents")]
        flags: SectionFlags,
        /// Output path; defaults to in-place overwrite of the target.
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value = "512", value_parser = parse_number)]
        alignment: u64,
        #[arg(long, default_value = "0x20000", value_parser = parse_number)]
        max_payload: u64,
        #[arg(long, default_value = "raw")]
        app_format: AppFormat,
        #[arg(long, default_value = "0xff", value_parser = parse_byte)]
        fill: u8,
    },
    /// Sign an image and append a signature record.
    Sign {
        /// ELF (flattened first) or flat binary.
        #[arg(long)]
        input: PathBuf,
        /// PKCS#8 PEM or hex-encoded private key.
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "ecdsa-p256")]
        algorithm: Algorithm,
        /// Signed bytes as `start:len` image offsets; whole image by default.
        #[arg(long, conflicts_with = "exclude_reserved", value_parser = parse_range)]
        range: Option<ByteRange>,
        /// Sign everything after this many reserved bytes.
        #[arg(long, value_parser = parse_number)]
        exclude_reserved: Option<u64>,
        /// Address range (`start:len`) rewritten by a later step.
        #[arg(long, value_parser = parse_range)]
        mutable: Vec<ByteRange>,
        #[arg(long, default_value = "code")]
        region_kind: RegionKind,
        #[arg(long)]
        embed_public_key: bool,
        /// Load address of a flat binary input.
        #[arg(long, value_parser = parse_number)]
        base: Option<u64>,
        #[arg(long, default_value = "2048", value_parser = parse_number)]
        granularity: u64,
        #[arg(long, default_value = "0xff", value_parser = parse_byte)]
        fill: u8,
    },
    /// Place flat images at their addresses in one image.
    Compose {
        /// `file:address` pairs, e.g. `bootloader.bin:0x40000,kernel.signed:0x44000`.
        #[arg(long, value_delimiter = ',', required = true, value_parser = parse_part)]
        parts: Vec<(PathBuf, u64)>,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, value_parser = parse_number)]
        origin: Option<u64>,
        #[arg(long, default_value = "2048", value_parser = parse_number)]
        granularity: u64,
        /// Largest fill run between parts; 64 MiB by default.
        #[arg(long, value_parser = parse_number)]
        max_gap: Option<u64>,
        #[arg(long, default_value = "0xff", value_parser = parse_byte)]
        fill: u8,
    },
    /// Check the signature record of a signed image.
    Verify {
        #[arg(long)]
        input: PathBuf,
        /// File holding the hex public key; the embedded key is used otherwise.
        #[arg(long)]
        public_key: Option<PathBuf>,
        /// Offset of the signed image inside a composed one.
        #[arg(long, default_value = "0", value_parser = parse_number)]
        offset: u64,
    },
    /// Print the hex public key for a private key.
    PublicKey {
        #[arg(long)]
        key: PathBuf,
        #[arg(long, default_value = "ecdsa-p256")]
        algorithm: Algorithm,
    },
    /// List the sections of an ELF.
    Sections {
        #[arg(long)]
        input: PathBuf,
    },
    /// Run a board's configured stages over a kernel ELF.
    Pipeline {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        kernel: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
}

fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("`{s}` is not a number: {e}"))
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let value = parse_number(s)?;
    u8::try_from(value).map_err(|_| format!("{value} does not fit in a byte"))
}

fn parse_range(s: &str) -> Result<ByteRange, String> {
    let (start, len) = s
        .split_once(':')
        .ok_or_else(|| format!("`{s}` is not `start:len`"))?;
    Ok(ByteRange::new(parse_number(start)?, parse_number(len)?))
}

fn parse_part(s: &str) -> Result<(PathBuf, u64), String> {
    let (file, addr) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("`{s}` is not `file:address`"))?;
    Ok((PathBuf::from(file), parse_number(addr)?))
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(exit_code(&err))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(image_err) = cause.downcast_ref::<ImageError>() {
            return image_err.exit_code();
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return 74;
        }
    }
    1
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Patch {
            target,
            section,
            payload,
            flags,
            output,
            alignment,
            max_payload,
            app_format,
            fill,
        } => {
            let out_path = output.unwrap_or_else(|| target.clone());
            let kernel = read(&target)?;
            let payload = read(&payload)?;
            let request = PatchRequest {
                section: &section,
                payload: &payload,
                flags,
            };
            let options = PatchOptions {
                alignment,
                max_payload: usize::try_from(max_payload).context("max payload")?,
                fill,
                app_format,
            };
            let outcome = patch_section(&kernel, &request, &options)?;
            write_atomic(&out_path, &outcome.bytes)?;
            println!("Patched kernel saved to {}", out_path.display());
        }

        Command::Sign {
            input,
            key,
            output,
            algorithm,
            range,
            exclude_reserved,
            mutable,
            region_kind,
            embed_public_key,
            base,
            granularity,
            fill,
        } => {
            let bytes = read(&input)?;
            let (image, sections) = if elf::is_elf(&bytes) {
                let flat = elf::flatten(&bytes, fill)?;
                (flat.image, flat.sections)
            } else {
                (BinaryImage::new(bytes, base.unwrap_or(0)), Vec::new())
            };
            let range = match (range, exclude_reserved) {
                (Some(r), _) => SigningRange::Explicit {
                    start: r.start,
                    len: r.len,
                },
                (None, Some(len)) => SigningRange::ExcludeReserved { len },
                (None, None) => SigningRange::Whole,
            };
            let options = SignOptions {
                range,
                region_kind,
                mutable_regions: mutable,
                granularity,
                fill,
                embed_public_key,
                sections,
            };
            let signed = {
                let key = LoadedKey::from_file(&key, algorithm)?;
                sign_with_key(&image, &key, &options)?
            };
            write_atomic(&output, signed.image.bytes())?;
            println!("Signed image saved to {}", output.display());
        }

        Command::Compose {
            parts,
            output,
            origin,
            granularity,
            max_gap,
            fill,
        } => {
            let parts = parts
                .into_iter()
                .map(|(path, base)| {
                    let bytes = read(&path)?;
                    Ok(ComposePart::new(
                        path.display().to_string(),
                        BinaryImage::new(bytes, base),
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            let options = ComposeOptions {
                origin,
                granularity,
                max_gap: max_gap.unwrap_or(DEFAULT_MAX_GAP),
                fill,
            };
            let image = compose(&parts, &options)?;
            write_atomic(&output, image.bytes())?;
            println!("Composed image saved to {}", output.display());
        }

        Command::Verify {
            input,
            public_key,
            offset,
        } => {
            let bytes = read(&input)?;
            let signed = usize::try_from(offset)
                .ok()
                .and_then(|off| bytes.get(off..))
                .ok_or_else(|| anyhow!("offset 0x{offset:x} is past the end of {}", input.display()))?;
            let public_key = public_key.as_deref().map(read_public_key).transpose()?;
            let record = verify_image(signed, public_key.as_deref())?;
            println!(
                "{}: {} signature over {} is valid",
                input.display(),
                record.algorithm,
                record.range
            );
        }

        Command::PublicKey { key, algorithm } => {
            let key = LoadedKey::from_file(&key, algorithm)?;
            let public_key = key.public_key();
            info!("key id {}", hex::encode(key_id(&public_key)));
            println!("{}", hex::encode(public_key));
        }

        Command::Sections { input } => {
            let bytes = read(&input)?;
            println!(
                "{:<20} {:>10} {:>10} {:>10} {:>6}  flags",
                "name", "offset", "size", "address", "align"
            );
            for s in elf::sections(&bytes)? {
                println!(
                    "{:<20} 0x{:08x} 0x{:08x} 0x{:08x} {:>6}  {}",
                    s.name, s.offset, s.size, s.address, s.align, s.flags
                );
            }
        }

        Command::Pipeline {
            config,
            kernel,
            output,
        } => {
            let config = PipelineConfig::from_file(&config)?;
            let kernel = read(&kernel)?;
            let mut pipeline = Pipeline::new(config)?;
            let report = pipeline.run(&kernel)?;
            write_atomic(&output, report.artifact.bytes())?;
            println!("Image saved to {}", output.display());
        }
    }
    Ok(())
}
