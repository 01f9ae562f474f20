// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

mod common;

use std::path::{Path, PathBuf};

use common::{board_kernel, kernel_elf, tbf_app, write, KernelLayout, P256_PEM};
use hotel_image::algorithm::{Algorithm, EcdsaP256Sha256, SignatureAlgorithm};
use hotel_image::board::{BoardProfile, BoardVariant};
use hotel_image::config::{ComposeStage, PatchStage, PipelineConfig, SignStage, StageConfig};
use hotel_image::error::StageKind;
use hotel_image::pipeline::{Artifact, Pipeline, PipelineState};
use hotel_image::section::SectionFlags;
use hotel_image::signer::{verify_image, RegionKind};
use hotel_image::ImageError;

struct Inputs {
    _dir: tempfile::TempDir,
    payload: PathBuf,
    key: PathBuf,
    bootloader: PathBuf,
}

fn inputs(payload: &[u8]) -> Inputs {
    let dir = tempfile::tempdir().unwrap();
    Inputs {
        payload: write(dir.path(), "app.bin", payload),
        key: write(dir.path(), "key.pem", P256_PEM),
        bootloader: write(dir.path(), "bootloader.bin", vec![0xB0u8; 3000]),
        _dir: dir,
    }
}

fn patch(payload: &Path) -> StageConfig {
    StageConfig::Patch(PatchStage {
        section: ".apps".into(),
        payload: payload.to_path_buf(),
        flags: SectionFlags::ALLOC | SectionFlags::CONTENTS,
    })
}

fn sign(key: &Path, region_kind: Option<RegionKind>) -> StageConfig {
    StageConfig::Sign(SignStage {
        key: key.to_path_buf(),
        algorithm: Algorithm::EcdsaP256,
        range: None,
        region_kind,
        embed_public_key: false,
    })
}

fn compose(bootloader: &Path) -> StageConfig {
    StageConfig::Compose(ComposeStage {
        bootloader: bootloader.to_path_buf(),
        origin: None,
        max_gap: None,
    })
}

fn golf2(inputs: &Inputs) -> PipelineConfig {
    PipelineConfig::new(
        BoardProfile::for_variant(BoardVariant::Golf2),
        vec![
            patch(&inputs.payload),
            sign(&inputs.key, None),
            compose(&inputs.bootloader),
        ],
    )
}

fn public_key() -> Vec<u8> {
    EcdsaP256Sha256::public_key(&EcdsaP256Sha256::load_private_key(P256_PEM).unwrap())
}

fn tbf_payload() -> Vec<u8> {
    let mut payload = tbf_app(512, "blink");
    payload.extend(tbf_app(256, "console"));
    payload
}

#[test]
fn golf2_builds_bootloader_plus_signed_kernel() {
    let inputs = inputs(&tbf_payload());
    let (_, kernel) = board_kernel();
    let mut pipeline = Pipeline::new(golf2(&inputs)).unwrap();
    let report = pipeline.run(&kernel).unwrap();

    assert_eq!(pipeline.state(), PipelineState::Composed);
    let states: Vec<_> = report.stages.iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        [PipelineState::Patched, PipelineState::Signed, PipelineState::Composed]
    );

    let Artifact::Flat(image) = &report.artifact else {
        panic!("expected a flat image");
    };
    let bytes = image.bytes();
    assert_eq!(image.base(), 0x4_0000);
    assert_eq!(bytes.len() % 2048, 0);
    assert_eq!(&bytes[..3000], &[0xB0; 3000][..]);
    assert!(bytes[3000..0x4000].iter().all(|&b| b == 0xFF));

    // Kernel .text, then the TBF payload patched into .apps.
    assert_eq!(&bytes[0x4000 + 4..0x4000 + 8], &0x4_4041u32.to_le_bytes());
    assert_eq!(&bytes[0x4800..0x4800 + 768], &tbf_payload()[..]);

    let record = verify_image(&bytes[0x4000..], Some(&public_key())).unwrap();
    assert_eq!(record.entry_point, None, "golf2 signs its region as data");
    assert_eq!(record.range.start, 0);
    assert_eq!(record, report.record.unwrap());
}

#[test]
fn golf_signs_code_without_bootloader() {
    let inputs = inputs(&[0x42; 100]);
    let (_, kernel) = board_kernel();
    let config = PipelineConfig::new(
        BoardProfile::for_variant(BoardVariant::Golf),
        vec![patch(&inputs.payload), sign(&inputs.key, None)],
    );
    let report = Pipeline::new(config).unwrap().run(&kernel).unwrap();

    let Artifact::Flat(image) = &report.artifact else {
        panic!("expected a flat image");
    };
    assert_eq!(image.base(), 0x4_4000);
    let record = verify_image(image.bytes(), Some(&public_key())).unwrap();
    assert_eq!(record.entry_point, Some(0x4_4041));
    // 2 KiB of code, then .apps padded to the 2 KiB app alignment.
    assert_eq!(record.range.len, 4096);
    assert_eq!(&image.bytes()[2048..2148], &[0x42; 100][..]);
}

#[test]
fn identical_inputs_give_identical_images() {
    let inputs = inputs(&tbf_payload());
    let (_, kernel) = board_kernel();

    let first = Pipeline::new(golf2(&inputs)).unwrap().run(&kernel).unwrap();
    let second = Pipeline::new(golf2(&inputs)).unwrap().run(&kernel).unwrap();
    assert_eq!(first.artifact, second.artifact);

    let parallel: Vec<Artifact> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let mut pipeline = Pipeline::new(golf2(&inputs)).unwrap();
                let kernel = &kernel;
                s.spawn(move || pipeline.run(kernel).unwrap().artifact)
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(parallel[0], first.artifact);
    assert_eq!(parallel[1], first.artifact);
}

#[test]
fn contract_violations_fail_before_running() {
    let inputs = inputs(&tbf_payload());
    let golf2 = BoardProfile::for_variant(BoardVariant::Golf2);
    let golf = BoardProfile::for_variant(BoardVariant::Golf);

    let plans = [
        (golf2.clone(), vec![compose(&inputs.bootloader), sign(&inputs.key, None)]),
        (golf2.clone(), vec![sign(&inputs.key, None), patch(&inputs.payload), compose(&inputs.bootloader)]),
        (golf2, vec![patch(&inputs.payload), sign(&inputs.key, None)]),
        (golf, vec![patch(&inputs.payload), sign(&inputs.key, None), compose(&inputs.bootloader)]),
    ];
    for (board, stages) in plans {
        let err = Pipeline::new(PipelineConfig::new(board, stages)).err().unwrap();
        assert!(matches!(err, ImageError::PipelineContractViolation { .. }), "{err}");
        assert_eq!(err.exit_code(), 40);
    }
}

#[test]
fn marking_a_data_region_as_code_fails_the_entry_search() {
    let inputs = inputs(&[]);
    // A flat blob at the kernel base with no vector table in front.
    let blob = vec![0xA5u8; 2048];
    let board = BoardProfile::for_variant(BoardVariant::Golf2);

    let as_code = PipelineConfig::new(
        board.clone(),
        vec![sign(&inputs.key, Some(RegionKind::Code)), compose(&inputs.bootloader)],
    );
    let mut pipeline = Pipeline::new(as_code).unwrap();
    let err = pipeline.run(&blob).unwrap_err();
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(matches!(
        &err,
        ImageError::Stage { stage: StageKind::Sign, source }
            if matches!(**source, ImageError::EntryPointNotFound { .. })
    ));
    assert_eq!(err.exit_code(), 23);

    let as_data = PipelineConfig::new(
        board,
        vec![sign(&inputs.key, Some(RegionKind::Data)), compose(&inputs.bootloader)],
    );
    Pipeline::new(as_data).unwrap().run(&blob).unwrap();
}

#[test]
fn kernel_linked_at_wrong_base() {
    let inputs = inputs(&tbf_payload());
    let kernel = kernel_elf(KernelLayout {
        base: 0x4_8000,
        text_len: 2048,
        apps_len: 1024,
    });
    let mut pipeline = Pipeline::new(golf2(&inputs)).unwrap();
    let err = pipeline.run(&kernel).unwrap_err();
    assert!(matches!(
        err.root(),
        ImageError::BaseAddressMismatch { expected: 0x4_4000, actual: 0x4_8000, .. }
    ));
    assert!(matches!(err, ImageError::Stage { stage: StageKind::Compose, .. }));
    assert_eq!(err.exit_code(), 32);
    assert_eq!(pipeline.state(), PipelineState::Failed);
}

#[test]
fn missing_inputs_name_the_stage() {
    let inputs = inputs(&tbf_payload());
    let (_, kernel) = board_kernel();

    let mut config = golf2(&inputs);
    config.stages[1] = sign(&inputs.key.with_file_name("absent.pem"), None);
    let err = Pipeline::new(config).unwrap().run(&kernel).unwrap_err();
    assert!(matches!(err, ImageError::Stage { stage: StageKind::Sign, .. }));
    assert_eq!(err.exit_code(), 20);

    let mut config = golf2(&inputs);
    config.stages[0] = patch(&inputs.payload.with_file_name("absent.tbf"));
    let err = Pipeline::new(config).unwrap().run(&kernel).unwrap_err();
    assert!(err.to_string().starts_with("patch stage failed"));
    assert_eq!(err.exit_code(), 74);
}

#[test]
fn runs_from_a_config_file() {
    let inputs = inputs(&tbf_payload());
    let dir = inputs.payload.parent().unwrap();
    let config_path = write(
        dir,
        "golf2.toml",
        r#"
[board]
variant = "golf2"

[[stages]]
kind = "patch"
payload = "app.bin"
flags = "alloc,contents"

[[stages]]
kind = "sign"
key = "key.pem"
embed_public_key = true

[[stages]]
kind = "compose"
bootloader = "bootloader.bin"
max_gap = 0x4000
"#,
    );
    let config = PipelineConfig::from_file(&config_path).unwrap();
    let (_, kernel) = board_kernel();
    let report = Pipeline::new(config).unwrap().run(&kernel).unwrap();
    let expected = Pipeline::new(golf2(&inputs)).unwrap().run(&kernel).unwrap();

    // Same layout; only the embedded public key differs.
    assert_eq!(report.artifact.bytes().len(), expected.artifact.bytes().len());
    verify_image(&report.artifact.bytes()[0x4000..], None).unwrap();
}
