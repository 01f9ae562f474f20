// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Signature algorithms understood by the bootloader.
//!
//! Each algorithm implements [`SignatureAlgorithm`]; the signer is generic
//! over it and nothing else in the crate depends on a concrete scheme.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{ImageError, Result};

pub const KEY_ID_LEN: usize = 8;

pub trait SignatureAlgorithm {
    type PrivateKey;

    /// Identifier stored in the signature record.
    const ID: u32;
    const NAME: &'static str;
    const SIGNATURE_LEN: usize;
    const PUBLIC_KEY_LEN: usize;

    /// Parse a PKCS#8 PEM key or a hex-encoded 32-byte secret.
    fn load_private_key(text: &str) -> Result<Self::PrivateKey>;

    /// Raw public key bytes, as embedded in records and printed by `public-key`.
    fn public_key(key: &Self::PrivateKey) -> Vec<u8>;

    fn sign(key: &Self::PrivateKey, message: &[u8]) -> Result<Vec<u8>>;

    fn verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

fn is_pem(text: &str) -> bool {
    text.trim_start().starts_with("-----BEGIN")
}

fn decode_secret(text: &str) -> Result<Zeroizing<[u8; 32]>> {
    let raw = Zeroizing::new(
        hex::decode(text.trim())
            .map_err(|e| ImageError::KeyLoadError(format!("not PEM and not hex: {e}")))?,
    );
    if raw.len() != 32 {
        return Err(ImageError::KeyLoadError(format!(
            "hex secret must be 32 bytes, got {}",
            raw.len()
        )));
    }
    let mut secret = Zeroizing::new([0u8; 32]);
    secret.copy_from_slice(&raw);
    Ok(secret)
}

/// ECDSA over NIST P-256, signing the SHA-256 digest of the message.
pub struct EcdsaP256Sha256;

impl SignatureAlgorithm for EcdsaP256Sha256 {
    type PrivateKey = p256::ecdsa::SigningKey;

    const ID: u32 = 1;
    const NAME: &'static str = "ecdsa-p256";
    const SIGNATURE_LEN: usize = 64;
    const PUBLIC_KEY_LEN: usize = 64;

    fn load_private_key(text: &str) -> Result<Self::PrivateKey> {
        use p256::pkcs8::DecodePrivateKey;

        if is_pem(text) {
            return p256::ecdsa::SigningKey::from_pkcs8_pem(text.trim())
                .map_err(|e| ImageError::KeyLoadError(format!("P-256 PKCS#8: {e}")));
        }
        let secret = decode_secret(text)?;
        p256::ecdsa::SigningKey::from_slice(&secret[..])
            .map_err(|e| ImageError::KeyLoadError(format!("P-256 scalar: {e}")))
    }

    fn public_key(key: &Self::PrivateKey) -> Vec<u8> {
        // Uncompressed SEC1 without the leading 0x04: x || y.
        let point = key.verifying_key().to_encoded_point(false);
        point.as_bytes()[1..].to_vec()
    }

    fn sign(key: &Self::PrivateKey, message: &[u8]) -> Result<Vec<u8>> {
        use p256::ecdsa::signature::hazmat::PrehashSigner;
        use p256::ecdsa::Signature;

        let digest = Sha256::digest(message);
        let sig: Signature = key
            .sign_prehash(&digest)
            .map_err(|e| ImageError::SigningFailed(format!("P-256 sign_prehash: {e}")))?;
        Ok(sig.to_bytes().to_vec())
    }

    fn verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;
        use p256::ecdsa::{Signature, VerifyingKey};

        if public_key.len() != Self::PUBLIC_KEY_LEN {
            return false;
        }
        let mut sec1 = Vec::with_capacity(65);
        sec1.push(0x04);
        sec1.extend_from_slice(public_key);
        let Ok(vk) = VerifyingKey::from_sec1_bytes(&sec1) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        let digest = Sha256::digest(message);
        vk.verify_prehash(&digest, &sig).is_ok()
    }
}

pub struct Ed25519;

impl SignatureAlgorithm for Ed25519 {
    type PrivateKey = ed25519_dalek::SigningKey;

    const ID: u32 = 2;
    const NAME: &'static str = "ed25519";
    const SIGNATURE_LEN: usize = 64;
    const PUBLIC_KEY_LEN: usize = 32;

    fn load_private_key(text: &str) -> Result<Self::PrivateKey> {
        use ed25519_dalek::pkcs8::DecodePrivateKey;

        if is_pem(text) {
            return ed25519_dalek::SigningKey::from_pkcs8_pem(text.trim())
                .map_err(|e| ImageError::KeyLoadError(format!("Ed25519 PKCS#8: {e}")));
        }
        let seed = decode_secret(text)?;
        Ok(ed25519_dalek::SigningKey::from_bytes(&seed))
    }

    fn public_key(key: &Self::PrivateKey) -> Vec<u8> {
        key.verifying_key().to_bytes().to_vec()
    }

    fn sign(key: &Self::PrivateKey, message: &[u8]) -> Result<Vec<u8>> {
        use ed25519_dalek::Signer;

        Ok(key.sign(message).to_bytes().to_vec())
    }

    fn verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(pk) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&pk) else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
            return false;
        };
        vk.verify_strict(message, &sig).is_ok()
    }
}

/// Runtime selector for the shipped algorithms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl Algorithm {
    pub const ALL: [Algorithm; 2] = [Algorithm::EcdsaP256, Algorithm::Ed25519];

    pub fn id(self) -> u32 {
        match self {
            Algorithm::EcdsaP256 => EcdsaP256Sha256::ID,
            Algorithm::Ed25519 => Ed25519::ID,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::EcdsaP256 => EcdsaP256Sha256::NAME,
            Algorithm::Ed25519 => Ed25519::NAME,
        }
    }

    pub fn signature_len(self) -> usize {
        match self {
            Algorithm::EcdsaP256 => EcdsaP256Sha256::SIGNATURE_LEN,
            Algorithm::Ed25519 => Ed25519::SIGNATURE_LEN,
        }
    }

    pub fn public_key_len(self) -> usize {
        match self {
            Algorithm::EcdsaP256 => EcdsaP256Sha256::PUBLIC_KEY_LEN,
            Algorithm::Ed25519 => Ed25519::PUBLIC_KEY_LEN,
        }
    }

    pub fn verify(self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        match self {
            Algorithm::EcdsaP256 => EcdsaP256Sha256::verify(message, signature, public_key),
            Algorithm::Ed25519 => Ed25519::verify(message, signature, public_key),
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ecdsa-p256" | "p256" => Ok(Algorithm::EcdsaP256),
            "ed25519" => Ok(Algorithm::Ed25519),
            other => Err(format!(
                "unknown algorithm `{other}` (expected ecdsa-p256 or ed25519)"
            )),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// First eight bytes of SHA-256 over the raw public key.
pub fn key_id(public_key: &[u8]) -> [u8; KEY_ID_LEN] {
    let digest = Sha256::digest(public_key);
    let mut id = [0u8; KEY_ID_LEN];
    id.copy_from_slice(&digest[..KEY_ID_LEN]);
    id
}

/// Read a hex-encoded raw public key (P-256 `x || y` or Ed25519) from `path`.
pub fn read_public_key(path: &Path) -> Result<Vec<u8>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ImageError::KeyLoadError(format!("cannot read {}: {e}", path.display()))
    })?;
    let key = hex::decode(text.trim()).map_err(|e| {
        ImageError::KeyLoadError(format!("{} does not hold a hex public key: {e}", path.display()))
    })?;
    if !Algorithm::ALL.iter().any(|a| a.public_key_len() == key.len()) {
        return Err(ImageError::KeyLoadError(format!(
            "{}: {}-byte public key matches no algorithm",
            path.display(),
            key.len()
        )));
    }
    Ok(key)
}

/// A private key for one of the shipped algorithms. Both inner key types
/// wipe their secret on drop.
pub enum LoadedKey {
    P256(p256::ecdsa::SigningKey),
    Ed25519(ed25519_dalek::SigningKey),
}

impl LoadedKey {
    pub fn parse(text: &str, algorithm: Algorithm) -> Result<Self> {
        Ok(match algorithm {
            Algorithm::EcdsaP256 => LoadedKey::P256(EcdsaP256Sha256::load_private_key(text)?),
            Algorithm::Ed25519 => LoadedKey::Ed25519(Ed25519::load_private_key(text)?),
        })
    }

    pub fn from_file(path: &Path, algorithm: Algorithm) -> Result<Self> {
        let text = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            ImageError::KeyLoadError(format!("cannot read {}: {e}", path.display()))
        })?);
        Self::parse(&text, algorithm)
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            LoadedKey::P256(_) => Algorithm::EcdsaP256,
            LoadedKey::Ed25519(_) => Algorithm::Ed25519,
        }
    }

    pub fn public_key(&self) -> Vec<u8> {
        match self {
            LoadedKey::P256(key) => EcdsaP256Sha256::public_key(key),
            LoadedKey::Ed25519(key) => Ed25519::public_key(key),
        }
    }
}

impl fmt::Debug for LoadedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LoadedKey({}, id {})",
            self.algorithm(),
            hex::encode(key_id(&self.public_key()))
        )
    }
}
