//! Ed25519 ballot signing helpers.
//!
//! Keys and signatures travel as base64 strings.  Verification fails closed:
//! [`verify`] answers `false` for malformed keys or signatures instead of
//! surfacing an error to the caller.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand_core::OsRng;
use sha2::{Digest, Sha512};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Describes how an ed25519 key should be obtained.
#[derive(Debug, Clone)]
pub enum Ed25519KeySource {
    /// Deterministic key derived from an `ed25519://` seed string.
    Seed(String),
    /// Load the secret key material from the provided file path.
    File(PathBuf),
    /// Use a freshly generated random key.
    Random,
}

impl Ed25519KeySource {
    /// Parses a `--key` style argument into a concrete key source.
    pub fn from_spec(spec: Option<&str>) -> Self {
        match spec {
            Some(value) if value.starts_with("ed25519://") => {
                Self::Seed(value.trim_start_matches("ed25519://").to_string())
            }
            Some(value) if !value.is_empty() => Self::File(PathBuf::from(value)),
            _ => Self::Random,
        }
    }
}

/// Ed25519 key pair held by a voter or a test harness.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    /// Signing key used to produce ed25519 signatures.
    pub signing: SigningKey,
    /// Verifying key associated with `signing`.
    pub verifying: VerifyingKey,
}

impl KeyMaterial {
    /// Base64 rendering of the verifying key, as stored in vote transactions.
    pub fn public_key_base64(&self) -> String {
        encode_public_key_base64(&self.verifying)
    }

    /// Signs `payload` and returns the base64 signature.
    pub fn sign_base64(&self, payload: &[u8]) -> String {
        encode_signature_base64(&sign_payload(&self.signing, payload))
    }
}

/// Errors reported while loading or decoding key material.
#[derive(Debug, Clone, Error)]
pub enum KeyError {
    /// Underlying filesystem I/O failure.
    #[error("key I/O error: {0}")]
    Io(String),
    /// Base64, hex, or ed25519 parsing failure.
    #[error("key decode error: {0}")]
    Decode(String),
    /// Buffer did not match the expected secret-key length.
    #[error("unexpected key length: {0}")]
    InvalidLength(usize),
}

/// Loads or derives key material according to the source specification.
pub fn load_or_derive_keypair(source: &Ed25519KeySource) -> Result<KeyMaterial, KeyError> {
    let secret_bytes = match source {
        Ed25519KeySource::Seed(seed) => Ok(derive_key_from_seed(seed)),
        Ed25519KeySource::File(path) => load_key_from_file(path),
        Ed25519KeySource::Random => Ok(SigningKey::generate(&mut OsRng).to_bytes()),
    }?;
    Ok(key_material_from_secret(secret_bytes))
}

/// Deterministic key pair for a seed string.
pub fn keypair_from_seed(seed: &str) -> KeyMaterial {
    key_material_from_secret(derive_key_from_seed(seed))
}

/// Encodes a public key as base64.
pub fn encode_public_key_base64(verifying: &VerifyingKey) -> String {
    BASE64.encode(verifying.to_bytes())
}

/// Encodes a signature as base64.
pub fn encode_signature_base64(sig: &Signature) -> String {
    BASE64.encode(sig.to_bytes())
}

/// Decodes a base64 signature.
pub fn decode_signature_base64(input: &str) -> Result<Signature, KeyError> {
    let bytes = BASE64
        .decode(input)
        .map_err(|err| KeyError::Decode(err.to_string()))?;
    Signature::from_slice(&bytes).map_err(|err| KeyError::Decode(err.to_string()))
}

/// Decodes a base64 public key.
pub fn decode_public_key_base64(input: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = BASE64
        .decode(input)
        .map_err(|err| KeyError::Decode(err.to_string()))?;
    VerifyingKey::try_from(bytes.as_slice()).map_err(|err| KeyError::Decode(err.to_string()))
}

fn derive_key_from_seed(seed: &str) -> [u8; SECRET_KEY_LENGTH] {
    let digest = Sha512::digest(seed.as_bytes());
    let mut secret = [0u8; SECRET_KEY_LENGTH];
    secret.copy_from_slice(&digest[..SECRET_KEY_LENGTH]);
    secret
}

fn load_key_from_file(path: &Path) -> Result<[u8; SECRET_KEY_LENGTH], KeyError> {
    let contents = fs::read(path).map_err(|err| KeyError::Io(err.to_string()))?;
    if contents.len() == SECRET_KEY_LENGTH {
        return bytes_to_secret(contents);
    }
    if let Ok(text) = std::str::from_utf8(&contents) {
        let trimmed = text.trim();
        if trimmed.len() == SECRET_KEY_LENGTH * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit())
        {
            let decoded = hex::decode(trimmed).map_err(|err| KeyError::Decode(err.to_string()))?;
            return bytes_to_secret(decoded);
        }
        if let Ok(decoded) = BASE64.decode(trimmed) {
            return bytes_to_secret(decoded);
        }
    }
    bytes_to_secret(contents)
}

fn key_material_from_secret(secret_bytes: [u8; SECRET_KEY_LENGTH]) -> KeyMaterial {
    let signing = SigningKey::from_bytes(&secret_bytes);
    let verifying = signing.verifying_key();
    KeyMaterial { signing, verifying }
}

fn bytes_to_secret(bytes: impl AsRef<[u8]>) -> Result<[u8; SECRET_KEY_LENGTH], KeyError> {
    let bytes = bytes.as_ref();
    if bytes.len() != SECRET_KEY_LENGTH {
        return Err(KeyError::InvalidLength(bytes.len()));
    }
    let mut secret = [0u8; SECRET_KEY_LENGTH];
    secret.copy_from_slice(bytes);
    Ok(secret)
}

/// Signs a payload with the provided signing key.
pub fn sign_payload(signing: &SigningKey, payload: &[u8]) -> Signature {
    signing.sign(payload)
}

/// Verifies a base64 signature over `payload` with a base64 public key.
pub fn verify_signature_base64(
    public_key_b64: &str,
    payload: &[u8],
    signature_b64: &str,
) -> Result<(), KeyError> {
    let verifying = decode_public_key_base64(public_key_b64)?;
    let signature = decode_signature_base64(signature_b64)?;
    verifying
        .verify(payload, &signature)
        .map_err(|err| KeyError::Decode(err.to_string()))
}

/// Fail-closed verification: any decoding problem or mismatch is `false`.
pub fn verify(public_key_b64: &str, payload: &[u8], signature_b64: &str) -> bool {
    verify_signature_base64(public_key_b64, payload, signature_b64).is_ok()
}
