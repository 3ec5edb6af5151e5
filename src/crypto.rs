//! Ed25519 signing/verification and the node's own key material.
//!
//! Verification never leaks a library exception — a bad signature and a
//! well-formed-but-false signature are both "false", while malformed
//! base64/key/signature bytes are a distinct decode error so a caller can
//! tell a 400 apart from a deliberate `false`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::{env, fmt, path::PathBuf};

/// Decode/format failures for key and signature material. Distinct from "the
/// signature did not verify" so callers can return 400 instead of a false.
#[derive(Debug, Clone)]
pub enum CryptoError {
    /// Base64 decoding failed.
    Base64(String),
    /// The decoded buffer did not match the expected Ed25519 key/signature length.
    InvalidLength(usize),
    /// The Ed25519 library rejected the key/signature bytes.
    InvalidKeyMaterial(String),
    /// Underlying filesystem failure loading key material.
    Io(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base64(err) => write!(f, "base64 decode error: {err}"),
            Self::InvalidLength(len) => write!(f, "unexpected key/signature length: {len}"),
            Self::InvalidKeyMaterial(err) => write!(f, "invalid key material: {err}"),
            Self::Io(err) => write!(f, "key I/O error: {err}"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Encodes a public key as base64 (32 raw bytes).
pub fn encode_public_key_base64(verifying: &VerifyingKey) -> String {
    BASE64.encode(verifying.to_bytes())
}

/// Encodes a signature as base64 (64 raw bytes).
pub fn encode_signature_base64(sig: &Signature) -> String {
    BASE64.encode(sig.to_bytes())
}

/// Decodes a base64-encoded Ed25519 public key.
pub fn decode_public_key_base64(input: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = BASE64
        .decode(input)
        .map_err(|err| CryptoError::Base64(err.to_string()))?;
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidLength(bytes.len()))?;
    VerifyingKey::from_bytes(&array).map_err(|err| CryptoError::InvalidKeyMaterial(err.to_string()))
}

/// Decodes a base64-encoded Ed25519 signature.
pub fn decode_signature_base64(input: &str) -> Result<Signature, CryptoError> {
    let bytes = BASE64
        .decode(input)
        .map_err(|err| CryptoError::Base64(err.to_string()))?;
    let array: [u8; 64] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidLength(bytes.len()))?;
    Ok(Signature::from_bytes(&array))
}

/// Signs `payload` (already canonicalized) with `signing`.
pub fn sign_payload(signing: &SigningKey, payload: &[u8]) -> Signature {
    signing.sign(payload)
}

/// Verifies `signature` over `payload` with `verifying`. Never propagates a
/// library exception: returns `false` for a well-formed-but-wrong signature.
pub fn verify_signature_bool(verifying: &VerifyingKey, payload: &[u8], signature: &Signature) -> bool {
    verifying.verify(payload, signature).is_ok()
}

/// Decodes a base64 public key and signature and verifies in one call.
/// Returns `Ok(false)` for a valid-but-wrong signature, `Err` for malformed
/// base64/key/signature material (the caller's 400 vs. false distinction).
pub fn verify_signature_base64(
    public_key_b64: &str,
    payload: &[u8],
    signature_b64: &str,
) -> Result<bool, CryptoError> {
    let verifying = decode_public_key_base64(public_key_b64)?;
    let signature = decode_signature_base64(signature_b64)?;
    Ok(verify_signature_bool(&verifying, payload, &signature))
}

/// Describes how the node's own signing key should be obtained.
#[derive(Debug, Clone)]
pub enum NodeKeySource {
    /// A base64-encoded 32-byte seed taken from an environment variable.
    Env(String),
    /// A file containing the raw 32-byte seed, hex, or base64.
    File(PathBuf),
    /// No key configured; node-signed artifacts are left unsigned.
    None,
}

impl NodeKeySource {
    /// Resolves the node key source from `VILLAGE_TRUST_NODE_KEY` (base64
    /// seed) or `VILLAGE_TRUST_NODE_KEY_FILE`, falling back to `None` —
    /// absence of a node key disables manifest/denial/audit-export signing
    /// without failing those operations.
    pub fn from_env() -> Self {
        if let Ok(seed) = env::var("VILLAGE_TRUST_NODE_KEY") {
            if !seed.is_empty() {
                return Self::Env(seed);
            }
        }
        if let Ok(path) = env::var("VILLAGE_TRUST_NODE_KEY_FILE") {
            if !path.is_empty() {
                return Self::File(PathBuf::from(path));
            }
        }
        Self::None
    }

    /// Loads the signing key, if any is configured.
    pub fn load(&self) -> Result<Option<SigningKey>, CryptoError> {
        match self {
            Self::Env(seed_b64) => {
                let bytes = BASE64
                    .decode(seed_b64)
                    .map_err(|err| CryptoError::Base64(err.to_string()))?;
                let array: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::InvalidLength(bytes.len()))?;
                Ok(Some(SigningKey::from_bytes(&array)))
            }
            Self::File(path) => {
                let contents = std::fs::read(path).map_err(|err| CryptoError::Io(err.to_string()))?;
                let array = read_seed_bytes(&contents)?;
                Ok(Some(SigningKey::from_bytes(&array)))
            }
            Self::None => Ok(None),
        }
    }
}

fn read_seed_bytes(contents: &[u8]) -> Result<[u8; 32], CryptoError> {
    if contents.len() == 32 {
        return Ok(contents.try_into().unwrap());
    }
    if let Ok(text) = std::str::from_utf8(contents) {
        let trimmed = text.trim();
        if trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut out = [0u8; 32];
            for (idx, chunk) in trimmed.as_bytes().chunks(2).enumerate() {
                let hex_pair = std::str::from_utf8(chunk).unwrap();
                out[idx] = u8::from_str_radix(hex_pair, 16)
                    .map_err(|err| CryptoError::InvalidKeyMaterial(err.to_string()))?;
            }
            return Ok(out);
        }
        if let Ok(decoded) = BASE64.decode(trimmed) {
            if decoded.len() == 32 {
                let mut out = [0u8; 32];
                out.copy_from_slice(&decoded);
                return Ok(out);
            }
        }
    }
    Err(CryptoError::InvalidLength(contents.len()))
}

/// Generates a fresh random signing key (test/bootstrap helper).
pub fn generate_signing_key() -> SigningKey {
    let mut rng = rand::rngs::OsRng;
    SigningKey::generate(&mut rng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let key = generate_signing_key();
        let payload = b"hello world";
        let sig = sign_payload(&key, payload);
        assert!(verify_signature_bool(&key.verifying_key(), payload, &sig));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = generate_signing_key();
        let sig = sign_payload(&key, b"original");
        assert!(!verify_signature_bool(&key.verifying_key(), b"tampered", &sig));
    }

    #[test]
    fn base64_round_trip_for_key_and_signature() {
        let key = generate_signing_key();
        let sig = sign_payload(&key, b"payload");
        let pk_b64 = encode_public_key_base64(&key.verifying_key());
        let sig_b64 = encode_signature_base64(&sig);
        assert!(verify_signature_base64(&pk_b64, b"payload", &sig_b64).unwrap());
    }

    #[test]
    fn malformed_base64_is_a_decode_error_not_a_false() {
        let result = verify_signature_base64("not-base64!!!", b"payload", "also-bad!!!");
        assert!(result.is_err());
    }

    #[test]
    fn node_key_source_defaults_to_none() {
        assert!(matches!(NodeKeySource::None.load(), Ok(None)));
    }
}
