//! At-rest encryption for module environment variables (§6, §4.C).
//!
//! Mirrors the original platform's Fernet-backed `EncryptedJSON` column at
//! the same authenticated-encryption strength: AES-256-GCM, a fresh random
//! nonce per encryption, packed as `nonce(12) || ciphertext+tag` and
//! base64-encoded for storage as a UTF-8 string.

use crate::error::{CoreError, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use rand::RngCore;
use std::env;

pub const ENCRYPTION_KEY_ENV_VAR: &str = "ENV_ENCRYPTION_KEY";

/// Reads and validates the process-wide encryption key. Per §5 "Encryption
/// key: read once at process start; absence is fatal", callers should call
/// this during startup and abort the process if it errors rather than
/// retrying lazily per-request.
pub fn load_key_from_env() -> Result<[u8; 32]> {
    let raw = env::var(ENCRYPTION_KEY_ENV_VAR).map_err(|_| {
        CoreError::DecryptionError(format!(
            "required environment variable '{ENCRYPTION_KEY_ENV_VAR}' is not set"
        ))
    })?;
    decode_key(&raw)
}

fn decode_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = base64::engine::general_purpose::URL_SAFE
        .decode(raw.trim())
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(raw.trim()))
        .map_err(|e| {
            CoreError::DecryptionError(format!(
                "{ENCRYPTION_KEY_ENV_VAR} is not valid URL-safe base64: {e}"
            ))
        })?;
    if bytes.len() != 32 {
        return Err(CoreError::DecryptionError(format!(
            "{ENCRYPTION_KEY_ENV_VAR} must decode to exactly 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Encrypts an arbitrary JSON value. Returns a base64 string suitable for
/// storing in a text column.
pub fn encrypt_json(value: &serde_json::Value, key: &[u8; 32]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CoreError::DecryptionError("AES key must be 32 bytes".into()))?;

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = serde_json::to_vec(value)?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|e| CoreError::DecryptionError(format!("encryption failed: {e}")))?;

    let mut packed = Vec::with_capacity(12 + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);

    Ok(base64::engine::general_purpose::STANDARD.encode(&packed))
}

/// Decrypts a value produced by [`encrypt_json`]. A `DecryptionError` here
/// is fatal for the row it came from (§6): the caller should not retry,
/// only surface the failure.
pub fn decrypt_json(encoded: &str, key: &[u8; 32]) -> Result<serde_json::Value> {
    let packed = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| CoreError::DecryptionError(format!("base64 decode failed: {e}")))?;

    if packed.len() < 12 + 16 {
        return Err(CoreError::DecryptionError("ciphertext too short".into()));
    }

    let (nonce_bytes, ciphertext) = packed.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CoreError::DecryptionError("invalid key length".into()))?;

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CoreError::DecryptionError("wrong key or corrupted data".into()))?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| CoreError::DecryptionError(format!("decrypted payload is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn round_trips_a_json_object() {
        let key = test_key();
        let value = serde_json::json!({"API_TOKEN": "s3cr3t", "n": 3});
        let encoded = encrypt_json(&value, &key).unwrap();
        let decoded = decrypt_json(&encoded, &key).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn rejects_wrong_key() {
        let value = serde_json::json!({"a": 1});
        let encoded = encrypt_json(&value, &test_key()).unwrap();
        let other_key = [9u8; 32];
        assert!(decrypt_json(&encoded, &other_key).is_err());
    }

    #[test]
    fn decode_key_requires_32_bytes() {
        let short = base64::engine::general_purpose::URL_SAFE.encode(b"too-short");
        assert!(decode_key(&short).is_err());
    }
}
