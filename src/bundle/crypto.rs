//! AES-256-GCM + Argon2id sealing for encrypted bundles (SPEC_FULL.md §3, §4.8).

use crate::error::{CaamError, Result};
use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit};
use argon2::Argon2;
use base64::Engine;
use serde::{Deserialize, Serialize};

const SALT_LEN: usize = 32;
const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Argon2Params {
    pub time: u32,
    pub memory_kib: u32,
    pub threads: u32,
    pub key_len: usize,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self { time: 3, memory_kib: 64 * 1024, threads: 4, key_len: KEY_LEN }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub version: u32,
    pub algorithm: String,
    pub kdf: String,
    pub salt: String,
    pub nonce: String,
    pub argon2_params: Argon2Params,
}

fn derive_key(password: &str, salt: &[u8], params: &Argon2Params) -> Result<[u8; KEY_LEN]> {
    let argon2_params = argon2::Params::new(params.memory_kib, params.time, params.threads, Some(params.key_len))
        .map_err(|e| CaamError::Internal(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CaamError::Internal(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Seal `plaintext` with a freshly generated salt and nonce, returning the
/// ciphertext plus the metadata needed to later open it.
pub fn seal(plaintext: &[u8], password: &str) -> Result<(Vec<u8>, EncryptionMetadata)> {
    let params = Argon2Params::default();

    let mut salt = [0u8; SALT_LEN];
    use aes_gcm::aead::rand_core::RngCore;
    OsRng.fill_bytes(&mut salt);

    let key_bytes = derive_key(password, &salt, &params)?;
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CaamError::Internal("AES-GCM seal failed".to_string()))?;

    let metadata = EncryptionMetadata {
        version: 1,
        algorithm: "aes-256-gcm".to_string(),
        kdf: "argon2id".to_string(),
        salt: base64::engine::general_purpose::STANDARD.encode(salt),
        nonce: base64::engine::general_purpose::STANDARD.encode(nonce),
        argon2_params: params,
    };
    Ok((ciphertext, metadata))
}

/// Open `ciphertext` produced by [`seal`]. A tag-verification failure maps
/// to `CaamError::Corruption` with a wrong-password hint (SPEC_FULL §4.9
/// step 2).
pub fn open(ciphertext: &[u8], password: &str, metadata: &EncryptionMetadata) -> Result<Vec<u8>> {
    if metadata.algorithm != "aes-256-gcm" || metadata.kdf != "argon2id" {
        return Err(CaamError::validation("encryption_metadata", format!("unsupported algorithm/kdf: {}/{}", metadata.algorithm, metadata.kdf)));
    }

    let salt = base64::engine::general_purpose::STANDARD
        .decode(&metadata.salt)
        .map_err(|e| CaamError::corruption(format!("invalid salt encoding: {e}")))?;
    let nonce_bytes = base64::engine::general_purpose::STANDARD
        .decode(&metadata.nonce)
        .map_err(|e| CaamError::corruption(format!("invalid nonce encoding: {e}")))?;

    let key_bytes = derive_key(password, &salt, &metadata.argon2_params)?;
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = aes_gcm::Nonce::from_slice(&nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CaamError::corruption("decryption failed, likely wrong password"))
}
