//! Password encryption for stored data-source credentials.
//!
//! AES-256-GCM with a random 12-byte nonce prepended to the ciphertext,
//! base64 over the whole blob. The key lives in a file next to the worker
//! config; a missing key file gets a fresh key generated on first start.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use std::fs;
use std::path::Path;

pub fn generate_key() -> Vec<u8> {
    let mut key = vec![0u8; 32];
    rand::thread_rng().fill(&mut key[..]);
    key
}

/// Loads the base64 key from `path`, generating and persisting a new one if
/// the file does not exist yet.
pub fn load_or_create_key(path: &Path) -> Result<Vec<u8>, String> {
    if path.exists() {
        let encoded = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read key file {}: {}", path.display(), e))?;
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|e| format!("Failed to decode key file {}: {}", path.display(), e))?;
        if key.len() != 32 {
            return Err(format!(
                "Key file {} holds {} bytes, expected 32",
                path.display(),
                key.len()
            ));
        }
        return Ok(key);
    }

    let key = generate_key();
    fs::write(path, BASE64.encode(&key))
        .map_err(|e| format!("Failed to write key file {}: {}", path.display(), e))?;
    log::info!("Generated new encryption key at {}", path.display());
    Ok(key)
}

pub fn encrypt(key: &[u8], password: &str) -> Result<String, String> {
    if password.is_empty() {
        return Ok(String::new());
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| format!("Failed to create cipher: {}", e))?;

    let mut rng = rand::thread_rng();
    let nonce_bytes: [u8; 12] = rng.gen();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, password.as_bytes())
        .map_err(|e| format!("Encryption failed: {}", e))?;

    let mut combined = nonce_bytes.to_vec();
    combined.extend(ciphertext);

    Ok(BASE64.encode(combined))
}

pub fn decrypt(key: &[u8], encrypted: &str) -> Result<String, String> {
    if encrypted.is_empty() {
        return Ok(String::new());
    }

    let combined = BASE64
        .decode(encrypted)
        .map_err(|e| format!("Base64 decode failed: {}", e))?;

    if combined.len() < 12 {
        return Err("Invalid encrypted data".to_string());
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| format!("Failed to create cipher: {}", e))?;

    let nonce = Nonce::from_slice(&combined[..12]);
    let ciphertext = &combined[12..];

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| format!("Decryption failed: {}", e))?;

    String::from_utf8(plaintext).map_err(|e| format!("UTF-8 conversion failed: {}", e))
}
