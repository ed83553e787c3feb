use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use crate::error::AppError;
use crate::Result;

const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;

/// Encrypts TOTP secrets at rest with the application key.
///
/// Stored form is `base64(nonce || ciphertext)`.
#[derive(Clone)]
pub struct SecretCipher {
    encryption_key: [u8; KEY_SIZE],
}

impl SecretCipher {
    pub fn new(encryption_key: [u8; KEY_SIZE]) -> Self {
        Self { encryption_key }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|e| AppError::InternalError(format!("Encryption error: {}", e)))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let encrypted = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AppError::InternalError(format!("Encryption failed: {}", e)))?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + encrypted.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&encrypted);
        Ok(BASE64.encode(payload))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let payload = BASE64
            .decode(stored.trim())
            .map_err(|e| AppError::InternalError(format!("Invalid encrypted data: {}", e)))?;
        if payload.len() <= NONCE_SIZE {
            return Err(AppError::InternalError("Encrypted data too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
        let decrypted = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| AppError::InternalError(format!("Decryption failed: {}", e)))?;

        String::from_utf8(decrypted)
            .map_err(|e| AppError::InternalError(format!("Invalid UTF-8: {}", e)))
    }
}
