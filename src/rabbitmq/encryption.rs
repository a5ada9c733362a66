use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::rabbitmq::errors::{RabbitMQError, Result};

const NONCE_LEN: usize = 12;

/// Optional body encryption applied after serialization.
pub trait Encryption: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM keyed by the SHA-256 digest of a shared secret.
///
/// Output is `base64(nonce || ciphertext)` so encrypted bodies stay printable.
pub struct Aes256GcmEncryption {
    cipher: Aes256Gcm,
}

impl Aes256GcmEncryption {
    pub fn new(secret_key: &str) -> Result<Self> {
        let key = Sha256::digest(secret_key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| RabbitMQError::EncryptionError(e.to_string()))?;

        Ok(Self { cipher })
    }
}

impl Encryption for Aes256GcmEncryption {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plain)
            .map_err(|_| RabbitMQError::EncryptionError("failed to encrypt body".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(sealed).into_bytes())
    }

    fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        let sealed = STANDARD
            .decode(encrypted.trim_ascii())
            .map_err(|e| RabbitMQError::EncryptionError(format!("invalid base64 body: {}", e)))?;

        if sealed.len() < NONCE_LEN {
            return Err(RabbitMQError::EncryptionError(
                "encrypted body is shorter than its nonce".to_string(),
            ));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| RabbitMQError::EncryptionError("failed to decrypt body".to_string()))
    }
}
