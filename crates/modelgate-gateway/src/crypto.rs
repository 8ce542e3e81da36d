use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be 64 hex characters")]
    BadKey,
    #[error("ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext too short")]
    Truncated,
    #[error("decryption failed")]
    Aead,
    #[error("plaintext is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// AES-256-GCM decryptor for stored deployment config values. The AES key is the
/// SHA-256 digest of the configured 64-hex secret; wire format is
/// `base64(IV || TAG || CIPHERTEXT)` with a 12-byte IV and 16-byte tag.
#[derive(Clone)]
pub struct ConfigCipher {
    key: [u8; 32],
}

impl ConfigCipher {
    pub fn new(secret: &str) -> Result<Self, CryptoError> {
        if secret.len() != 64 || !secret.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(CryptoError::BadKey);
        }
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(Self { key })
    }

    pub fn decrypt(&self, wire: &str) -> Result<String, CryptoError> {
        let raw = B64.decode(wire)?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }
        let (iv, rest) = raw.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        // The AEAD API wants CIPHERTEXT || TAG.
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_ref())
            .map_err(|_| CryptoError::Aead)?;
        Ok(String::from_utf8(plaintext)?)
    }

    #[cfg(test)]
    pub fn encrypt(&self, plaintext: &str, iv: &[u8; IV_LEN]) -> String {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let sealed = cipher
            .encrypt(Nonce::from_slice(iv), plaintext.as_bytes())
            .expect("encryption cannot fail");
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut wire = Vec::with_capacity(IV_LEN + sealed.len());
        wire.extend_from_slice(iv);
        wire.extend_from_slice(tag);
        wire.extend_from_slice(ciphertext);
        B64.encode(wire)
    }
}

/// Lowercase hex SHA-256, used for API-key hashing and request hashes.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
