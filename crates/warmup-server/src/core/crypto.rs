use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be 32 bytes ({0} given)")]
    InvalidKeyLength(usize),
    #[error("encryption key is not valid hex: {0}")]
    InvalidKeyEncoding(String),
    #[error("ciphertext is not valid base64: {0}")]
    MalformedCiphertext(String),
    #[error("ciphertext too short: {0} bytes")]
    TruncatedCiphertext(usize),
    #[error("decryption failed (wrong key or corrupted value)")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
}

/// Symmetric cipher for credential columns. Values are AES-256-GCM sealed
/// with a fresh random nonce prepended, then base64 encoded.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self { cipher: Aes256Gcm::new(key) })
    }

    /// Accepts the 64-hex-char form the config carries.
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(key_hex.trim())
            .map_err(|err| CryptoError::InvalidKeyEncoding(err.to_string()))?;
        Self::new(&raw)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, value: &str) -> Result<String, CryptoError> {
        let raw = BASE64
            .decode(value.trim())
            .map_err(|err| CryptoError::MalformedCiphertext(err.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::TruncatedCiphertext(raw.len()));
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::DecryptFailed)?;

        String::from_utf8(plain).map_err(|_| CryptoError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher_with(byte: u8) -> CredentialCipher {
        CredentialCipher::new(&[byte; 32]).unwrap()
    }

    #[test]
    fn round_trips_credentials() {
        let cipher = cipher_with(7);
        let sealed = cipher.encrypt("app-password-123").unwrap();
        assert_ne!(sealed, "app-password-123");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "app-password-123");
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let cipher = cipher_with(7);
        let a = cipher.encrypt("same input").unwrap();
        let b = cipher.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = cipher_with(1).encrypt("secret").unwrap();
        assert!(matches!(
            cipher_with(2).decrypt(&sealed),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn rejects_short_keys_and_garbage() {
        assert!(matches!(
            CredentialCipher::new(&[0; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        let cipher = cipher_with(3);
        assert!(cipher.decrypt("not base64 !!!").is_err());
        assert!(matches!(
            cipher.decrypt("AAAA"),
            Err(CryptoError::TruncatedCiphertext(_))
        ));
    }
}
