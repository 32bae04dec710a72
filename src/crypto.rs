use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ENCRYPTION_KEY must be 64 hex characters (32 bytes)")]
    InvalidKey,

    #[error("unable to encrypt value")]
    Encryption,

    #[error("unable to decrypt value: {0}")]
    Decryption(String),
}

/// Encrypted value as persisted next to the user: base64 ciphertext and nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    pub data: String,
    pub nonce: String,
}

/// Authenticated cipher for OAuth tokens at rest.
///
/// 256-bit key, fresh random 96-bit nonce on every call.
#[derive(Clone)]
pub struct TokenCipher {
    aead: ChaCha20Poly1305,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let aead = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(TokenCipher { aead })
    }

    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        let key = hex::decode(key_hex.trim()).map_err(|_| CryptoError::InvalidKey)?;
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedValue, CryptoError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        Ok(EncryptedValue {
            data: STANDARD.encode(ciphertext),
            nonce: STANDARD.encode(nonce),
        })
    }

    pub fn decrypt(&self, encrypted: &EncryptedValue) -> Result<String, CryptoError> {
        let ciphertext = STANDARD
            .decode(encrypted.data.as_bytes())
            .map_err(|e| CryptoError::Decryption(format!("invalid ciphertext encoding: {}", e)))?;
        let nonce_raw = STANDARD
            .decode(encrypted.nonce.as_bytes())
            .map_err(|e| CryptoError::Decryption(format!("invalid nonce encoding: {}", e)))?;

        if nonce_raw.len() != NONCE_LEN {
            return Err(CryptoError::Decryption("nonce length is invalid".to_string()));
        }

        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(&nonce_raw), ciphertext.as_ref())
            .map_err(|_| CryptoError::Decryption("authentication failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Decryption(format!("plaintext is not utf-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::from_hex(&"2a".repeat(32)).expect("valid key")
    }

    #[test]
    fn test_round_trip() {
        let cipher = cipher();
        for plaintext in ["", "ya29.a0AfH6SM", "jeton d'accès ünïcødé ✓"] {
            let encrypted = cipher.encrypt(plaintext).expect("encrypt");
            assert_eq!(cipher.decrypt(&encrypted).expect("decrypt"), plaintext);
        }
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let cipher = cipher();
        let a = cipher.encrypt("same").expect("encrypt");
        let b = cipher.encrypt("same").expect("encrypt");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let cipher = cipher();
        let mut encrypted = cipher.encrypt("refresh-token").expect("encrypt");
        let mut raw = STANDARD.decode(&encrypted.data).expect("base64");
        raw[0] ^= 0x01;
        encrypted.data = STANDARD.encode(raw);

        assert!(matches!(cipher.decrypt(&encrypted), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let encrypted = cipher().encrypt("refresh-token").expect("encrypt");
        let other = TokenCipher::from_hex(&"07".repeat(32)).expect("valid key");

        assert!(matches!(other.decrypt(&encrypted), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(TokenCipher::from_hex("abcd"), Err(CryptoError::InvalidKey)));
        assert!(matches!(TokenCipher::from_hex(&"zz".repeat(32)), Err(CryptoError::InvalidKey)));
    }
}
