use std::path::Path;

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use tracing::{debug, warn};

use super::StorageError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Symmetric encryption for partition files. One key is generated the first
/// time a store directory is opened and reused for every partition afterwards.
/// Each message gets a fresh random nonce, prepended to the ciphertext.
pub struct StoreCipher {
    cipher: ChaCha20Poly1305,
}

impl StoreCipher {
    /// Loads the key from `key_path`, generating and persisting a new one if
    /// the file is missing or malformed.
    pub fn load_or_generate(key_path: &Path) -> Result<Self, StorageError> {
        match std::fs::read(key_path) {
            Ok(bytes) if bytes.len() == KEY_LEN => {
                debug!("Loaded existing store key from {key_path:?}");
                let key = Key::clone_from_slice(&bytes);
                return Ok(Self {
                    cipher: ChaCha20Poly1305::new(&key),
                });
            }
            Ok(bytes) => {
                warn!(
                    "Key file {key_path:?} has invalid length {}, generating a new key",
                    bytes.len()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }

        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        std::fs::write(key_path, key.as_slice())?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(&key),
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| StorageError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, StorageError> {
        if payload.len() < NONCE_LEN {
            return Err(StorageError::Decrypt);
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StorageError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::storage::StorageError;

    use super::StoreCipher;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let dir = tempdir().unwrap();
        let cipher = StoreCipher::load_or_generate(&dir.path().join("store.key")).unwrap();

        let encrypted = cipher.encrypt(b"day partition payload").unwrap();
        assert_ne!(&encrypted[12..], b"day partition payload");

        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, b"day partition payload");
    }

    #[test]
    fn test_key_is_persisted_and_reused() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("store.key");

        let first = StoreCipher::load_or_generate(&key_path).unwrap();
        let encrypted = first.encrypt(b"payload").unwrap();

        let second = StoreCipher::load_or_generate(&key_path).unwrap();
        assert_eq!(second.decrypt(&encrypted).unwrap(), b"payload");
    }

    #[test]
    fn test_tampered_payload_fails_decryption() {
        let dir = tempdir().unwrap();
        let cipher = StoreCipher::load_or_generate(&dir.path().join("store.key")).unwrap();

        let mut encrypted = cipher.encrypt(b"payload").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xff;

        assert!(matches!(
            cipher.decrypt(&encrypted),
            Err(StorageError::Decrypt)
        ));
    }

    #[test]
    fn test_malformed_key_file_is_replaced() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("store.key");
        std::fs::write(&key_path, b"too short").unwrap();

        let cipher = StoreCipher::load_or_generate(&key_path).unwrap();
        let encrypted = cipher.encrypt(b"payload").unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), b"payload");

        assert_eq!(std::fs::read(&key_path).unwrap().len(), 32);
    }
}
