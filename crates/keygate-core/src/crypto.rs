//! Passphrase-based authenticated encryption for key secrets at rest.
//!
//! Blob layout: `version (1) || salt (16) || nonce (12) || ciphertext || tag (16)`.
//! The key is PBKDF2-HMAC-SHA256 over the passphrase and the per-blob salt,
//! sealed with ChaCha20-Poly1305.

use crate::error::{KeygateError, KeygateResult};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::io;
use zeroize::Zeroizing;

pub const BLOB_VERSION: u8 = 1;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = 1 + SALT_LEN + NONCE_LEN;

#[derive(Debug, Clone, Copy)]
pub struct CryptoBox {
    iterations: u32,
}

impl CryptoBox {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    /// Seal `plaintext` under `passphrase` with a fresh salt and nonce.
    pub fn encrypt(&self, plaintext: &[u8], passphrase: &[u8]) -> KeygateResult<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let cipher = self.cipher(passphrase, &salt);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| {
                KeygateError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "plaintext too large to seal",
                ))
            })?;

        let mut blob = Vec::with_capacity(HEADER_LEN + sealed.len());
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Open a blob produced by [`CryptoBox::encrypt`]. Every failure is the
    /// same `Decryption` error.
    pub fn decrypt(&self, blob: &[u8], passphrase: &[u8]) -> KeygateResult<Zeroizing<Vec<u8>>> {
        if blob.len() < HEADER_LEN + TAG_LEN || blob[0] != BLOB_VERSION {
            return Err(KeygateError::Decryption);
        }
        let (salt, rest) = blob[1..].split_at(SALT_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let cipher = self.cipher(passphrase, salt);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| KeygateError::Decryption)?;
        Ok(Zeroizing::new(plaintext))
    }

    fn cipher(&self, passphrase: &[u8], salt: &[u8]) -> ChaCha20Poly1305 {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2_hmac::<Sha256>(passphrase, salt, self.iterations, &mut key[..]);
        ChaCha20Poly1305::new(Key::from_slice(&key[..]))
    }
}
