// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! Request encryption.
//!
//! The daemon generates a fresh 256-bit ChaCha20-Poly1305 key at startup
//! and publishes it hex-encoded at a well-known shared-memory path. Clients
//! read the key, seal the request body, and send nonce ∥ ciphertext; the
//! authentication tag makes any body that was not sealed under the current
//! daemon key undecryptable. Authorization does not rest on the key alone:
//! the allow-list and the socket-owner check run after decryption.

use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;

use crate::error::{OptError, Result};

/// Published key location. `/dev/shm` so the key never persists across
/// reboots even if shutdown cleanup is skipped.
pub const KEY_PATH: &str = "/dev/shm/guapow/opt.key";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub struct RequestCipher {
    cipher: ChaCha20Poly1305,
    key: [u8; KEY_LEN],
}

impl RequestCipher {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        Self {
            cipher: ChaCha20Poly1305::new(&key),
            key: key.into(),
        }
    }

    /// Rebuild a cipher from a published hex key (client side).
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|_| OptError::Configuration("key file is not valid hex".into()))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| OptError::Configuration("key file has the wrong length".into()))?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            key,
        })
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Seal a request body: random nonce ∥ ciphertext+tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| OptError::Decrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed body. Fails for truncated input, a stale key, or any
    /// tampering.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() <= NONCE_LEN {
            return Err(OptError::Decrypt);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| OptError::Decrypt)
    }

    /// Write the hex key to `path`, readable by any local user (0o644).
    /// Loopback binding plus the post-decrypt allow-list do the gating.
    pub async fn publish(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(path, self.key_hex()).await?;
        let mut perms = tokio::fs::metadata(path).await?.permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o644);
        tokio::fs::set_permissions(path, perms).await?;
        tracing::info!("Request key published at {}", path.display());
        Ok(())
    }

    /// Remove the published key (shutdown path).
    pub async fn unpublish(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove key file {}: {e}", path.display());
            }
        }
    }
}

/// Default key path as a `PathBuf`.
pub fn key_path() -> PathBuf {
    PathBuf::from(KEY_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let cipher = RequestCipher::generate();
        let sealed = cipher.seal(b"request.pid=1").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"request.pid=1");
        assert_eq!(cipher.open(&sealed).unwrap(), b"request.pid=1");
    }

    #[test]
    fn test_open_rejects_other_key() {
        let a = RequestCipher::generate();
        let b = RequestCipher::generate();
        let sealed = a.seal(b"hello").unwrap();
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn test_open_rejects_tampering() {
        let cipher = RequestCipher::generate();
        let mut sealed = cipher.seal(b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn test_open_rejects_truncation() {
        let cipher = RequestCipher::generate();
        assert!(cipher.open(&[0u8; NONCE_LEN]).is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let a = RequestCipher::generate();
        let b = RequestCipher::from_hex(&a.key_hex()).unwrap();
        let sealed = b.seal(b"body").unwrap();
        assert_eq!(a.open(&sealed).unwrap(), b"body");
    }

    #[tokio::test]
    async fn test_publish_and_unpublish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.key");
        let cipher = RequestCipher::generate();
        cipher.publish(&path).await.unwrap();
        let published = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(published, cipher.key_hex());
        RequestCipher::unpublish(&path).await;
        assert!(!path.exists());
    }
}
