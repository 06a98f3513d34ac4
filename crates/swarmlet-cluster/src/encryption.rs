//! Message sealing for the gossip bus.
//!
//! Every payload that leaves a node is sealed with AES-256-GCM under
//! the cluster's shared secret. The wire frame is
//! `nonce(12) || ciphertext+tag`. Frames that fail to open are dropped
//! by the caller and never reach the message handler.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ClusterError, ClusterResult};

/// Nonce length for AES-GCM.
const NONCE_LEN: usize = 12;

/// Seals and opens gossip payloads under the cluster secret.
pub struct Encryptor {
    cipher: Aes256Gcm,
}

impl Encryptor {
    /// Create an encryptor from the shared secret.
    ///
    /// A secret that is not exactly 32 bytes is hashed to 32 with
    /// SHA-256, so any operator-supplied string works as a key.
    pub fn new(secret: &[u8]) -> Self {
        let key = if secret.len() == 32 {
            *Key::<Aes256Gcm>::from_slice(secret)
        } else {
            let digest = Sha256::digest(secret);
            *Key::<Aes256Gcm>::from_slice(digest.as_slice())
        };
        Encryptor {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Seal a plaintext: fresh random nonce, prepended to the ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> ClusterResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ClusterError::Encrypt)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Open a sealed frame. Any tampering with nonce or ciphertext
    /// fails authentication.
    pub fn open(&self, frame: &[u8]) -> ClusterResult<Vec<u8>> {
        if frame.len() < NONCE_LEN {
            return Err(ClusterError::Decrypt);
        }
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ClusterError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let enc = Encryptor::new(b"0123456789abcdef0123456789abcdef");
        let frame = enc.seal(b"hello cluster").unwrap();
        assert_eq!(enc.open(&frame).unwrap(), b"hello cluster");
    }

    #[test]
    fn short_secret_is_derived() {
        let enc = Encryptor::new(b"short secret");
        let frame = enc.seal(b"payload").unwrap();
        assert_eq!(enc.open(&frame).unwrap(), b"payload");
    }

    #[test]
    fn nonces_are_fresh_per_message() {
        let enc = Encryptor::new(b"key");
        let a = enc.seal(b"same").unwrap();
        let b = enc.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_frame_fails_to_open() {
        let enc = Encryptor::new(b"key");
        let frame = enc.seal(b"important").unwrap();

        // Flip one bit anywhere: nonce, ciphertext, or tag.
        for idx in [0, 12, frame.len() - 1] {
            let mut bad = frame.clone();
            bad[idx] ^= 0x01;
            assert!(enc.open(&bad).is_err(), "byte {idx} tamper accepted");
        }
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let enc = Encryptor::new(b"key one");
        let other = Encryptor::new(b"key two");
        let frame = enc.seal(b"secret").unwrap();
        assert!(other.open(&frame).is_err());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let enc = Encryptor::new(b"key");
        assert!(enc.open(b"tiny").is_err());
        assert!(enc.open(b"").is_err());
    }
}
