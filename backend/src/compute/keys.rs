//! Task-scoped ephemeral keys and output decryption.
//!
//! Task outputs are sealed for the key pair that submitted the task:
//!
//! ```text
//! key  = ECDH(task secret key, worker public key)      (32 bytes)
//! blob = nonce (12 bytes) || AES-256-GCM ciphertext+tag
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tracing::debug;

use super::ComputeError;
use crate::utils::decode_hex;

const NONCE_LEN: usize = 12;

/// One-time key pair used to request and read one task output.
#[derive(Clone)]
pub struct TaskKeyPair {
    secret: SecretKey,
    public: PublicKey,
    consumed: bool,
}

impl TaskKeyPair {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret = loop {
            let mut bytes = [0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            // Out-of-range scalars are astronomically rare; draw again
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                break secret;
            }
        };
        let public = PublicKey::from_secret_key(&secp, &secret);
        Self {
            secret,
            public,
            consumed: false,
        }
    }

    /// Uncompressed public key without the `04` tag, hex encoded.
    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public.serialize_uncompressed()[1..])
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    #[cfg(test)]
    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Decrypt a task output sealed for this key pair by `worker_pub_key`.
    pub fn decrypt(&self, worker_pub_key: &str, blob: &[u8]) -> Result<Vec<u8>, ComputeError> {
        let worker = parse_public_key(worker_pub_key)?;
        open(&shared_key(&self.secret, &worker), blob)
    }
}

impl std::fmt::Debug for TaskKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskKeyPair")
            .field("public", &self.public_key_hex())
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

/// Holds the current task key pair and enforces rotate-after-use.
///
/// ```text
/// acquire ──> (consumed? generate new) ──> current pair
/// consume ──> current pair marked, next acquire rotates
/// rotate  ──> fresh pair immediately
/// ```
pub struct TaskKeyRing {
    current: TaskKeyPair,
    generation: u64,
}

impl TaskKeyRing {
    pub fn new() -> Self {
        Self {
            current: TaskKeyPair::generate(),
            generation: 0,
        }
    }

    /// The current key pair. A consumed pair is replaced first.
    pub fn acquire(&mut self) -> &TaskKeyPair {
        if self.current.consumed {
            self.rotate();
        }
        &self.current
    }

    /// Mark the current pair as used for a disclosure request.
    pub fn consume(&mut self) {
        self.current.consumed = true;
    }

    /// Replace the current pair with a fresh one.
    pub fn rotate(&mut self) {
        self.current = TaskKeyPair::generate();
        self.generation += 1;
        debug!("Task key pair rotated (generation {})", self.generation);
    }

    /// Number of rotations so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Default for TaskKeyRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a secp256k1 public key given as hex. The 64-byte form without
/// the `04` tag is accepted as well as the standard encodings.
pub fn parse_public_key(value: &str) -> Result<PublicKey, ComputeError> {
    let mut bytes = decode_hex(value).map_err(ComputeError::InvalidKey)?;
    if bytes.len() == 64 {
        bytes.insert(0, 0x04);
    }
    PublicKey::from_slice(&bytes).map_err(|e| ComputeError::InvalidKey(e.to_string()))
}

/// Symmetric key shared by `secret` and the owner of `peer`.
pub fn shared_key(secret: &SecretKey, peer: &PublicKey) -> [u8; 32] {
    SharedSecret::new(peer, secret).secret_bytes()
}

/// Seal `plaintext` under `key` (`nonce || ciphertext`), as a worker does.
#[cfg(test)]
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, ComputeError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| ComputeError::Decryption(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| ComputeError::Decryption(format!("encrypt failed: {}", e)))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open a blob produced by [`seal`].
pub fn open(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, ComputeError> {
    if blob.len() < NONCE_LEN {
        return Err(ComputeError::Decryption(format!(
            "ciphertext too short: {} bytes",
            blob.len()
        )));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| ComputeError::Decryption(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| ComputeError::Decryption(format!("decrypt failed: {}", e)))
}
