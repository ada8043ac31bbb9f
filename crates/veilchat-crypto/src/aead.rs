//! AES-256-GCM authenticated encryption with associated data.
//!
//! All symmetric encryption in Veilchat uses AES-256-GCM with 96-bit
//! IVs and the 128-bit tag appended to the ciphertext. A fresh random
//! IV is generated inside every encrypt call; IVs are never reused with
//! the same key because every message key is used for exactly one AEAD
//! operation and every multi-use key (transfer keys, envelope keys)
//! draws a new IV per call from OS entropy.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use veilchat_types::{Result, VeilchatError};
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// AeadKey
// ---------------------------------------------------------------------------

/// 256-bit AES-GCM key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; 32]);

impl AeadKey {
    /// Fixed byte length of an AES-256 key.
    pub const LEN: usize = 32;

    /// Wraps raw 32-byte key material.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random key from OS entropy.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns the raw key bytes.
    ///
    /// Needed where a key itself is payload: embedding a transfer key in
    /// the ratchet-encrypted metadata envelope, or sealing a sender
    /// chain key for distribution.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// AeadKey does not implement Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Iv
// ---------------------------------------------------------------------------

/// 96-bit AES-GCM initialization vector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Iv([u8; 12]);

impl Iv {
    /// Fixed byte length of an AES-GCM IV.
    pub const LEN: usize = 12;

    /// Wraps raw IV bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Generates a fresh random 96-bit IV from OS entropy.
pub fn generate_iv() -> Iv {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    Iv(bytes)
}

// ---------------------------------------------------------------------------
// Encrypt / Decrypt
// ---------------------------------------------------------------------------

/// Ciphertext (tag appended) plus the IV it was produced under.
#[derive(Clone, Debug)]
pub struct Sealed {
    /// Encrypted payload with the 16-byte GCM tag appended.
    pub ciphertext: Vec<u8>,
    /// IV used for this encryption; must travel with the ciphertext.
    pub iv: Iv,
}

/// Encrypts `plaintext` under `key`, generating a fresh random IV.
///
/// `aad` is authenticated but not encrypted; it must bind every identity
/// field the receiver will trust (sender address, chain position, DH key).
pub fn encrypt(key: &AeadKey, plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
    let iv = generate_iv();
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let payload = Payload {
        msg: plaintext,
        aad,
    };

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv.0), payload)
        .map_err(|_| VeilchatError::CryptoError {
            reason: "AES-256-GCM encryption failed".into(),
        })?;

    Ok(Sealed { ciphertext, iv })
}

/// Decrypts `ciphertext` under `key` and `iv`.
///
/// # Errors
///
/// Returns [`VeilchatError::AuthenticationFailure`] on any tag mismatch —
/// tampering, wrong key, wrong IV, or wrong AAD are indistinguishable by
/// design.
pub fn decrypt(key: &AeadKey, ciphertext: &[u8], iv: &Iv, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    cipher
        .decrypt(Nonce::from_slice(&iv.0), payload)
        .map_err(|_| VeilchatError::AuthenticationFailure)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
