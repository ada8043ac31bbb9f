//! Cryptographic primitives for the Veilchat end-to-end encryption core.
//!
//! This crate is the **sole** location for all cryptographic operations:
//!
//! - **P-256 ECDH** key generation and agreement
//! - **AES-256-GCM** AEAD encryption/decryption
//! - **HKDF-SHA256** extract-and-expand key derivation
//! - **HMAC-SHA256** single-byte-label chain derivation
//! - **SHA-256** hashing, channel hashes, master-seed derivation
//! - **Base64 / base64url** codecs and **JWK** public-key import/export
//! - Deterministic **room key pair** derivation with rejection sampling
//!
//! No other crate in the workspace should perform raw crypto operations.

pub mod aead;
pub mod b64;
pub mod ecdh;
pub mod hash;
pub mod hkdf;
pub mod hmac;
pub mod jwk;
pub mod seed;
