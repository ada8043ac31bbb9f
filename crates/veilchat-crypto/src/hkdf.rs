//! HKDF-SHA256 key derivation (RFC 5869).
//!
//! Every derived key in the core flows through this module with a fixed
//! domain-separating salt:
//!
//! | Salt           | Derives |
//! |----------------|---------|
//! | `e2e-room-key` | per-room seed from the master seed |
//! | `e2e-ecdh`     | P-256 scalar candidates for the room key pair |
//! | `x3dh`         | Double Ratchet root key from the triple DH |
//! | `dr-root` / `dr-chain` | DH-ratchet step outputs |
//! | `e2e-shared`   | sender-key envelope sealing keys |

use hkdf::Hkdf;
use sha2::Sha256;
use veilchat_types::{Result, VeilchatError};

/// Derives exactly 32 bytes of key material.
///
/// The salt is always non-empty in this codebase (fixed domain
/// separators), so no empty-salt special case is needed.
pub fn derive_32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let mut okm = [0u8; 32];
    fill(ikm, salt, info, &mut okm)?;
    Ok(okm)
}

/// Expands `ikm` into `out.len()` bytes of key material.
///
/// # Errors
///
/// Returns [`VeilchatError::CryptoError`] if the requested length exceeds
/// the HKDF-SHA256 limit of `255 × 32` bytes.
pub fn fill(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out).map_err(|e| VeilchatError::CryptoError {
        reason: format!("HKDF-SHA256 expansion failed: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() -> Result<()> {
        let a = derive_32(&[0x42; 32], b"salt", b"info")?;
        let b = derive_32(&[0x42; 32], b"salt", b"info")?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn salt_and_info_separate_domains() -> Result<()> {
        let base = derive_32(&[0x42; 32], b"dr-root", b"root-key")?;
        assert_ne!(base, derive_32(&[0x42; 32], b"dr-chain", b"root-key")?);
        assert_ne!(base, derive_32(&[0x42; 32], b"dr-root", b"chain-key")?);
        Ok(())
    }

    #[test]
    fn oversized_output_rejected() {
        let mut out = vec![0u8; 255 * 32 + 1];
        assert!(fill(&[0x01; 32], b"salt", b"info", &mut out).is_err());
    }

    /// RFC 5869 Test Case 1 (HKDF-SHA256).
    #[test]
    fn rfc5869_test_vector_1() -> Result<()> {
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0x00u8..=0x0c).collect();
        let info: Vec<u8> = (0xf0u8..=0xf9).collect();

        let mut okm = [0u8; 42];
        fill(&ikm, &salt, &info, &mut okm)?;

        let expected = [
            0x3c, 0xb2, 0x5f, 0x25, 0xfa, 0xac, 0xd5, 0x7a, 0x90, 0x43, 0x4f, 0x64, 0xd0, 0x36,
            0x2f, 0x2a, 0x2d, 0x2d, 0x0a, 0x90, 0xcf, 0x1a, 0x5a, 0x4c, 0x5d, 0xb0, 0x2d, 0x56,
            0xec, 0xc4, 0xc5, 0xbf, 0x34, 0x00, 0x72, 0x08, 0xd5, 0xb8, 0x87, 0x18, 0x58, 0x65,
        ];
        assert_eq!(okm, expected);
        Ok(())
    }
}
