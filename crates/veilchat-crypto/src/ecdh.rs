//! P-256 Elliptic-Curve Diffie-Hellman key agreement.
//!
//! Wraps the `p256` crate behind two types: [`P256KeyPair`] (private half
//! never leaves the process — there is deliberately no secret accessor)
//! and [`P256PublicKey`] (curve membership enforced at construction, so
//! the identity point and off-curve inputs are unrepresentable).

use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand::rngs::OsRng;
use veilchat_types::{Result, VeilchatError};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::sha256;

// ---------------------------------------------------------------------------
// P256PublicKey
// ---------------------------------------------------------------------------

/// Validated P-256 public key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct P256PublicKey(PublicKey);

impl P256PublicKey {
    /// Parses an uncompressed SEC1 point (65 bytes, `0x04 || x || y`).
    ///
    /// # Errors
    ///
    /// Returns [`VeilchatError::InvalidPeerKey`] if the bytes do not
    /// encode a point on the curve.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        PublicKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| VeilchatError::InvalidPeerKey {
                reason: "not a valid P-256 point".into(),
            })
    }

    /// Builds a public key from raw affine coordinates (JWK `x`/`y`).
    pub fn from_affine_coordinates(x: &[u8; 32], y: &[u8; 32]) -> Result<Self> {
        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(x),
            FieldBytes::from_slice(y),
            false,
        );
        Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
            .map(Self)
            .ok_or_else(|| VeilchatError::InvalidPeerKey {
                reason: "coordinates are not on the P-256 curve".into(),
            })
    }

    /// Returns the uncompressed SEC1 encoding (65 bytes).
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(false).as_bytes().to_vec()
    }

    /// Returns the affine coordinates as two 32-byte arrays.
    pub fn affine_coordinates(&self) -> Result<([u8; 32], [u8; 32])> {
        let point = self.0.to_encoded_point(false);
        let (x, y) = match (point.x(), point.y()) {
            (Some(x), Some(y)) => (x, y),
            // Unreachable for a validated non-identity key, but this
            // module never panics.
            _ => {
                return Err(VeilchatError::CryptoError {
                    reason: "public key has no affine coordinates".into(),
                })
            }
        };
        let mut xb = [0u8; 32];
        let mut yb = [0u8; 32];
        xb.copy_from_slice(x);
        yb.copy_from_slice(y);
        Ok((xb, yb))
    }

    /// SHA-256 fingerprint of the SEC1 encoding.
    ///
    /// Used to index skipped-key maps by the DH key that was current when
    /// a message key was set aside.
    pub fn fingerprint(&self) -> [u8; 32] {
        sha256(&self.to_sec1_bytes())
    }
}

// ---------------------------------------------------------------------------
// SharedSecret
// ---------------------------------------------------------------------------

/// Raw 32-byte ECDH shared secret (the x-coordinate of the shared point).
///
/// Zeroized on drop. Must be passed through HKDF before use as a key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Returns the raw shared secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// SharedSecret does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// P256KeyPair
// ---------------------------------------------------------------------------

/// P-256 key pair for ECDH.
///
/// The secret scalar is not exportable: there is no accessor returning
/// secret bytes, and the `SecretKey` zeroizes itself on drop.
pub struct P256KeyPair {
    secret: SecretKey,
    public: P256PublicKey,
}

impl P256KeyPair {
    /// Generates a fresh random key pair from OS entropy.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = P256PublicKey(secret.public_key());
        Self { secret, public }
    }

    /// Builds a key pair from an already-validated secret key.
    pub(crate) fn from_secret(secret: SecretKey) -> Self {
        let public = P256PublicKey(secret.public_key());
        Self { secret, public }
    }

    /// Returns the public half.
    pub fn public(&self) -> &P256PublicKey {
        &self.public
    }

    /// Performs ECDH with a peer's public key, yielding 32 secret bytes.
    ///
    /// Peer validation (curve membership, non-identity) happened at
    /// import, so agreement itself cannot fail.
    pub fn ecdh(&self, peer: &P256PublicKey) -> SharedSecret {
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer.0.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        SharedSecret(out)
    }
}

// P256KeyPair does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_shared_secret_matches() {
        let a = P256KeyPair::generate();
        let b = P256KeyPair::generate();

        let shared_ab = a.ecdh(b.public());
        let shared_ba = b.ecdh(a.public());
        assert_eq!(shared_ab.as_bytes(), shared_ba.as_bytes());
    }

    #[test]
    fn different_peers_different_secrets() {
        let a = P256KeyPair::generate();
        let b = P256KeyPair::generate();
        let c = P256KeyPair::generate();

        assert_ne!(a.ecdh(b.public()).as_bytes(), a.ecdh(c.public()).as_bytes());
    }

    #[test]
    fn sec1_roundtrip() -> Result<()> {
        let pair = P256KeyPair::generate();
        let bytes = pair.public().to_sec1_bytes();
        assert_eq!(bytes.len(), 65);
        assert_eq!(bytes[0], 0x04);

        let parsed = P256PublicKey::from_sec1_bytes(&bytes)?;
        assert_eq!(&parsed, pair.public());
        Ok(())
    }

    #[test]
    fn affine_roundtrip() -> Result<()> {
        let pair = P256KeyPair::generate();
        let (x, y) = pair.public().affine_coordinates()?;
        let rebuilt = P256PublicKey::from_affine_coordinates(&x, &y)?;
        assert_eq!(&rebuilt, pair.public());
        Ok(())
    }

    #[test]
    fn off_curve_coordinates_rejected() {
        // (1, 1) is not on P-256.
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x[31] = 1;
        y[31] = 1;
        assert!(P256PublicKey::from_affine_coordinates(&x, &y).is_err());
    }

    #[test]
    fn garbage_sec1_rejected() {
        assert!(P256PublicKey::from_sec1_bytes(&[0xFF; 65]).is_err());
        assert!(P256PublicKey::from_sec1_bytes(&[]).is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = P256KeyPair::generate();
        let b = P256KeyPair::generate();
        assert_eq!(a.public().fingerprint(), a.public().fingerprint());
        assert_ne!(a.public().fingerprint(), b.public().fingerprint());
    }
}
