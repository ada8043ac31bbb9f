//! JWK import/export for P-256 public keys (RFC 7518 §6.2).
//!
//! Only the public form is ever accepted: any inbound JWK carrying the
//! private scalar `d` is rejected outright, regardless of whether the
//! rest of the key is well formed.

use serde::{Deserialize, Serialize};
use veilchat_types::{Result, VeilchatError};

use crate::b64;
use crate::ecdh::P256PublicKey;

/// JSON Web Key for an EC public key.
///
/// `{"kty":"EC","crv":"P-256","x":…,"y":…}` with base64url (unpadded)
/// coordinates. The optional `d` field exists only so that inbound keys
/// smuggling a private scalar can be detected and rejected — it is never
/// populated on export.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type; always `"EC"`.
    pub kty: String,
    /// Curve name; always `"P-256"`.
    pub crv: String,
    /// Base64url-encoded x coordinate.
    pub x: String,
    /// Base64url-encoded y coordinate.
    pub y: String,
    /// Private scalar. Must be absent; present only on hostile input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

/// Exports a validated public key to its JWK form.
pub fn export_public(key: &P256PublicKey) -> Result<Jwk> {
    let (x, y) = key.affine_coordinates()?;
    Ok(Jwk {
        kty: "EC".into(),
        crv: "P-256".into(),
        x: b64::encode_url(&x),
        y: b64::encode_url(&y),
        d: None,
    })
}

/// Imports and validates a JWK public key.
///
/// # Errors
///
/// Returns [`VeilchatError::InvalidPeerKey`] if the JWK:
/// - contains a `d` (private scalar) component,
/// - has a key type other than `EC` or a curve other than `P-256`,
/// - has malformed base64url or wrong-length coordinates,
/// - encodes a point that is not on the curve.
pub fn import_public(jwk: &Jwk) -> Result<P256PublicKey> {
    if jwk.d.is_some() {
        return Err(VeilchatError::InvalidPeerKey {
            reason: "JWK contains a private scalar component".into(),
        });
    }
    if jwk.kty != "EC" {
        return Err(VeilchatError::InvalidPeerKey {
            reason: format!("unsupported key type '{}'", jwk.kty),
        });
    }
    if jwk.crv != "P-256" {
        return Err(VeilchatError::InvalidPeerKey {
            reason: format!("unsupported curve '{}'", jwk.crv),
        });
    }

    let x = decode_coordinate(&jwk.x, "x")?;
    let y = decode_coordinate(&jwk.y, "y")?;
    P256PublicKey::from_affine_coordinates(&x, &y)
}

fn decode_coordinate(value: &str, name: &str) -> Result<[u8; 32]> {
    let bytes = b64::decode_url(value).map_err(|_| VeilchatError::InvalidPeerKey {
        reason: format!("coordinate '{name}' is not valid base64url"),
    })?;
    if bytes.len() != 32 {
        return Err(VeilchatError::InvalidPeerKey {
            reason: format!("coordinate '{name}': expected 32 bytes, got {}", bytes.len()),
        });
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}
