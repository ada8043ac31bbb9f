//! HMAC-SHA256 for symmetric ratchet chain derivation.
//!
//! Ratchet chains advance by keying HMAC-SHA256 with the current chain
//! key and hashing a single domain byte: `0x01` yields the next chain
//! key, `0x02` yields the message key. The one-way property of HMAC is
//! what makes a ratchet step irreversible.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use veilchat_types::{Result, VeilchatError};

type HmacSha256 = Hmac<Sha256>;

/// Computes HMAC-SHA256 over `data` keyed by `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| VeilchatError::CryptoError {
            reason: format!("HMAC initialization failed: {e}"),
        })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Derives key material from a 32-byte chain key and a single label byte.
pub fn derive_labeled(chain_key: &[u8; 32], label: u8) -> Result<[u8; 32]> {
    hmac_sha256(chain_key, &[label])
}
