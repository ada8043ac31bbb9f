//! SHA-256 hashing helpers.

use sha2::{Digest, Sha256};
use veilchat_types::ChannelHash;

/// Computes SHA-256 over `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Computes the channel hash of a room name: `SHA-256(room_name)`.
///
/// Both participants hashing the same room name derive the same room
/// identity, which feeds the room key pair derivation as HKDF `info`.
pub fn channel_hash(room_name: &str) -> ChannelHash {
    ChannelHash::new(sha256(room_name.as_bytes()))
}
