//! Master seed and deterministic room key pair derivation.
//!
//! The master seed is `SHA-256(walletSignature)` over a fixed app-wide
//! message — re-signing with the same wallet yields the same seed, and
//! the seed plus a channel hash deterministically yields the same P-256
//! room key pair on every device holding that wallet.
//!
//! # Derivation chain
//!
//! ```text
//! masterSeed = SHA-256(signature)                                   (65 B in)
//! roomSeed   = HKDF(masterSeed, salt="e2e-room-key", info=channelHash, 32 B)
//! scalar     = rejection-sample over
//!              HKDF(roomSeed, salt="e2e-ecdh", info="ecdh-p256-key" [‖ ctr], 32 B)
//! ```
//!
//! The rejection loop reduces derived bits to a valid scalar in
//! `[1, n−1]`: a candidate outside the range (probability ≈ 2⁻³²) bumps
//! a counter byte appended to the HKDF info and tries again.

use std::collections::HashMap;

use p256::{FieldBytes, SecretKey};
use veilchat_types::{ChannelHash, Result, VeilchatError, WalletAddress};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::ecdh::P256KeyPair;
use crate::hash::sha256;
use crate::hkdf;

/// Length of a wallet signature (r ‖ s ‖ v).
pub const WALLET_SIGNATURE_LEN: usize = 65;

const ROOM_KEY_SALT: &[u8] = b"e2e-room-key";
const ECDH_SALT: &[u8] = b"e2e-ecdh";
const ECDH_INFO: &[u8] = b"ecdh-p256-key";

// ---------------------------------------------------------------------------
// MasterSeed
// ---------------------------------------------------------------------------

/// 32-byte master seed derived from a wallet signature.
///
/// Shared process-wide (one per wallet); only the HKDF derivation layer
/// reads it. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterSeed([u8; 32]);

impl MasterSeed {
    /// Derives the seed from a 65-byte wallet signature.
    ///
    /// # Errors
    ///
    /// Returns [`VeilchatError::FatalInit`] for a signature of the wrong
    /// length — the wallet refused or produced garbage.
    pub fn from_signature(signature: &[u8]) -> Result<Self> {
        if signature.len() != WALLET_SIGNATURE_LEN {
            return Err(VeilchatError::FatalInit {
                reason: format!(
                    "wallet signature must be {WALLET_SIGNATURE_LEN} bytes, got {}",
                    signature.len()
                ),
            });
        }
        Ok(Self(sha256(signature)))
    }

    /// Restores a seed from its persisted hex form.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|_| VeilchatError::FatalInit {
            reason: "persisted seed is not valid hex".into(),
        })?;
        if bytes.len() != 32 {
            return Err(VeilchatError::FatalInit {
                reason: format!("persisted seed must be 32 bytes, got {}", bytes.len()),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Hex form for external persistence (the only key material that
    /// ever leaves the process, keyed by wallet address).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// MasterSeed does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// SeedCache
// ---------------------------------------------------------------------------

/// In-memory master seeds keyed by lowercase wallet address.
///
/// Invalidated only by address change — dropping an entry zeroizes it.
#[derive(Default)]
pub struct SeedCache {
    seeds: HashMap<WalletAddress, MasterSeed>,
}

impl SeedCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a seed for `address`, replacing any previous one.
    pub fn insert(&mut self, address: WalletAddress, seed: MasterSeed) {
        self.seeds.insert(address, seed);
    }

    /// Looks up the seed for `address`.
    pub fn get(&self, address: &WalletAddress) -> Option<&MasterSeed> {
        self.seeds.get(address)
    }

    /// Drops (and zeroizes) the seed for `address`.
    pub fn remove(&mut self, address: &WalletAddress) {
        self.seeds.remove(address);
    }
}

// ---------------------------------------------------------------------------
// Room key pair derivation
// ---------------------------------------------------------------------------

/// Deterministically derives the P-256 room key pair for
/// `(masterSeed, channelHash)`.
///
/// Two independent runs with the same inputs produce byte-identical
/// public keys — this is the contract that lets a wallet owner rejoin a
/// room from any device and land on the same room identity.
pub fn derive_room_key_pair(seed: &MasterSeed, channel: &ChannelHash) -> Result<P256KeyPair> {
    let room_seed = Zeroizing::new(hkdf::derive_32(&seed.0, ROOM_KEY_SALT, channel.as_bytes())?);

    // Rejection sampling: counter 0 uses the bare info string, matching
    // the first candidate of the derived bits; subsequent candidates
    // append the counter byte.
    for counter in 0u8..=255 {
        let candidate = Zeroizing::new(derive_scalar_candidate(&room_seed, counter)?);
        if let Ok(secret) = SecretKey::from_bytes(FieldBytes::from_slice(candidate.as_slice())) {
            return Ok(P256KeyPair::from_secret(secret));
        }
    }

    // 256 consecutive out-of-range candidates has probability ≈ 2^-8192.
    Err(VeilchatError::FatalInit {
        reason: "room key derivation exhausted rejection sampling".into(),
    })
}

fn derive_scalar_candidate(room_seed: &[u8; 32], counter: u8) -> Result<[u8; 32]> {
    if counter == 0 {
        hkdf::derive_32(room_seed, ECDH_SALT, ECDH_INFO)
    } else {
        let mut info = [0u8; ECDH_INFO.len() + 1];
        info[..ECDH_INFO.len()].copy_from_slice(ECDH_INFO);
        info[ECDH_INFO.len()] = counter;
        hkdf::derive_32(room_seed, ECDH_SALT, &info)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::channel_hash;

    fn test_signature(fill: u8) -> Vec<u8> {
        vec![fill; WALLET_SIGNATURE_LEN]
    }

    #[test]
    fn seed_is_sha256_of_signature() -> Result<()> {
        let sig = test_signature(0xAB);
        let seed = MasterSeed::from_signature(&sig)?;
        assert_eq!(seed.0, sha256(&sig));
        Ok(())
    }

    #[test]
    fn seed_rejects_wrong_signature_length() {
        assert!(MasterSeed::from_signature(&[0u8; 64]).is_err());
        assert!(MasterSeed::from_signature(&[0u8; 66]).is_err());
        assert!(MasterSeed::from_signature(&[]).is_err());
    }

    #[test]
    fn seed_hex_roundtrip() -> Result<()> {
        let seed = MasterSeed::from_signature(&test_signature(0x42))?;
        let restored = MasterSeed::from_hex(&seed.to_hex())?;
        assert_eq!(seed.0, restored.0);
        Ok(())
    }

    #[test]
    fn seed_hex_rejects_garbage() {
        assert!(MasterSeed::from_hex("zz").is_err());
        assert!(MasterSeed::from_hex("abcd").is_err());
    }

    #[test]
    fn room_key_pair_is_deterministic() -> Result<()> {
        let channel = channel_hash("lobby");

        // Two fully independent derivations from the same signature.
        let seed_a = MasterSeed::from_signature(&test_signature(0x42))?;
        let seed_b = MasterSeed::from_signature(&test_signature(0x42))?;

        let pair_a = derive_room_key_pair(&seed_a, &channel)?;
        let pair_b = derive_room_key_pair(&seed_b, &channel)?;

        assert_eq!(
            pair_a.public().to_sec1_bytes(),
            pair_b.public().to_sec1_bytes()
        );
        Ok(())
    }

    #[test]
    fn different_channels_different_keys() -> Result<()> {
        let seed = MasterSeed::from_signature(&test_signature(0x42))?;

        let pair_a = derive_room_key_pair(&seed, &channel_hash("room-a"))?;
        let pair_b = derive_room_key_pair(&seed, &channel_hash("room-b"))?;

        assert_ne!(
            pair_a.public().to_sec1_bytes(),
            pair_b.public().to_sec1_bytes()
        );
        Ok(())
    }

    #[test]
    fn different_wallets_different_keys() -> Result<()> {
        let channel = channel_hash("lobby");

        let pair_a =
            derive_room_key_pair(&MasterSeed::from_signature(&test_signature(0x01))?, &channel)?;
        let pair_b =
            derive_room_key_pair(&MasterSeed::from_signature(&test_signature(0x02))?, &channel)?;

        assert_ne!(
            pair_a.public().to_sec1_bytes(),
            pair_b.public().to_sec1_bytes()
        );
        Ok(())
    }

    #[test]
    fn derived_pairs_perform_working_ecdh() -> Result<()> {
        let channel = channel_hash("lobby");
        let alice = derive_room_key_pair(&MasterSeed::from_signature(&test_signature(0x01))?, &channel)?;
        let bob = derive_room_key_pair(&MasterSeed::from_signature(&test_signature(0x02))?, &channel)?;

        assert_eq!(
            alice.ecdh(bob.public()).as_bytes(),
            bob.ecdh(alice.public()).as_bytes()
        );
        Ok(())
    }

    #[test]
    fn seed_cache_insert_get_remove() -> Result<()> {
        let addr = WalletAddress::parse("0xabcdef0123456789abcdef0123456789abcdef01")?;
        let mut cache = SeedCache::new();
        assert!(cache.get(&addr).is_none());

        cache.insert(addr.clone(), MasterSeed::from_signature(&test_signature(0x42))?);
        assert!(cache.get(&addr).is_some());

        cache.remove(&addr);
        assert!(cache.get(&addr).is_none());
        Ok(())
    }
}
