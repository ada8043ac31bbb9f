//! Symmetric KDF chain: the inner ratchet shared by the Double Ratchet
//! and Sender Keys.
//!
//! One step turns a chain key into the next chain key and a one-shot
//! message key:
//!
//! ```text
//! CK' = HMAC-SHA256(CK, 0x01)
//! MK  = HMAC-SHA256(CK, 0x02)
//! ```
//!
//! Stepping consumes the input chain key; after the call returns, the
//! previous `CK` has been zeroized and cannot be recovered.

use rand::rngs::OsRng;
use rand::RngCore;
use veilchat_crypto::aead::AeadKey;
use veilchat_crypto::hmac;
use veilchat_types::{Result, VeilchatError};
use zeroize::{Zeroize, ZeroizeOnDrop};

const CHAIN_LABEL: u8 = 0x01;
const MESSAGE_LABEL: u8 = 0x02;

// ---------------------------------------------------------------------------
// ChainKey
// ---------------------------------------------------------------------------

/// 256-bit chain key: one position on a one-way KDF chain.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    /// Wraps raw chain key material (e.g. an opened distribution
    /// envelope or a DH-ratchet output).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random chain key (a new sender chain).
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes, needed when sealing the chain key for distribution.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// ChainKey does not implement Debug to prevent leakage.

// ---------------------------------------------------------------------------
// MessageKey
// ---------------------------------------------------------------------------

/// One-shot AES-256-GCM message key derived from a chain position.
pub struct MessageKey(AeadKey);

impl MessageKey {
    /// The AEAD key for this key's single encrypt or decrypt.
    pub fn aead_key(&self) -> &AeadKey {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Stepping
// ---------------------------------------------------------------------------

/// Advances the chain one step, consuming the input chain key.
pub fn step(ck: ChainKey) -> Result<(ChainKey, MessageKey)> {
    let next = hmac::derive_labeled(&ck.0, CHAIN_LABEL)?;
    let message = hmac::derive_labeled(&ck.0, MESSAGE_LABEL)?;
    // `ck` is dropped (and zeroized) here.
    Ok((
        ChainKey(next),
        MessageKey(AeadKey::from_bytes(message)),
    ))
}

/// Derives and collects the message keys for every index in
/// `[current, target)` without consuming the target step.
///
/// Returns the chain key positioned at `target` plus the skipped keys.
///
/// # Errors
///
/// [`VeilchatError::SkipOverflow`] if the gap exceeds `max_skip`. The
/// input chain key is consumed either way; callers wanting
/// no-mutation-on-failure must work on a clone.
pub fn skip_to(
    ck: ChainKey,
    current: u32,
    target: u32,
    max_skip: u32,
) -> Result<(ChainKey, Vec<(u32, MessageKey)>)> {
    let gap = target.saturating_sub(current);
    if gap > max_skip {
        return Err(VeilchatError::SkipOverflow {
            requested: gap,
            max: max_skip,
        });
    }

    let mut chain = ck;
    let mut skipped = Vec::with_capacity(gap as usize);
    for index in current..target {
        let (next, mk) = step(chain)?;
        skipped.push((index, mk));
        chain = next;
    }

    Ok((chain, skipped))
}

/// Advances from `current` to `target`, collecting skipped keys for
/// `[current, target)`, then one more step for the target itself.
///
/// Returns `(chain key positioned after target, MK_target, skipped)`.
pub fn ratchet_to_index(
    ck: ChainKey,
    current: u32,
    target: u32,
    max_skip: u32,
) -> Result<(ChainKey, MessageKey, Vec<(u32, MessageKey)>)> {
    let (chain, skipped) = skip_to(ck, current, target, max_skip)?;
    let (chain, mk) = step(chain)?;
    Ok((chain, mk, skipped))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use veilchat_crypto::aead;

    #[test]
    fn step_produces_distinct_chain_and_message_keys() -> Result<()> {
        let ck = ChainKey::from_bytes([0x42; 32]);
        let (next, mk) = step(ck)?;
        assert_ne!(next.as_bytes(), mk.aead_key().as_bytes());
        Ok(())
    }

    #[test]
    fn chains_from_same_seed_stay_in_lockstep() -> Result<()> {
        let mut a = ChainKey::from_bytes([0x11; 32]);
        let mut b = ChainKey::from_bytes([0x11; 32]);

        for _ in 0..5 {
            let (a_next, a_mk) = step(a)?;
            let (b_next, b_mk) = step(b)?;
            assert_eq!(a_mk.aead_key().as_bytes(), b_mk.aead_key().as_bytes());
            a = a_next;
            b = b_next;
        }
        Ok(())
    }

    #[test]
    fn ratchet_to_index_collects_every_skipped_key() -> Result<()> {
        let (_, mk3, skipped) =
            ratchet_to_index(ChainKey::from_bytes([0x11; 32]), 0, 3, 100)?;

        assert_eq!(
            skipped.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        // The skipped keys and the target key match a straight walk.
        let mut ck = ChainKey::from_bytes([0x11; 32]);
        for (_, expected) in &skipped {
            let (next, mk) = step(ck)?;
            assert_eq!(mk.aead_key().as_bytes(), expected.aead_key().as_bytes());
            ck = next;
        }
        let (_, walked_mk3) = step(ck)?;
        assert_eq!(walked_mk3.aead_key().as_bytes(), mk3.aead_key().as_bytes());
        Ok(())
    }

    #[test]
    fn ratchet_to_current_index_skips_nothing() -> Result<()> {
        let (_, _, skipped) = ratchet_to_index(ChainKey::from_bytes([0x11; 32]), 4, 4, 100)?;
        assert!(skipped.is_empty());
        Ok(())
    }

    #[test]
    fn gap_beyond_max_skip_overflows() {
        let result = ratchet_to_index(ChainKey::from_bytes([0x11; 32]), 0, 101, 100);
        assert!(matches!(
            result,
            Err(VeilchatError::SkipOverflow {
                requested: 101,
                max: 100
            })
        ));
    }

    #[test]
    fn message_key_encrypts_exactly_like_its_bytes() -> Result<()> {
        let (_, mk) = step(ChainKey::from_bytes([0x42; 32]))?;
        let sealed = aead::encrypt(mk.aead_key(), b"payload", b"aad")?;
        let plain = aead::decrypt(mk.aead_key(), &sealed.ciphertext, &sealed.iv, b"aad")?;
        assert_eq!(plain, b"payload");
        Ok(())
    }
}
