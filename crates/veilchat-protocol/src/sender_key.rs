//! Sender Keys: per-sender symmetric ratchets for group rooms.
//!
//! Each member owns one chain; messages carry the sender's address and
//! chain index. The chain key itself is distributed to every other
//! member inside an ECDH-sealed envelope, and re-generated (with a
//! fresh distribution to the reduced member set) whenever someone
//! leaves, so a departed member cannot read what follows.

use veilchat_crypto::aead::{self, AeadKey, Iv};
use veilchat_crypto::b64;
use veilchat_crypto::ecdh::{P256KeyPair, P256PublicKey};
use veilchat_crypto::hkdf;
use veilchat_crypto::jwk;
use veilchat_types::{Result, VeilchatError, WalletAddress};

use crate::aad;
use crate::chain::{self, ChainKey, MessageKey};
use crate::frames::{GroupMessage, SenderKeyEnvelope};
use crate::RatchetLimits;

const SHARED_SALT: &[u8] = b"e2e-shared";
const SHARED_INFO: &[u8] = b"aes-256-gcm";

// ---------------------------------------------------------------------------
// SenderKeyState
// ---------------------------------------------------------------------------

/// One sender's chain: ours for encrypting, a peer's for decrypting.
pub struct SenderKeyState {
    sender: WalletAddress,
    chain: ChainKey,
    index: u32,
    skipped: Vec<(u32, MessageKey)>,
    limits: RatchetLimits,
}

impl SenderKeyState {
    /// Creates a fresh local sender chain with a random chain key.
    pub fn create(sender: WalletAddress, limits: RatchetLimits) -> Self {
        Self {
            sender,
            chain: ChainKey::random(),
            index: 0,
            skipped: Vec::new(),
            limits,
        }
    }

    /// Adopts a chain key received in a distribution envelope.
    pub fn from_chain_key(sender: WalletAddress, chain: ChainKey, limits: RatchetLimits) -> Self {
        Self {
            sender,
            chain,
            index: 0,
            skipped: Vec::new(),
            limits,
        }
    }

    /// The sender this chain belongs to.
    pub fn sender(&self) -> &WalletAddress {
        &self.sender
    }

    /// Current chain position.
    pub fn chain_index(&self) -> u32 {
        self.index
    }

    /// The current chain key, for sealing into distribution envelopes.
    pub fn current_chain_key(&self) -> &ChainKey {
        &self.chain
    }

    /// Encrypts one group message, advancing the chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<GroupMessage> {
        let (next, mk) = chain::step(self.chain.clone())?;

        let aad = aad::group_message(&self.sender, self.index)?;
        let sealed = aead::encrypt(mk.aead_key(), plaintext, &aad)?;

        let message = GroupMessage {
            sender_address: self.sender.clone(),
            chain_index: self.index,
            ciphertext: b64::encode(&sealed.ciphertext),
            iv: b64::encode(sealed.iv.as_bytes()),
        };

        self.chain = next;
        self.index += 1;
        Ok(message)
    }

    /// Decrypts one group message, committing state only on success.
    ///
    /// - index below the chain: a retained skipped key, or [`VeilchatError::StaleMessage`]
    /// - index at the chain: one step
    /// - index ahead: ratchet forward, banking the gap as skipped keys
    pub fn decrypt(&mut self, message: &GroupMessage) -> Result<Vec<u8>> {
        let ciphertext = b64::decode(&message.ciphertext)?;
        let iv = decode_iv(&message.iv)?;
        let aad = aad::group_message(&message.sender_address, message.chain_index)?;

        if message.chain_index < self.index {
            let pos = self
                .skipped
                .iter()
                .position(|(index, _)| *index == message.chain_index)
                .ok_or(VeilchatError::StaleMessage {
                    index: message.chain_index,
                })?;

            let plaintext = aead::decrypt(self.skipped[pos].1.aead_key(), &ciphertext, &iv, &aad)?;
            self.skipped.remove(pos);
            return Ok(plaintext);
        }

        // Ratchet forward (zero or more skipped steps) on a working copy.
        let (next, mk, banked) = chain::ratchet_to_index(
            self.chain.clone(),
            self.index,
            message.chain_index,
            self.limits.max_skip,
        )?;

        let plaintext = aead::decrypt(mk.aead_key(), &ciphertext, &iv, &aad)?;

        self.chain = next;
        self.index = message.chain_index + 1;
        self.skipped.extend(banked);
        let overflow = self.skipped.len().saturating_sub(self.limits.max_skipped_total);
        if overflow > 0 {
            self.skipped.drain(..overflow);
        }

        Ok(plaintext)
    }
}

// ---------------------------------------------------------------------------
// Distribution envelopes
// ---------------------------------------------------------------------------

/// Derives the pairwise envelope-sealing key:
/// `HKDF(ECDH(us, them), salt="e2e-shared", info="aes-256-gcm", 32 B)`.
///
/// Symmetric in the key material, so either side derives it from its
/// own private half and the other's public half.
fn envelope_key(ours: &P256KeyPair, theirs: &P256PublicKey) -> Result<AeadKey> {
    let shared = ours.ecdh(theirs);
    let key = hkdf::derive_32(shared.as_bytes(), SHARED_SALT, SHARED_INFO)?;
    Ok(AeadKey::from_bytes(key))
}

/// Seals `chain_key` for one recipient.
pub fn seal_chain_key(
    ours: &P256KeyPair,
    our_address: &WalletAddress,
    peer: &P256PublicKey,
    peer_address: &WalletAddress,
    chain_key: &ChainKey,
) -> Result<SenderKeyEnvelope> {
    let key = envelope_key(ours, peer)?;
    let aad = aad::sender_key_envelope(our_address, peer_address)?;
    let sealed = aead::encrypt(&key, chain_key.as_bytes(), &aad)?;

    Ok(SenderKeyEnvelope {
        from_address: our_address.clone(),
        for_public_key: jwk::export_public(peer)?,
        encrypted_chain_key: b64::encode(&sealed.ciphertext),
        iv: b64::encode(sealed.iv.as_bytes()),
    })
}

/// Opens a distribution envelope addressed to us.
///
/// # Errors
///
/// [`VeilchatError::InvalidSenderKey`] if the envelope fails to
/// authenticate — the distributing peer is then ignored.
pub fn open_chain_key(
    ours: &P256KeyPair,
    our_address: &WalletAddress,
    distributor: &P256PublicKey,
    envelope: &SenderKeyEnvelope,
) -> Result<ChainKey> {
    let key = envelope_key(ours, distributor)?;
    let ciphertext = b64::decode(&envelope.encrypted_chain_key)?;
    let iv = decode_iv(&envelope.iv)?;
    let aad = aad::sender_key_envelope(&envelope.from_address, our_address)?;

    let opened =
        aead::decrypt(&key, &ciphertext, &iv, &aad).map_err(|_| VeilchatError::InvalidSenderKey {
            from: envelope.from_address.to_string(),
        })?;

    if opened.len() != 32 {
        return Err(VeilchatError::InvalidSenderKey {
            from: envelope.from_address.to_string(),
        });
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&opened);
    Ok(ChainKey::from_bytes(bytes))
}

fn decode_iv(encoded: &str) -> Result<Iv> {
    let bytes = b64::decode(encoded)?;
    if bytes.len() != Iv::LEN {
        return Err(VeilchatError::ProtocolError {
            reason: format!("expected {}-byte IV, got {}", Iv::LEN, bytes.len()),
        });
    }
    let mut arr = [0u8; 12];
    arr.copy_from_slice(&bytes);
    Ok(Iv::from_bytes(arr))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
