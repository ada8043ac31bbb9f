//! Double Ratchet session state machine.
//!
//! Combines a DH ratchet (a fresh ECDH per direction change, giving
//! post-compromise recovery) with the symmetric chain of [`crate::chain`]
//! (one message key per message, giving forward secrecy). Out-of-order
//! delivery is tolerated up to the configured skip bound by setting
//! message keys aside, indexed by the DH key that was current when they
//! were skipped.
//!
//! # Mutation discipline
//!
//! `decrypt` is transactional: the whole candidate state — ratcheted
//! chains, a possibly rotated DH pair, collected skipped keys — is
//! computed into locals first, the AEAD tag is verified, and only then
//! is anything committed. A tampered frame or an oversized skip leaves
//! the session byte-for-byte untouched.
//!
//! Callers must serialize `encrypt`/`decrypt` per session; the
//! orchestrator wraps each session in a FIFO mutex.

use std::collections::VecDeque;

use veilchat_crypto::aead::{self, Iv};
use veilchat_crypto::b64;
use veilchat_crypto::ecdh::{P256KeyPair, P256PublicKey};
use veilchat_crypto::hkdf;
use veilchat_crypto::jwk;
use veilchat_types::{Result, VeilchatError, WalletAddress};
use zeroize::Zeroizing;

use crate::aad;
use crate::chain::{self, ChainKey, MessageKey};
use crate::frames::DirectMessage;
use crate::x3dh::RootKey;
use crate::RatchetLimits;

const ROOT_SALT: &[u8] = b"dr-root";
const CHAIN_SALT: &[u8] = b"dr-chain";
const ROOT_INFO: &[u8] = b"root-key";
const CHAIN_INFO: &[u8] = b"chain-key";

// ---------------------------------------------------------------------------
// DH ratchet step
// ---------------------------------------------------------------------------

/// One DH-ratchet step: mixes the current root key with a fresh ECDH
/// output into a new root key and a chain key.
fn dh_step(
    root: &RootKey,
    pair: &P256KeyPair,
    remote: &P256PublicKey,
) -> Result<(RootKey, ChainKey)> {
    let dh = pair.ecdh(remote);

    let mut ikm = Zeroizing::new([0u8; 64]);
    ikm[0..32].copy_from_slice(root.as_bytes());
    ikm[32..64].copy_from_slice(dh.as_bytes());

    let new_root = hkdf::derive_32(ikm.as_slice(), ROOT_SALT, ROOT_INFO)?;
    let chain = hkdf::derive_32(ikm.as_slice(), CHAIN_SALT, CHAIN_INFO)?;

    Ok((RootKey::from_bytes(new_root), ChainKey::from_bytes(chain)))
}

// ---------------------------------------------------------------------------
// Skipped key store
// ---------------------------------------------------------------------------

struct SkippedEntry {
    fingerprint: [u8; 32],
    index: u32,
    key: MessageKey,
    seen_at: u64,
}

/// Bounded store of message keys set aside for out-of-order frames.
///
/// Entries are keyed by `(DH key fingerprint, chain index)`, consumed at
/// most once, evicted oldest-first past the global cap, and expired once
/// they are `ttl_messages` processed messages old.
struct SkippedKeys {
    entries: VecDeque<SkippedEntry>,
    max_total: usize,
    ttl_messages: u64,
}

impl SkippedKeys {
    fn new(limits: &RatchetLimits) -> Self {
        Self {
            entries: VecDeque::new(),
            max_total: limits.max_skipped_total,
            ttl_messages: limits.ttl_messages,
        }
    }

    fn contains(&self, fingerprint: &[u8; 32], index: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.fingerprint == *fingerprint && e.index == index)
    }

    fn peek(&self, fingerprint: &[u8; 32], index: u32) -> Option<&MessageKey> {
        self.entries
            .iter()
            .find(|e| e.fingerprint == *fingerprint && e.index == index)
            .map(|e| &e.key)
    }

    fn remove(&mut self, fingerprint: &[u8; 32], index: u32) {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.fingerprint == *fingerprint && e.index == index)
        {
            self.entries.remove(pos);
        }
    }

    fn insert(&mut self, fingerprint: [u8; 32], index: u32, key: MessageKey, seen_at: u64) {
        while self.entries.len() >= self.max_total {
            self.entries.pop_front();
        }
        self.entries.push_back(SkippedEntry {
            fingerprint,
            index,
            key,
            seen_at,
        });
    }

    fn prune_expired(&mut self, now: u64) {
        while let Some(front) = self.entries.front() {
            if now.saturating_sub(front.seen_at) > self.ttl_messages {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// DoubleRatchet
// ---------------------------------------------------------------------------

/// Per-peer Double Ratchet session.
pub struct DoubleRatchet {
    local: WalletAddress,
    remote: WalletAddress,
    limits: RatchetLimits,

    dh_pair: P256KeyPair,
    remote_dh_public: Option<P256PublicKey>,
    root_key: RootKey,

    sending_chain: Option<ChainKey>,
    sending_index: u32,
    previous_sending_chain_length: u32,

    receiving_chain: Option<ChainKey>,
    receiving_index: u32,

    skipped: SkippedKeys,
    /// Count of messages processed by this session, the clock for
    /// skipped-key expiry.
    processed: u64,
}

impl DoubleRatchet {
    /// Initializes the initiator side after X3DH completes.
    ///
    /// Performs the first DH-ratchet step against the responder's
    /// handshake ephemeral, so the initiator can encrypt immediately.
    pub fn new_initiator(
        local: WalletAddress,
        remote: WalletAddress,
        root_key: RootKey,
        responder_ephemeral: P256PublicKey,
        limits: RatchetLimits,
    ) -> Result<Self> {
        let dh_pair = P256KeyPair::generate();
        let (root_key, sending_chain) = dh_step(&root_key, &dh_pair, &responder_ephemeral)?;

        Ok(Self {
            local,
            remote,
            skipped: SkippedKeys::new(&limits),
            limits,
            dh_pair,
            remote_dh_public: Some(responder_ephemeral),
            root_key,
            sending_chain: Some(sending_chain),
            sending_index: 0,
            previous_sending_chain_length: 0,
            receiving_chain: None,
            receiving_index: 0,
            processed: 0,
        })
    }

    /// Initializes the responder side after answering an X3DH init.
    ///
    /// The responder's handshake ephemeral becomes its ratchet DH pair;
    /// chains are established by the initiator's first message.
    pub fn new_responder(
        local: WalletAddress,
        remote: WalletAddress,
        root_key: RootKey,
        ephemeral: P256KeyPair,
        limits: RatchetLimits,
    ) -> Self {
        Self {
            local,
            remote,
            skipped: SkippedKeys::new(&limits),
            limits,
            dh_pair: ephemeral,
            remote_dh_public: None,
            root_key,
            sending_chain: None,
            sending_index: 0,
            previous_sending_chain_length: 0,
            receiving_chain: None,
            receiving_index: 0,
            processed: 0,
        }
    }

    /// Address of the peer this session talks to.
    pub fn remote(&self) -> &WalletAddress {
        &self.remote
    }

    /// Current sending chain position.
    pub fn sending_index(&self) -> u32 {
        self.sending_index
    }

    /// Current receiving chain position.
    pub fn receiving_index(&self) -> u32 {
        self.receiving_index
    }

    /// Number of retained skipped message keys.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    // -----------------------------------------------------------------------
    // Encrypt
    // -----------------------------------------------------------------------

    /// Encrypts one message, advancing the sending chain by one step.
    ///
    /// # Errors
    ///
    /// `ProtocolError` if no sending chain exists yet — the responder
    /// cannot send before the initiator's first message arrives.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<DirectMessage> {
        let ck = self
            .sending_chain
            .clone()
            .ok_or_else(|| VeilchatError::ProtocolError {
                reason: "no sending chain established yet".into(),
            })?;

        let (next_ck, mk) = chain::step(ck)?;

        let dh_public = self.dh_pair.public();
        let aad = aad::direct_message(
            &self.local,
            &dh_public.to_sec1_bytes(),
            self.previous_sending_chain_length,
            self.sending_index,
        )?;
        let sealed = aead::encrypt(mk.aead_key(), plaintext, &aad)?;

        let message = DirectMessage {
            sender: self.local.clone(),
            sender_dh_public_key: jwk::export_public(dh_public)?,
            previous_chain_length: self.previous_sending_chain_length,
            chain_index: self.sending_index,
            ciphertext: b64::encode(&sealed.ciphertext),
            iv: b64::encode(sealed.iv.as_bytes()),
        };

        // Commit after the AEAD succeeded.
        self.sending_chain = Some(next_ck);
        self.sending_index += 1;

        Ok(message)
    }

    // -----------------------------------------------------------------------
    // Decrypt
    // -----------------------------------------------------------------------

    /// Decrypts one message, committing state only on success.
    pub fn decrypt(&mut self, message: &DirectMessage) -> Result<Vec<u8>> {
        let sender_dh = jwk::import_public(&message.sender_dh_public_key)?;
        let ciphertext = b64::decode(&message.ciphertext)?;
        let iv = decode_iv(&message.iv)?;

        let aad = aad::direct_message(
            &message.sender,
            &sender_dh.to_sec1_bytes(),
            message.previous_chain_length,
            message.chain_index,
        )?;

        let fingerprint = sender_dh.fingerprint();

        // 1. A key set aside for exactly this frame.
        if self.skipped.contains(&fingerprint, message.chain_index) {
            let mk = self
                .skipped
                .peek(&fingerprint, message.chain_index)
                .ok_or(VeilchatError::AuthenticationFailure)?;
            let plaintext = aead::decrypt(mk.aead_key(), &ciphertext, &iv, &aad)?;

            self.skipped.remove(&fingerprint, message.chain_index);
            self.bump_processed();
            return Ok(plaintext);
        }

        // 2. Compute the candidate state without touching `self`.
        let is_new_remote_key = match &self.remote_dh_public {
            Some(current) => current != &sender_dh,
            None => true,
        };

        let mut pending_skipped: Vec<([u8; 32], u32, MessageKey)> = Vec::new();
        let mut new_root: Option<RootKey> = None;
        let mut new_dh_pair: Option<P256KeyPair> = None;
        let mut new_sending: Option<ChainKey> = None;

        let (work_chain, work_index) = if is_new_remote_key {
            // Close out the old receiving chain, banking its remainder.
            if let (Some(old_chain), Some(old_remote)) =
                (self.receiving_chain.clone(), self.remote_dh_public.as_ref())
            {
                let old_fingerprint = old_remote.fingerprint();
                let (_, banked) = chain::skip_to(
                    old_chain,
                    self.receiving_index,
                    message.previous_chain_length,
                    self.limits.max_skip,
                )?;
                for (index, key) in banked {
                    pending_skipped.push((old_fingerprint, index, key));
                }
            }

            // Receiving half of the DH ratchet.
            let (root_after_recv, receiving) = dh_step(&self.root_key, &self.dh_pair, &sender_dh)?;

            // Sending half, under a rotated DH pair.
            let rotated = P256KeyPair::generate();
            let (root_after_send, sending) = dh_step(&root_after_recv, &rotated, &sender_dh)?;

            new_root = Some(root_after_send);
            new_dh_pair = Some(rotated);
            new_sending = Some(sending);

            (receiving, 0u32)
        } else {
            let chain = self
                .receiving_chain
                .clone()
                .ok_or_else(|| VeilchatError::ProtocolError {
                    reason: "no receiving chain for current remote key".into(),
                })?;
            (chain, self.receiving_index)
        };

        if message.chain_index < work_index {
            return Err(VeilchatError::StaleMessage {
                index: message.chain_index,
            });
        }

        // 3. Skip forward on the (possibly fresh) receiving chain.
        let (chain_at_target, banked) = chain::skip_to(
            work_chain,
            work_index,
            message.chain_index,
            self.limits.max_skip,
        )?;
        for (index, key) in banked {
            pending_skipped.push((fingerprint, index, key));
        }

        // 4. Derive this frame's key and authenticate.
        let (final_chain, mk) = chain::step(chain_at_target)?;
        let plaintext = aead::decrypt(mk.aead_key(), &ciphertext, &iv, &aad)?;

        // 5. Commit.
        if let Some(root) = new_root {
            self.root_key = root;
        }
        if let Some(pair) = new_dh_pair {
            self.dh_pair = pair;
            self.previous_sending_chain_length = self.sending_index;
            self.sending_index = 0;
            self.sending_chain = new_sending;
        }
        self.remote_dh_public = Some(sender_dh);
        self.receiving_chain = Some(final_chain);
        self.receiving_index = message.chain_index + 1;

        self.bump_processed();
        let now = self.processed;
        for (fp, index, key) in pending_skipped {
            self.skipped.insert(fp, index, key, now);
        }
        self.skipped.prune_expired(now);

        Ok(plaintext)
    }

    fn bump_processed(&mut self) {
        self.processed += 1;
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x3dh;

    fn addr(last: u8) -> WalletAddress {
        WalletAddress::parse(&format!("0x{:038x}{:02x}", 0, last)).unwrap()
    }

    /// Runs a real X3DH and builds both session halves.
    fn session_pair() -> (DoubleRatchet, DoubleRatchet) {
        let alice_identity = P256KeyPair::generate();
        let bob_identity = P256KeyPair::generate();
        let alice_ephemeral = x3dh::initiate();

        let (bob_root, bob_ephemeral) = x3dh::respond(
            &bob_identity,
            alice_identity.public(),
            alice_ephemeral.public(),
        )
        .unwrap();
        let alice_root = x3dh::complete(
            &alice_identity,
            &alice_ephemeral,
            bob_identity.public(),
            bob_ephemeral.public(),
        )
        .unwrap();

        let bob_ephemeral_public = bob_ephemeral.public().clone();
        let alice = DoubleRatchet::new_initiator(
            addr(1),
            addr(2),
            alice_root,
            bob_ephemeral_public,
            RatchetLimits::default(),
        )
        .unwrap();
        let bob = DoubleRatchet::new_responder(
            addr(2),
            addr(1),
            bob_root,
            bob_ephemeral,
            RatchetLimits::default(),
        );

        (alice, bob)
    }

    #[test]
    fn roundtrip_in_both_directions() -> Result<()> {
        let (mut alice, mut bob) = session_pair();

        let m1 = alice.encrypt(b"hello bob")?;
        assert_eq!(bob.decrypt(&m1)?, b"hello bob");

        let r1 = bob.encrypt(b"hello alice")?;
        assert_eq!(alice.decrypt(&r1)?, b"hello alice");
        Ok(())
    }

    #[test]
    fn responder_cannot_send_first() {
        let (_, mut bob) = session_pair();
        assert!(bob.encrypt(b"too early").is_err());
    }

    #[test]
    fn long_alternating_conversation() -> Result<()> {
        let (mut alice, mut bob) = session_pair();

        for round in 0..8 {
            let msg = format!("alice round {round}");
            let frame = alice.encrypt(msg.as_bytes())?;
            assert_eq!(bob.decrypt(&frame)?, msg.as_bytes());

            let msg = format!("bob round {round}");
            let frame = bob.encrypt(msg.as_bytes())?;
            assert_eq!(alice.decrypt(&frame)?, msg.as_bytes());
        }
        Ok(())
    }

    #[test]
    fn out_of_order_within_one_chain() -> Result<()> {
        let (mut alice, mut bob) = session_pair();

        let m1 = alice.encrypt(b"m1")?;
        let m2 = alice.encrypt(b"m2")?;
        let m3 = alice.encrypt(b"m3")?;

        // Delivery order: m3, m1, m2.
        assert_eq!(bob.decrypt(&m3)?, b"m3");
        assert_eq!(bob.skipped_key_count(), 2);
        assert_eq!(bob.decrypt(&m1)?, b"m1");
        assert_eq!(bob.decrypt(&m2)?, b"m2");

        assert_eq!(bob.receiving_index(), 3);
        assert_eq!(bob.skipped_key_count(), 0);
        Ok(())
    }

    #[test]
    fn dh_ratchet_resets_sending_chain() -> Result<()> {
        let (mut alice, mut bob) = session_pair();

        let m1 = alice.encrypt(b"m1")?;
        let m2 = alice.encrypt(b"m2")?;
        bob.decrypt(&m1)?;
        bob.decrypt(&m2)?;

        let r1 = bob.encrypt(b"r1")?;
        alice.decrypt(&r1)?;

        // Alice's reply rides a new chain.
        let m3 = alice.encrypt(b"m3")?;
        assert_eq!(m3.previous_chain_length, 2);
        assert_eq!(m3.chain_index, 0);
        assert_eq!(bob.decrypt(&m3)?, b"m3");
        Ok(())
    }

    #[test]
    fn skipped_keys_survive_dh_ratchet() -> Result<()> {
        let (mut alice, mut bob) = session_pair();

        let m1 = alice.encrypt(b"m1")?;
        let m2 = alice.encrypt(b"m2")?;
        bob.decrypt(&m1)?;
        // m2 is in flight while the conversation turns around.

        let r1 = bob.encrypt(b"r1")?;
        alice.decrypt(&r1)?;
        let m3 = alice.encrypt(b"m3")?;

        // m3 (new chain) arrives before m2 (old chain).
        assert_eq!(bob.decrypt(&m3)?, b"m3");
        assert_eq!(bob.decrypt(&m2)?, b"m2");
        Ok(())
    }

    #[test]
    fn tampered_ciphertext_leaves_state_untouched() -> Result<()> {
        let (mut alice, mut bob) = session_pair();

        let mut frame = alice.encrypt(b"secret")?;
        let mut raw = b64::decode(&frame.ciphertext)?;
        raw[0] ^= 0xFF;
        frame.ciphertext = b64::encode(&raw);

        let before_index = bob.receiving_index();
        let result = bob.decrypt(&frame);
        assert!(matches!(result, Err(VeilchatError::AuthenticationFailure)));
        assert_eq!(bob.receiving_index(), before_index);
        assert_eq!(bob.skipped_key_count(), 0);
        Ok(())
    }

    #[test]
    fn mutated_metadata_fails_authentication() -> Result<()> {
        let (mut alice, mut bob) = session_pair();

        // Burn index 0 so a forged index 0 is a stale frame and a forged
        // higher index hits the AAD check.
        let m0 = alice.encrypt(b"m0")?;
        bob.decrypt(&m0)?;

        let mut frame = alice.encrypt(b"m1")?;
        frame.chain_index = 5;
        let result = bob.decrypt(&frame);
        assert!(matches!(result, Err(VeilchatError::AuthenticationFailure)));

        let mut frame = alice.encrypt(b"m2")?;
        frame.sender = addr(9);
        let result = bob.decrypt(&frame);
        assert!(matches!(result, Err(VeilchatError::AuthenticationFailure)));
        Ok(())
    }

    #[test]
    fn gap_beyond_max_skip_fails_without_mutation() -> Result<()> {
        let limits = RatchetLimits {
            max_skip: 4,
            ..RatchetLimits::default()
        };

        let alice_identity = P256KeyPair::generate();
        let bob_identity = P256KeyPair::generate();
        let alice_ephemeral = x3dh::initiate();
        let (bob_root, bob_ephemeral) = x3dh::respond(
            &bob_identity,
            alice_identity.public(),
            alice_ephemeral.public(),
        )?;
        let alice_root = x3dh::complete(
            &alice_identity,
            &alice_ephemeral,
            bob_identity.public(),
            bob_ephemeral.public(),
        )?;
        let bob_ephemeral_public = bob_ephemeral.public().clone();
        let mut alice =
            DoubleRatchet::new_initiator(addr(1), addr(2), alice_root, bob_ephemeral_public, limits)?;
        let mut bob = DoubleRatchet::new_responder(addr(2), addr(1), bob_root, bob_ephemeral, limits);

        // Skip 6 messages: beyond the bound of 4.
        let mut last = alice.encrypt(b"x")?;
        for _ in 0..5 {
            last = alice.encrypt(b"x")?;
        }

        let result = bob.decrypt(&last);
        assert!(matches!(result, Err(VeilchatError::SkipOverflow { .. })));
        assert_eq!(bob.receiving_index(), 0);
        assert_eq!(bob.skipped_key_count(), 0);
        Ok(())
    }

    #[test]
    fn replayed_message_is_rejected() -> Result<()> {
        let (mut alice, mut bob) = session_pair();

        let m1 = alice.encrypt(b"m1")?;
        bob.decrypt(&m1)?;

        // Same frame again: index below the chain, no skipped key.
        let result = bob.decrypt(&m1);
        assert!(matches!(result, Err(VeilchatError::StaleMessage { index: 0 })));
        Ok(())
    }

    #[test]
    fn skipped_key_is_consumed_exactly_once() -> Result<()> {
        let (mut alice, mut bob) = session_pair();

        let m1 = alice.encrypt(b"m1")?;
        let m2 = alice.encrypt(b"m2")?;

        bob.decrypt(&m2)?;
        assert_eq!(bob.decrypt(&m1)?, b"m1");

        let result = bob.decrypt(&m1);
        assert!(matches!(result, Err(VeilchatError::StaleMessage { .. })));
        Ok(())
    }

    #[test]
    fn global_skipped_cap_evicts_oldest() -> Result<()> {
        let limits = RatchetLimits {
            max_skip: 100,
            max_skipped_total: 5,
            ttl_messages: 1000,
        };

        let alice_identity = P256KeyPair::generate();
        let bob_identity = P256KeyPair::generate();
        let alice_ephemeral = x3dh::initiate();
        let (bob_root, bob_ephemeral) = x3dh::respond(
            &bob_identity,
            alice_identity.public(),
            alice_ephemeral.public(),
        )?;
        let alice_root = x3dh::complete(
            &alice_identity,
            &alice_ephemeral,
            bob_identity.public(),
            bob_ephemeral.public(),
        )?;
        let bob_ephemeral_public = bob_ephemeral.public().clone();
        let mut alice =
            DoubleRatchet::new_initiator(addr(1), addr(2), alice_root, bob_ephemeral_public, limits)?;
        let mut bob = DoubleRatchet::new_responder(addr(2), addr(1), bob_root, bob_ephemeral, limits);

        // 9 skipped keys would accumulate; the cap holds it at 5.
        for _ in 0..9 {
            let _ = alice.encrypt(b"dropped")?;
        }
        let m10 = alice.encrypt(b"kept")?;
        assert_eq!(bob.decrypt(&m10)?, b"kept");
        assert_eq!(bob.skipped_key_count(), 5);
        Ok(())
    }
}
