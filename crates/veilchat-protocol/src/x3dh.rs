//! X3DH (Extended Triple Diffie-Hellman) handshake.
//!
//! Two peers each contribute a long-lived room identity key and a fresh
//! ephemeral key; three DH legs mix them so that the root key is secret
//! unless *both* of a peer's keys leak:
//!
//! ```text
//! DH1 = ECDH(ephemeral_initiator, identity_responder)
//! DH2 = ECDH(identity_initiator,  ephemeral_responder)
//! DH3 = ECDH(ephemeral_initiator, ephemeral_responder)
//! rootKey = HKDF(DH1 ‖ DH2 ‖ DH3, salt="x3dh", info="root-key", 32 B)
//! ```
//!
//! The initiator retains its ephemeral pair until the response arrives;
//! the session orchestrator owns that pending map and raises
//! `UnexpectedHandshake` for responses with no pending init.

use veilchat_crypto::ecdh::{P256KeyPair, P256PublicKey, SharedSecret};
use veilchat_crypto::hkdf;
use veilchat_types::Result;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const X3DH_SALT: &[u8] = b"x3dh";
const ROOT_INFO: &[u8] = b"root-key";

// ---------------------------------------------------------------------------
// RootKey
// ---------------------------------------------------------------------------

/// 256-bit Double Ratchet root key produced by the handshake.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey([u8; 32]);

impl RootKey {
    /// Wraps raw root key material (a DH-ratchet step output).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw export, consumed by the next DH-ratchet step.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// RootKey does not implement Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Handshake halves
// ---------------------------------------------------------------------------

/// Starts a handshake: generates the initiator's ephemeral pair.
///
/// The caller sends `identity` and the ephemeral public key in an
/// `x3dh_init` frame and retains the returned pair until the response.
pub fn initiate() -> P256KeyPair {
    P256KeyPair::generate()
}

/// Responder half: consumes an init's public keys, generates the
/// responder ephemeral, and derives the root key.
///
/// Returns the root key and the responder's ephemeral pair — the latter
/// becomes the responder's initial Double Ratchet DH pair.
pub fn respond(
    identity: &P256KeyPair,
    initiator_identity: &P256PublicKey,
    initiator_ephemeral: &P256PublicKey,
) -> Result<(RootKey, P256KeyPair)> {
    let ephemeral = P256KeyPair::generate();

    let dh1 = identity.ecdh(initiator_ephemeral);
    let dh2 = ephemeral.ecdh(initiator_identity);
    let dh3 = ephemeral.ecdh(initiator_ephemeral);

    let root = derive_root(&dh1, &dh2, &dh3)?;
    Ok((root, ephemeral))
}

/// Initiator half: completes the handshake with the responder's keys,
/// mirroring the responder's three DH legs.
pub fn complete(
    identity: &P256KeyPair,
    pending_ephemeral: &P256KeyPair,
    responder_identity: &P256PublicKey,
    responder_ephemeral: &P256PublicKey,
) -> Result<RootKey> {
    let dh1 = pending_ephemeral.ecdh(responder_identity);
    let dh2 = identity.ecdh(responder_ephemeral);
    let dh3 = pending_ephemeral.ecdh(responder_ephemeral);

    derive_root(&dh1, &dh2, &dh3)
}

fn derive_root(dh1: &SharedSecret, dh2: &SharedSecret, dh3: &SharedSecret) -> Result<RootKey> {
    let mut ikm = Zeroizing::new([0u8; 96]);
    ikm[0..32].copy_from_slice(dh1.as_bytes());
    ikm[32..64].copy_from_slice(dh2.as_bytes());
    ikm[64..96].copy_from_slice(dh3.as_bytes());

    Ok(RootKey(hkdf::derive_32(
        ikm.as_slice(),
        X3DH_SALT,
        ROOT_INFO,
    )?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_root_key() -> Result<()> {
        let alice_identity = P256KeyPair::generate();
        let bob_identity = P256KeyPair::generate();

        // Alice opens; her frame carries both public keys.
        let alice_ephemeral = initiate();

        // Bob responds.
        let (bob_root, bob_ephemeral) = respond(
            &bob_identity,
            alice_identity.public(),
            alice_ephemeral.public(),
        )?;

        // Alice completes with Bob's public keys.
        let alice_root = complete(
            &alice_identity,
            &alice_ephemeral,
            bob_identity.public(),
            bob_ephemeral.public(),
        )?;

        assert_eq!(alice_root.as_bytes(), bob_root.as_bytes());
        Ok(())
    }

    #[test]
    fn different_ephemerals_different_roots() -> Result<()> {
        let alice_identity = P256KeyPair::generate();
        let bob_identity = P256KeyPair::generate();

        let eph_1 = initiate();
        let eph_2 = initiate();

        let (root_1, _) = respond(&bob_identity, alice_identity.public(), eph_1.public())?;
        let (root_2, _) = respond(&bob_identity, alice_identity.public(), eph_2.public())?;

        assert_ne!(root_1.as_bytes(), root_2.as_bytes());
        Ok(())
    }

    #[test]
    fn wrong_identity_breaks_agreement() -> Result<()> {
        let alice_identity = P256KeyPair::generate();
        let bob_identity = P256KeyPair::generate();
        let mallory_identity = P256KeyPair::generate();

        let alice_ephemeral = initiate();
        let (bob_root, bob_ephemeral) = respond(
            &bob_identity,
            alice_identity.public(),
            alice_ephemeral.public(),
        )?;

        // Alice mistakenly completes against Mallory's identity key.
        let alice_root = complete(
            &alice_identity,
            &alice_ephemeral,
            mallory_identity.public(),
            bob_ephemeral.public(),
        )?;

        assert_ne!(alice_root.as_bytes(), bob_root.as_bytes());
        Ok(())
    }
}
