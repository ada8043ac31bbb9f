//! Canonical AAD construction (RFC 8949 §4.2 deterministic CBOR).
//!
//! Every AEAD operation binds its identity fields — sender address,
//! chain position, DH key — as associated data, so a relay that rewrites
//! any of them turns the frame into garbage instead of a forgery. Both
//! peers must produce byte-identical AAD, hence canonical CBOR: map keys
//! sorted by their encoded form (shortest first, then bytewise), all
//! lengths definite.
//!
//! Key sets per AAD kind, in canonical order:
//!
//! | AAD | Keys |
//! |---|---|
//! | direct message   | `sender`, `senderDh`, `chainIndex`, `previousChainLength` |
//! | group message    | `sender`, `chainIndex` |
//! | sender-key envelope | `for`, `from` |
//! | transfer chunk   | `chunkIndex`, `transferId` |

use ciborium::Value;
use veilchat_types::{Result, TransferId, VeilchatError, WalletAddress};

/// AAD for a Double Ratchet message.
///
/// `sender_dh` is the SEC1 uncompressed encoding of the sender's current
/// ratchet key — the same bytes the receiver reconstructs from the
/// frame's JWK, so a swapped key breaks authentication.
pub fn direct_message(
    sender: &WalletAddress,
    sender_dh: &[u8],
    previous_chain_length: u32,
    chain_index: u32,
) -> Result<Vec<u8>> {
    encode(vec![
        (text("sender"), text(sender.as_str())),
        (text("senderDh"), Value::Bytes(sender_dh.to_vec())),
        (text("chainIndex"), integer(chain_index)),
        (text("previousChainLength"), integer(previous_chain_length)),
    ])
}

/// AAD for a Sender Key group message.
pub fn group_message(sender: &WalletAddress, chain_index: u32) -> Result<Vec<u8>> {
    encode(vec![
        (text("sender"), text(sender.as_str())),
        (text("chainIndex"), integer(chain_index)),
    ])
}

/// AAD for a sealed sender-key envelope.
pub fn sender_key_envelope(from: &WalletAddress, for_peer: &WalletAddress) -> Result<Vec<u8>> {
    encode(vec![
        (text("for"), text(for_peer.as_str())),
        (text("from"), text(from.as_str())),
    ])
}

/// AAD for one media transfer chunk.
pub fn transfer_chunk(transfer_id: &TransferId, chunk_index: u32) -> Result<Vec<u8>> {
    encode(vec![
        (text("chunkIndex"), integer(chunk_index)),
        (text("transferId"), Value::Bytes(transfer_id.as_bytes().to_vec())),
    ])
}

fn text(s: &str) -> Value {
    Value::Text(s.into())
}

fn integer(n: u32) -> Value {
    Value::Integer(n.into())
}

fn encode(entries: Vec<(Value, Value)>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(&Value::Map(entries), &mut buf).map_err(|e| {
        VeilchatError::ProtocolError {
            reason: format!("AAD encoding failed: {e}"),
        }
    })?;
    Ok(buf)
}
