//! Relay wire frames.
//!
//! Every message crossing the untrusted relay is one JSON object with a
//! `type` discriminator. The relay treats frames as opaque; only the
//! fields needed for routing (`sender`, addresses) are plaintext —
//! everything confidential rides inside AEAD ciphertexts.
//!
//! The `chat` type is shared by direct (Double Ratchet) and group
//! (Sender Key) messages; the two are distinguished structurally, since
//! only direct messages carry a `senderDhPublicKey`.

use serde::{Deserialize, Serialize};
use veilchat_crypto::jwk::Jwk;
use veilchat_types::{MediaKind, Result, TransferId, VeilchatError, WalletAddress};

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A single JSON frame on the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Announces the sender's room public key.
    #[serde(rename = "encryption_pubkey")]
    EncryptionPubkey {
        /// Announcing peer.
        sender: WalletAddress,
        /// The peer's room public key.
        #[serde(rename = "publicKey")]
        public_key: Jwk,
    },

    /// A peer joined the room.
    #[serde(rename = "user_joined")]
    UserJoined {
        /// Joining peer.
        address: WalletAddress,
        /// Room public key, if the peer already derived one.
        #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
        public_key: Option<Jwk>,
    },

    /// Presence answer to `user_joined`.
    #[serde(rename = "i_am_here")]
    IAmHere {
        /// Answering peer.
        address: WalletAddress,
        /// Room public key, if derived.
        #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
        public_key: Option<Jwk>,
    },

    /// A peer left the room.
    #[serde(rename = "user_left")]
    UserLeft {
        /// Departing peer.
        address: WalletAddress,
    },

    /// X3DH handshake opener (sent by the tiebreak winner).
    #[serde(rename = "x3dh_init")]
    X3dhInit(Handshake),

    /// X3DH handshake answer.
    #[serde(rename = "x3dh_response")]
    X3dhResponse(Handshake),

    /// ECDH-sealed sender chain key for one recipient.
    #[serde(rename = "sender_key")]
    SenderKey(SenderKeyEnvelope),

    /// An encrypted chat payload (direct or group).
    #[serde(rename = "chat")]
    Chat(ChatBody),

    /// Media transfer metadata. Travels *inside* the ratchet: the frame
    /// is serialized and encrypted as a chat payload, never sent bare.
    #[serde(rename = "file_transfer_start")]
    TransferStart(TransferStart),

    /// One encrypted media chunk.
    #[serde(rename = "file_transfer_chunk")]
    TransferChunk(TransferChunk),

    /// All chunks of a transfer have been sent.
    #[serde(rename = "file_transfer_complete")]
    TransferComplete {
        /// Transfer being completed.
        #[serde(rename = "transferId")]
        transfer_id: TransferId,
        /// Sending peer.
        sender: WalletAddress,
    },
}

impl Frame {
    /// Serializes the frame to its wire JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| VeilchatError::ProtocolError {
            reason: format!("frame serialization failed: {e}"),
        })
    }

    /// Parses a frame from wire JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VeilchatError::ProtocolError {
            reason: format!("frame deserialization failed: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Body of `x3dh_init` and `x3dh_response`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Peer performing this half of the handshake.
    #[serde(rename = "fromAddress")]
    pub from_address: WalletAddress,
    /// The peer's long-lived room identity key.
    #[serde(rename = "identityPublicKey")]
    pub identity_public_key: Jwk,
    /// The peer's fresh handshake ephemeral key.
    #[serde(rename = "ephemeralPublicKey")]
    pub ephemeral_public_key: Jwk,
}

// ---------------------------------------------------------------------------
// SenderKeyEnvelope
// ---------------------------------------------------------------------------

/// A sender chain key sealed to a single recipient with ECDH + AEAD.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SenderKeyEnvelope {
    /// Distributing peer.
    #[serde(rename = "fromAddress")]
    pub from_address: WalletAddress,
    /// Room public key of the intended recipient; receivers discard
    /// envelopes not addressed to their key.
    #[serde(rename = "forPublicKey")]
    pub for_public_key: Jwk,
    /// Base64 AEAD ciphertext of the raw 32-byte chain key.
    #[serde(rename = "encryptedChainKey")]
    pub encrypted_chain_key: String,
    /// Base64 AEAD IV.
    pub iv: String,
}

// ---------------------------------------------------------------------------
// ChatBody
// ---------------------------------------------------------------------------

/// Direct/group union under the shared `chat` frame type.
///
/// Variant order matters: `Direct` is tried first so its extra required
/// fields disambiguate it from `Group`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatBody {
    /// Double-Ratchet-encrypted 1:1 message.
    Direct(DirectMessage),
    /// Sender-Key-encrypted group message.
    Group(GroupMessage),
}

/// A Double Ratchet message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Sending peer.
    pub sender: WalletAddress,
    /// Sender's current ratchet DH public key.
    #[serde(rename = "senderDhPublicKey")]
    pub sender_dh_public_key: Jwk,
    /// Length of the sender's previous sending chain.
    #[serde(rename = "previousChainLength")]
    pub previous_chain_length: u32,
    /// Index of this message in the current sending chain.
    #[serde(rename = "chainIndex")]
    pub chain_index: u32,
    /// Base64 AEAD ciphertext (tag appended).
    pub ciphertext: String,
    /// Base64 AEAD IV.
    pub iv: String,
}

/// A Sender Key group message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Sending peer.
    #[serde(rename = "senderAddress")]
    pub sender_address: WalletAddress,
    /// Index of this message in the sender's chain.
    #[serde(rename = "chainIndex")]
    pub chain_index: u32,
    /// Base64 AEAD ciphertext (tag appended).
    pub ciphertext: String,
    /// Base64 AEAD IV.
    pub iv: String,
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

/// Metadata of a media transfer, including its symmetric key.
///
/// The `transferKey` field is why this frame must ride the ratchet:
/// only peers already in session may learn it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferStart {
    /// Random transfer identifier.
    #[serde(rename = "transferId")]
    pub transfer_id: TransferId,
    /// Original file name.
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// Original file size in bytes.
    #[serde(rename = "fileSize")]
    pub file_size: u64,
    /// MIME type of the payload.
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Number of chunks the file was split into.
    #[serde(rename = "totalChunks")]
    pub total_chunks: u32,
    /// Image or video classification.
    #[serde(rename = "mediaType")]
    pub media_type: MediaKind,
    /// Base64 of the raw 256-bit per-transfer AEAD key.
    #[serde(rename = "transferKey")]
    pub transfer_key: String,
    /// Optional preview as a data URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// One AEAD-encrypted chunk of a transfer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferChunk {
    /// Transfer this chunk belongs to.
    #[serde(rename = "transferId")]
    pub transfer_id: TransferId,
    /// Position of this chunk in the file.
    #[serde(rename = "chunkIndex")]
    pub chunk_index: u32,
    /// Base64 AEAD ciphertext of the base64-encoded chunk bytes.
    pub ciphertext: String,
    /// Base64 AEAD IV.
    pub iv: String,
    /// Sending peer.
    pub sender: WalletAddress,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
