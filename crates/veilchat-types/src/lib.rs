//! Core shared types for the Veilchat end-to-end encryption core.
//!
//! This crate defines all fundamental types used across the workspace.
//! No other crate should define shared types — everything lives here.

pub mod config;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// WalletAddress
// ---------------------------------------------------------------------------

/// Wallet address identifying a chat participant: `0x` + 40 hex characters.
///
/// Stored lowercase so that map lookups and the handshake tiebreak (the
/// lexicographically smaller address initiates X3DH) are well defined
/// regardless of how the transport cased the address.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    /// Length of the canonical string form (`0x` + 40 hex digits).
    pub const STR_LEN: usize = 42;

    /// Parses and normalizes an address. Accepts any casing.
    pub fn parse(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        if lower.len() != Self::STR_LEN || !lower.starts_with("0x") {
            return Err(VeilchatError::InvalidAddress {
                reason: format!("expected 0x + 40 hex chars, got {} chars", s.len()),
            });
        }
        if !lower[2..].bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VeilchatError::InvalidAddress {
                reason: "non-hex character in address body".into(),
            });
        }
        Ok(Self(lower))
    }

    /// Returns the canonical lowercase string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WalletAddress {
    type Err = VeilchatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = VeilchatError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<WalletAddress> for String {
    fn from(addr: WalletAddress) -> Self {
        addr.0
    }
}

impl AsRef<str> for WalletAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// ChannelHash
// ---------------------------------------------------------------------------

/// SHA-256 of a room name, used as HKDF `info` when deriving the room
/// key pair. Two participants computing the hash of the same room name
/// derive the same room identity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChannelHash([u8; 32]);

impl ChannelHash {
    /// The fixed byte length of a channel hash.
    pub const LEN: usize = 32;

    /// Creates a `ChannelHash` from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for ChannelHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ChannelHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChannelHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for ChannelHash {
    type Err = VeilchatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| VeilchatError::ProtocolError {
            reason: "invalid hex encoding for channel hash".into(),
        })?;
        if bytes.len() != Self::LEN {
            return Err(VeilchatError::ProtocolError {
                reason: format!("expected 32 bytes for channel hash, got {}", bytes.len()),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

// ---------------------------------------------------------------------------
// TransferId
// ---------------------------------------------------------------------------

/// Random 128-bit identifier of a media transfer, hex-encoded on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransferId([u8; 16]);

impl TransferId {
    /// The fixed byte length of a transfer id.
    pub const LEN: usize = 16;

    /// Creates a `TransferId` from raw bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for TransferId {
    type Err = VeilchatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| VeilchatError::ProtocolError {
            reason: "invalid hex encoding for transfer id".into(),
        })?;
        if bytes.len() != Self::LEN {
            return Err(VeilchatError::ProtocolError {
                reason: format!("expected 16 bytes for transfer id, got {}", bytes.len()),
            });
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl TryFrom<String> for TransferId {
    type Error = VeilchatError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TransferId> for String {
    fn from(id: TransferId) -> Self {
        id.to_string()
    }
}

// ---------------------------------------------------------------------------
// EncryptionMode / EncryptionStatus
// ---------------------------------------------------------------------------

/// How a room encrypts: pairwise Double Ratchet or group Sender Keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EncryptionMode {
    /// 1:1 room — X3DH handshake followed by a Double Ratchet session.
    Direct,
    /// Multi-party room — per-sender symmetric chains with sealed
    /// chain-key distribution.
    Group,
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Lifecycle of a room's encryption state.
///
/// Transitions only ever move forward: `Idle → Deriving → Handshaking →
/// Ready`, with `Error` as a terminal branch from any non-`Ready` state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EncryptionStatus {
    /// No key material yet.
    Idle,
    /// Room key pair derivation in progress.
    Deriving,
    /// Waiting for peer keys / X3DH completion.
    Handshaking,
    /// At least one session established (or empty-room fallback fired).
    Ready,
    /// Fatal failure; the room cannot encrypt.
    Error,
}

impl EncryptionStatus {
    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: EncryptionStatus) -> bool {
        use EncryptionStatus::*;
        matches!(
            (self, next),
            (Idle, Deriving)
                | (Deriving, Handshaking)
                | (Handshaking, Ready)
                | (Idle, Error)
                | (Deriving, Error)
                | (Handshaking, Error)
        )
    }
}

impl fmt::Display for EncryptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Deriving => write!(f, "deriving"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

// ---------------------------------------------------------------------------
// MediaKind
// ---------------------------------------------------------------------------

/// Media classification for transfers, with per-kind size caps.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Raster image (`image/*`), capped at [`config::CoreConfig::max_image_bytes`].
    Image,
    /// Video (`video/*`), capped at [`config::CoreConfig::max_video_bytes`].
    Video,
}

impl MediaKind {
    /// Classifies a MIME type, or `None` for unsupported media.
    pub fn from_mime(mime: &str) -> Option<Self> {
        if mime.starts_with("image/") {
            Some(Self::Image)
        } else if mime.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
        }
    }
}

// ---------------------------------------------------------------------------
// VeilchatError
// ---------------------------------------------------------------------------

/// Central error type for the Veilchat core.
///
/// All crates in the workspace convert their internal errors into variants
/// of this enum, ensuring a unified error handling surface. Variants never
/// carry key material or plaintext.
#[derive(Debug, Error)]
pub enum VeilchatError {
    /// A wallet address is malformed.
    #[error("invalid address: {reason}")]
    InvalidAddress {
        /// Why the address was rejected.
        reason: String,
    },

    /// A peer public key is malformed, off-curve, or carries a private
    /// scalar component.
    #[error("invalid peer key: {reason}")]
    InvalidPeerKey {
        /// Why the key was rejected.
        reason: String,
    },

    /// AEAD tag verification failed: tampering, wrong key, or ratchet
    /// desynchronization. The frame is dropped; session state is untouched.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// A ratchet was asked to skip further ahead than the configured bound.
    #[error("skip overflow: requested {requested} exceeds maximum {max}")]
    SkipOverflow {
        /// Number of indices the caller asked to skip.
        requested: u32,
        /// Configured per-chain maximum.
        max: u32,
    },

    /// A message arrived with an index below the current chain position and
    /// no skipped key was retained for it.
    #[error("stale message at chain index {index}")]
    StaleMessage {
        /// The chain index carried by the stale message.
        index: u32,
    },

    /// An X3DH response arrived without a matching pending init.
    #[error("unexpected handshake from {from}")]
    UnexpectedHandshake {
        /// Address of the unexpected responder.
        from: String,
    },

    /// A group message arrived from a sender whose chain key is not held.
    #[error("unknown sender {address}")]
    UnknownSender {
        /// Address of the unknown sender.
        address: String,
    },

    /// A sealed sender-key envelope failed to open.
    #[error("invalid sender key from {from}")]
    InvalidSenderKey {
        /// Address of the distributing peer.
        from: String,
    },

    /// A media transfer made no progress within the idle window.
    #[error("transfer {transfer_id} timed out")]
    TransferTimeout {
        /// Hex id of the aborted transfer.
        transfer_id: String,
    },

    /// A media payload exceeds the cap for its kind.
    #[error("transfer of {size} bytes exceeds maximum {max}")]
    TransferTooLarge {
        /// Size of the offered payload.
        size: u64,
        /// Configured maximum for the media kind.
        max: u64,
    },

    /// A MIME type that is neither image nor video.
    #[error("unsupported media type: {mime}")]
    UnsupportedMedia {
        /// The rejected MIME type.
        mime: String,
    },

    /// Key derivation failed or the wallet refused to sign. The room
    /// transitions to `EncryptionStatus::Error`.
    #[error("fatal initialization failure: {reason}")]
    FatalInit {
        /// Why initialization failed.
        reason: String,
    },

    /// A cryptographic primitive failed outside the variants above.
    #[error("crypto error: {reason}")]
    CryptoError {
        /// Why the operation failed.
        reason: String,
    },

    /// A wire frame or serialized structure failed to parse or validate.
    #[error("protocol error: {reason}")]
    ProtocolError {
        /// Why the frame was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`VeilchatError`].
pub type Result<T> = std::result::Result<T, VeilchatError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
