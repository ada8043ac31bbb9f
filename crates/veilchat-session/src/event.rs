//! Events emitted by a room session to the embedding layer.

use veilchat_types::{EncryptionStatus, TransferId, WalletAddress};

/// Out-of-band notifications from the orchestrator.
///
/// Decrypted payloads are *not* events — they are returned directly from
/// frame handling so the core never holds plaintext.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// The room's encryption status changed.
    StatusChanged {
        /// New status.
        status: EncryptionStatus,
    },

    /// Repeated AEAD failures from one peer within the configured
    /// window — likely tampering or a desynchronized ratchet.
    AuthFailureWarning {
        /// Peer whose frames keep failing.
        peer: WalletAddress,
        /// Failures observed inside the window.
        failures: u32,
    },

    /// A peer's session overran the skip bound and was discarded; a
    /// fresh handshake is required.
    SessionPoisoned {
        /// Peer whose session was discarded.
        peer: WalletAddress,
    },

    /// A media transfer was aborted after making no progress.
    TransferAborted {
        /// The abandoned transfer.
        transfer_id: TransferId,
    },
}
