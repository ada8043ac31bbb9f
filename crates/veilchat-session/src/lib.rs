//! Session orchestration for the Veilchat core.
//!
//! [`room::RoomSession`] drives the protocol state machines in response
//! to peer presence and inbound frames: it derives the room identity,
//! runs the X3DH tiebreak, owns the per-peer Double Ratchet sessions
//! and group sender keys, and dispatches encrypt/decrypt. The
//! [`transfer`] module handles chunked encrypted media riding on top of
//! an established session.
//!
//! Decrypted plaintext is returned to the caller and never retained.

pub mod event;
pub mod room;
pub mod transfer;

pub use event::SessionEvent;
pub use room::{Inbound, RoomSession, SessionOutput};
pub use transfer::CompletedMedia;
