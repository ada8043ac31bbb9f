//! Protocol layer of the Veilchat core: relay wire frames, canonical
//! AAD construction, and the three ratchet constructions (symmetric
//! chain, X3DH + Double Ratchet, Sender Keys).
//!
//! Everything here is pure protocol state — no I/O, no clocks, no
//! tasks. The session crate drives these state machines in response to
//! peer presence and inbound frames.

pub mod aad;
pub mod chain;
pub mod double_ratchet;
pub mod frames;
pub mod sender_key;
pub mod x3dh;

use veilchat_types::config::CoreConfig;

/// Bounds applied to a ratchet's skipped-key bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct RatchetLimits {
    /// Maximum indices a single chain may be skipped ahead.
    pub max_skip: u32,
    /// Global cap on retained skipped keys per session.
    pub max_skipped_total: usize,
    /// Skipped keys older than this many processed messages are evicted.
    pub ttl_messages: u64,
}

impl From<&CoreConfig> for RatchetLimits {
    fn from(config: &CoreConfig) -> Self {
        Self {
            max_skip: config.max_skip,
            max_skipped_total: config.max_skipped_total,
            ttl_messages: config.skipped_key_ttl_messages,
        }
    }
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self::from(&CoreConfig::default())
    }
}
