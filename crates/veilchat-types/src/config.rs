//! Protocol configuration with sensible defaults.
//!
//! All operational parameters of the core are centralized here. Every
//! value has a documented default; tuning them is the embedding
//! application's business, validation is ours.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, VeilchatError};

/// Operational parameters for the encryption core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Maximum number of message keys a single receiving chain may skip
    /// ahead. A larger gap fails with `SkipOverflow`.
    pub max_skip: u32,

    /// Global cap on retained skipped message keys across all chains of a
    /// session. Oldest entries are evicted when the cap is exceeded.
    pub max_skipped_total: usize,

    /// Skipped keys older than this many globally-processed messages are
    /// evicted.
    pub skipped_key_ttl_messages: u64,

    /// Media transfer chunk size in bytes.
    pub chunk_size: usize,

    /// Maximum image payload in bytes.
    pub max_image_bytes: u64,

    /// Maximum video payload in bytes.
    pub max_video_bytes: u64,

    /// How long a handshaking room with no observed peers waits before
    /// falling back to `Ready`.
    pub handshake_fallback: Duration,

    /// A transfer with no chunk progress for this long is aborted.
    pub transfer_idle_timeout: Duration,

    /// Number of AEAD authentication failures from one peer within
    /// [`auth_failure_window`](Self::auth_failure_window) that triggers a
    /// user-visible warning.
    pub auth_failure_warn_threshold: u32,

    /// Sliding window for the authentication-failure counter.
    pub auth_failure_window: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_skip: 100,
            max_skipped_total: 1000,
            skipped_key_ttl_messages: 1000,
            chunk_size: 16 * 1024,
            max_image_bytes: 10 * 1024 * 1024,
            max_video_bytes: 100 * 1024 * 1024,
            handshake_fallback: Duration::from_millis(200),
            transfer_idle_timeout: Duration::from_secs(60),
            auth_failure_warn_threshold: 3,
            auth_failure_window: Duration::from_secs(30),
        }
    }
}

impl CoreConfig {
    /// Validates all configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.max_skip == 0 {
            return Err(VeilchatError::ProtocolError {
                reason: "max_skip must be greater than 0".into(),
            });
        }

        if self.max_skipped_total < self.max_skip as usize {
            return Err(VeilchatError::ProtocolError {
                reason: "max_skipped_total must be at least max_skip".into(),
            });
        }

        if self.chunk_size == 0 {
            return Err(VeilchatError::ProtocolError {
                reason: "chunk_size must be greater than 0".into(),
            });
        }

        if self.max_image_bytes == 0 || self.max_video_bytes == 0 {
            return Err(VeilchatError::ProtocolError {
                reason: "media size caps must be greater than 0".into(),
            });
        }

        if self.transfer_idle_timeout.is_zero() {
            return Err(VeilchatError::ProtocolError {
                reason: "transfer_idle_timeout must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_values_match_protocol_constants() {
        let config = CoreConfig::default();
        assert_eq!(config.max_skip, 100);
        assert_eq!(config.max_skipped_total, 1000);
        assert_eq!(config.chunk_size, 16_384);
        assert_eq!(config.max_image_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_video_bytes, 100 * 1024 * 1024);
        assert_eq!(config.handshake_fallback, Duration::from_millis(200));
        assert_eq!(config.transfer_idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn zero_max_skip_rejected() {
        let config = CoreConfig {
            max_skip: 0,
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn skipped_total_below_max_skip_rejected() {
        let config = CoreConfig {
            max_skipped_total: 10,
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let config = CoreConfig {
            chunk_size: 0,
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
