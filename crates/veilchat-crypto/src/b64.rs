//! Base64 codecs used on the wire.
//!
//! Standard alphabet (with padding) for ciphertexts, IVs and raw keys;
//! URL-safe unpadded alphabet for JWK coordinates (RFC 7518).

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use veilchat_types::{Result, VeilchatError};

/// Encodes bytes with the standard base64 alphabet.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes standard base64.
pub fn decode(s: &str) -> Result<Vec<u8>> {
    STANDARD.decode(s).map_err(|e| VeilchatError::ProtocolError {
        reason: format!("invalid base64: {e}"),
    })
}

/// Encodes bytes with the unpadded URL-safe alphabet (JWK coordinates).
pub fn encode_url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes unpadded URL-safe base64.
pub fn decode_url(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| VeilchatError::ProtocolError {
            reason: format!("invalid base64url: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_roundtrip() -> Result<()> {
        let data = b"veilchat wire payload \x00\xff";
        assert_eq!(decode(&encode(data))?, data);
        Ok(())
    }

    #[test]
    fn url_roundtrip_has_no_padding() -> Result<()> {
        let data = [0xfbu8; 31];
        let encoded = encode_url(&data);
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(decode_url(&encoded)?, data);
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode("not base64!!").is_err());
        assert!(decode_url("@@@").is_err());
    }

    #[test]
    fn url_decoder_rejects_standard_alphabet() {
        // '+' is only valid in the standard alphabet.
        assert!(decode_url("+/+/").is_err());
    }
}
