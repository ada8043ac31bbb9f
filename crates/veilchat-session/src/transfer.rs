//! Chunked encrypted media transfer.
//!
//! Each transfer gets a fresh 256-bit AEAD key and a random 128-bit id.
//! The file is split into fixed-size chunks; every chunk is
//! base64-encoded, then AEAD-encrypted under the transfer key with
//! `(transferId, chunkIndex)` as associated data and a fresh IV. The
//! metadata frame carrying the transfer key never travels bare — the
//! orchestrator serializes it and sends it through the ratchet, so only
//! peers already in session can read it.
//!
//! Chunks may arrive in any order, before or after the completion
//! signal, and (because the metadata rides a different layer) even
//! before the metadata itself — such orphans are buffered encrypted and
//! drained once the transfer is known.

use std::collections::HashMap;

use tokio::time::Instant;
use veilchat_crypto::aead::{self, AeadKey, Iv};
use veilchat_crypto::b64;
use veilchat_protocol::aad;
use veilchat_protocol::frames::{Frame, TransferChunk, TransferStart};
use veilchat_types::config::CoreConfig;
use veilchat_types::{MediaKind, Result, TransferId, VeilchatError, WalletAddress};
use zeroize::Zeroize;

/// Cap on buffered orphan chunks per transfer; beyond this the transfer
/// is being abused and further orphans are dropped.
const MAX_ORPHAN_CHUNKS: usize = 64;

// ---------------------------------------------------------------------------
// Outgoing
// ---------------------------------------------------------------------------

/// A fully prepared outgoing transfer.
pub struct PreparedTransfer {
    /// Metadata to be serialized and sent through the ratchet.
    pub start: TransferStart,
    /// Chunk frames, in order. Safe to send bare — each is AEAD-sealed
    /// under the transfer key.
    pub chunks: Vec<Frame>,
    /// Completion signal.
    pub complete: Frame,
}

/// Validates, chunks and encrypts a media payload.
pub fn prepare_outgoing(
    config: &CoreConfig,
    sender: &WalletAddress,
    bytes: &[u8],
    file_name: &str,
    mime_type: &str,
    thumbnail: Option<String>,
) -> Result<PreparedTransfer> {
    let media_type = MediaKind::from_mime(mime_type).ok_or_else(|| {
        VeilchatError::UnsupportedMedia {
            mime: mime_type.to_string(),
        }
    })?;

    let max = max_bytes_for(config, media_type);
    if bytes.len() as u64 > max {
        return Err(VeilchatError::TransferTooLarge {
            size: bytes.len() as u64,
            max,
        });
    }
    if bytes.is_empty() {
        return Err(VeilchatError::ProtocolError {
            reason: "empty media payload".into(),
        });
    }

    let transfer_id = random_transfer_id();
    let key = AeadKey::generate();

    let mut chunks = Vec::with_capacity(bytes.len().div_ceil(config.chunk_size));
    for (index, chunk) in bytes.chunks(config.chunk_size).enumerate() {
        let index = index as u32;
        let encoded = b64::encode(chunk);
        let chunk_aad = aad::transfer_chunk(&transfer_id, index)?;
        let sealed = aead::encrypt(&key, encoded.as_bytes(), &chunk_aad)?;

        chunks.push(Frame::TransferChunk(TransferChunk {
            transfer_id,
            chunk_index: index,
            ciphertext: b64::encode(&sealed.ciphertext),
            iv: b64::encode(sealed.iv.as_bytes()),
            sender: sender.clone(),
        }));
    }

    let start = TransferStart {
        transfer_id,
        file_name: file_name.to_string(),
        file_size: bytes.len() as u64,
        mime_type: mime_type.to_string(),
        total_chunks: chunks.len() as u32,
        media_type,
        transfer_key: b64::encode(key.as_bytes()),
        thumbnail,
    };

    Ok(PreparedTransfer {
        start,
        chunks,
        complete: Frame::TransferComplete {
            transfer_id,
            sender: sender.clone(),
        },
    })
}

fn max_bytes_for(config: &CoreConfig, kind: MediaKind) -> u64 {
    match kind {
        MediaKind::Image => config.max_image_bytes,
        MediaKind::Video => config.max_video_bytes,
    }
}

fn random_transfer_id() -> TransferId {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    TransferId::new(bytes)
}

// ---------------------------------------------------------------------------
// Incoming
// ---------------------------------------------------------------------------

/// A finished inbound transfer, handed to the caller and not retained.
#[derive(Debug)]
pub struct CompletedMedia {
    /// Sending peer.
    pub from: WalletAddress,
    /// Transfer identifier.
    pub transfer_id: TransferId,
    /// Original file name.
    pub file_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Image/video classification.
    pub media: MediaKind,
    /// Reassembled plaintext.
    pub bytes: Vec<u8>,
    /// Optional preview data URL.
    pub thumbnail: Option<String>,
}

struct IncomingTransfer {
    from: WalletAddress,
    meta: TransferStart,
    key: AeadKey,
    chunks: HashMap<u32, Vec<u8>>,
    completion_signaled: bool,
    last_progress: Instant,
}

impl IncomingTransfer {
    fn zeroize_chunks(&mut self) {
        for chunk in self.chunks.values_mut() {
            chunk.zeroize();
        }
        self.chunks.clear();
    }
}

/// Table of in-flight inbound transfers for one room.
pub struct IncomingTransfers {
    config: CoreConfig,
    transfers: HashMap<TransferId, IncomingTransfer>,
    orphans: HashMap<TransferId, Vec<TransferChunk>>,
}

impl IncomingTransfers {
    /// Creates an empty table.
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            transfers: HashMap::new(),
            orphans: HashMap::new(),
        }
    }

    /// Registers a transfer from its (ratchet-delivered) metadata and
    /// drains any orphan chunks that raced ahead of it.
    ///
    /// Returns the completed media if the orphans already covered the
    /// whole file and completion was signaled.
    pub fn begin(&mut self, from: WalletAddress, meta: TransferStart) -> Result<Option<CompletedMedia>> {
        let media_type = meta.media_type;
        let max = max_bytes_for(&self.config, media_type);
        if meta.file_size > max {
            return Err(VeilchatError::TransferTooLarge {
                size: meta.file_size,
                max,
            });
        }

        let expected_chunks = meta.file_size.div_ceil(self.config.chunk_size as u64);
        if u64::from(meta.total_chunks) != expected_chunks || meta.total_chunks == 0 {
            return Err(VeilchatError::ProtocolError {
                reason: format!(
                    "totalChunks {} inconsistent with fileSize {}",
                    meta.total_chunks, meta.file_size
                ),
            });
        }

        let key_bytes = b64::decode(&meta.transfer_key)?;
        if key_bytes.len() != AeadKey::LEN {
            return Err(VeilchatError::ProtocolError {
                reason: format!("transfer key must be 32 bytes, got {}", key_bytes.len()),
            });
        }
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&key_bytes);
        let key = AeadKey::from_bytes(raw);

        let id = meta.transfer_id;
        self.transfers.insert(
            id,
            IncomingTransfer {
                from,
                meta,
                key,
                chunks: HashMap::new(),
                completion_signaled: false,
                last_progress: Instant::now(),
            },
        );

        if let Some(buffered) = self.orphans.remove(&id) {
            for chunk in &buffered {
                self.accept_chunk(chunk)?;
            }
        }
        self.try_finalize(&id)
    }

    /// Feeds one chunk frame; chunks for unknown transfers are buffered.
    pub fn chunk(&mut self, chunk: &TransferChunk) -> Result<Option<CompletedMedia>> {
        let id = chunk.transfer_id;
        if !self.transfers.contains_key(&id) {
            let buffered = self.orphans.entry(id).or_default();
            if buffered.len() < MAX_ORPHAN_CHUNKS {
                buffered.push(chunk.clone());
            }
            return Ok(None);
        }

        self.accept_chunk(chunk)?;
        self.try_finalize(&id)
    }

    /// Marks a transfer as fully sent; finalizes if every chunk landed.
    pub fn complete(&mut self, id: &TransferId) -> Result<Option<CompletedMedia>> {
        if let Some(transfer) = self.transfers.get_mut(id) {
            transfer.completion_signaled = true;
            transfer.last_progress = Instant::now();
        }
        self.try_finalize(id)
    }

    /// Aborts every transfer idle past the configured timeout, zeroizing
    /// accumulated plaintext. Returns the aborted ids.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<TransferId> {
        let timeout = self.config.transfer_idle_timeout;
        let expired: Vec<TransferId> = self
            .transfers
            .iter()
            .filter(|(_, t)| now.duration_since(t.last_progress) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(mut transfer) = self.transfers.remove(id) {
                transfer.zeroize_chunks();
            }
            self.orphans.remove(id);
        }
        expired
    }

    /// Drops all state, zeroizing buffered plaintext.
    pub fn clear(&mut self) {
        for (_, mut transfer) in self.transfers.drain() {
            transfer.zeroize_chunks();
        }
        self.orphans.clear();
    }

    /// Number of in-flight transfers.
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    fn accept_chunk(&mut self, chunk: &TransferChunk) -> Result<()> {
        let transfer = self
            .transfers
            .get_mut(&chunk.transfer_id)
            .ok_or_else(|| VeilchatError::ProtocolError {
                reason: "chunk for unknown transfer".into(),
            })?;

        if chunk.chunk_index >= transfer.meta.total_chunks {
            return Err(VeilchatError::ProtocolError {
                reason: format!(
                    "chunk index {} out of range for {} chunks",
                    chunk.chunk_index, transfer.meta.total_chunks
                ),
            });
        }

        let ciphertext = b64::decode(&chunk.ciphertext)?;
        let iv = decode_iv(&chunk.iv)?;
        let chunk_aad = aad::transfer_chunk(&chunk.transfer_id, chunk.chunk_index)?;

        // A chunk that fails authentication poisons the whole transfer:
        // the transport is reliable, so it will never be retransmitted.
        let encoded = match aead::decrypt(&transfer.key, &ciphertext, &iv, &chunk_aad) {
            Ok(encoded) => encoded,
            Err(e) => {
                if let Some(mut dead) = self.transfers.remove(&chunk.transfer_id) {
                    dead.zeroize_chunks();
                }
                return Err(e);
            }
        };

        let encoded_str = std::str::from_utf8(&encoded).map_err(|_| VeilchatError::ProtocolError {
            reason: "chunk payload is not base64 text".into(),
        })?;
        let raw = b64::decode(encoded_str)?;

        transfer.chunks.entry(chunk.chunk_index).or_insert(raw);
        transfer.last_progress = Instant::now();
        Ok(())
    }

    fn try_finalize(&mut self, id: &TransferId) -> Result<Option<CompletedMedia>> {
        let ready = match self.transfers.get(id) {
            Some(t) => {
                t.completion_signaled && t.chunks.len() as u32 == t.meta.total_chunks
            }
            None => false,
        };
        if !ready {
            return Ok(None);
        }

        let Some(mut transfer) = self.transfers.remove(id) else {
            return Ok(None);
        };

        let mut bytes = Vec::with_capacity(transfer.meta.file_size as usize);
        for index in 0..transfer.meta.total_chunks {
            match transfer.chunks.get(&index) {
                Some(chunk) => bytes.extend_from_slice(chunk),
                None => {
                    transfer.zeroize_chunks();
                    bytes.zeroize();
                    return Err(VeilchatError::ProtocolError {
                        reason: format!("missing chunk {index} during reassembly"),
                    });
                }
            }
        }
        transfer.zeroize_chunks();

        if bytes.len() as u64 != transfer.meta.file_size {
            bytes.zeroize();
            return Err(VeilchatError::ProtocolError {
                reason: "reassembled size does not match metadata".into(),
            });
        }

        Ok(Some(CompletedMedia {
            from: transfer.from,
            transfer_id: *id,
            file_name: transfer.meta.file_name,
            mime_type: transfer.meta.mime_type,
            media: transfer.meta.media_type,
            bytes,
            thumbnail: transfer.meta.thumbnail,
        }))
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

    fn addr(last: u8) -> WalletAddress {
        WalletAddress::parse(&format!("0x{:038x}{:02x}", 0, last)).unwrap()
    }

    fn chunk_frames(prepared: &PreparedTransfer) -> Vec<TransferChunk> {
        prepared
            .chunks
            .iter()
            .map(|f| match f {
                Frame::TransferChunk(c) => c.clone(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn prepare_computes_chunk_count() -> Result<()> {
        let config = CoreConfig::default();
        let bytes = payload(200 * 1024);
        let prepared =
            prepare_outgoing(&config, &addr(1), &bytes, "cat.png", "image/png", None)?;

        assert_eq!(prepared.start.total_chunks, 13);
        assert_eq!(prepared.chunks.len(), 13);
        assert_eq!(prepared.start.file_size, bytes.len() as u64);
        Ok(())
    }

    #[test]
    fn oversized_image_rejected() {
        let config = CoreConfig {
            max_image_bytes: 1024,
            ..CoreConfig::default()
        };
        let result =
            prepare_outgoing(&config, &addr(1), &payload(2048), "big.png", "image/png", None);
        assert!(matches!(result, Err(VeilchatError::TransferTooLarge { .. })));
    }

    #[test]
    fn unsupported_mime_rejected() {
        let config = CoreConfig::default();
        let result = prepare_outgoing(
            &config,
            &addr(1),
            &payload(16),
            "doc.pdf",
            "application/pdf",
            None,
        );
        assert!(matches!(result, Err(VeilchatError::UnsupportedMedia { .. })));
    }

    #[tokio::test]
    async fn in_order_roundtrip() -> Result<()> {
        let config = CoreConfig::default();
        let bytes = payload(40_000);
        let prepared =
            prepare_outgoing(&config, &addr(1), &bytes, "cat.png", "image/png", None)?;

        let mut incoming = IncomingTransfers::new(config);
        assert!(incoming.begin(addr(1), prepared.start.clone())?.is_none());

        let chunks = chunk_frames(&prepared);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(incoming.chunk(chunk)?.is_none());
        }
        incoming.chunk(&chunks[chunks.len() - 1])?;

        let done = incoming
            .complete(&prepared.start.transfer_id)?
            .expect("transfer should finalize");
        assert_eq!(done.bytes, bytes);
        assert_eq!(done.file_name, "cat.png");
        Ok(())
    }

    #[tokio::test]
    async fn reverse_order_finalizes_on_last_chunk() -> Result<()> {
        let config = CoreConfig::default();
        let bytes = payload(200 * 1024);
        let prepared =
            prepare_outgoing(&config, &addr(1), &bytes, "cat.png", "image/png", None)?;

        let mut incoming = IncomingTransfers::new(config);
        incoming.begin(addr(1), prepared.start.clone())?;

        // Completion signal arrives before any chunk.
        assert!(incoming.complete(&prepared.start.transfer_id)?.is_none());

        let mut chunks = chunk_frames(&prepared);
        chunks.reverse();

        let mut completed = None;
        for chunk in &chunks {
            if let Some(done) = incoming.chunk(chunk)? {
                completed = Some(done);
            }
        }

        let done = completed.expect("last chunk should finalize");
        assert_eq!(done.bytes, bytes);
        Ok(())
    }

    #[tokio::test]
    async fn orphan_chunks_before_metadata_are_drained() -> Result<()> {
        let config = CoreConfig::default();
        let bytes = payload(50_000);
        let prepared =
            prepare_outgoing(&config, &addr(1), &bytes, "cat.png", "image/png", None)?;

        let mut incoming = IncomingTransfers::new(config);

        // Every chunk and the completion race ahead of the metadata.
        for chunk in &chunk_frames(&prepared) {
            assert!(incoming.chunk(chunk)?.is_none());
        }
        assert!(incoming.complete(&prepared.start.transfer_id)?.is_none());

        // Metadata arrives last... and nothing was lost.
        // (Completion flag is not buffered for unknown transfers, so the
        // final signal must still be observed afterwards.)
        incoming.begin(addr(1), prepared.start.clone())?;
        let done = incoming
            .complete(&prepared.start.transfer_id)?
            .expect("buffered chunks should finalize");
        assert_eq!(done.bytes, bytes);
        Ok(())
    }

    #[tokio::test]
    async fn tampered_chunk_poisons_transfer() -> Result<()> {
        let config = CoreConfig::default();
        let prepared = prepare_outgoing(
            &config,
            &addr(1),
            &payload(40_000),
            "cat.png",
            "image/png",
            None,
        )?;

        let mut incoming = IncomingTransfers::new(config);
        incoming.begin(addr(1), prepared.start.clone())?;

        let mut chunks = chunk_frames(&prepared);
        let mut raw = b64::decode(&chunks[0].ciphertext)?;
        raw[0] ^= 0xFF;
        chunks[0].ciphertext = b64::encode(&raw);

        let result = incoming.chunk(&chunks[0]);
        assert!(matches!(result, Err(VeilchatError::AuthenticationFailure)));
        assert_eq!(incoming.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_chunks_are_idempotent() -> Result<()> {
        let config = CoreConfig::default();
        let bytes = payload(20_000);
        let prepared =
            prepare_outgoing(&config, &addr(1), &bytes, "cat.png", "image/png", None)?;

        let mut incoming = IncomingTransfers::new(config);
        incoming.begin(addr(1), prepared.start.clone())?;

        let chunks = chunk_frames(&prepared);
        for chunk in &chunks {
            incoming.chunk(chunk)?;
            incoming.chunk(chunk)?; // resend
        }

        let done = incoming
            .complete(&prepared.start.transfer_id)?
            .expect("transfer should finalize");
        assert_eq!(done.bytes, bytes);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn idle_transfer_expires() -> Result<()> {
        let config = CoreConfig::default();
        let prepared = prepare_outgoing(
            &config,
            &addr(1),
            &payload(40_000),
            "cat.png",
            "image/png",
            None,
        )?;

        let timeout = config.transfer_idle_timeout;
        let mut incoming = IncomingTransfers::new(config);
        incoming.begin(addr(1), prepared.start.clone())?;
        assert_eq!(incoming.in_flight(), 1);

        tokio::time::advance(timeout + std::time::Duration::from_secs(1)).await;

        let expired = incoming.expire_idle(Instant::now());
        assert_eq!(expired, vec![prepared.start.transfer_id]);
        assert_eq!(incoming.in_flight(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_progress_defers_expiry() -> Result<()> {
        let config = CoreConfig::default();
        let prepared = prepare_outgoing(
            &config,
            &addr(1),
            &payload(40_000),
            "cat.png",
            "image/png",
            None,
        )?;

        let timeout = config.transfer_idle_timeout;
        let mut incoming = IncomingTransfers::new(config);
        incoming.begin(addr(1), prepared.start.clone())?;

        tokio::time::advance(timeout / 2).await;
        incoming.chunk(&chunk_frames(&prepared)[0])?;

        tokio::time::advance(timeout / 2).await;
        assert!(incoming.expire_idle(Instant::now()).is_empty());
        Ok(())
    }
}
