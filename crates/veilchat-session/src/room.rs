//! Per-room session orchestrator.
//!
//! Owns the room's encryption lifecycle: deriving the room identity
//! from the master seed, reacting to peer presence, running the X3DH
//! tiebreak, holding the per-peer Double Ratchet sessions and group
//! sender keys, and dispatching every encrypt/decrypt.
//!
//! # Locking
//!
//! Room bookkeeping (status, peer keys, session map, sender keys,
//! transfers) lives behind one room mutex. Each Double Ratchet session
//! additionally sits in its own FIFO mutex so that 1:1 traffic for
//! different peers proceeds concurrently while operations on one
//! session are strictly serialized — two interleaved ratchet steps on
//! the same state would desynchronize it permanently. Every state
//! transition is read-compute-commit under the owning lock; no
//! `get → await → set` ever spans an await point unlocked.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use veilchat_crypto::ecdh::{P256KeyPair, P256PublicKey};
use veilchat_crypto::jwk::{self, Jwk};
use veilchat_crypto::seed::{self, MasterSeed};
use veilchat_protocol::double_ratchet::DoubleRatchet;
use veilchat_protocol::frames::{
    ChatBody, DirectMessage, Frame, GroupMessage, Handshake, SenderKeyEnvelope, TransferStart,
};
use veilchat_protocol::sender_key::{self, SenderKeyState};
use veilchat_protocol::{x3dh, RatchetLimits};
use veilchat_types::config::CoreConfig;
use veilchat_types::{
    ChannelHash, EncryptionMode, EncryptionStatus, MediaKind, Result, TransferId, VeilchatError,
    WalletAddress,
};

use crate::event::SessionEvent;
use crate::transfer::{self, CompletedMedia, IncomingTransfers};

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Something a decrypted frame produced for the embedding layer.
#[derive(Debug)]
pub enum Inbound {
    /// A decrypted text payload. Ownership passes to the caller; the
    /// core retains nothing.
    Text {
        /// Sending peer.
        from: WalletAddress,
        /// Decrypted bytes.
        plaintext: Vec<u8>,
    },
    /// A media transfer was announced through the ratchet.
    MediaStarted {
        /// Sending peer.
        from: WalletAddress,
        /// Transfer identifier.
        transfer_id: TransferId,
        /// Declared file name.
        file_name: String,
        /// Image/video classification.
        media: MediaKind,
    },
    /// A media transfer finished reassembly.
    MediaCompleted(CompletedMedia),
}

/// Result of feeding one frame to the orchestrator.
#[derive(Debug, Default)]
pub struct SessionOutput {
    /// Frames to hand to the transport, in order.
    pub outbound: Vec<Frame>,
    /// Decrypted payload, if the frame carried one.
    pub inbound: Option<Inbound>,
    /// Why an inbound frame was discarded, if it was. Dropping a frame
    /// is protocol-recoverable and never advances ratchet state.
    pub dropped: Option<VeilchatError>,
}

impl SessionOutput {
    fn empty() -> Self {
        Self::default()
    }

    fn dropped(error: VeilchatError) -> Self {
        Self {
            dropped: Some(error),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Room state
// ---------------------------------------------------------------------------

struct RoomState {
    mode: EncryptionMode,
    status: EncryptionStatus,
    room_pair: Option<P256KeyPair>,
    peer_keys: HashMap<WalletAddress, P256PublicKey>,
    sessions: HashMap<WalletAddress, Arc<Mutex<DoubleRatchet>>>,
    pending_x3dh: HashMap<WalletAddress, P256KeyPair>,
    my_sender_key: Option<SenderKeyState>,
    peer_sender_keys: HashMap<WalletAddress, SenderKeyState>,
    auth_failures: HashMap<WalletAddress, VecDeque<Instant>>,
    transfers: IncomingTransfers,
    closed: bool,
}

/// Orchestrator for one room.
pub struct RoomSession {
    local: WalletAddress,
    channel: ChannelHash,
    config: CoreConfig,
    limits: RatchetLimits,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Mutex<RoomState>,
}

impl RoomSession {
    /// Creates an idle room session and its event stream.
    pub fn new(
        local: WalletAddress,
        channel: ChannelHash,
        mode: EncryptionMode,
        config: CoreConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let limits = RatchetLimits::from(&config);
        let state = RoomState {
            mode,
            status: EncryptionStatus::Idle,
            room_pair: None,
            peer_keys: HashMap::new(),
            sessions: HashMap::new(),
            pending_x3dh: HashMap::new(),
            my_sender_key: None,
            peer_sender_keys: HashMap::new(),
            auth_failures: HashMap::new(),
            transfers: IncomingTransfers::new(config.clone()),
            closed: false,
        };
        (
            Self {
                local,
                channel,
                config,
                limits,
                events,
                state: Mutex::new(state),
            },
            event_rx,
        )
    }

    /// Local wallet address.
    pub fn local_address(&self) -> &WalletAddress {
        &self.local
    }

    /// Current encryption status.
    pub async fn status(&self) -> EncryptionStatus {
        self.state.lock().await.status
    }

    /// Number of peers whose public keys are known.
    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peer_keys.len()
    }

    /// Whether a Double Ratchet session with `peer` exists.
    pub async fn has_session_with(&self, peer: &WalletAddress) -> bool {
        self.state.lock().await.sessions.contains_key(peer)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Derives the room key pair from the master seed and announces it.
    ///
    /// Drives `idle → deriving → handshaking`. Handshakes with any peers
    /// whose keys arrived early are initiated immediately.
    pub async fn begin(&self, master_seed: &MasterSeed) -> Result<Vec<Frame>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(closed_error());
        }
        if state.status != EncryptionStatus::Idle {
            return Err(VeilchatError::ProtocolError {
                reason: format!("begin() called in status '{}'", state.status),
            });
        }

        self.set_status(&mut state, EncryptionStatus::Deriving);

        let room_pair = match seed::derive_room_key_pair(master_seed, &self.channel) {
            Ok(pair) => pair,
            Err(e) => {
                self.set_status(&mut state, EncryptionStatus::Error);
                tracing::error!(%e, "room key derivation failed");
                return Err(e);
            }
        };

        let public_jwk = jwk::export_public(room_pair.public())?;
        state.room_pair = Some(room_pair);
        self.set_status(&mut state, EncryptionStatus::Handshaking);
        tracing::info!(channel = %self.channel, mode = %state.mode, "room key pair ready");

        let mut outbound = vec![Frame::EncryptionPubkey {
            sender: self.local.clone(),
            public_key: public_jwk,
        }];

        // Keys observed before derivation finished are handled now.
        let early_peers: Vec<WalletAddress> = state.peer_keys.keys().cloned().collect();
        for peer in early_peers {
            outbound.extend(self.engage_peer(&mut state, &peer)?);
        }

        Ok(outbound)
    }

    /// Empty-room fallback: waits the configured window and, if still
    /// handshaking with no peer keys observed, declares the room ready.
    pub async fn handshake_fallback(&self) {
        tokio::time::sleep(self.config.handshake_fallback).await;

        let mut state = self.state.lock().await;
        if !state.closed
            && state.status == EncryptionStatus::Handshaking
            && state.peer_keys.is_empty()
        {
            tracing::debug!("no peers observed, falling back to ready");
            self.set_status(&mut state, EncryptionStatus::Ready);
        }
    }

    /// Closes the room: pending operations observe the closed flag and
    /// discard their results; key material and buffered transfer
    /// plaintext are dropped (and zeroized) immediately.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.room_pair = None;
        state.sessions.clear();
        state.pending_x3dh.clear();
        state.my_sender_key = None;
        state.peer_sender_keys.clear();
        state.peer_keys.clear();
        state.transfers.clear();
        tracing::info!(channel = %self.channel, "room session closed");
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Encrypts a text payload for the room.
    pub async fn encrypt_text(&self, plaintext: &[u8]) -> Result<Frame> {
        let mode = {
            let state = self.state.lock().await;
            if state.closed {
                return Err(closed_error());
            }
            state.mode
        };

        match mode {
            EncryptionMode::Direct => self.encrypt_direct(plaintext).await,
            EncryptionMode::Group => self.encrypt_group(plaintext).await,
        }
    }

    async fn encrypt_direct(&self, plaintext: &[u8]) -> Result<Frame> {
        // 1:1 rooms hold a single peer session.
        let session = {
            let state = self.state.lock().await;
            state
                .sessions
                .values()
                .next()
                .cloned()
                .ok_or_else(|| VeilchatError::ProtocolError {
                    reason: "no established session in direct room".into(),
                })?
        };

        let message = {
            let mut session = session.lock().await;
            session.encrypt(plaintext)?
        };

        self.mark_ready_after_crypto().await;
        Ok(Frame::Chat(ChatBody::Direct(message)))
    }

    async fn encrypt_group(&self, plaintext: &[u8]) -> Result<Frame> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(closed_error());
        }
        let sender_key =
            state
                .my_sender_key
                .as_mut()
                .ok_or_else(|| VeilchatError::ProtocolError {
                    reason: "no sender key created yet".into(),
                })?;
        let message = sender_key.encrypt(plaintext)?;

        if state.status == EncryptionStatus::Handshaking {
            self.set_status(&mut state, EncryptionStatus::Ready);
        }
        Ok(Frame::Chat(ChatBody::Group(message)))
    }

    /// Prepares and encrypts a media transfer.
    ///
    /// Returns, in send order: the ratchet-encrypted metadata frame,
    /// every chunk frame, and the completion frame.
    pub async fn send_media(
        &self,
        bytes: &[u8],
        file_name: &str,
        mime_type: &str,
        thumbnail: Option<String>,
    ) -> Result<Vec<Frame>> {
        let prepared = transfer::prepare_outgoing(
            &self.config,
            &self.local,
            bytes,
            file_name,
            mime_type,
            thumbnail,
        )?;

        // The metadata (carrying the transfer key) rides the ratchet.
        let start_json = Frame::TransferStart(prepared.start).to_json()?;
        let sealed_start = self.encrypt_text(start_json.as_bytes()).await?;

        let mut frames = Vec::with_capacity(prepared.chunks.len() + 2);
        frames.push(sealed_start);
        frames.extend(prepared.chunks);
        frames.push(prepared.complete);

        tracing::debug!(
            chunks = frames.len() - 2,
            file = file_name,
            "media transfer prepared"
        );
        Ok(frames)
    }

    /// Aborts transfers that have made no progress within the idle
    /// window, emitting [`SessionEvent::TransferAborted`] for each.
    pub async fn expire_idle_transfers(&self) {
        let mut state = self.state.lock().await;
        for transfer_id in state.transfers.expire_idle(Instant::now()) {
            tracing::warn!(%transfer_id, "transfer aborted after idle timeout");
            let _ = self.events.send(SessionEvent::TransferAborted { transfer_id });
        }
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    /// Feeds one relay frame through the state machine.
    pub async fn handle_frame(&self, frame: Frame) -> Result<SessionOutput> {
        match frame {
            Frame::EncryptionPubkey { sender, public_key } => {
                self.on_peer_key(sender, Some(public_key), false).await
            }
            Frame::UserJoined {
                address,
                public_key,
            } => self.on_peer_key(address, public_key, true).await,
            Frame::IAmHere {
                address,
                public_key,
            } => self.on_peer_key(address, public_key, false).await,
            Frame::UserLeft { address } => self.on_user_left(address).await,
            Frame::X3dhInit(handshake) => self.on_x3dh_init(handshake).await,
            Frame::X3dhResponse(handshake) => self.on_x3dh_response(handshake).await,
            Frame::SenderKey(envelope) => self.on_sender_key(envelope).await,
            Frame::Chat(ChatBody::Direct(message)) => self.on_direct_message(message).await,
            Frame::Chat(ChatBody::Group(message)) => self.on_group_message(message).await,
            Frame::TransferChunk(chunk) => self.on_transfer_chunk(chunk).await,
            Frame::TransferComplete { transfer_id, .. } => {
                self.on_transfer_complete(transfer_id).await
            }
            // Transfer metadata is only valid inside the ratchet.
            Frame::TransferStart(_) => Ok(SessionOutput::dropped(VeilchatError::ProtocolError {
                reason: "bare file_transfer_start frame".into(),
            })),
        }
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    async fn on_peer_key(
        &self,
        peer: WalletAddress,
        public_key: Option<Jwk>,
        announce_back: bool,
    ) -> Result<SessionOutput> {
        if peer == self.local {
            return Ok(SessionOutput::empty());
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(SessionOutput::empty());
        }

        let mut output = SessionOutput::empty();

        if announce_back {
            if let Some(pair) = &state.room_pair {
                output.outbound.push(Frame::IAmHere {
                    address: self.local.clone(),
                    public_key: Some(jwk::export_public(pair.public())?),
                });
            }
        }

        let Some(raw) = public_key else {
            return Ok(output);
        };

        let imported = match jwk::import_public(&raw) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(%peer, %e, "rejecting peer public key");
                output.dropped = Some(e);
                return Ok(output);
            }
        };

        let known = state.peer_keys.get(&peer) == Some(&imported);
        state.peer_keys.insert(peer.clone(), imported);
        tracing::debug!(%peer, known, "peer public key observed");

        if !known {
            output.outbound.extend(self.engage_peer(&mut state, &peer)?);
        }
        Ok(output)
    }

    /// Mode-specific reaction to a newly observed peer key.
    fn engage_peer(&self, state: &mut RoomState, peer: &WalletAddress) -> Result<Vec<Frame>> {
        let Some(room_pair) = &state.room_pair else {
            // Key recorded; the handshake starts once begin() finishes.
            return Ok(Vec::new());
        };

        match state.mode {
            EncryptionMode::Direct => {
                // Tiebreak: only the lexicographically smaller address
                // initiates.
                if self.local >= *peer
                    || state.sessions.contains_key(peer)
                    || state.pending_x3dh.contains_key(peer)
                {
                    return Ok(Vec::new());
                }

                let ephemeral = x3dh::initiate();
                let frame = Frame::X3dhInit(Handshake {
                    from_address: self.local.clone(),
                    identity_public_key: jwk::export_public(room_pair.public())?,
                    ephemeral_public_key: jwk::export_public(ephemeral.public())?,
                });
                state.pending_x3dh.insert(peer.clone(), ephemeral);
                tracing::info!(%peer, "initiating X3DH handshake");
                Ok(vec![frame])
            }
            EncryptionMode::Group => {
                if state.my_sender_key.is_none() {
                    state.my_sender_key =
                        Some(SenderKeyState::create(self.local.clone(), self.limits));
                    tracing::info!("created sender key chain");
                }
                let (Some(sender_key), Some(peer_public)) =
                    (state.my_sender_key.as_ref(), state.peer_keys.get(peer))
                else {
                    return Ok(Vec::new());
                };

                let envelope = sender_key::seal_chain_key(
                    room_pair,
                    &self.local,
                    peer_public,
                    peer,
                    sender_key.current_chain_key(),
                )?;
                tracing::info!(%peer, "distributing sender key");
                Ok(vec![Frame::SenderKey(envelope)])
            }
        }
    }

    async fn on_user_left(&self, peer: WalletAddress) -> Result<SessionOutput> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(SessionOutput::empty());
        }

        state.peer_keys.remove(&peer);
        state.sessions.remove(&peer);
        state.pending_x3dh.remove(&peer);
        state.peer_sender_keys.remove(&peer);
        state.auth_failures.remove(&peer);
        tracing::info!(%peer, "peer left the room");

        let mut output = SessionOutput::empty();

        // Rekey: the departed member must not read anything that follows.
        if state.mode == EncryptionMode::Group && state.my_sender_key.is_some() {
            let fresh = SenderKeyState::create(self.local.clone(), self.limits);

            if let Some(room_pair) = &state.room_pair {
                for (address, public) in &state.peer_keys {
                    let envelope = sender_key::seal_chain_key(
                        room_pair,
                        &self.local,
                        public,
                        address,
                        fresh.current_chain_key(),
                    )?;
                    output.outbound.push(Frame::SenderKey(envelope));
                }
            }

            tracing::info!(%peer, redistributed = output.outbound.len(), "rekeyed after member leave");
            state.my_sender_key = Some(fresh);
        }

        Ok(output)
    }

    // -----------------------------------------------------------------------
    // X3DH
    // -----------------------------------------------------------------------

    async fn on_x3dh_init(&self, handshake: Handshake) -> Result<SessionOutput> {
        let peer = handshake.from_address.clone();
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(SessionOutput::empty());
        }

        let Some(room_pair) = &state.room_pair else {
            return Ok(SessionOutput::dropped(VeilchatError::ProtocolError {
                reason: "x3dh_init before room key derivation".into(),
            }));
        };

        // Only the smaller address may initiate.
        if peer >= self.local {
            tracing::warn!(%peer, "x3dh_init from non-initiator side");
            return Ok(SessionOutput::dropped(VeilchatError::UnexpectedHandshake {
                from: peer.to_string(),
            }));
        }

        let peer_identity = match jwk::import_public(&handshake.identity_public_key) {
            Ok(key) => key,
            Err(e) => return Ok(SessionOutput::dropped(e)),
        };
        let peer_ephemeral = match jwk::import_public(&handshake.ephemeral_public_key) {
            Ok(key) => key,
            Err(e) => return Ok(SessionOutput::dropped(e)),
        };

        let (root_key, our_ephemeral) = x3dh::respond(room_pair, &peer_identity, &peer_ephemeral)?;
        let response = Frame::X3dhResponse(Handshake {
            from_address: self.local.clone(),
            identity_public_key: jwk::export_public(room_pair.public())?,
            ephemeral_public_key: jwk::export_public(our_ephemeral.public())?,
        });

        let session = DoubleRatchet::new_responder(
            self.local.clone(),
            peer.clone(),
            root_key,
            our_ephemeral,
            self.limits,
        );
        state.peer_keys.insert(peer.clone(), peer_identity);
        state
            .sessions
            .insert(peer.clone(), Arc::new(Mutex::new(session)));

        if state.status == EncryptionStatus::Handshaking {
            self.set_status(&mut state, EncryptionStatus::Ready);
        }
        tracing::info!(%peer, "answered X3DH init");

        Ok(SessionOutput {
            outbound: vec![response],
            ..SessionOutput::default()
        })
    }

    async fn on_x3dh_response(&self, handshake: Handshake) -> Result<SessionOutput> {
        let peer = handshake.from_address.clone();
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(SessionOutput::empty());
        }

        let Some(pending) = state.pending_x3dh.remove(&peer) else {
            tracing::warn!(%peer, "x3dh_response without pending init");
            return Ok(SessionOutput::dropped(VeilchatError::UnexpectedHandshake {
                from: peer.to_string(),
            }));
        };

        let Some(room_pair) = &state.room_pair else {
            return Ok(SessionOutput::dropped(VeilchatError::ProtocolError {
                reason: "x3dh_response before room key derivation".into(),
            }));
        };

        let peer_identity = match jwk::import_public(&handshake.identity_public_key) {
            Ok(key) => key,
            Err(e) => return Ok(SessionOutput::dropped(e)),
        };
        let peer_ephemeral = match jwk::import_public(&handshake.ephemeral_public_key) {
            Ok(key) => key,
            Err(e) => return Ok(SessionOutput::dropped(e)),
        };

        let root_key = x3dh::complete(room_pair, &pending, &peer_identity, &peer_ephemeral)?;
        let session = DoubleRatchet::new_initiator(
            self.local.clone(),
            peer.clone(),
            root_key,
            peer_ephemeral,
            self.limits,
        )?;

        state.peer_keys.insert(peer.clone(), peer_identity);
        state
            .sessions
            .insert(peer.clone(), Arc::new(Mutex::new(session)));

        if state.status == EncryptionStatus::Handshaking {
            self.set_status(&mut state, EncryptionStatus::Ready);
        }
        tracing::info!(%peer, "X3DH handshake complete");
        Ok(SessionOutput::empty())
    }

    // -----------------------------------------------------------------------
    // Sender keys
    // -----------------------------------------------------------------------

    async fn on_sender_key(&self, envelope: SenderKeyEnvelope) -> Result<SessionOutput> {
        let peer = envelope.from_address.clone();
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(SessionOutput::empty());
        }

        let Some(room_pair) = &state.room_pair else {
            return Ok(SessionOutput::dropped(VeilchatError::ProtocolError {
                reason: "sender_key before room key derivation".into(),
            }));
        };

        // Addressed to someone else's key: not ours to open.
        let target = match jwk::import_public(&envelope.for_public_key) {
            Ok(key) => key,
            Err(e) => return Ok(SessionOutput::dropped(e)),
        };
        if &target != room_pair.public() {
            return Ok(SessionOutput::empty());
        }

        let Some(distributor) = state.peer_keys.get(&peer).cloned() else {
            tracing::warn!(%peer, "sender key from peer with no known public key");
            return Ok(SessionOutput::dropped(VeilchatError::ProtocolError {
                reason: "sender key distributor unknown".into(),
            }));
        };

        match sender_key::open_chain_key(room_pair, &self.local, &distributor, &envelope) {
            Ok(chain_key) => {
                state.peer_sender_keys.insert(
                    peer.clone(),
                    SenderKeyState::from_chain_key(peer.clone(), chain_key, self.limits),
                );
                if state.status == EncryptionStatus::Handshaking {
                    self.set_status(&mut state, EncryptionStatus::Ready);
                }
                tracing::info!(%peer, "sender key installed");
                Ok(SessionOutput::empty())
            }
            Err(e) => {
                // A bad envelope means the peer is ignored.
                state.peer_sender_keys.remove(&peer);
                tracing::warn!(%peer, %e, "sender key rejected, ignoring peer");
                Ok(SessionOutput::dropped(e))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Chat payloads
    // -----------------------------------------------------------------------

    async fn on_direct_message(&self, message: DirectMessage) -> Result<SessionOutput> {
        let peer = message.sender.clone();

        let session = {
            let state = self.state.lock().await;
            if state.closed {
                return Ok(SessionOutput::empty());
            }
            match state.sessions.get(&peer) {
                Some(session) => session.clone(),
                None => {
                    tracing::debug!(%peer, "direct message without session");
                    return Ok(SessionOutput::dropped(VeilchatError::ProtocolError {
                        reason: "direct message from peer without session".into(),
                    }));
                }
            }
        };

        let result = {
            let mut session = session.lock().await;
            session.decrypt(&message)
        };

        match result {
            Ok(plaintext) => self.accept_plaintext(peer, plaintext).await,
            Err(VeilchatError::AuthenticationFailure) => {
                self.record_auth_failure(&peer).await;
                Ok(SessionOutput::dropped(VeilchatError::AuthenticationFailure))
            }
            Err(e @ VeilchatError::SkipOverflow { .. }) => self.poison_session(&peer, e).await,
            Err(e) => Ok(SessionOutput::dropped(e)),
        }
    }

    async fn on_group_message(&self, message: GroupMessage) -> Result<SessionOutput> {
        let peer = message.sender_address.clone();
        let result = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Ok(SessionOutput::empty());
            }
            match state.peer_sender_keys.get_mut(&peer) {
                Some(sender_key) => sender_key.decrypt(&message),
                None => {
                    // No chain key yet: dropped without buffering.
                    tracing::debug!(%peer, "group message from sender without chain key");
                    return Ok(SessionOutput::dropped(VeilchatError::UnknownSender {
                        address: peer.to_string(),
                    }));
                }
            }
        };

        match result {
            Ok(plaintext) => self.accept_plaintext(peer, plaintext).await,
            Err(VeilchatError::AuthenticationFailure) => {
                self.record_auth_failure(&peer).await;
                Ok(SessionOutput::dropped(VeilchatError::AuthenticationFailure))
            }
            Err(e) => Ok(SessionOutput::dropped(e)),
        }
    }

    /// Post-decrypt handling shared by both modes: flips the room to
    /// ready, and routes ratchet-delivered transfer metadata.
    async fn accept_plaintext(
        &self,
        from: WalletAddress,
        plaintext: Vec<u8>,
    ) -> Result<SessionOutput> {
        let mut state = self.state.lock().await;
        if state.closed {
            // Cancelled mid-flight: the result is discarded.
            return Ok(SessionOutput::empty());
        }
        if state.status == EncryptionStatus::Handshaking {
            self.set_status(&mut state, EncryptionStatus::Ready);
        }

        if let Ok(Frame::TransferStart(meta)) = serde_json::from_slice::<Frame>(&plaintext) {
            return self.register_transfer(&mut state, from, meta);
        }

        Ok(SessionOutput {
            inbound: Some(Inbound::Text { from, plaintext }),
            ..SessionOutput::default()
        })
    }

    fn register_transfer(
        &self,
        state: &mut RoomState,
        from: WalletAddress,
        meta: TransferStart,
    ) -> Result<SessionOutput> {
        let transfer_id = meta.transfer_id;
        let file_name = meta.file_name.clone();
        let media = meta.media_type;

        match state.transfers.begin(from.clone(), meta) {
            Ok(Some(done)) => Ok(SessionOutput {
                inbound: Some(Inbound::MediaCompleted(done)),
                ..SessionOutput::default()
            }),
            Ok(None) => {
                tracing::debug!(%transfer_id, file = %file_name, "incoming transfer registered");
                Ok(SessionOutput {
                    inbound: Some(Inbound::MediaStarted {
                        from,
                        transfer_id,
                        file_name,
                        media,
                    }),
                    ..SessionOutput::default()
                })
            }
            Err(e) => {
                tracing::warn!(%transfer_id, %e, "rejecting incoming transfer");
                Ok(SessionOutput::dropped(e))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transfers
    // -----------------------------------------------------------------------

    async fn on_transfer_chunk(
        &self,
        chunk: veilchat_protocol::frames::TransferChunk,
    ) -> Result<SessionOutput> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(SessionOutput::empty());
        }

        match state.transfers.chunk(&chunk) {
            Ok(Some(done)) => Ok(SessionOutput {
                inbound: Some(Inbound::MediaCompleted(done)),
                ..SessionOutput::default()
            }),
            Ok(None) => Ok(SessionOutput::empty()),
            Err(e) => {
                tracing::warn!(transfer_id = %chunk.transfer_id, %e, "transfer chunk rejected");
                Ok(SessionOutput::dropped(e))
            }
        }
    }

    async fn on_transfer_complete(&self, transfer_id: TransferId) -> Result<SessionOutput> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(SessionOutput::empty());
        }

        match state.transfers.complete(&transfer_id) {
            Ok(Some(done)) => Ok(SessionOutput {
                inbound: Some(Inbound::MediaCompleted(done)),
                ..SessionOutput::default()
            }),
            Ok(None) => Ok(SessionOutput::empty()),
            Err(e) => {
                tracing::warn!(%transfer_id, %e, "transfer finalization failed");
                Ok(SessionOutput::dropped(e))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Failure bookkeeping
    // -----------------------------------------------------------------------

    async fn mark_ready_after_crypto(&self) {
        let mut state = self.state.lock().await;
        if !state.closed && state.status == EncryptionStatus::Handshaking {
            self.set_status(&mut state, EncryptionStatus::Ready);
        }
    }

    async fn record_auth_failure(&self, peer: &WalletAddress) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }

        let now = Instant::now();
        let window = self.config.auth_failure_window;
        let failures = state.auth_failures.entry(peer.clone()).or_default();
        failures.push_back(now);
        while let Some(front) = failures.front() {
            if now.duration_since(*front) > window {
                failures.pop_front();
            } else {
                break;
            }
        }

        let count = failures.len() as u32;
        tracing::warn!(%peer, count, "authentication failure on inbound frame");
        if count >= self.config.auth_failure_warn_threshold {
            let _ = self.events.send(SessionEvent::AuthFailureWarning {
                peer: peer.clone(),
                failures: count,
            });
        }
    }

    /// A skip overflow poisons the peer's chain: the session is
    /// discarded and, on the initiator side, a fresh X3DH goes out.
    async fn poison_session(
        &self,
        peer: &WalletAddress,
        error: VeilchatError,
    ) -> Result<SessionOutput> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(SessionOutput::empty());
        }

        state.sessions.remove(peer);
        state.pending_x3dh.remove(peer);
        tracing::warn!(%peer, "session poisoned by skip overflow, requesting fresh handshake");
        let _ = self
            .events
            .send(SessionEvent::SessionPoisoned { peer: peer.clone() });

        let mut output = SessionOutput::dropped(error);
        if self.local < *peer {
            if let Some(room_pair) = &state.room_pair {
                let ephemeral = x3dh::initiate();
                output.outbound.push(Frame::X3dhInit(Handshake {
                    from_address: self.local.clone(),
                    identity_public_key: jwk::export_public(room_pair.public())?,
                    ephemeral_public_key: jwk::export_public(ephemeral.public())?,
                }));
                state.pending_x3dh.insert(peer.clone(), ephemeral);
            }
        }
        Ok(output)
    }

    fn set_status(&self, state: &mut RoomState, status: EncryptionStatus) {
        if state.status == status {
            return;
        }
        debug_assert!(
            state.status.can_transition_to(status),
            "illegal status transition {} -> {}",
            state.status,
            status
        );
        state.status = status;
        tracing::info!(%status, "encryption status changed");
        let _ = self.events.send(SessionEvent::StatusChanged { status });
    }
}

fn closed_error() -> VeilchatError {
    VeilchatError::ProtocolError {
        reason: "room session is closed".into(),
    }
}
