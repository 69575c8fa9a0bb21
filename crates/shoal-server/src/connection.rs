//! Per-connection handshake state machine and relay loop.
//!
//! Every accepted stream gets its own task running [`run`]. The handshake
//! is an explicit state machine — one transition function per state, any
//! message type invalid for the current state is fatal:
//!
//! ```text
//! New → ServerHelloSent → ClientAuthPending → PeerHandshakeRelay
//!                                                   → Established → Closed
//! ```
//!
//! After the handshake the task multiplexes three sources: frames from the
//! client, items on its outbound queue (relayed envelopes and control
//! messages enqueued by peer tasks), and the keep-alive timer. All writes
//! to the stream happen here, so server-to-client ordering and the
//! outgoing combined sequence number stay consistent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;
use x25519_dalek::PublicKey;

use crate::dispatch;
use crate::error::SignalingError;
use crate::registry::{ConnectionHandle, Outbound, Path, PathRegistry};
use crate::transport::{write_frame, FrameReader};
use shoal_core::envelope::Envelope;
use shoal_core::message::{ControlMessage, HexKey};
use shoal_core::nonce::{Cookie, Nonce};
use shoal_core::reason::DisconnectReason;
use shoal_core::{ClientId, PathKey, Role, KEY_LENGTH};
use shoal_crypto::boxes::CryptoBox;
use shoal_crypto::csn::CombinedSequence;
use shoal_crypto::identity::{PermanentKeypair, SessionKeypair};
use shoal_crypto::validator::NonceValidator;

/// Smallest keep-alive interval a client may request.
pub const KEEP_ALIVE_INTERVAL_MIN: Duration = Duration::from_secs(1);

/// Tunables shared by all connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for a connection to finish its handshake.
    pub handshake_timeout: Duration,
    /// Default keep-alive probe interval (client-tunable per connection).
    pub keep_alive_interval: Duration,
    /// Extra silence tolerated beyond the interval before closing.
    pub keep_alive_grace: Duration,
    /// Deadline for a relayed envelope to reach the peer's stream.
    pub relay_deadline: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(60),
            keep_alive_grace: Duration::from_secs(30),
            relay_deadline: Duration::from_secs(10),
        }
    }
}

/// Process-wide state shared by every connection task.
pub struct ServerContext {
    pub identity: PermanentKeypair,
    pub registry: PathRegistry,
    pub config: ConnectionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    New,
    ServerHelloSent,
    ClientAuthPending,
    PeerHandshakeRelay,
    Established,
    Closed,
}

/// Handle one accepted stream until it closes.
///
/// The stream must already be authenticated and ordered; the transport
/// collaborator owns TLS termination.
pub async fn run<S>(stream: S, ctx: Arc<ServerContext>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let cookie_out = Cookie::random();
    let ping_interval = ctx.config.keep_alive_interval;

    let mut conn = Connection {
        ctx,
        serial: Uuid::new_v4(),
        frames: FrameReader::new(reader),
        writer,
        tx,
        rx,
        state: HandshakeState::New,
        role: None,
        client_id: None,
        path: None,
        path_key: None,
        session: SessionKeypair::generate(),
        client_permanent: None,
        auth_box: None,
        transport_box: None,
        validator_in: NonceValidator::new(Some(cookie_out)),
        relay_validators: HashMap::new(),
        cookie_out,
        csn_out: CombinedSequence::random(),
        ping_interval,
        last_rx: Instant::now(),
        relayed_out: false,
        relayed_in: false,
    };

    let result = conn.serve().await;
    conn.shutdown(result).await;
}

struct Connection<S> {
    ctx: Arc<ServerContext>,
    serial: Uuid,
    frames: FrameReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    /// Kept so the queue never closes while the connection lives; cloned
    /// into the registry handle.
    tx: mpsc::UnboundedSender<Outbound>,
    rx: mpsc::UnboundedReceiver<Outbound>,

    state: HandshakeState,
    role: Option<Role>,
    client_id: Option<ClientId>,
    path: Option<Arc<Path>>,
    path_key: Option<PathKey>,

    /// Fresh per connection, never persisted.
    session: SessionKeypair,
    client_permanent: Option<PublicKey>,
    /// Client permanent key ↔ server session key; handshake messages.
    auth_box: Option<CryptoBox>,
    /// Client session key ↔ server session key; everything after.
    transport_box: Option<CryptoBox>,

    /// Incoming client-to-server channel.
    validator_in: NonceValidator,
    /// Incoming relayed channels, keyed by destination client-id.
    relay_validators: HashMap<u8, NonceValidator>,
    cookie_out: Cookie,
    csn_out: CombinedSequence,

    ping_interval: Duration,
    last_rx: Instant,
    relayed_out: bool,
    relayed_in: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    async fn serve(&mut self) -> Result<(), SignalingError> {
        self.send_server_hello().await?;

        let deadline = self.ctx.config.handshake_timeout;
        match timeout(deadline, self.handshake()).await {
            Ok(result) => result?,
            Err(_) => return Err(SignalingError::HandshakeTimeout),
        }

        self.relay_loop().await
    }

    // --- Handshake -------------------------------------------------------

    async fn send_server_hello(&mut self) -> Result<(), SignalingError> {
        let message = ControlMessage::ServerHello {
            key: self.session.public_key_bytes(),
        };
        // Plaintext: the client has not told us who it is yet.
        let nonce = self.next_nonce(ClientId::SERVER)?;
        let envelope = Envelope::new(nonce, message.to_vec());
        write_frame(&mut self.writer, &envelope.to_bytes()).await?;

        self.state = HandshakeState::ServerHelloSent;
        debug!("sent server-hello");
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), SignalingError> {
        while self.state != HandshakeState::PeerHandshakeRelay {
            let frame = self
                .frames
                .next_frame()
                .await?
                .ok_or(SignalingError::Disconnected)?;
            self.last_rx = Instant::now();

            let envelope = Envelope::from_bytes(frame)?;
            // The client is unaddressed until server-auth: all handshake
            // traffic runs 0x00 → 0x00.
            if !envelope.nonce.source.is_server() || !envelope.nonce.destination.is_server() {
                return Err(SignalingError::Protocol(format!(
                    "unexpected addressing {} -> {} during handshake",
                    envelope.nonce.source, envelope.nonce.destination
                )));
            }
            self.validator_in
                .check_and_record(&envelope.nonce.cookie, envelope.nonce.combined_sequence())?;

            match self.state {
                HandshakeState::ServerHelloSent => self.on_client_hello(envelope)?,
                HandshakeState::ClientAuthPending => self.on_client_auth(envelope).await?,
                _ => {
                    return Err(SignalingError::Protocol(
                        "message received in invalid handshake state".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    fn on_client_hello(&mut self, envelope: Envelope) -> Result<(), SignalingError> {
        let message = ControlMessage::from_slice(&envelope.payload)?;
        let (key, path, role) = match message {
            ControlMessage::ClientHello { key, path, role } => (key, path, role),
            other => {
                return Err(SignalingError::Protocol(format!(
                    "expected 'client-hello', got '{}'",
                    other.kind()
                )))
            }
        };

        let path_key: PathKey = match (role, path) {
            // An initiator's own key is the path key.
            (Role::Initiator, None) => key,
            (Role::Initiator, Some(HexKey(p))) if p == key => key,
            (Role::Initiator, Some(_)) => {
                return Err(SignalingError::Protocol(
                    "initiator path must be its own key".into(),
                ))
            }
            (Role::Responder, Some(HexKey(p))) if p != key => p,
            (Role::Responder, Some(_)) => {
                return Err(SignalingError::Protocol(
                    "responder cannot pair with itself".into(),
                ))
            }
            (Role::Responder, None) => {
                return Err(SignalingError::Protocol(
                    "responder must name a path".into(),
                ))
            }
        };

        let client_key = PublicKey::from(key);
        self.auth_box = Some(
            CryptoBox::new(self.session.secret(), &client_key)
                .map_err(|_| SignalingError::Protocol("unusable client public key".into()))?,
        );
        self.client_permanent = Some(client_key);
        self.path_key = Some(path_key);
        self.role = Some(role);

        self.state = HandshakeState::ClientAuthPending;
        debug!(role = %role, "received client-hello");
        Ok(())
    }

    async fn on_client_auth(&mut self, envelope: Envelope) -> Result<(), SignalingError> {
        let auth_box = self
            .auth_box
            .as_ref()
            .ok_or_else(|| SignalingError::Internal("auth box missing".into()))?;
        let plaintext = auth_box.open(&envelope.nonce.encode(), &envelope.payload)?;

        let message = ControlMessage::from_slice(&plaintext)?;
        let (your_cookie, session_key, your_key, ping_interval) = match message {
            ControlMessage::ClientAuth {
                your_cookie,
                session_key,
                your_key,
                ping_interval,
            } => (your_cookie, session_key, your_key, ping_interval),
            other => {
                return Err(SignalingError::Protocol(format!(
                    "expected 'client-auth', got '{}'",
                    other.kind()
                )))
            }
        };

        // Cookie proof: the client must echo the cookie from server-hello.
        if Cookie::from_bytes(your_cookie) != self.cookie_out {
            return Err(SignalingError::AuthFailure);
        }
        if let Some(HexKey(expected)) = your_key {
            if expected != self.ctx.identity.public_key_bytes() {
                return Err(SignalingError::InvalidKey);
            }
        }
        if let Some(seconds) = ping_interval {
            let requested = Duration::from_secs(u64::from(seconds));
            if requested >= KEEP_ALIVE_INTERVAL_MIN {
                self.ping_interval = requested;
            }
        }

        let client_session = PublicKey::from(session_key);
        self.transport_box = Some(
            CryptoBox::new(self.session.secret(), &client_session)
                .map_err(|_| SignalingError::Protocol("unusable session public key".into()))?,
        );

        self.register().await?;
        self.state = HandshakeState::PeerHandshakeRelay;
        if let (Some(role), Some(id)) = (self.role, self.client_id) {
            info!(role = %role, id = %id, "handshake completed");
        }
        Ok(())
    }

    /// Claim a slot on the path, notify peers, and confirm with server-auth.
    async fn register(&mut self) -> Result<(), SignalingError> {
        let path_key = self
            .path_key
            .ok_or_else(|| SignalingError::Internal("path key missing".into()))?;
        let handle = ConnectionHandle {
            serial: self.serial,
            tx: self.tx.clone(),
        };

        match self.role {
            Some(Role::Initiator) => {
                let (path, registration) = self
                    .ctx
                    .registry
                    .register_initiator(path_key, handle)
                    .await;
                debug!(path = %hex::encode(path.key()), "registered initiator");
                self.path = Some(path);
                self.client_id = Some(ClientId::INITIATOR);

                if let Some(previous) = registration.previous {
                    info!("evicting previous initiator");
                    previous.close(DisconnectReason::InitiatorReplaced);
                }

                let responder_ids: Vec<u8> =
                    registration.responders.iter().map(|(id, _)| *id).collect();
                for (_, responder) in &registration.responders {
                    responder.notify(ControlMessage::NewInitiator);
                }

                self.send_server_auth(None, Some(responder_ids)).await
            }
            Some(Role::Responder) => {
                let (path, registration) = self
                    .ctx
                    .registry
                    .register_responder(path_key, handle)
                    .await?;
                debug!(
                    path = %hex::encode(path.key()),
                    id = registration.client_id,
                    "registered responder"
                );
                self.path = Some(path);
                self.client_id = Some(ClientId(registration.client_id));

                let initiator_connected = registration.initiator.is_some();
                if let Some(initiator) = registration.initiator {
                    initiator.notify(ControlMessage::NewResponder {
                        id: registration.client_id,
                    });
                }

                self.send_server_auth(Some(initiator_connected), None).await
            }
            None => Err(SignalingError::Internal("role missing".into())),
        }
    }

    async fn send_server_auth(
        &mut self,
        initiator_connected: Option<bool>,
        responders: Option<Vec<u8>>,
    ) -> Result<(), SignalingError> {
        let client_id = self
            .client_id
            .ok_or_else(|| SignalingError::Internal("client id missing".into()))?;
        let client_cookie = *self
            .validator_in
            .cookie()
            .ok_or_else(|| SignalingError::Internal("client cookie missing".into()))?;
        let client_permanent = self
            .client_permanent
            .ok_or_else(|| SignalingError::Internal("client key missing".into()))?;

        let nonce = self.next_nonce(client_id)?;
        let nonce_bytes = nonce.encode();

        // The permanent key vouches for the session key: both public keys
        // sealed under the permanent key, bound to this very nonce.
        let sign_box = CryptoBox::new(self.ctx.identity.secret(), &client_permanent)?;
        let mut keys = Vec::with_capacity(2 * KEY_LENGTH);
        keys.extend_from_slice(&self.session.public_key_bytes());
        keys.extend_from_slice(client_permanent.as_bytes());
        let signed_keys = sign_box.seal(&nonce_bytes, &keys)?;

        let message = ControlMessage::ServerAuth {
            your_cookie: *client_cookie.as_bytes(),
            signed_keys,
            initiator_connected,
            responders,
        };
        let auth_box = self
            .auth_box
            .as_ref()
            .ok_or_else(|| SignalingError::Internal("auth box missing".into()))?;
        let sealed = auth_box.seal(&nonce_bytes, &message.to_vec())?;

        let envelope = Envelope::new(nonce, sealed);
        write_frame(&mut self.writer, &envelope.to_bytes()).await
    }

    // --- Relay phase -----------------------------------------------------

    async fn relay_loop(&mut self) -> Result<(), SignalingError> {
        let mut ping_timer = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = self.frames.next_frame() => {
                    let frame = frame?.ok_or(SignalingError::Disconnected)?;
                    self.last_rx = Instant::now();
                    self.on_frame(frame).await?;
                }
                item = self.rx.recv() => {
                    // We hold our own sender, so the queue cannot close.
                    let item = item
                        .ok_or_else(|| SignalingError::Internal("outbound queue closed".into()))?;
                    self.on_outbound(item).await?;
                }
                _ = ping_timer.tick() => {
                    self.on_keep_alive().await?;
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Bytes) -> Result<(), SignalingError> {
        let envelope = Envelope::from_bytes(frame.clone())?;
        let client_id = self
            .client_id
            .ok_or_else(|| SignalingError::Internal("client id missing".into()))?;

        if envelope.nonce.source != client_id {
            return Err(SignalingError::Protocol(format!(
                "source {} does not match assigned id {}",
                envelope.nonce.source, client_id
            )));
        }

        if envelope.nonce.destination.is_server() {
            self.validator_in
                .check_and_record(&envelope.nonce.cookie, envelope.nonce.combined_sequence())?;
            let transport_box = self
                .transport_box
                .as_ref()
                .ok_or_else(|| SignalingError::Internal("transport box missing".into()))?;
            let plaintext = transport_box.open(&envelope.nonce.encode(), &envelope.payload)?;
            let message = ControlMessage::from_slice(&plaintext)?;
            self.on_control(message).await
        } else {
            self.on_relay(envelope, frame).await
        }
    }

    async fn on_control(&mut self, message: ControlMessage) -> Result<(), SignalingError> {
        let role = self
            .role
            .ok_or_else(|| SignalingError::Internal("role missing".into()))?;
        debug!(kind = message.kind(), "received control message");

        match (role, message) {
            (_, ControlMessage::Ping) => self.send_control(ControlMessage::Pong).await,
            // Any frame already counted as liveness.
            (_, ControlMessage::Pong) => Ok(()),
            (Role::Initiator, ControlMessage::DropResponder { id, reason }) => {
                self.on_drop_responder(id, reason).await
            }
            (_, other) => Err(SignalingError::Protocol(format!(
                "unexpected '{}' from {} in relay phase",
                other.kind(),
                role
            ))),
        }
    }

    async fn on_drop_responder(
        &mut self,
        id: u8,
        reason: Option<u16>,
    ) -> Result<(), SignalingError> {
        let target = ClientId(id);
        if !target.is_responder() {
            return Err(SignalingError::Protocol(format!(
                "drop-responder target {} out of range",
                target
            )));
        }
        let reason = match reason {
            Some(code) => DisconnectReason::try_from(code)?,
            None => DisconnectReason::DroppedByInitiator,
        };

        let path = self
            .path
            .clone()
            .ok_or_else(|| SignalingError::Internal("path missing".into()))?;
        match path.lookup(target).await {
            Some(responder) => {
                debug!(target = %target, reason = %reason, "dropping responder");
                responder.close(reason);
            }
            None => debug!(target = %target, "responder already gone, nothing to do"),
        }
        Ok(())
    }

    async fn on_relay(&mut self, envelope: Envelope, frame: Bytes) -> Result<(), SignalingError> {
        let destination = envelope.nonce.destination;
        let allowed = match self.role {
            Some(Role::Initiator) => destination.is_responder(),
            Some(Role::Responder) => destination.is_initiator(),
            None => false,
        };
        if !allowed {
            return Err(SignalingError::Protocol(format!(
                "relay to {} not permitted for this role",
                destination
            )));
        }

        // The payload stays opaque, but the cleartext header is still a
        // nonce on the client-to-client channel and must behave like one.
        let validator = self
            .relay_validators
            .entry(destination.0)
            .or_insert_with(|| NonceValidator::new(None));
        validator.check_and_record(&envelope.nonce.cookie, envelope.nonce.combined_sequence())?;

        let path = self
            .path
            .clone()
            .ok_or_else(|| SignalingError::Internal("path missing".into()))?;
        let result = dispatch::relay(
            &path,
            destination,
            frame,
            self.tx.clone(),
            envelope.nonce.message_id(),
            self.ctx.config.relay_deadline,
        )
        .await;

        match result {
            Ok(()) => {
                self.relayed_out = true;
                self.maybe_promote();
                Ok(())
            }
            Err(SignalingError::PeerUnreachable(_)) => {
                debug!(destination = %destination, "cannot relay, destination not connected");
                self.send_control(ControlMessage::SendError {
                    id: envelope.nonce.message_id(),
                })
                .await
            }
            Err(other) => Err(other),
        }
    }

    async fn on_outbound(&mut self, item: Outbound) -> Result<(), SignalingError> {
        match item {
            Outbound::Relay(frame, ack) => {
                write_frame(&mut self.writer, &frame).await?;
                let _ = ack.send(());
                self.relayed_in = true;
                self.maybe_promote();
                Ok(())
            }
            Outbound::Control(message) => {
                self.note_peer_change(&message);
                self.send_control(message).await
            }
            Outbound::Close(reason) => {
                // Deliver the reason before the stream goes away.
                if let Some(id) = self.client_id {
                    let notice = ControlMessage::Disconnected {
                        id: id.0,
                        reason: reason.code(),
                    };
                    let _ = self.send_control(notice).await;
                }
                Err(SignalingError::Dropped(reason))
            }
        }
    }

    /// A peer slot changing hands starts a fresh client-to-client channel;
    /// drop the pinned cookie and counter for it.
    fn note_peer_change(&mut self, message: &ControlMessage) {
        match message {
            ControlMessage::NewInitiator => {
                self.relay_validators.remove(&ClientId::INITIATOR.0);
            }
            ControlMessage::NewResponder { id } | ControlMessage::Disconnected { id, .. } => {
                self.relay_validators.remove(id);
            }
            _ => {}
        }
    }

    async fn on_keep_alive(&mut self) -> Result<(), SignalingError> {
        if self.last_rx.elapsed() > self.ping_interval + self.ctx.config.keep_alive_grace {
            return Err(SignalingError::PingTimeout);
        }
        self.send_control(ControlMessage::Ping).await
    }

    fn maybe_promote(&mut self) {
        if self.state == HandshakeState::PeerHandshakeRelay && self.relayed_out && self.relayed_in
        {
            self.state = HandshakeState::Established;
            debug!("connection established");
        }
    }

    // --- Outgoing --------------------------------------------------------

    fn next_nonce(&mut self, destination: ClientId) -> Result<Nonce, SignalingError> {
        let csn = self.csn_out.next()?;
        Ok(Nonce::new(self.cookie_out, ClientId::SERVER, destination, csn))
    }

    /// Seal and write a server control message on the post-handshake
    /// channel.
    async fn send_control(&mut self, message: ControlMessage) -> Result<(), SignalingError> {
        let client_id = self
            .client_id
            .ok_or_else(|| SignalingError::Internal("client id missing".into()))?;
        let nonce = self.next_nonce(client_id)?;

        let transport_box = self
            .transport_box
            .as_ref()
            .ok_or_else(|| SignalingError::Internal("transport box missing".into()))?;
        let sealed = transport_box.seal(&nonce.encode(), &message.to_vec())?;

        debug!(kind = message.kind(), "sending control message");
        let envelope = Envelope::new(nonce, sealed);
        write_frame(&mut self.writer, &envelope.to_bytes()).await
    }

    // --- Teardown --------------------------------------------------------

    /// Deregister, notify the surviving peers, and close the stream.
    /// Runs before the task exits, for every outcome.
    async fn shutdown(mut self, result: Result<(), SignalingError>) {
        self.state = HandshakeState::Closed;
        let reason = match &result {
            Ok(()) => DisconnectReason::GoingAway,
            Err(e) => e.reason(),
        };
        match &result {
            Ok(()) => info!("connection closed"),
            Err(e) if e.is_benign() => info!(reason = %reason, "connection closed"),
            Err(e) => warn!(error = %e, reason = %reason, "closing connection"),
        }

        if let (Some(path_key), Some(client_id)) = (self.path_key, self.client_id) {
            let removed = self
                .ctx
                .registry
                .remove(&path_key, client_id, self.serial)
                .await;
            // `None` means a successor already owns the slot (eviction);
            // its peers are not ours to notify.
            if let Some(peers) = removed {
                for peer in peers {
                    peer.notify(ControlMessage::Disconnected {
                        id: client_id.0,
                        reason: reason.code(),
                    });
                }
            }
        }

        let _ = self.writer.shutdown().await;
    }
}
