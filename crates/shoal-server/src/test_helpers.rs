//! Shared helpers for end-to-end signaling tests: a protocol-speaking test
//! client driven over an in-memory duplex stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;
use x25519_dalek::PublicKey;

use crate::connection::{self, ConnectionConfig, ServerContext};
use crate::registry::PathRegistry;
use crate::transport::{write_frame, FrameReader};
use shoal_core::envelope::Envelope;
use shoal_core::message::ControlMessage;
use shoal_core::nonce::{Cookie, Nonce};
use shoal_core::{ClientId, PathKey, Role};
use shoal_crypto::boxes::CryptoBox;
use shoal_crypto::identity::{PermanentKeypair, SessionKeypair};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);

pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        handshake_timeout: Duration::from_secs(2),
        keep_alive_interval: Duration::from_secs(60),
        keep_alive_grace: Duration::from_secs(30),
        relay_deadline: Duration::from_millis(500),
    }
}

pub fn test_context() -> Arc<ServerContext> {
    test_context_with(fast_config())
}

pub fn test_context_with(config: ConnectionConfig) -> Arc<ServerContext> {
    Arc::new(ServerContext {
        identity: PermanentKeypair::generate(),
        registry: PathRegistry::new(),
        config,
    })
}

/// One signaling client talking to an in-process server connection task.
pub struct TestClient {
    frames: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    pub permanent: PermanentKeypair,
    pub session: SessionKeypair,
    pub cookie: Cookie,
    csn: u64,
    relay_csn: HashMap<u8, u64>,
    pub server_session: Option<PublicKey>,
    pub server_cookie: Option<Cookie>,
    pub auth_box: Option<CryptoBox>,
    pub transport_box: Option<CryptoBox>,
    pub client_id: ClientId,
    /// Header of the most recently read envelope.
    pub last_nonce: Option<Nonce>,
}

impl TestClient {
    /// Open a duplex pair and spawn a server connection task on the far end.
    pub fn connect(ctx: &Arc<ServerContext>) -> Self {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        tokio::spawn(connection::run(server_end, ctx.clone()));

        let (reader, writer) = tokio::io::split(client_end);
        Self {
            frames: FrameReader::new(reader),
            writer,
            permanent: PermanentKeypair::generate(),
            session: SessionKeypair::generate(),
            cookie: Cookie::random(),
            csn: 100,
            relay_csn: HashMap::new(),
            server_session: None,
            server_cookie: None,
            auth_box: None,
            transport_box: None,
            client_id: ClientId::SERVER,
            last_nonce: None,
        }
    }

    /// Connect with a specific permanent keypair (to claim a known path).
    pub fn with_permanent(ctx: &Arc<ServerContext>, permanent: PermanentKeypair) -> Self {
        let mut client = Self::connect(ctx);
        client.permanent = permanent;
        client
    }

    pub fn public_key(&self) -> PathKey {
        self.permanent.public_key_bytes()
    }

    pub fn next_nonce(&mut self, destination: ClientId) -> Nonce {
        let nonce = Nonce::new(self.cookie, self.client_id, destination, self.csn);
        self.csn += 1;
        nonce
    }

    pub async fn read_envelope(&mut self) -> Envelope {
        let frame = timeout(TEST_TIMEOUT, self.frames.next_frame())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream error")
            .expect("unexpected end of stream");
        let envelope = Envelope::from_bytes(frame).expect("malformed envelope");
        self.last_nonce = Some(envelope.nonce);
        envelope
    }

    /// Assert the server closes the stream without sending anything more.
    pub async fn expect_closed(&mut self) {
        let result = timeout(TEST_TIMEOUT, self.frames.next_frame())
            .await
            .expect("timed out waiting for the stream to close");
        match result {
            Ok(None) | Err(_) => {}
            Ok(Some(frame)) => panic!("expected close, got a {} byte frame", frame.len()),
        }
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) {
        write_frame(&mut self.writer, &envelope.to_bytes())
            .await
            .expect("write failed");
    }

    // --- Handshake steps -------------------------------------------------

    pub async fn recv_server_hello(&mut self) {
        let envelope = self.read_envelope().await;
        self.server_cookie = Some(envelope.nonce.cookie);

        let message = ControlMessage::from_slice(&envelope.payload).expect("bad server-hello");
        let key = match message {
            ControlMessage::ServerHello { key } => key,
            other => panic!("expected server-hello, got {}", other.kind()),
        };

        let server_session = PublicKey::from(key);
        self.auth_box =
            Some(CryptoBox::new(self.permanent.secret(), &server_session).unwrap());
        self.transport_box =
            Some(CryptoBox::new(self.session.secret(), &server_session).unwrap());
        self.server_session = Some(server_session);
    }

    pub async fn send_client_hello(&mut self, role: Role, path: Option<PathKey>) {
        let message = ControlMessage::ClientHello {
            key: self.public_key(),
            path: path.map(shoal_core::message::HexKey),
            role,
        };
        let nonce = self.next_nonce(ClientId::SERVER);
        self.send_envelope(&Envelope::new(nonce, message.to_vec())).await;
    }

    pub fn client_auth_message(&self) -> ControlMessage {
        ControlMessage::ClientAuth {
            your_cookie: *self.server_cookie.expect("server-hello not read").as_bytes(),
            session_key: self.session.public_key_bytes(),
            your_key: None,
            ping_interval: None,
        }
    }

    pub async fn send_sealed_auth(&mut self, message: ControlMessage) {
        let nonce = self.next_nonce(ClientId::SERVER);
        let sealed = self
            .auth_box
            .as_ref()
            .expect("auth box not ready")
            .seal(&nonce.encode(), &message.to_vec())
            .unwrap();
        self.send_envelope(&Envelope::new(nonce, sealed)).await;
    }

    pub async fn recv_server_auth(&mut self) -> ControlMessage {
        let envelope = self.read_envelope().await;
        self.client_id = envelope.nonce.destination;

        let plaintext = self
            .auth_box
            .as_ref()
            .expect("auth box not ready")
            .open(&envelope.nonce.encode(), &envelope.payload)
            .expect("server-auth must open");
        ControlMessage::from_slice(&plaintext).expect("bad server-auth")
    }

    pub async fn handshake(&mut self, role: Role, path: Option<PathKey>) -> ControlMessage {
        self.recv_server_hello().await;
        self.send_client_hello(role, path).await;
        let auth = self.client_auth_message();
        self.send_sealed_auth(auth).await;
        self.recv_server_auth().await
    }

    pub async fn handshake_as_initiator(&mut self) -> ControlMessage {
        self.handshake(Role::Initiator, None).await
    }

    pub async fn handshake_as_responder(&mut self, path: PathKey) -> ControlMessage {
        self.handshake(Role::Responder, Some(path)).await
    }

    // --- Relay phase -----------------------------------------------------

    pub async fn send_sealed_control(&mut self, message: ControlMessage) {
        let nonce = self.next_nonce(ClientId::SERVER);
        let sealed = self
            .transport_box
            .as_ref()
            .expect("transport box not ready")
            .seal(&nonce.encode(), &message.to_vec())
            .unwrap();
        self.send_envelope(&Envelope::new(nonce, sealed)).await;
    }

    pub async fn recv_control(&mut self) -> ControlMessage {
        let envelope = self.read_envelope().await;
        let plaintext = self
            .transport_box
            .as_ref()
            .expect("transport box not ready")
            .open(&envelope.nonce.encode(), &envelope.payload)
            .expect("control message must open");
        ControlMessage::from_slice(&plaintext).expect("bad control message")
    }

    /// Send an opaque relay envelope; returns its message id.
    pub async fn send_relay(&mut self, destination: ClientId, payload: &[u8]) -> [u8; 8] {
        let csn = self.relay_csn.entry(destination.0).or_insert(1);
        let value = *csn;
        *csn += 1;

        let nonce = Nonce::new(self.cookie, self.client_id, destination, value);
        self.send_envelope(&Envelope::new(nonce, payload.to_vec())).await;
        nonce.message_id()
    }

    pub async fn recv_relay(&mut self) -> (ClientId, Bytes) {
        let envelope = self.read_envelope().await;
        (envelope.nonce.source, envelope.payload)
    }
}

/// A fully paired initiator/responder, with the responder's `new-initiator`
/// notification already consumed.
pub async fn paired(ctx: &Arc<ServerContext>) -> (TestClient, TestClient) {
    let initiator_keys = PermanentKeypair::generate();
    let path = initiator_keys.public_key_bytes();

    let mut responder = TestClient::connect(ctx);
    responder.handshake_as_responder(path).await;
    assert_eq!(responder.client_id, ClientId(0x02));

    let mut initiator = TestClient::with_permanent(ctx, initiator_keys);
    initiator.handshake_as_initiator().await;

    assert_eq!(responder.recv_control().await, ControlMessage::NewInitiator);
    (initiator, responder)
}
