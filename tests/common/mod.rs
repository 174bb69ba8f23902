//! Shared test harness: an in-process device driving the wire protocol
//! from the firmware side of a duplex stream.

#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

use corelink::config::SessionConfig;
use corelink::crypto::{CipherStream, DecipherStream, ServerKey, SessionKey};
use corelink::keystore::KeyStore;
use corelink::protocol::{ChunkingFramer, CoapMessage, MessageName};
use corelink::server::{handshake, DeviceSession, HandshakeConfig};
use corelink::types::{DeviceId, MessageCounter};
use corelink::{ID_BLOB_SIZE, NONCE_SIZE, SESSION_KEY_SIZE};

use std::sync::Arc;

/// A simulated device: keypair plus identity.
#[derive(Clone)]
pub struct TestDevice {
    pub device_id: DeviceId,
    pub private: RsaPrivateKey,
    pub public_der: Vec<u8>,
}

impl TestDevice {
    pub fn new(id_byte: u8) -> Self {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, 1024).expect("device keygen");
        let public_der = RsaPublicKey::from(&private)
            .to_public_key_der()
            .expect("device key der")
            .into_vec();
        Self {
            device_id: DeviceId::from_bytes([id_byte; 12]),
            private,
            public_der,
        }
    }
}

/// The device's half of an established session.
pub struct DeviceLink {
    framed: Framed<DuplexStream, ChunkingFramer>,
    cipher: CipherStream,
    decipher: DecipherStream,
    next_message_id: u16,
}

impl DeviceLink {
    /// Next outbound message id on the device side.
    pub fn next_message_id(&mut self) -> u16 {
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.next_message_id
    }

    /// Encrypt and send one message.
    pub async fn send(&mut self, msg: &CoapMessage) {
        let ciphertext = self.cipher.encrypt_next(&msg.encode().expect("encode"));
        self.framed
            .send(Bytes::from(ciphertext))
            .await
            .expect("device send");
    }

    /// Receive and decrypt the next message.
    pub async fn recv(&mut self) -> CoapMessage {
        let frame = self
            .framed
            .next()
            .await
            .expect("link open")
            .expect("frame read");
        let plain = self.decipher.decrypt_next(&frame).expect("decrypt");
        CoapMessage::decode(&plain).expect("decode")
    }

    /// Encrypt a message and drop it, desynchronising this side's counter.
    pub async fn encrypt_and_discard(&mut self, msg: &CoapMessage) {
        let _ = self.cipher.encrypt_next(&msg.encode().expect("encode"));
    }

    /// Receive, skipping server keepalive pings.
    pub async fn recv_app(&mut self) -> CoapMessage {
        loop {
            let msg = self.recv().await;
            if MessageName::from_request(&msg) != Some(MessageName::Ping) {
                return msg;
            }
        }
    }
}

/// Device-side handshake over an open socket.
///
/// Returns the link after the hello exchange completes in both directions.
pub async fn device_handshake(
    mut socket: DuplexStream,
    server_public: &RsaPublicKey,
    device: &TestDevice,
) -> DeviceLink {
    // Nonce, identity blob with in-band key.
    let mut nonce = [0u8; NONCE_SIZE];
    socket.read_exact(&mut nonce).await.expect("nonce");

    let mut blob = Vec::new();
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(device.device_id.as_bytes());
    blob.extend_from_slice(&device.public_der);

    let mut rng = rand::rngs::OsRng;
    let encrypted = server_public
        .encrypt(&mut rng, Pkcs1v15Encrypt, &blob)
        .expect("encrypt id blob");
    assert_eq!(encrypted.len(), ID_BLOB_SIZE);
    socket.write_all(&encrypted).await.expect("send id blob");

    // Session key message: 128-byte ciphertext, 256-byte signature.
    let mut reply = [0u8; 128 + 256];
    socket.read_exact(&mut reply).await.expect("session key");
    let key_material = device
        .private
        .decrypt(Pkcs1v15Encrypt, &reply[..128])
        .expect("decrypt session key");
    let mut bytes = [0u8; SESSION_KEY_SIZE];
    bytes.copy_from_slice(&key_material);

    // Verify the server's attestation the way firmware does.
    let digest = corelink::crypto::hmac_sha1(&bytes, &reply[..128]);
    corelink::crypto::DeviceKey::verify_server(server_public, &digest, &reply[128..])
        .expect("server signature");

    let session_key = SessionKey::from_bytes(bytes);
    let (mut cipher, mut decipher) = session_key.streams();
    let mut framed = Framed::new(socket, ChunkingFramer::new());

    // Device hello first, then read the server hello and adopt its
    // announced counter.
    let hello = MessageName::Hello.build(1).with_payload(vec![0, 0]);
    let ciphertext = cipher.encrypt_next(&hello.encode().expect("encode hello"));
    framed
        .send(Bytes::from(ciphertext))
        .await
        .expect("send hello");

    let frame = framed
        .next()
        .await
        .expect("server hello frame")
        .expect("server hello read");
    let plain = decipher.decrypt_next(&frame).expect("decrypt server hello");
    let server_hello = CoapMessage::decode(&plain).expect("decode server hello");
    assert_eq!(
        MessageName::from_request(&server_hello),
        Some(MessageName::Hello)
    );
    let seed: [u8; 4] = server_hello.payload[..4].try_into().expect("counter seed");
    decipher.set_expected(MessageCounter::new(u32::from_be_bytes(seed)));

    DeviceLink {
        framed,
        cipher,
        decipher,
        next_message_id: 1,
    }
}

/// Establish a full server+device session pair over an in-memory duplex.
///
/// Returns the server-side session handle and the device link.
pub async fn session_pair(
    keystore: &KeyStore,
    server_key: &ServerKey,
    device: &TestDevice,
    session_config: &SessionConfig,
) -> (Arc<DeviceSession>, DeviceLink) {
    let (device_sock, server_sock) = tokio::io::duplex(65536);
    let server_public = server_key.public().clone();

    // The device half runs on its own task: it blocks on the server Hello,
    // which only goes out once the session has been spawned.
    let device = device.clone();
    let device_task = tokio::spawn(async move {
        device_handshake(device_sock, &server_public, &device).await
    });

    let handshake_config = HandshakeConfig::default();
    let outcome = handshake(server_sock, server_key, keystore, &handshake_config)
        .await
        .expect("server handshake");
    let session = DeviceSession::spawn(outcome, session_config);

    let link = device_task.await.expect("device handshake");
    (session, link)
}

/// A session config that keeps keepalive probes out of short tests.
pub fn quiet_session_config() -> SessionConfig {
    SessionConfig {
        ping_interval_secs: 3600,
    }
}
