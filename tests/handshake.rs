//! Handshake integration tests with a full device on the far side.

mod common;

use common::{quiet_session_config, session_pair, TestDevice};

use corelink::crypto::ServerKey;
use corelink::error::{Error, HandshakeError};
use corelink::keystore::KeyStore;
use corelink::protocol::MessageName;
use corelink::server::{handshake, HandshakeConfig};
use corelink::NONCE_SIZE;
use rsa::Pkcs1v15Encrypt;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn test_first_contact_establishes_session() {
    let dir = tempdir().unwrap();
    let keystore = KeyStore::open(dir.path()).unwrap();
    let server_key = ServerKey::generate().unwrap();
    let device = TestDevice::new(0x31);

    let (session, mut link) =
        session_pair(&keystore, &server_key, &device, &quiet_session_config()).await;

    assert_eq!(session.device_id(), device.device_id);
    // The in-band key was persisted for the next connection.
    assert!(keystore.device_key(&device.device_id).unwrap().is_some());

    // The channel is live both ways.
    let id = link.next_message_id();
    link.send(&MessageName::GetTime.build(id)).await;
    let reply = link.recv_app().await;
    assert_eq!(reply.payload.len(), 4);
}

#[tokio::test]
async fn test_known_device_reconnects_without_inband_key() {
    let dir = tempdir().unwrap();
    let keystore = KeyStore::open(dir.path()).unwrap();
    let server_key = ServerKey::generate().unwrap();
    let device = TestDevice::new(0x32);

    // First contact persists the key.
    let (first, _link) =
        session_pair(&keystore, &server_key, &device, &quiet_session_config()).await;
    first.close("test over");

    // Second connection: blob with no key material must still succeed.
    let (mut device_sock, server_sock) = tokio::io::duplex(65536);
    let server_public = server_key.public().clone();
    let device_id = device.device_id;

    let device_side = async move {
        let mut nonce = [0u8; NONCE_SIZE];
        device_sock.read_exact(&mut nonce).await.unwrap();

        let mut blob = Vec::new();
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(device_id.as_bytes());
        let mut rng = rand::rngs::OsRng;
        let encrypted = server_public
            .encrypt(&mut rng, Pkcs1v15Encrypt, &blob)
            .unwrap();
        device_sock.write_all(&encrypted).await.unwrap();

        // Read the session key message so the server can move on, then
        // hold the socket open without a hello.
        let mut reply = [0u8; 128 + 256];
        device_sock.read_exact(&mut reply).await.unwrap();
        device_sock
    };

    let short = HandshakeConfig {
        read_timeout: std::time::Duration::from_millis(400),
        ..Default::default()
    };
    let (outcome, _sock) = tokio::join!(
        handshake(server_sock, &server_key, &keystore, &short),
        device_side,
    );

    // Key lookup succeeded (no UnknownDevice); only the missing hello
    // fails the exchange.
    match outcome.unwrap_err() {
        Error::Handshake(HandshakeError::Timeout { stage }) => {
            assert_eq!(stage, "send-hello");
        }
        other => panic!("expected hello timeout, got {other}"),
    }
}

#[tokio::test]
async fn test_nonce_mismatch_closes_without_session() {
    let dir = tempdir().unwrap();
    let keystore = KeyStore::open(dir.path()).unwrap();
    let server_key = ServerKey::generate().unwrap();
    let device = TestDevice::new(0x33);

    let (mut device_sock, server_sock) = tokio::io::duplex(65536);
    let server_public = server_key.public().clone();

    let device_side = async move {
        let mut nonce = [0u8; NONCE_SIZE];
        device_sock.read_exact(&mut nonce).await.unwrap();
        // Tamper with the echo.
        nonce[0] ^= 0x01;

        let mut blob = Vec::new();
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(device.device_id.as_bytes());
        blob.extend_from_slice(&device.public_der);
        let mut rng = rand::rngs::OsRng;
        let encrypted = server_public
            .encrypt(&mut rng, Pkcs1v15Encrypt, &blob)
            .unwrap();
        device_sock.write_all(&encrypted).await.unwrap();
        device_sock
    };

    let handshake_config = HandshakeConfig::default();
    let (outcome, _sock) = tokio::join!(
        handshake(server_sock, &server_key, &keystore, &handshake_config),
        device_side,
    );

    assert!(matches!(
        outcome.unwrap_err(),
        Error::Handshake(HandshakeError::NonceMismatch)
    ));
    // Nothing was persisted for the failed contact.
    assert!(keystore.device_key(&device.device_id).unwrap().is_none());
}

#[tokio::test]
async fn test_device_verifies_server_attestation() {
    // device_handshake checks the HMAC signature before completing, so an
    // established pair proves the server signed the ciphertext with the
    // key the device trusts.
    let dir = tempdir().unwrap();
    let keystore = KeyStore::open(dir.path()).unwrap();
    let server_key = ServerKey::generate().unwrap();
    let device = TestDevice::new(0x34);

    let (session, link) =
        session_pair(&keystore, &server_key, &device, &quiet_session_config()).await;
    assert!(session.is_open());
    drop(link);
}
