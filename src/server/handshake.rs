//! Per-connection handshake state machine.
//!
//! Runs once on every accepted socket, in five stages:
//!
//! ```text
//! send-nonce → read-core-id → get-core-key → send-session-key → send-hello
//! ```
//!
//! The server writes a 40-byte nonce; the device answers with a 256-byte
//! RSA blob (nonce echo, device id, optionally its public key); the server
//! answers with the RSA-encrypted session key plus a signed HMAC; then both
//! sides switch to framed AES-128-CBC and the device's `Hello` arrives as
//! the first frame. Any failure closes the socket with a stage-typed error;
//! no partial session ever escapes.

use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::crypto::{hmac_sha1, random_bytes, secure_compare, CipherStream, DecipherStream,
    DeviceKey, ServerKey, SessionKey};
use crate::error::{Error, HandshakeError, Result};
use crate::keystore::KeyStore;
use crate::protocol::{ChunkingFramer, CoapMessage, MessageName};
use crate::types::DeviceId;
use crate::{ID_BLOB_SIZE, NONCE_SIZE};

/// Handshake deadlines.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Bound on the whole key exchange (stages 1–4).
    pub global_timeout: Duration,
    /// Bound on any single read, including the device `Hello` wait.
    pub read_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            global_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything a completed handshake hands to the session.
#[derive(Debug)]
pub struct HandshakeOutcome<S> {
    pub device_id: DeviceId,
    pub framed: Framed<S, ChunkingFramer>,
    pub cipher: CipherStream,
    pub decipher: DecipherStream,
    pub session_key: SessionKey,
    /// The device's `Hello`, the first decrypted frame.
    pub hello: CoapMessage,
    /// Frames that arrived during the `Hello` window, decrypted in
    /// arrival order. The session must process them first.
    pub pending: Vec<CoapMessage>,
}

/// Run the handshake on a fresh socket.
pub async fn handshake<S>(
    stream: S,
    server_key: &ServerKey,
    keystore: &KeyStore,
    config: &HandshakeConfig,
) -> Result<HandshakeOutcome<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Stages 1–4 under the global deadline.
    let exchanged = timeout(
        config.global_timeout,
        exchange_keys(stream, server_key, keystore, config),
    )
    .await
    .map_err(|_| HandshakeError::Timeout { stage: "key-exchange" })??;

    let Exchanged {
        device_id,
        mut framed,
        cipher,
        mut decipher,
        session_key,
    } = exchanged;

    // Stage 5: wait for the device Hello, buffering anything behind it.
    let first = timeout(config.read_timeout, framed.next())
        .await
        .map_err(|_| HandshakeError::Timeout { stage: "send-hello" })?
        .ok_or(HandshakeError::Io {
            stage: "send-hello",
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "socket closed"),
        })?
        .map_err(|e| stage_error("send-hello", e))?;

    let hello_plain = decipher
        .decrypt_next(&first)
        .map_err(|_| HandshakeError::Decrypt)?;
    let hello = CoapMessage::decode(&hello_plain)
        .map_err(|e| Error::from(HandshakeError::Io {
            stage: "send-hello",
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        }))?;

    if MessageName::from_request(&hello) != Some(MessageName::Hello) {
        return Err(HandshakeError::Io {
            stage: "send-hello",
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected Hello, got {}", hello.code),
            ),
        }
        .into());
    }

    // Frames already buffered behind the Hello belong to the session;
    // decrypt them now so counter order is preserved.
    let mut pending = Vec::new();
    while let Some(Some(frame)) = framed.next().now_or_never() {
        let frame = frame.map_err(|e| stage_error("send-hello", e))?;
        let plain = decipher
            .decrypt_next(&frame)
            .map_err(|_| HandshakeError::Decrypt)?;
        let msg = CoapMessage::decode(&plain).map_err(|e| {
            Error::from(HandshakeError::Io {
                stage: "send-hello",
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
            })
        })?;
        pending.push(msg);
    }

    debug!(device_id = %device_id, pending = pending.len(), "handshake complete");

    Ok(HandshakeOutcome {
        device_id,
        framed,
        cipher,
        decipher,
        session_key,
        hello,
        pending,
    })
}

struct Exchanged<S> {
    device_id: DeviceId,
    framed: Framed<S, ChunkingFramer>,
    cipher: CipherStream,
    decipher: DecipherStream,
    session_key: SessionKey,
}

/// Stages 1–4: nonce, identity blob, key lookup, session key delivery.
async fn exchange_keys<S>(
    mut stream: S,
    server_key: &ServerKey,
    keystore: &KeyStore,
    config: &HandshakeConfig,
) -> Result<Exchanged<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // send-nonce
    let nonce: [u8; NONCE_SIZE] = random_bytes();
    stream
        .write_all(&nonce)
        .await
        .map_err(|e| io_error("send-nonce", e))?;
    trace!("nonce sent");

    // read-core-id
    let mut blob = [0u8; ID_BLOB_SIZE];
    timeout(config.read_timeout, stream.read_exact(&mut blob))
        .await
        .map_err(|_| HandshakeError::Timeout { stage: "read-core-id" })?
        .map_err(|e| io_error("read-core-id", e))?;

    let plaintext = server_key
        .decrypt(&blob)
        .map_err(|_| HandshakeError::Decrypt)?;

    if plaintext.len() < NONCE_SIZE + crate::types::DEVICE_ID_LEN {
        return Err(HandshakeError::ShortIdBlob {
            len: plaintext.len(),
        }
        .into());
    }

    if !secure_compare(&plaintext[..NONCE_SIZE], &nonce) {
        return Err(HandshakeError::NonceMismatch.into());
    }

    let device_id = DeviceId::try_from_slice(
        &plaintext[NONCE_SIZE..NONCE_SIZE + crate::types::DEVICE_ID_LEN],
    )?;

    // A first-seen device appends its public key in DER.
    let provided_key = {
        let rest = &plaintext[NONCE_SIZE + crate::types::DEVICE_ID_LEN..];
        if rest.is_empty() {
            None
        } else {
            Some(
                DeviceKey::from_der(rest)
                    .map_err(|e| HandshakeError::InvalidDeviceKey(e.to_string()))?,
            )
        }
    };

    // get-core-key
    let device_key = match (keystore.device_key(&device_id)?, provided_key) {
        (Some(known), _) => known,
        (None, Some(provided)) => {
            keystore.save_handshake_key(&device_id, &provided)?;
            provided
        }
        (None, None) => {
            return Err(HandshakeError::UnknownDevice {
                device_id: device_id.to_hex(),
            }
            .into())
        }
    };

    // send-session-key
    let session_key = SessionKey::generate();
    let ciphertext = device_key.encrypt(session_key.as_bytes())?;
    let digest = hmac_sha1(session_key.as_bytes(), &ciphertext);
    let signature = server_key.sign(&digest)?;

    let mut reply = Vec::with_capacity(ciphertext.len() + signature.len());
    reply.extend_from_slice(&ciphertext);
    reply.extend_from_slice(&signature);
    stream
        .write_all(&reply)
        .await
        .map_err(|e| io_error("send-session-key", e))?;
    stream
        .flush()
        .await
        .map_err(|e| io_error("send-session-key", e))?;

    let (cipher, decipher) = session_key.streams();
    let framed = Framed::new(stream, ChunkingFramer::new());

    Ok(Exchanged {
        device_id,
        framed,
        cipher,
        decipher,
        session_key,
    })
}

fn io_error(stage: &'static str, source: std::io::Error) -> Error {
    HandshakeError::Io { stage, source }.into()
}

/// Fold a framer error into a stage-typed handshake error.
fn stage_error(stage: &'static str, err: Error) -> Error {
    match err {
        Error::Io(source) => HandshakeError::Io { stage, source }.into(),
        other => other,
    }
}
