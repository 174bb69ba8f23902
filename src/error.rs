//! Error types for Corelink.

use std::io;

use thiserror::Error;

/// Result type alias for Corelink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Corelink.
#[derive(Error, Debug)]
pub enum Error {
    // Connection establishment
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    // Established sessions
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    // Firmware delivery
    #[error("ota error: {0}")]
    Ota(#[from] OtaError),

    // Event bus
    #[error("pubsub error: {0}")]
    PubSub(#[from] PubSubError),

    // Cryptographic primitives
    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    // Configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General
    #[error("internal error: {0}")]
    Internal(String),
}

/// Handshake stage failures.
///
/// Every variant names the stage that failed; no partial session ever
/// escapes a failed handshake.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("handshake timed out in stage {stage}")]
    Timeout { stage: &'static str },

    #[error("failed to decrypt device identity blob")]
    Decrypt,

    #[error("device response did not echo our nonce")]
    NonceMismatch,

    #[error("no public key on record for device {device_id}")]
    UnknownDevice { device_id: String },

    #[error("identity blob too short: {len} bytes")]
    ShortIdBlob { len: usize },

    #[error("invalid device-provided public key: {0}")]
    InvalidDeviceKey(String),

    #[error("socket error in stage {stage}: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Errors on an established device session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("message counter desync: expected {expected}")]
    CounterMismatch { expected: u32 },

    #[error("frame oversize: {size} bytes (max {max})")]
    FrameOversize { size: usize, max: usize },

    #[error("malformed CoAP message: {0}")]
    MalformedMessage(String),

    #[error("session IO error: {0}")]
    Io(String),

    #[error("session closed")]
    Closed,
}

/// Firmware update failures.
///
/// Every error path releases session ownership and drops the firmware
/// buffer before surfacing.
#[derive(Error, Debug)]
pub enum OtaError {
    #[error("device session already owned, update claim denied")]
    ClaimDenied,

    #[error("device never acknowledged update begin")]
    BeginTimeout,

    #[error("device aborted update (reason code {0})")]
    Aborted(u8),

    #[error("device rejected chunk {index}")]
    ChunkReceivedFail { index: u16 },

    #[error("too many outstanding missed chunks: {count} (max {max})")]
    MissedChunkFlood { count: usize, max: usize },

    #[error("update timed out")]
    Timeout,

    #[error("empty firmware image")]
    EmptyImage,
}

/// Event bus failures.
#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("no response within {0:?}")]
    ResponseTimeout(std::time::Duration),

    #[error("event bus shut down")]
    Closed,
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::from(HandshakeError::NonceMismatch);
        assert!(err.to_string().contains("nonce"));

        let err = Error::from(SessionError::CounterMismatch { expected: 7 });
        assert!(err.to_string().contains('7'));

        let err = Error::from(OtaError::Aborted(3));
        assert!(err.to_string().contains("reason code 3"));
    }
}
