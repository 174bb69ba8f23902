//! Wire protocol for Corelink.
//!
//! After the handshake, each direction of a session carries AES-128-CBC
//! ciphertext wrapped in chunk frames:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ Length (2, BE)       │ Ciphertext (Length bytes)    │
//! └──────────────────────┴──────────────────────────────┘
//! ```
//!
//! The decrypted payload of every frame is a single CoAP message.

mod chunking;
mod coap;
mod messages;

pub use chunking::{ChunkingFramer, MAX_FRAME_SIZE};
pub use coap::{CoapCode, CoapMessage, CoapOption, CoapType, Token};
pub use messages::{MessageName, MessageSpec, ResponseClass};

/// Calculate the CRC32 checksum carried with each OTA chunk.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
