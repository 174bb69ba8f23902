//! # Corelink
//!
//! Device-cloud server for Particle-class embedded devices.
//!
//! Corelink terminates TCP connections from small microcontrollers,
//! establishes a mutually authenticated encrypted session with each one,
//! carries a CoAP-framed application protocol across that session, and
//! orchestrates over-the-air firmware updates on top of it.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  API Consumers (pub/sub bus)                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Device Sessions │ OTA Flasher │ Event Publisher          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    CoAP Message Codec                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          AES-128-CBC Streams (counter-folded IVs)               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │             Chunking Framer (u16 length prefix)                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Transport (TCP)                              │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::cast_possible_truncation)]  // Intentional wire-width narrowing
#![allow(clippy::cognitive_complexity)]      // Complex state machines
#![allow(clippy::too_many_lines)]            // Complete implementations
#![allow(clippy::future_not_send)]           // Async internals
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod keystore;
pub mod ota;
pub mod protocol;
pub mod server;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of the random nonce sent to a device at handshake start.
pub const NONCE_SIZE: usize = 40;

/// Size of the RSA-encrypted identity blob a device sends back.
pub const ID_BLOB_SIZE: usize = 256;

/// Size of the session key material (key || iv || salt).
pub const SESSION_KEY_SIZE: usize = 40;

/// Default port devices connect to.
pub const DEFAULT_PORT: u16 = 5683;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::{CipherStream, DecipherStream, ServerKey, SessionKey};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventPublisher, FilterOptions, PublishedEvent};
    pub use crate::keystore::KeyStore;
    pub use crate::ota::{Flasher, OtaConfig};
    pub use crate::protocol::{ChunkingFramer, CoapMessage, MessageName};
    pub use crate::server::{DeviceServer, DeviceSession};
    pub use crate::types::*;
}
