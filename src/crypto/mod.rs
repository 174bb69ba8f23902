//! Cryptographic primitives for Corelink.
//!
//! This module provides:
//! - RSA keypair handling for handshake authentication (PKCS#1 v1.5)
//! - AES-128-CBC cipher/decipher streams with counter-folded IVs
//! - HMAC-SHA1 for session-key attestation
//! - CSPRNG helpers

mod keys;
mod streams;

pub use keys::{DeviceKey, ServerKey};
pub use streams::{CipherStream, DecipherStream, SessionKey};

use hmac::{Hmac, Mac};
use sha1::Sha1;

/// HMAC-SHA1 output size.
pub const HMAC_SIZE: usize = 20;

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// HMAC-SHA1 of `data` keyed by `key`.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; HMAC_SIZE] {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison of byte slices.
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq::constant_time_eq(a, b)
}
