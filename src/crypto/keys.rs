//! RSA key handling for the handshake.
//!
//! The server holds a long-lived RSA-2048 keypair; each device holds an
//! RSA-1024 keypair whose public half the server keeps on file. Devices
//! encrypt their identity blob to the server key; the server encrypts the
//! session key to the device key and signs its HMAC. All padding is
//! PKCS#1 v1.5 for wire compatibility with deployed firmware.

use std::fmt;
use std::path::Path;

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};

use crate::error::CryptoError;

/// Server keypair bit size. Yields 256-byte ciphertexts and signatures.
pub const SERVER_KEY_BITS: usize = 2048;

/// Device key bit size in deployed firmware. Yields 128-byte ciphertexts.
pub const DEVICE_KEY_BITS: usize = 1024;

/// The server's long-lived RSA keypair.
pub struct ServerKey {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl ServerKey {
    /// Generate a fresh keypair. Slow; intended for the keygen CLI path.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, SERVER_KEY_BITS)
            .map_err(|e| CryptoError::InvalidKey(format!("keygen failed: {e}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Load from a PKCS#8 PEM file.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| CryptoError::InvalidKey(format!("read {}: {e}", path.display())))?;
        Self::from_pem(&pem)
    }

    /// Parse from PKCS#8 PEM text.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid private key PEM: {e}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Serialize the private half as PKCS#8 PEM.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map(|z| z.to_string())
            .map_err(|e| CryptoError::InvalidKey(format!("PEM encode failed: {e}")))
    }

    /// Write the private half as PKCS#8 PEM.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let pem = self.to_pem()?;
        std::fs::write(path, pem)
            .map_err(|e| CryptoError::InvalidKey(format!("write {}: {e}", path.display())))
    }

    /// Ciphertext/signature width in bytes.
    pub fn size(&self) -> usize {
        SERVER_KEY_BITS / 8
    }

    /// Decrypt a blob a device encrypted to our public key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Sign a raw digest with PKCS#1 v1.5, no digest-info prefix.
    ///
    /// Matches the firmware's expectation of a bare private-key operation
    /// over the 20-byte HMAC.
    pub fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .sign(Pkcs1v15Sign::new_unprefixed(), digest)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }
}

impl fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerKey([REDACTED], {SERVER_KEY_BITS} bits)")
    }
}

/// A device's RSA public key.
#[derive(Clone, PartialEq)]
pub struct DeviceKey {
    public: RsaPublicKey,
}

impl DeviceKey {
    pub fn new(public: RsaPublicKey) -> Self {
        Self { public }
    }

    /// Parse a DER blob as delivered in-band during handshake.
    ///
    /// Firmware ships either a SubjectPublicKeyInfo or a bare PKCS#1
    /// structure depending on vintage; accept both.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        if let Ok(key) = RsaPublicKey::from_public_key_der(der) {
            return Ok(Self { public: key });
        }
        RsaPublicKey::from_pkcs1_der(der)
            .map(|public| Self { public })
            .map_err(|e| CryptoError::InvalidKey(format!("invalid device key DER: {e}")))
    }

    /// Parse from SubjectPublicKeyInfo PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        RsaPublicKey::from_public_key_pem(pem)
            .map(|public| Self { public })
            .map_err(|e| CryptoError::InvalidKey(format!("invalid device key PEM: {e}")))
    }

    /// Serialize as SubjectPublicKeyInfo PEM.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(format!("PEM encode failed: {e}")))
    }

    /// Ciphertext width in bytes (128 for deployed 1024-bit keys).
    pub fn size(&self) -> usize {
        use rsa::traits::PublicKeyParts;
        self.public.size()
    }

    /// Encrypt the session key to this device.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut rng = rand::rngs::OsRng;
        self.public
            .encrypt(&mut rng, Pkcs1v15Encrypt, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Verify a raw-digest signature made by [`ServerKey::sign`].
    pub fn verify_server(
        server: &RsaPublicKey,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        server
            .verify(Pkcs1v15Sign::new_unprefixed(), digest, signature)
            .map_err(|_| CryptoError::DecryptionFailed("signature verification failed".into()))
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceKey({} bytes)", self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;

    fn device_keypair() -> (RsaPrivateKey, DeviceKey) {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, DEVICE_KEY_BITS).unwrap();
        let public = DeviceKey::new(RsaPublicKey::from(&private));
        (private, public)
    }

    #[test]
    fn test_server_roundtrip() {
        let server = ServerKey::generate().unwrap();
        let pem = server.to_pem().unwrap();
        let reloaded = ServerKey::from_pem(&pem).unwrap();
        assert_eq!(server.public(), reloaded.public());
    }

    #[test]
    fn test_device_encrypt_sizes() {
        let (_, device) = device_keypair();
        assert_eq!(device.size(), 128);

        let ct = device.encrypt(&[0u8; 40]).unwrap();
        assert_eq!(ct.len(), 128);
    }

    #[test]
    fn test_sign_verify() {
        let server = ServerKey::generate().unwrap();
        let digest = crate::crypto::hmac_sha1(b"key", b"data");

        let sig = server.sign(&digest).unwrap();
        assert_eq!(sig.len(), server.public().size());

        DeviceKey::verify_server(server.public(), &digest, &sig).unwrap();
        assert!(DeviceKey::verify_server(server.public(), &[0u8; 20], &sig).is_err());
    }

    #[test]
    fn test_device_key_pem_roundtrip() {
        let (_, device) = device_keypair();
        let pem = device.to_pem().unwrap();
        let reloaded = DeviceKey::from_pem(&pem).unwrap();
        assert_eq!(device, reloaded);
    }
}
