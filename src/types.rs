//! Core types used throughout Corelink.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, SessionError};

/// Length of a device identifier in bytes.
pub const DEVICE_ID_LEN: usize = 12;

/// Unique identifier a device presents during handshake.
///
/// Canonical form is lowercase hex of the 12 raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    pub fn from_bytes(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice, failing on wrong length.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != DEVICE_ID_LEN {
            return Err(SessionError::MalformedMessage(format!(
                "device id must be {DEVICE_ID_LEN} bytes, got {}",
                bytes.len()
            ))
            .into());
        }
        let mut arr = [0u8; DEVICE_ID_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }

    /// Canonical lowercase-hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.to_hex())
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.to_ascii_lowercase())
            .map_err(|e| Error::Internal(format!("invalid device id hex: {e}")))?;
        Self::try_from_slice(&bytes)
    }
}

impl Serialize for DeviceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Unique identifier for one accepted connection.
///
/// Distinct from [`DeviceId`]: a device that reconnects gets a fresh
/// connection key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey(pub Uuid);

impl ConnectionKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Per-direction CoAP message counter, folded into the AES IV.
///
/// Advances by exactly one per message and wraps at `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageCounter(pub u32);

impl MessageCounter {
    pub const ZERO: Self = Self(0);

    pub fn new(n: u32) -> Self {
        Self(n)
    }

    /// Seed from the top four IV bytes, big-endian.
    pub fn from_iv(iv: &[u8; 16]) -> Self {
        Self(u32::from_be_bytes([iv[0], iv[1], iv[2], iv[3]]))
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for MessageCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session traffic statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_hex_roundtrip() {
        let id = DeviceId::from_bytes([0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(id.to_hex(), "deadbeef0001020304050607");

        let parsed: DeviceId = "DEADBEEF0001020304050607".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_device_id_wrong_length() {
        assert!(DeviceId::try_from_slice(&[0u8; 11]).is_err());
        assert!(DeviceId::try_from_slice(&[0u8; 13]).is_err());
    }

    #[test]
    fn test_counter_wraps() {
        let c = MessageCounter::new(u32::MAX);
        assert_eq!(c.next(), MessageCounter::ZERO);
    }

    #[test]
    fn test_counter_from_iv() {
        let mut iv = [0u8; 16];
        iv[..4].copy_from_slice(&[0x00, 0x00, 0x01, 0x02]);
        assert_eq!(MessageCounter::from_iv(&iv).0, 0x0102);
    }
}
