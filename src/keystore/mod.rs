//! Persistent device key storage.
//!
//! Device public keys live as `<device-id>.pub.pem` files under a single
//! directory, fronted by an in-memory cache. Keys learned in-band during a
//! first-contact handshake are persisted here for future sessions.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::crypto::{DeviceKey, ServerKey};
use crate::error::{Error, Result};
use crate::types::DeviceId;

/// File-backed store of per-device public keys.
pub struct KeyStore {
    dir: PathBuf,
    cache: DashMap<DeviceId, DeviceKey>,
}

impl KeyStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Config(format!("create key dir {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            cache: DashMap::new(),
        })
    }

    fn key_path(&self, id: &DeviceId) -> PathBuf {
        self.dir.join(format!("{id}.pub.pem"))
    }

    /// Look up a device's public key.
    pub fn device_key(&self, id: &DeviceId) -> Result<Option<DeviceKey>> {
        if let Some(key) = self.cache.get(id) {
            return Ok(Some(key.clone()));
        }

        let path = self.key_path(id);
        if !path.exists() {
            return Ok(None);
        }

        let pem = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let key = DeviceKey::from_pem(&pem)?;
        self.cache.insert(*id, key.clone());
        debug!(device_id = %id, "loaded device key from disk");
        Ok(Some(key))
    }

    /// Persist a key a device provided during handshake.
    ///
    /// First write wins; an existing key on disk is never overwritten by
    /// an in-band one.
    pub fn save_handshake_key(&self, id: &DeviceId, key: &DeviceKey) -> Result<()> {
        let path = self.key_path(id);
        if path.exists() {
            debug!(device_id = %id, "key already on file, ignoring handshake copy");
            return Ok(());
        }

        let pem = key.to_pem()?;
        std::fs::write(&path, pem)
            .map_err(|e| Error::Config(format!("write {}: {e}", path.display())))?;
        self.cache.insert(*id, key.clone());
        info!(device_id = %id, "saved first-contact device key");
        Ok(())
    }

    /// Number of cached keys.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// Load the server keypair from `path`, generating and persisting one if
/// the file does not exist yet.
pub fn load_or_create_server_key(path: &Path) -> Result<ServerKey> {
    if path.exists() {
        return Ok(ServerKey::load(path)?);
    }

    info!(path = %path.display(), "no server key on disk, generating");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("create {}: {e}", parent.display())))?;
    }
    let key = ServerKey::generate()?;
    key.save(path)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use tempfile::tempdir;

    fn test_key() -> DeviceKey {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        DeviceKey::new(RsaPublicKey::from(&private))
    }

    fn test_id(b: u8) -> DeviceId {
        DeviceId::from_bytes([b; 12])
    }

    #[test]
    fn test_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        assert!(store.device_key(&test_id(1)).unwrap().is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let id = test_id(2);
        let key = test_key();

        {
            let store = KeyStore::open(dir.path()).unwrap();
            store.save_handshake_key(&id, &key).unwrap();
            assert!(store.device_key(&id).unwrap().is_some());
        }

        // Fresh store must read it back from disk.
        let store = KeyStore::open(dir.path()).unwrap();
        let loaded = store.device_key(&id).unwrap().unwrap();
        assert_eq!(loaded, key);
    }

    #[test]
    fn test_first_write_wins() {
        let dir = tempdir().unwrap();
        let id = test_id(3);
        let first = test_key();
        let second = test_key();

        let store = KeyStore::open(dir.path()).unwrap();
        store.save_handshake_key(&id, &first).unwrap();
        store.save_handshake_key(&id, &second).unwrap();

        let fresh = KeyStore::open(dir.path()).unwrap();
        assert_eq!(fresh.device_key(&id).unwrap().unwrap(), first);
    }

    #[test]
    fn test_load_or_create_server_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.pem");

        let created = load_or_create_server_key(&path).unwrap();
        assert!(path.exists());

        let reloaded = load_or_create_server_key(&path).unwrap();
        assert_eq!(created.public(), reloaded.public());
    }
}
