use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::destination::RATCHET_LENGTH;
use crate::error::MeshError;
use crate::hash::AddressHash;
use crate::time::epoch_secs;

/// Remote ratchets older than this are never used for outbound encryption;
/// the destination has long since announced fresher ones.
pub const RATCHET_EXPIRY_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RatchetRecord {
    ratchet: ByteBuf,
    received: u64,
}

/// Encrypt-side cache of the newest ratchet public announced by each remote
/// destination, persisted one file per destination so a restart keeps
/// forward secrecy without waiting for fresh announces.
pub struct RatchetStore {
    dir: PathBuf,
    cache: HashMap<AddressHash, RatchetRecord>,
}

impl RatchetStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, cache: HashMap::new() }
    }

    pub fn remember(
        &mut self,
        destination: &AddressHash,
        ratchet: [u8; RATCHET_LENGTH],
    ) -> Result<(), MeshError> {
        if let Some(existing) = self.cache.get(destination) {
            if existing.ratchet.as_ref() == ratchet.as_slice() {
                return Ok(());
            }
        }

        let record =
            RatchetRecord { ratchet: ByteBuf::from(ratchet.to_vec()), received: epoch_secs() };
        self.persist(destination, &record)?;
        self.cache.insert(*destination, record);
        Ok(())
    }

    pub fn get(&mut self, destination: &AddressHash) -> Option<[u8; RATCHET_LENGTH]> {
        let now = epoch_secs();

        if let Some(record) = self.cache.get(destination) {
            if now <= record.received + RATCHET_EXPIRY_SECS {
                return record.ratchet.as_ref().try_into().ok();
            }
            self.cache.remove(destination);
            self.remove(destination);
            return None;
        }

        let record = self.load(destination)?;
        if now > record.received + RATCHET_EXPIRY_SECS {
            self.remove(destination);
            return None;
        }
        let ratchet = record.ratchet.as_ref().try_into().ok();
        self.cache.insert(*destination, record);
        ratchet
    }

    pub fn clean_expired(&mut self) {
        let now = epoch_secs();
        self.cache.retain(|_, record| now <= record.received + RATCHET_EXPIRY_SECS);

        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let stale = fs::read(&path)
                .ok()
                .and_then(|data| rmp_serde::from_slice::<RatchetRecord>(&data).ok())
                .map(|record| now > record.received + RATCHET_EXPIRY_SECS)
                .unwrap_or(true);
            if stale {
                let _ = fs::remove_file(path);
            }
        }
    }

    fn persist(&self, destination: &AddressHash, record: &RatchetRecord) -> Result<(), MeshError> {
        fs::create_dir_all(&self.dir).map_err(|_| MeshError::StorageError)?;
        let encoded = rmp_serde::to_vec_named(record).map_err(|_| MeshError::StorageError)?;
        let path = self.path_for(destination);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, encoded).map_err(|_| MeshError::StorageError)?;
        fs::rename(&tmp, &path).map_err(|_| MeshError::StorageError)
    }

    fn load(&self, destination: &AddressHash) -> Option<RatchetRecord> {
        let data = fs::read(self.path_for(destination)).ok()?;
        rmp_serde::from_slice(&data).ok()
    }

    fn remove(&self, destination: &AddressHash) {
        let _ = fs::remove_file(self.path_for(destination));
    }

    fn path_for(&self, destination: &AddressHash) -> PathBuf {
        self.dir.join(destination.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut store = RatchetStore::new(dir.path().to_path_buf());
        let destination = AddressHash::of(b"remote");
        let ratchet = [9u8; RATCHET_LENGTH];

        store.remember(&destination, ratchet).expect("remember");
        assert_eq!(store.get(&destination), Some(ratchet));

        // A second store over the same directory sees the persisted record.
        let mut reopened = RatchetStore::new(dir.path().to_path_buf());
        assert_eq!(reopened.get(&destination), Some(ratchet));
    }

    #[test]
    fn expired_record_is_dropped_on_get() {
        let dir = tempfile::tempdir().expect("temp dir");
        let destination = AddressHash::of(b"stale");

        let record = RatchetRecord { ratchet: ByteBuf::from(vec![1u8; RATCHET_LENGTH]), received: 0 };
        let encoded = rmp_serde::to_vec_named(&record).expect("encode");
        fs::write(dir.path().join(destination.to_hex()), encoded).expect("write");

        let mut store = RatchetStore::new(dir.path().to_path_buf());
        assert_eq!(store.get(&destination), None);
        assert!(!dir.path().join(destination.to_hex()).exists());
    }

    #[test]
    fn record_encodes_ratchet_as_binary() {
        let record = RatchetRecord { ratchet: ByteBuf::from(vec![2u8; RATCHET_LENGTH]), received: 7 };
        let encoded = rmp_serde::to_vec_named(&record).expect("encode");
        let value = rmpv::decode::read_value(&mut std::io::Cursor::new(encoded)).expect("decode");
        let map = value.as_map().expect("map");
        let binary = map.iter().any(|(key, val)| {
            key.as_str() == Some("ratchet") && matches!(val, rmpv::Value::Binary(_))
        });
        assert!(binary, "ratchet should be msgpack binary");
    }
}
