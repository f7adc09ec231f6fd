use std::fs;
use std::path::{Path, PathBuf};

use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::MeshError;
use crate::identity::PrivateIdentity;
use crate::transport::tunnels::TunnelStore;

/// Serialized path-table row. The interface is recorded by name; addresses
/// are ephemeral, so restored rows wait until an interface with the same
/// name registers again before they re-enter the table.
#[derive(Clone, Serialize, Deserialize)]
pub struct PersistedPathEntry {
    pub destination: ByteBuf,
    pub received_from: ByteBuf,
    pub iface_name: String,
    pub hops: u8,
    pub expires_at: u64,
    pub announce_timestamp: u64,
    pub announce_payload: ByteBuf,
    pub announce_has_ratchet: bool,
    pub mode: u8,
}

/// On-disk layout of one stack instance:
///
/// ```text
/// <root>/identities/              application identity files
/// <root>/storage/transport_identity
/// <root>/storage/path_table
/// <root>/storage/tunnels
/// <root>/storage/ratchets/        remembered remote ratchets
/// <root>/cache/                   reserved for the announce cache
/// ```
pub struct InstanceStorage {
    root: PathBuf,
}

impl InstanceStorage {
    pub fn new(root: PathBuf) -> Result<Self, MeshError> {
        let storage = Self { root };
        storage.ensure_layout()?;
        Ok(storage)
    }

    fn ensure_layout(&self) -> Result<(), MeshError> {
        for dir in [
            self.root.clone(),
            self.identities_dir(),
            self.root.join("storage"),
            self.ratchets_dir(),
            self.cache_dir(),
        ] {
            fs::create_dir_all(dir).map_err(|_| MeshError::StorageError)?;
        }
        Ok(())
    }

    pub fn identities_dir(&self) -> PathBuf {
        self.root.join("identities")
    }

    pub fn ratchets_dir(&self) -> PathBuf {
        self.root.join("storage").join("ratchets")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    fn transport_identity_path(&self) -> PathBuf {
        self.root.join("storage").join("transport_identity")
    }

    fn path_table_path(&self) -> PathBuf {
        self.root.join("storage").join("path_table")
    }

    fn tunnels_path(&self) -> PathBuf {
        self.root.join("storage").join("tunnels")
    }

    /// Loads the daemon identity or creates and persists a fresh one.
    pub fn load_or_create_identity(&self) -> Result<PrivateIdentity, MeshError> {
        let path = self.transport_identity_path();
        if path.exists() {
            return PrivateIdentity::from_file(&path);
        }
        let identity = PrivateIdentity::generate(OsRng);
        identity.to_file(&path)?;
        Ok(identity)
    }

    pub fn save_path_table(&self, entries: &[PersistedPathEntry]) -> Result<(), MeshError> {
        write_atomic(&self.path_table_path(), &rmp_serde_encode(entries)?)
    }

    pub fn load_path_table(&self) -> Result<Vec<PersistedPathEntry>, MeshError> {
        let path = self.path_table_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(path).map_err(|_| MeshError::StorageError)?;
        rmp_serde::from_slice(&data).map_err(|_| MeshError::StorageError)
    }

    pub fn save_tunnels(&self, tunnels: &TunnelStore) -> Result<(), MeshError> {
        write_atomic(&self.tunnels_path(), &rmp_serde_encode(tunnels)?)
    }

    pub fn load_tunnels(&self) -> Result<TunnelStore, MeshError> {
        let path = self.tunnels_path();
        if !path.exists() {
            return Ok(TunnelStore::new());
        }
        let data = fs::read(path).map_err(|_| MeshError::StorageError)?;
        rmp_serde::from_slice(&data).map_err(|_| MeshError::StorageError)
    }
}

fn rmp_serde_encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, MeshError> {
    rmp_serde::to_vec_named(value).map_err(|_| MeshError::StorageError)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), MeshError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).map_err(|_| MeshError::StorageError)?;
    fs::rename(&tmp, path).map_err(|_| MeshError::StorageError)
}
