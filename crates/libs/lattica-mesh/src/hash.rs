use core::fmt;

use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};

use crate::error::MeshError;

pub const HASH_SIZE: usize = 32;
pub const ADDRESS_HASH_SIZE: usize = 16;
pub const NAME_HASH_SIZE: usize = 10;

/// Full SHA-256 digest.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash([u8; HASH_SIZE]);

/// 16-byte truncated SHA-256, the addressing unit of the whole stack:
/// identity hashes, destination hashes, link ids, packet hashes and
/// interface addresses all share this shape.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct AddressHash([u8; ADDRESS_HASH_SIZE]);

impl Hash {
    pub fn hasher() -> Sha256 {
        Sha256::new()
    }

    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }
}

impl From<Sha256> for Hash {
    fn from(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }
}

impl AddressHash {
    pub const fn new(bytes: [u8; ADDRESS_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; ADDRESS_HASH_SIZE])
    }

    /// Hashes `data` and keeps the leading 16 bytes.
    pub fn of(data: &[u8]) -> Self {
        Self::truncating(&Hash::of(data))
    }

    pub fn truncating(hash: &Hash) -> Self {
        let mut bytes = [0u8; ADDRESS_HASH_SIZE];
        bytes.copy_from_slice(&hash.0[..ADDRESS_HASH_SIZE]);
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, MeshError> {
        if slice.len() != ADDRESS_HASH_SIZE {
            return Err(MeshError::MalformedPacket);
        }
        let mut bytes = [0u8; ADDRESS_HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn random<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut bytes = [0u8; ADDRESS_HASH_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_hex(text: &str) -> Result<Self, MeshError> {
        let decoded = hex::decode(text).map_err(|_| MeshError::InvalidKey)?;
        Self::from_slice(&decoded).map_err(|_| MeshError::InvalidKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; ADDRESS_HASH_SIZE] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}

impl From<Hash> for AddressHash {
    fn from(hash: Hash) -> Self {
        Self::truncating(&hash)
    }
}

impl Default for AddressHash {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_keeps_leading_bytes() {
        let hash = Hash::of(b"lattica");
        let address = AddressHash::truncating(&hash);
        assert_eq!(address.as_slice(), &hash.as_slice()[..ADDRESS_HASH_SIZE]);
    }

    #[test]
    fn hex_round_trip() {
        let address = AddressHash::of(b"hex round trip");
        let parsed = AddressHash::from_hex(&address.to_hex()).expect("valid hex");
        assert_eq!(parsed, address);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(AddressHash::from_hex("abcd").is_err());
    }
}
