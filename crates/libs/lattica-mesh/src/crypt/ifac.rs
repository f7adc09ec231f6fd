use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::crypt::ct_eq;
use crate::error::MeshError;

pub const IFAC_KEY_LENGTH: usize = 64;
pub const IFAC_MAX_TAG: usize = 16;

/// Fixed salt for interface authentication key derivation. Shared by every
/// implementation of the protocol; changing it partitions the network.
pub const IFAC_SALT: [u8; 32] = [
    0xad, 0xf5, 0x4d, 0x88, 0x2c, 0x9a, 0x9b, 0x80, 0x77, 0x1e, 0xb4, 0x99, 0x5d, 0x70, 0x2d,
    0x4a, 0x3e, 0x73, 0x33, 0x91, 0xb2, 0xa0, 0xf5, 0x3f, 0x41, 0x6d, 0x9f, 0x90, 0x7e, 0x55,
    0xcf, 0xf8,
];

/// Derives the per-interface authentication key:
/// `HKDF(len=64, ikm=SHA-256(netname ‖ netkey?), salt=IFAC_SALT)`.
pub fn derive_ifac_key(netname: &str, netkey: Option<&str>) -> [u8; IFAC_KEY_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(netname.as_bytes());
    if let Some(netkey) = netkey {
        hasher.update(netkey.as_bytes());
    }
    let ikm: [u8; 32] = hasher.finalize().into();

    let mut key = [0u8; IFAC_KEY_LENGTH];
    // Expand cannot fail for a 64-byte output with SHA-256.
    let _ = Hkdf::<Sha256>::new(Some(&IFAC_SALT), &ikm).expand(&[], &mut key);
    key
}

/// Computes the truncated tag for `bytes` (the packet without its tag
/// field). The tag is the trailing `size` bytes of the full HMAC.
pub fn ifac_tag(key: &[u8; IFAC_KEY_LENGTH], bytes: &[u8], size: usize) -> Result<Vec<u8>, MeshError> {
    if size == 0 || size > IFAC_MAX_TAG {
        return Err(MeshError::ConfigurationError);
    }
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| MeshError::InvalidKey)?;
    mac.update(bytes);
    let full = mac.finalize().into_bytes();
    Ok(full[full.len() - size..].to_vec())
}

pub fn verify_ifac_tag(key: &[u8; IFAC_KEY_LENGTH], bytes: &[u8], tag: &[u8]) -> bool {
    match ifac_tag(key, bytes, tag.len()) {
        Ok(expected) => ct_eq(&expected, tag),
        Err(_) => false,
    }
}
