use std::time::{SystemTime, UNIX_EPOCH};

pub fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Big-endian five-byte encoding used in announce random blobs. Wraps in the
/// year 36812; the truncation is part of the wire format.
pub fn epoch_secs_be5(secs: u64) -> [u8; 5] {
    let be = secs.to_be_bytes();
    [be[3], be[4], be[5], be[6], be[7]]
}

pub fn epoch_secs_from_be5(bytes: &[u8]) -> u64 {
    let mut be = [0u8; 8];
    be[3..8].copy_from_slice(&bytes[..5]);
    u64::from_be_bytes(be)
}
