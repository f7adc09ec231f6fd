pub mod link;

use core::fmt;
use core::marker::PhantomData;
use std::fs;
use std::path::{Path, PathBuf};

use rand_core::{CryptoRngCore, OsRng};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::Digest;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypt::token::TokenKey;
use crate::error::MeshError;
use crate::hash::{AddressHash, Hash, NAME_HASH_SIZE};
use crate::identity::{Identity, PrivateIdentity, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use crate::packet::{
    ContextFlag, DestinationType, Header, Packet, PacketContext, PacketType, PayloadBuffer,
    TransportType,
};
use crate::time::{epoch_secs, epoch_secs_be5, epoch_secs_from_be5};

pub const RANDOM_HASH_LENGTH: usize = 10;
pub const RATCHET_LENGTH: usize = PUBLIC_KEY_LENGTH;
pub const MIN_ANNOUNCE_LENGTH: usize =
    2 * PUBLIC_KEY_LENGTH + NAME_HASH_SIZE + RANDOM_HASH_LENGTH + SIGNATURE_LENGTH;

const RATCHET_ROTATION_INTERVAL_SECS: u64 = 30 * 60;
const MAX_RETAINED_RATCHETS: usize = 512;

//***************************************************************************//

pub trait Direction {}

pub struct Input;
pub struct Output;

impl Direction for Input {}
impl Direction for Output {}

pub trait Kind {
    fn destination_type() -> DestinationType;
}

pub struct Single;
pub struct Group;
pub struct Plain;

impl Kind for Single {
    fn destination_type() -> DestinationType {
        DestinationType::Single
    }
}

impl Kind for Group {
    fn destination_type() -> DestinationType {
        DestinationType::Group
    }
}

impl Kind for Plain {
    fn destination_type() -> DestinationType {
        DestinationType::Plain
    }
}

/// The bytes an endpoint's keys contribute to its destination hash. Single
/// destinations contribute their identity hash; plain and group
/// destinations contribute nothing and are named by their name hash alone.
pub trait AddressableKeys {
    fn address_material(&self) -> &[u8];
}

impl AddressableKeys for Identity {
    fn address_material(&self) -> &[u8] {
        self.address_hash().as_slice()
    }
}

impl AddressableKeys for PrivateIdentity {
    fn address_material(&self) -> &[u8] {
        self.address_hash().as_slice()
    }
}

/// Keyless endpoint for plain destinations.
pub struct NoIdentity;

impl AddressableKeys for NoIdentity {
    fn address_material(&self) -> &[u8] {
        &[]
    }
}

/// Pre-shared symmetric key for group destinations; 32- or 64-byte input.
pub struct GroupKey {
    key: [u8; 64],
}

impl GroupKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        let mut key = [0u8; 64];
        match bytes.len() {
            64 => key.copy_from_slice(bytes),
            32 => key = expand_group_seed(bytes)?,
            _ => return Err(MeshError::InvalidKey),
        }
        Ok(Self { key })
    }

    fn token_key(&self) -> TokenKey {
        TokenKey::from_derived(&self.key)
    }
}

fn expand_group_seed(seed: &[u8]) -> Result<[u8; 64], MeshError> {
    use hkdf::Hkdf;
    use sha2::Sha256;
    let mut full = [0u8; 64];
    Hkdf::<Sha256>::new(None, seed).expand(&[], &mut full).map_err(|_| MeshError::InvalidKey)?;
    Ok(full)
}

impl AddressableKeys for GroupKey {
    fn address_material(&self) -> &[u8] {
        &[]
    }
}

//***************************************************************************//

/// Dotted endpoint name, `app_name.aspect1.aspect2…`, hashed to ten bytes.
/// Neither the app name nor any aspect may contain a dot.
#[derive(Clone)]
pub struct DestinationName {
    hash: Hash,
    full_name: String,
}

impl DestinationName {
    pub fn new(app_name: &str, aspects: &[&str]) -> Result<Self, MeshError> {
        if app_name.is_empty() || app_name.contains('.') {
            return Err(MeshError::ConfigurationError);
        }
        let mut full_name = String::from(app_name);
        for aspect in aspects {
            if aspect.is_empty() || aspect.contains('.') {
                return Err(MeshError::ConfigurationError);
            }
            full_name.push('.');
            full_name.push_str(aspect);
        }

        Ok(Self { hash: Hash::of(full_name.as_bytes()), full_name })
    }

    /// Reconstructs a name from the ten hash bytes carried in an announce.
    /// The textual name is unknown at that point.
    pub fn from_name_hash_slice(slice: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        let take = slice.len().min(NAME_HASH_SIZE);
        bytes[..take].copy_from_slice(&slice[..take]);
        Self { hash: Hash::new(bytes), full_name: String::new() }
    }

    pub fn name_hash(&self) -> &[u8] {
        &self.hash.as_slice()[..NAME_HASH_SIZE]
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }
}

pub fn destination_hash<K: AddressableKeys>(keys: &K, name: &DestinationName) -> AddressHash {
    let hash: Hash = Hash::hasher()
        .chain_update(name.name_hash())
        .chain_update(keys.address_material())
        .into();
    AddressHash::truncating(&hash)
}

/// Ten-byte identifier of a ratchet public key, used for logging and
/// correlation without revealing the key ordering.
pub fn ratchet_id(ratchet_public: &[u8; RATCHET_LENGTH]) -> [u8; NAME_HASH_SIZE] {
    let hash = Hash::of(ratchet_public);
    let mut id = [0u8; NAME_HASH_SIZE];
    id.copy_from_slice(&hash.as_slice()[..NAME_HASH_SIZE]);
    id
}

/// Public face of a single destination: enough to address, verify and
/// encrypt toward it.
#[derive(Copy, Clone)]
pub struct DestinationDesc {
    pub identity: Identity,
    pub name_hash: [u8; NAME_HASH_SIZE],
    pub address_hash: AddressHash,
}

impl fmt::Display for DestinationDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_hash)
    }
}

//***************************************************************************//

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRatchets {
    signature: ByteBuf,
    ratchets: Vec<ByteBuf>,
}

/// Decrypt-side ratchet secrets for an input destination. The newest secret
/// is announced; older ones are retained to decrypt in-flight traffic.
struct RatchetState {
    enabled: bool,
    enforced: bool,
    secrets: Vec<[u8; RATCHET_LENGTH]>,
    path: Option<PathBuf>,
    rotation_interval_secs: u64,
    retained: usize,
    rotated_at: u64,
}

impl Default for RatchetState {
    fn default() -> Self {
        Self {
            enabled: false,
            enforced: false,
            secrets: Vec::new(),
            path: None,
            rotation_interval_secs: RATCHET_ROTATION_INTERVAL_SECS,
            retained: MAX_RETAINED_RATCHETS,
            rotated_at: 0,
        }
    }
}

impl RatchetState {
    fn enable(&mut self, identity: &PrivateIdentity, path: PathBuf) -> Result<(), MeshError> {
        if path.exists() {
            self.load(identity, &path)?;
        }
        self.enabled = true;
        self.path = Some(path);
        Ok(())
    }

    fn load(&mut self, identity: &PrivateIdentity, path: &Path) -> Result<(), MeshError> {
        let data = fs::read(path).map_err(|_| MeshError::StorageError)?;
        let persisted: PersistedRatchets =
            rmp_serde::from_slice(&data).map_err(|_| MeshError::StorageError)?;

        let packed =
            rmp_serde::to_vec(&persisted.ratchets).map_err(|_| MeshError::StorageError)?;
        identity.verify(&packed, persisted.signature.as_ref())?;

        self.secrets = persisted
            .ratchets
            .iter()
            .filter(|bytes| bytes.len() == RATCHET_LENGTH)
            .map(|bytes| {
                let mut secret = [0u8; RATCHET_LENGTH];
                secret.copy_from_slice(bytes);
                secret
            })
            .collect();
        Ok(())
    }

    fn persist(&self, identity: &PrivateIdentity, path: &Path) -> Result<(), MeshError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| MeshError::StorageError)?;
        }
        let ratchets: Vec<ByteBuf> =
            self.secrets.iter().map(|secret| ByteBuf::from(secret.to_vec())).collect();
        let packed = rmp_serde::to_vec(&ratchets).map_err(|_| MeshError::StorageError)?;
        let persisted = PersistedRatchets {
            signature: ByteBuf::from(identity.sign(&packed).to_vec()),
            ratchets,
        };
        let encoded = rmp_serde::to_vec(&persisted).map_err(|_| MeshError::StorageError)?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, encoded).map_err(|_| MeshError::StorageError)?;
        fs::rename(&tmp, path).map_err(|_| MeshError::StorageError)
    }

    fn rotate_if_due(&mut self, identity: &PrivateIdentity, now: u64) -> Result<(), MeshError> {
        if !self.enabled {
            return Ok(());
        }
        if self.secrets.is_empty() || now >= self.rotated_at + self.rotation_interval_secs {
            let secret = StaticSecret::random_from_rng(OsRng);
            self.secrets.insert(0, secret.to_bytes());
            self.secrets.truncate(self.retained);
            self.rotated_at = now;
            if let Some(path) = self.path.clone() {
                self.persist(identity, &path)?;
            }
        }
        Ok(())
    }

    fn current_public(&self) -> Option<[u8; RATCHET_LENGTH]> {
        let secret = StaticSecret::from(*self.secrets.first()?);
        Some(*PublicKey::from(&secret).as_bytes())
    }

    fn secrets(&self) -> Vec<StaticSecret> {
        self.secrets.iter().map(|bytes| StaticSecret::from(*bytes)).collect()
    }
}

//***************************************************************************//

pub struct Destination<K: AddressableKeys, D: Direction, T: Kind> {
    direction: PhantomData<D>,
    kind: PhantomData<T>,
    pub identity: K,
    pub name: DestinationName,
    pub address_hash: AddressHash,
    ratchets: RatchetState,
    accept_link_requests: bool,
}

impl<K: AddressableKeys, D: Direction, T: Kind> Destination<K, D, T> {
    pub fn destination_type(&self) -> DestinationType {
        T::destination_type()
    }

    fn assemble(identity: K, name: DestinationName) -> Self {
        let address_hash = destination_hash(&identity, &name);
        Self {
            direction: PhantomData,
            kind: PhantomData,
            identity,
            name,
            address_hash,
            ratchets: RatchetState::default(),
            accept_link_requests: true,
        }
    }
}

pub type SingleInputDestination = Destination<PrivateIdentity, Input, Single>;
pub type SingleOutputDestination = Destination<Identity, Output, Single>;
pub type GroupInputDestination = Destination<GroupKey, Input, Group>;
pub type GroupOutputDestination = Destination<GroupKey, Output, Group>;
pub type PlainInputDestination = Destination<NoIdentity, Input, Plain>;
pub type PlainOutputDestination = Destination<NoIdentity, Output, Plain>;

impl SingleInputDestination {
    pub fn new(identity: PrivateIdentity, name: DestinationName) -> Self {
        Self::assemble(identity, name)
    }

    pub fn desc(&self) -> DestinationDesc {
        let mut name_hash = [0u8; NAME_HASH_SIZE];
        name_hash.copy_from_slice(self.name.name_hash());
        DestinationDesc {
            identity: *self.identity.as_identity(),
            name_hash,
            address_hash: self.address_hash,
        }
    }

    pub fn set_accept_link_requests(&mut self, accept: bool) {
        self.accept_link_requests = accept;
    }

    pub fn accepts_link_requests(&self) -> bool {
        self.accept_link_requests
    }

    pub fn enable_ratchets<P: AsRef<Path>>(&mut self, path: P) -> Result<(), MeshError> {
        self.ratchets.enable(&self.identity, path.as_ref().to_path_buf())
    }

    pub fn enforce_ratchets(&mut self, enforce: bool) {
        self.ratchets.enforced = enforce;
    }

    pub fn set_ratchet_interval_secs(&mut self, secs: u64) -> Result<(), MeshError> {
        if secs == 0 {
            return Err(MeshError::ConfigurationError);
        }
        self.ratchets.rotation_interval_secs = secs;
        Ok(())
    }

    pub fn set_retained_ratchets(&mut self, retained: usize) -> Result<(), MeshError> {
        if retained == 0 {
            return Err(MeshError::ConfigurationError);
        }
        self.ratchets.retained = retained;
        self.ratchets.secrets.truncate(retained);
        Ok(())
    }

    /// Decrypts inbound payload, trying ratchet secrets newest-first before
    /// the identity key. Returns the plaintext and whether a ratchet was
    /// used.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<(Vec<u8>, bool), MeshError> {
        self.identity.decrypt_with_ratchets(
            ciphertext,
            &self.ratchets.secrets(),
            self.ratchets.enforced,
        )
    }

    /// Builds a signed announce. Rotates the ratchet first when one is due
    /// so the freshest public always ships.
    pub fn announce<R: CryptoRngCore>(
        &mut self,
        mut rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, MeshError> {
        // Announce randomness: five random bytes followed by a five-byte
        // big-endian unix timestamp. Freshness checks and equal-hop path
        // ordering read the timestamp half.
        let mut random_hash = [0u8; RANDOM_HASH_LENGTH];
        rng.fill_bytes(&mut random_hash[..RANDOM_HASH_LENGTH / 2]);
        random_hash[RANDOM_HASH_LENGTH / 2..].copy_from_slice(&epoch_secs_be5(epoch_secs()));

        let ratchet = if self.ratchets.enabled {
            self.ratchets.rotate_if_due(&self.identity, epoch_secs())?;
            self.ratchets.current_public()
        } else {
            None
        };

        let identity = self.identity.as_identity();

        let mut signed = PayloadBuffer::new();
        signed
            .append(self.address_hash.as_slice())?
            .append(identity.public_key_bytes())?
            .append(identity.verifying_key_bytes())?
            .append(self.name.name_hash())?
            .append(&random_hash)?;
        if let Some(ratchet) = &ratchet {
            signed.append(ratchet)?;
        }
        if let Some(app_data) = app_data {
            signed.append(app_data)?;
        }

        let signature = self.identity.sign(signed.as_slice());

        let mut payload = PayloadBuffer::new();
        payload
            .append(identity.public_key_bytes())?
            .append(identity.verifying_key_bytes())?
            .append(self.name.name_hash())?
            .append(&random_hash)?;
        if let Some(ratchet) = &ratchet {
            payload.append(ratchet)?;
        }
        payload.append(&signature)?;
        if let Some(app_data) = app_data {
            payload.append(app_data)?;
        }

        Ok(Packet {
            header: Header {
                context_flag: if ratchet.is_some() { ContextFlag::Set } else { ContextFlag::Unset },
                transport_type: TransportType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                ..Default::default()
            },
            ifac: None,
            destination: self.address_hash,
            transport_id: None,
            context: PacketContext::None,
            data: payload,
        })
    }

    /// An announce emitted in reply to a path request.
    pub fn path_response<R: CryptoRngCore>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, MeshError> {
        let mut announce = self.announce(rng, app_data)?;
        announce.context = PacketContext::PathResponse;
        Ok(announce)
    }
}

impl SingleOutputDestination {
    pub fn new(identity: Identity, name: DestinationName) -> Self {
        Self::assemble(identity, name)
    }

    /// Encrypts toward the remote endpoint, preferring a known ratchet.
    pub fn encrypt<R: CryptoRngCore>(
        &self,
        rng: R,
        plaintext: &[u8],
        ratchet: Option<&[u8; RATCHET_LENGTH]>,
    ) -> Result<Vec<u8>, MeshError> {
        self.identity.encrypt(rng, plaintext, ratchet)
    }
}

impl GroupInputDestination {
    pub fn new(key: GroupKey, name: DestinationName) -> Self {
        Self::assemble(key, name)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, MeshError> {
        let mut out = vec![0u8; ciphertext.len()];
        let len = self.identity.token_key().decrypt(ciphertext, &mut out)?.len();
        out.truncate(len);
        Ok(out)
    }
}

impl GroupOutputDestination {
    pub fn new(key: GroupKey, name: DestinationName) -> Self {
        Self::assemble(key, name)
    }

    pub fn encrypt<R: CryptoRngCore>(
        &self,
        rng: R,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, MeshError> {
        let mut out = vec![0u8; TokenKey::token_length(plaintext.len())];
        let len = self.identity.token_key().encrypt(rng, plaintext, &mut out)?.len();
        out.truncate(len);
        Ok(out)
    }
}

impl<D: Direction> Destination<NoIdentity, D, Plain> {
    pub fn new(name: DestinationName) -> Self {
        Self::assemble(NoIdentity, name)
    }
}

//***************************************************************************//

/// Parsed and signature-verified announce.
pub struct AnnounceInfo<'a> {
    pub identity: Identity,
    pub name: DestinationName,
    pub random_hash: [u8; RANDOM_HASH_LENGTH],
    pub ratchet: Option<[u8; RATCHET_LENGTH]>,
    pub app_data: &'a [u8],
}

impl<'a> AnnounceInfo<'a> {
    /// Emission time from the trailing five bytes of the random blob.
    pub fn timestamp(&self) -> u64 {
        epoch_secs_from_be5(&self.random_hash[RANDOM_HASH_LENGTH / 2..])
    }

    pub fn name_hash(&self) -> [u8; NAME_HASH_SIZE] {
        let mut name_hash = [0u8; NAME_HASH_SIZE];
        name_hash.copy_from_slice(self.name.name_hash());
        name_hash
    }

    pub fn as_output_destination(&self) -> SingleOutputDestination {
        SingleOutputDestination::new(self.identity, self.name.clone())
    }
}

/// Validates an announce packet: structural layout, destination-hash
/// consistency and the Ed25519 signature over the reconstructed signed
/// data. Freshness is the transport's concern.
pub fn validate_announce(packet: &Packet) -> Result<AnnounceInfo<'_>, MeshError> {
    if packet.header.packet_type != PacketType::Announce {
        return Err(MeshError::MalformedPacket);
    }

    let data = packet.data.as_slice();
    let has_ratchet = packet.header.context_flag == ContextFlag::Set;
    let min_len =
        if has_ratchet { MIN_ANNOUNCE_LENGTH + RATCHET_LENGTH } else { MIN_ANNOUNCE_LENGTH };
    if data.len() < min_len {
        return Err(MeshError::MalformedPacket);
    }

    let mut offset = 0usize;
    let identity = Identity::from_public_bytes(&data[..2 * PUBLIC_KEY_LENGTH])?;
    offset += 2 * PUBLIC_KEY_LENGTH;

    let name = DestinationName::from_name_hash_slice(&data[offset..offset + NAME_HASH_SIZE]);
    offset += NAME_HASH_SIZE;

    let mut random_hash = [0u8; RANDOM_HASH_LENGTH];
    random_hash.copy_from_slice(&data[offset..offset + RANDOM_HASH_LENGTH]);
    offset += RANDOM_HASH_LENGTH;

    let ratchet = if has_ratchet {
        let mut ratchet = [0u8; RATCHET_LENGTH];
        ratchet.copy_from_slice(&data[offset..offset + RATCHET_LENGTH]);
        offset += RATCHET_LENGTH;
        Some(ratchet)
    } else {
        None
    };

    let signature = &data[offset..offset + SIGNATURE_LENGTH];
    let app_data = &data[offset + SIGNATURE_LENGTH..];

    if destination_hash(&identity, &name) != packet.destination {
        return Err(MeshError::AuthenticationFailed);
    }

    let mut signed = PayloadBuffer::new();
    signed
        .append(packet.destination.as_slice())?
        .append(identity.public_key_bytes())?
        .append(identity.verifying_key_bytes())?
        .append(name.name_hash())?
        .append(&random_hash)?;
    if let Some(ratchet) = &ratchet {
        signed.append(ratchet)?;
    }
    if !app_data.is_empty() {
        signed.append(app_data)?;
    }

    identity.verify(signed.as_slice(), signature)?;

    Ok(AnnounceInfo { identity, name, random_hash, ratchet, app_data })
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::*;
    use crate::identity::PRIVATE_KEY_LENGTH;

    #[test]
    fn names_reject_dots() {
        assert!(DestinationName::new("app.name", &[]).is_err());
        assert!(DestinationName::new("app", &["good", "bad.aspect"]).is_err());
        assert!(DestinationName::new("", &[]).is_err());
        assert!(DestinationName::new("app", &["one", "two"]).is_ok());
    }

    #[test]
    fn destination_hash_is_deterministic() {
        let mut key_bytes = [0u8; PRIVATE_KEY_LENGTH];
        for (i, byte) in key_bytes.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let identity = PrivateIdentity::from_private_key_bytes(&key_bytes).expect("key");
        let name = DestinationName::new("lxmf", &["delivery"]).expect("name");

        let expected_name_hash_full = Hash::of(b"lxmf.delivery");
        let expected_name_hash = &expected_name_hash_full.as_slice()[..NAME_HASH_SIZE];
        assert_eq!(name.name_hash(), expected_name_hash);

        let expected: Hash = Hash::hasher()
            .chain_update(expected_name_hash)
            .chain_update(identity.address_hash().as_slice())
            .into();
        let destination = SingleInputDestination::new(identity, name);
        assert_eq!(destination.address_hash, AddressHash::truncating(&expected));
    }

    #[test]
    fn plain_destination_hash_uses_name_only() {
        let name = DestinationName::new("lattica", &["path", "request"]).expect("name");
        let destination = PlainInputDestination::new(name.clone());
        let expected = AddressHash::of(name.name_hash());
        assert_eq!(destination.address_hash, expected);
    }

    #[test]
    fn announce_validates_and_carries_app_data() {
        let identity = PrivateIdentity::generate(OsRng);
        let name = DestinationName::new("demo", &["announce"]).expect("name");
        let mut destination = SingleInputDestination::new(identity, name);

        let announce = destination.announce(OsRng, Some(b"app payload")).expect("announce");
        let info = validate_announce(&announce).expect("valid announce");
        assert_eq!(info.app_data, b"app payload");
        assert!(info.ratchet.is_none());
        assert_eq!(*info.identity.address_hash(), *destination.identity.address_hash());

        let now = epoch_secs();
        assert!(info.timestamp() >= now.saturating_sub(2) && info.timestamp() <= now + 2);
    }

    #[test]
    fn tampered_announce_app_data_fails() {
        let identity = PrivateIdentity::generate(OsRng);
        let name = DestinationName::new("demo", &["announce"]).expect("name");
        let mut destination = SingleInputDestination::new(identity, name);

        let mut announce = destination.announce(OsRng, Some(b"app payload")).expect("announce");
        let offset = MIN_ANNOUNCE_LENGTH; // first app_data byte
        announce.data.as_mut_slice()[offset] ^= 0x01;

        match validate_announce(&announce) {
            Err(MeshError::AuthenticationFailed) => {}
            other => panic!("expected authentication failure, got {:?}", other.err()),
        }
    }

    #[test]
    fn announce_with_ratchet_sets_context_flag() {
        let dir = tempfile::tempdir().expect("temp dir");
        let identity = PrivateIdentity::generate(OsRng);
        let name = DestinationName::new("demo", &["ratchets"]).expect("name");
        let mut destination = SingleInputDestination::new(identity, name);
        destination
            .enable_ratchets(dir.path().join("demo.ratchets"))
            .expect("enable ratchets");

        let announce = destination.announce(OsRng, None).expect("announce");
        assert_eq!(announce.header.context_flag, ContextFlag::Set);
        let info = validate_announce(&announce).expect("valid announce");
        assert!(info.ratchet.is_some());
    }

    #[test]
    fn ratchet_round_trip_through_announce() {
        let dir = tempfile::tempdir().expect("temp dir");
        let identity = PrivateIdentity::generate(OsRng);
        let name = DestinationName::new("demo", &["ratchets"]).expect("name");
        let mut input = SingleInputDestination::new(identity, name);
        input.enable_ratchets(dir.path().join("rt.ratchets")).expect("enable");

        let announce = input.announce(OsRng, None).expect("announce");
        let info = validate_announce(&announce).expect("valid");
        let ratchet = info.ratchet.expect("ratchet present");

        let output = info.as_output_destination();
        let ciphertext = output.encrypt(OsRng, b"forward secret", Some(&ratchet)).expect("ct");
        let (plaintext, used_ratchet) = input.decrypt(&ciphertext).expect("plaintext");
        assert_eq!(plaintext, b"forward secret");
        assert!(used_ratchet);
    }

    #[test]
    fn group_round_trip_both_key_sizes() {
        let name = DestinationName::new("demo", &["group"]).expect("name");
        for key_len in [32usize, 64] {
            let key_bytes = vec![0x42u8; key_len];
            let sender = GroupOutputDestination::new(
                GroupKey::from_bytes(&key_bytes).expect("key"),
                name.clone(),
            );
            let receiver = GroupInputDestination::new(
                GroupKey::from_bytes(&key_bytes).expect("key"),
                name.clone(),
            );
            assert_eq!(sender.address_hash, receiver.address_hash);

            let ciphertext = sender.encrypt(OsRng, b"group message").expect("ct");
            assert_eq!(receiver.decrypt(&ciphertext).expect("plain"), b"group message");
        }
    }
}
