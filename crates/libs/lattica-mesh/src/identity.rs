use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ed25519_dalek::ed25519::signature::Signer;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroize;

use crate::crypt::token::{TokenKey, TOKEN_KEY_LENGTH};
use crate::error::MeshError;
use crate::hash::{AddressHash, Hash, NAME_HASH_SIZE};
use crate::time::epoch_secs;

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const PRIVATE_KEY_LENGTH: usize = 2 * PUBLIC_KEY_LENGTH;
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// 64-byte key derived from an X25519 exchange via HKDF-SHA256. Feeds the
/// symmetric token as signing(32) ‖ encryption(32).
pub struct DerivedKey([u8; TOKEN_KEY_LENGTH]);

impl DerivedKey {
    pub fn from_shared(shared: &SharedSecret, salt: &[u8]) -> Self {
        let mut key = [0u8; TOKEN_KEY_LENGTH];
        // Expand cannot fail for a 64-byte output with SHA-256.
        let _ = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes()).expand(&[], &mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_KEY_LENGTH] {
        &self.0
    }

    pub fn token_key(&self) -> TokenKey {
        TokenKey::from_derived(&self.0)
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Public half of an identity: an X25519 encryption key, an Ed25519
/// verifying key, and the 16-byte truncated hash over both that names it.
#[derive(Copy, Clone)]
pub struct Identity {
    public_key: PublicKey,
    verifying_key: VerifyingKey,
    address_hash: AddressHash,
}

impl Identity {
    pub fn new(public_key: PublicKey, verifying_key: VerifyingKey) -> Self {
        let hash: Hash = Hash::hasher()
            .chain_update(public_key.as_bytes())
            .chain_update(verifying_key.as_bytes())
            .into();

        Self { public_key, verifying_key, address_hash: AddressHash::truncating(&hash) }
    }

    /// Parses the 64-byte public material carried in announces.
    pub fn from_public_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        if bytes.len() != PRIVATE_KEY_LENGTH {
            return Err(MeshError::InvalidKey);
        }

        let mut enc = [0u8; PUBLIC_KEY_LENGTH];
        enc.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);

        let mut sig = [0u8; PUBLIC_KEY_LENGTH];
        sig.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);
        let verifying_key =
            VerifyingKey::from_bytes(&sig).map_err(|_| MeshError::InvalidKey)?;

        Ok(Self::new(PublicKey::from(enc), verifying_key))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.public_key.as_bytes()
    }

    pub fn verifying_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.as_bytes()
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.address_hash
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), MeshError> {
        let signature =
            Signature::from_slice(signature).map_err(|_| MeshError::AuthenticationFailed)?;
        self.verifying_key
            .verify_strict(data, &signature)
            .map_err(|_| MeshError::AuthenticationFailed)
    }

    /// Encrypts to this identity, or to its current ratchet when one is
    /// known. A ratchet public replaces the identity key as the ECDH target,
    /// upgrading the destination to forward secrecy.
    pub fn encrypt<R: CryptoRngCore>(
        &self,
        rng: R,
        plaintext: &[u8],
        ratchet: Option<&[u8; PUBLIC_KEY_LENGTH]>,
    ) -> Result<Vec<u8>, MeshError> {
        let target = match ratchet {
            Some(ratchet) => PublicKey::from(*ratchet),
            None => self.public_key,
        };
        encrypt_to_public_key(&target, self.address_hash.as_slice(), plaintext, rng)
    }
}

/// Full identity with private material. The private halves never leave this
/// struct except through the 64-byte persistence format.
#[derive(Clone)]
pub struct PrivateIdentity {
    identity: Identity,
    encryption_key: StaticSecret,
    sign_key: SigningKey,
}

impl PrivateIdentity {
    pub fn new(encryption_key: StaticSecret, sign_key: SigningKey) -> Self {
        Self {
            identity: Identity::new((&encryption_key).into(), sign_key.verifying_key()),
            encryption_key,
            sign_key,
        }
    }

    /// Fresh keypairs. The X25519 scalar is clamped per RFC 7748 when the
    /// exchange runs, so raw random bytes are a valid seed.
    pub fn generate<R: CryptoRngCore>(mut rng: R) -> Self {
        let sign_key = SigningKey::generate(&mut rng);
        let encryption_key = StaticSecret::random_from_rng(rng);
        Self::new(encryption_key, sign_key)
    }

    /// 64-byte persistence format: X25519 seed ‖ Ed25519 seed.
    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        if bytes.len() != PRIVATE_KEY_LENGTH {
            return Err(MeshError::InvalidKey);
        }

        let mut enc = [0u8; PUBLIC_KEY_LENGTH];
        enc.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);
        let mut sig = [0u8; PUBLIC_KEY_LENGTH];
        sig.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);

        let identity = Self::new(StaticSecret::from(enc), SigningKey::from_bytes(&sig));
        enc.zeroize();
        sig.zeroize();
        Ok(identity)
    }

    pub fn to_private_key_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(self.encryption_key.as_bytes());
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(self.sign_key.as_bytes());
        bytes
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        let mut data = fs::read(path).map_err(|_| MeshError::StorageError)?;
        let identity = Self::from_private_key_bytes(&data);
        data.zeroize();
        identity
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), MeshError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| MeshError::StorageError)?;
        }
        let mut bytes = self.to_private_key_bytes();
        let tmp = path.with_extension("tmp");
        let written = fs::write(&tmp, bytes);
        bytes.zeroize();
        written.map_err(|_| MeshError::StorageError)?;
        fs::rename(&tmp, path).map_err(|_| MeshError::StorageError)
    }

    pub fn as_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.identity.address_hash
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.sign_key
    }

    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.sign_key.sign(data).to_bytes()
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), MeshError> {
        self.identity.verify(data, signature)
    }

    pub fn exchange(&self, public_key: &PublicKey) -> SharedSecret {
        self.encryption_key.diffie_hellman(public_key)
    }

    pub fn derive_key(&self, public_key: &PublicKey, salt: &[u8]) -> DerivedKey {
        DerivedKey::from_shared(&self.exchange(public_key), salt)
    }

    /// Decrypts a ciphertext addressed to this identity's static key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, MeshError> {
        decrypt_with_secret(
            &self.encryption_key,
            self.identity.address_hash.as_slice(),
            ciphertext,
        )
    }

    /// Tries each ratchet private (newest first), then the identity key
    /// unless ratchets are enforced. Returns the plaintext and whether a
    /// ratchet decrypted it.
    pub fn decrypt_with_ratchets(
        &self,
        ciphertext: &[u8],
        ratchets: &[StaticSecret],
        enforce_ratchets: bool,
    ) -> Result<(Vec<u8>, bool), MeshError> {
        let salt = self.identity.address_hash;
        for ratchet in ratchets {
            if let Ok(plaintext) = decrypt_with_secret(ratchet, salt.as_slice(), ciphertext) {
                return Ok((plaintext, true));
            }
        }
        if enforce_ratchets {
            return Err(MeshError::AuthenticationFailed);
        }
        self.decrypt(ciphertext).map(|plaintext| (plaintext, false))
    }
}

/// `ephemeral_pub(32) ‖ Token` — the asymmetric envelope used by single
/// destinations and announce-learned ratchets.
pub fn encrypt_to_public_key<R: CryptoRngCore>(
    target: &PublicKey,
    salt: &[u8],
    plaintext: &[u8],
    mut rng: R,
) -> Result<Vec<u8>, MeshError> {
    let ephemeral = EphemeralSecret::random_from_rng(&mut rng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let derived = DerivedKey::from_shared(&ephemeral.diffie_hellman(target), salt);

    let mut out = vec![0u8; PUBLIC_KEY_LENGTH + TokenKey::token_length(plaintext.len())];
    out[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_public.as_bytes());
    let token_len = derived
        .token_key()
        .encrypt(rng, plaintext, &mut out[PUBLIC_KEY_LENGTH..])?
        .len();
    out.truncate(PUBLIC_KEY_LENGTH + token_len);
    Ok(out)
}

pub fn decrypt_with_secret(
    secret: &StaticSecret,
    salt: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, MeshError> {
    if ciphertext.len() <= PUBLIC_KEY_LENGTH {
        return Err(MeshError::AuthenticationFailed);
    }

    let mut ephemeral = [0u8; PUBLIC_KEY_LENGTH];
    ephemeral.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
    let derived = DerivedKey::from_shared(
        &secret.diffie_hellman(&PublicKey::from(ephemeral)),
        salt,
    );

    let token = &ciphertext[PUBLIC_KEY_LENGTH..];
    let mut out = vec![0u8; token.len()];
    let plain_len = derived.token_key().decrypt(token, &mut out)?.len();
    out.truncate(plain_len);
    Ok(out)
}

/// One remembered remote endpoint, learned from a validated announce.
#[derive(Clone)]
pub struct KnownDestination {
    pub identity: Identity,
    pub name_hash: [u8; NAME_HASH_SIZE],
    pub app_data: Vec<u8>,
    pub last_seen: u64,
}

/// Instance-scoped recall map `destination_hash → public material`. Owned by
/// the transport so several stacks can coexist in one process.
#[derive(Default)]
pub struct KnownDestinations {
    map: HashMap<AddressHash, KnownDestination>,
}

impl KnownDestinations {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn remember(
        &mut self,
        destination: AddressHash,
        identity: Identity,
        name_hash: [u8; NAME_HASH_SIZE],
        app_data: &[u8],
    ) {
        self.map.insert(
            destination,
            KnownDestination {
                identity,
                name_hash,
                app_data: app_data.to_vec(),
                last_seen: epoch_secs(),
            },
        );
    }

    pub fn recall(&self, destination: &AddressHash) -> Option<&KnownDestination> {
        self.map.get(destination)
    }

    pub fn recall_identity(&self, destination: &AddressHash) -> Option<Identity> {
        self.map.get(destination).map(|known| known.identity)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn cull_older_than(&mut self, max_age_secs: u64) -> usize {
        let now = epoch_secs();
        let before = self.map.len();
        self.map.retain(|_, known| now.saturating_sub(known.last_seen) <= max_age_secs);
        before - self.map.len()
    }
}
