use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyIvInit};
use crypto_common::typenum::Unsigned;
use crypto_common::{IvSizeUser, KeySizeUser, OutputSizeUser};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::Sha256;

use crate::crypt::ct_eq;
use crate::error::MeshError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const HALF_KEY: usize = <<aes::Aes256 as KeySizeUser>::KeySize as Unsigned>::USIZE;
const IV_LENGTH: usize = <<Aes256CbcEnc as IvSizeUser>::IvSize as Unsigned>::USIZE;
const TAG_LENGTH: usize = <<HmacSha256 as OutputSizeUser>::OutputSize as Unsigned>::USIZE;
const BLOCK_LENGTH: usize = <<aes::Aes256 as BlockSizeUser>::BlockSize as Unsigned>::USIZE;

pub const TOKEN_KEY_LENGTH: usize = 2 * HALF_KEY;

pub const TOKEN_OVERHEAD: usize = IV_LENGTH + TAG_LENGTH;
pub const TOKEN_MAX_PADDING: usize = BLOCK_LENGTH;

/// Authenticated symmetric token: `IV(16) ‖ AES-256-CBC(PKCS7) ‖
/// HMAC-SHA256(32)`, encrypt-then-MAC over IV and ciphertext.
///
/// This follows the Fernet construction with the version and timestamp
/// fields removed: they add overhead and leak initiator metadata, and
/// nothing in the stack consumes them.
pub struct TokenKey {
    sign_key: [u8; HALF_KEY],
    cipher_key: [u8; HALF_KEY],
}

impl TokenKey {
    /// Splits a 64-byte derived key into signing(32) ‖ encryption(32).
    pub fn from_derived(key: &[u8; TOKEN_KEY_LENGTH]) -> Self {
        let mut sign_key = [0u8; HALF_KEY];
        let mut cipher_key = [0u8; HALF_KEY];
        sign_key.copy_from_slice(&key[..HALF_KEY]);
        cipher_key.copy_from_slice(&key[HALF_KEY..]);
        Self { sign_key, cipher_key }
    }

    /// Group keys come in two sizes: a full 64-byte pair used directly, or a
    /// 32-byte seed expanded to the pair with HKDF.
    pub fn from_group_key(key: &[u8]) -> Result<Self, MeshError> {
        match key.len() {
            TOKEN_KEY_LENGTH => {
                let mut full = [0u8; TOKEN_KEY_LENGTH];
                full.copy_from_slice(key);
                Ok(Self::from_derived(&full))
            }
            HALF_KEY => {
                let mut full = [0u8; TOKEN_KEY_LENGTH];
                Hkdf::<Sha256>::new(None, key)
                    .expand(&[], &mut full)
                    .map_err(|_| MeshError::InvalidKey)?;
                Ok(Self::from_derived(&full))
            }
            _ => Err(MeshError::InvalidKey),
        }
    }

    /// Exact token length produced for `plaintext_len` bytes of input.
    pub const fn token_length(plaintext_len: usize) -> usize {
        let padded = (plaintext_len / BLOCK_LENGTH + 1) * BLOCK_LENGTH;
        TOKEN_OVERHEAD + padded
    }

    pub fn encrypt<'a, R: CryptoRngCore>(
        &self,
        mut rng: R,
        plaintext: &[u8],
        out: &'a mut [u8],
    ) -> Result<&'a [u8], MeshError> {
        let required = Self::token_length(plaintext.len());
        if out.len() < required {
            return Err(MeshError::BufferExhausted);
        }

        let mut iv = [0u8; IV_LENGTH];
        rng.fill_bytes(&mut iv);
        out[..IV_LENGTH].copy_from_slice(&iv);

        let cipher_len = Aes256CbcEnc::new(&self.cipher_key.into(), &iv.into())
            .encrypt_padded_b2b_mut::<Pkcs7>(plaintext, &mut out[IV_LENGTH..])
            .map_err(|_| MeshError::BufferExhausted)?
            .len();

        let body_len = IV_LENGTH + cipher_len;
        let tag = self.tag_over(&out[..body_len])?;
        out[body_len..body_len + TAG_LENGTH].copy_from_slice(&tag);

        Ok(&out[..body_len + TAG_LENGTH])
    }

    /// Verifies the tag in constant time, then decrypts. Any failure maps to
    /// `AuthenticationFailed`; callers treat it as a silent drop.
    pub fn decrypt<'a>(
        &self,
        token: &[u8],
        out: &'a mut [u8],
    ) -> Result<&'a [u8], MeshError> {
        if token.len() <= TOKEN_OVERHEAD {
            return Err(MeshError::AuthenticationFailed);
        }

        let tag_start = token.len() - TAG_LENGTH;
        let expected = self.tag_over(&token[..tag_start])?;
        if !ct_eq(&expected, &token[tag_start..]) {
            return Err(MeshError::AuthenticationFailed);
        }

        let iv: [u8; IV_LENGTH] =
            token[..IV_LENGTH].try_into().map_err(|_| MeshError::AuthenticationFailed)?;
        let plaintext = Aes256CbcDec::new(&self.cipher_key.into(), &iv.into())
            .decrypt_padded_b2b_mut::<Pkcs7>(&token[IV_LENGTH..tag_start], out)
            .map_err(|_| MeshError::AuthenticationFailed)?;

        Ok(plaintext)
    }

    fn tag_over(&self, data: &[u8]) -> Result<[u8; TAG_LENGTH], MeshError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| MeshError::InvalidKey)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::*;

    fn test_key() -> TokenKey {
        let mut key = [0u8; TOKEN_KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        TokenKey::from_derived(&key)
    }

    #[test]
    fn encrypt_then_decrypt() {
        let key = test_key();
        let mut token_buf = [0u8; 256];
        let token = key.encrypt(OsRng, b"token round trip", &mut token_buf).expect("token");

        let mut plain_buf = [0u8; 256];
        let plain = key.decrypt(token, &mut plain_buf).expect("plaintext");
        assert_eq!(plain, b"token round trip");
    }

    #[test]
    fn token_length_matches_output() {
        let key = test_key();
        let mut buf = [0u8; 256];
        for len in [0usize, 1, 15, 16, 17, 64] {
            let plaintext = vec![0x5Au8; len];
            let token = key.encrypt(OsRng, &plaintext, &mut buf).expect("token");
            assert_eq!(token.len(), TokenKey::token_length(len));
        }
    }

    #[test]
    fn flipped_tag_is_rejected() {
        let key = test_key();
        let mut token_buf = [0u8; 256];
        let token_len =
            key.encrypt(OsRng, b"integrity", &mut token_buf).expect("token").len();
        let last = token_len - 1;
        token_buf[last] ^= 0x01;

        let mut plain_buf = [0u8; 256];
        assert_eq!(
            key.decrypt(&token_buf[..token_len], &mut plain_buf),
            Err(MeshError::AuthenticationFailed)
        );
    }

    #[test]
    fn short_group_key_expands() {
        let seed = [7u8; 32];
        let key = TokenKey::from_group_key(&seed).expect("group key");
        let mut token_buf = [0u8; 128];
        let token = key.encrypt(OsRng, b"group", &mut token_buf).expect("token");
        let mut plain_buf = [0u8; 128];
        assert_eq!(key.decrypt(token, &mut plain_buf).expect("plain"), b"group");
    }

    #[test]
    fn wrong_group_key_size_is_rejected() {
        assert!(TokenKey::from_group_key(&[0u8; 16]).is_err());
    }
}
