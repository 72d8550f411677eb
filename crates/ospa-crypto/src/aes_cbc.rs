use aes::Aes256;
use cbc::cipher::block_padding::{Pkcs7, UnpadError};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const BLOCK_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = BLOCK_LEN;
/// Wire length of `iv || key`.
pub const SESSION_KEY_LEN: usize = IV_LEN + KEY_LEN;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AesError {
    #[error("ciphertext is not a multiple of the block size")]
    NotBlockAligned,
    #[error("invalid pkcs7 padding")]
    InvalidPadding,
    #[error("session key must be {SESSION_KEY_LEN} bytes, got {0}")]
    InvalidSessionKey(usize),
}

/// Per-message AES-256-CBC key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    iv: [u8; IV_LEN],
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut session = Self {
            iv: [0u8; IV_LEN],
            key: [0u8; KEY_LEN],
        };
        OsRng.fill_bytes(&mut session.iv);
        OsRng.fill_bytes(&mut session.key);
        session
    }

    /// Split an `iv || key` blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AesError> {
        if bytes.len() != SESSION_KEY_LEN {
            return Err(AesError::InvalidSessionKey(bytes.len()));
        }
        let mut session = Self {
            iv: [0u8; IV_LEN],
            key: [0u8; KEY_LEN],
        };
        session.iv.copy_from_slice(&bytes[..IV_LEN]);
        session.key.copy_from_slice(&bytes[IV_LEN..]);
        Ok(session)
    }

    pub fn to_bytes(&self) -> zeroize::Zeroizing<Vec<u8>> {
        let mut out = zeroize::Zeroizing::new(Vec::with_capacity(SESSION_KEY_LEN));
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.key);
        out
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AesError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(AesError::NotBlockAligned);
        }
        Ok(Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)?)
    }
}

impl From<UnpadError> for AesError {
    fn from(_: UnpadError) -> Self {
        AesError::InvalidPadding
    }
}
