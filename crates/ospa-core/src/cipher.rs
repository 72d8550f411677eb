use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::tlv::{Container, TlvError};

/// Cipher suite identifier carried in byte 2 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuiteId {
    Unknown,
    RsaSha256Aes256Cbc,
    /// Pass-through suite reserved for tests.
    NoSecurity,
    Other(u8),
}

impl From<u8> for CipherSuiteId {
    fn from(value: u8) -> Self {
        match value {
            0 => CipherSuiteId::Unknown,
            1 => CipherSuiteId::RsaSha256Aes256Cbc,
            255 => CipherSuiteId::NoSecurity,
            other => CipherSuiteId::Other(other),
        }
    }
}

impl From<CipherSuiteId> for u8 {
    fn from(id: CipherSuiteId) -> Self {
        match id {
            CipherSuiteId::Unknown => 0,
            CipherSuiteId::RsaSha256Aes256Cbc => 1,
            CipherSuiteId::NoSecurity => 255,
            CipherSuiteId::Other(other) => other,
        }
    }
}

impl CipherSuiteId {
    /// Name used by configuration files.
    pub fn name(self) -> &'static str {
        match self {
            CipherSuiteId::RsaSha256Aes256Cbc => "CipherRSA_SHA256_AES256CBC",
            CipherSuiteId::NoSecurity => "CipherNoSecurity",
            CipherSuiteId::Unknown | CipherSuiteId::Other(_) => "CipherUnknown",
        }
    }
}

impl fmt::Display for CipherSuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Only production suites can be selected by name; the test suite cannot.
impl FromStr for CipherSuiteId {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CipherRSA_SHA256_AES256CBC" => Ok(CipherSuiteId::RsaSha256Aes256Cbc),
            other => Err(CipherError::UnknownSuite(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("unknown cipher suite {0:?}")]
    UnknownSuite(String),
    #[error("failed to resolve peer public key: {0}")]
    KeyResolution(String),
    #[error("failed to sign packet: {0}")]
    Signing(String),
    #[error("failed to encrypt: {0}")]
    Encrypt(String),
    #[error("decryption failed")]
    DecryptFailed,
    #[error("session key must be 48 bytes, got {0}")]
    InvalidSessionKey(usize),
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("encrypted container is missing {0}")]
    MissingEntry(&'static str),
    #[error("encrypted container: {0}")]
    Tlv(#[from] TlvError),
}

/// Encryption and authentication applied to a PDU body.
///
/// `secure` turns a plaintext body into the encrypted container that follows
/// the header on the wire; `unlock` reverses it. Both receive the marshalled
/// header so implementations can authenticate it together with the body.
/// The metadata container carries values the suite may need (for example the
/// peer's client UUID) that are never transmitted.
pub trait CipherSuite: Send + Sync + fmt::Debug {
    fn id(&self) -> CipherSuiteId;

    fn secure(
        &self,
        header: &[u8],
        body: &Container,
        metadata: &Container,
    ) -> Result<Container, CipherError>;

    fn unlock(&self, header: &[u8], encrypted: &Container) -> Result<Container, CipherError>;
}

/// Pass-through suite for tests. Never register it on a production listener.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecurity;

impl CipherSuite for NoSecurity {
    fn id(&self) -> CipherSuiteId {
        CipherSuiteId::NoSecurity
    }

    fn secure(
        &self,
        _header: &[u8],
        body: &Container,
        _metadata: &Container,
    ) -> Result<Container, CipherError> {
        Ok(body.clone())
    }

    fn unlock(&self, _header: &[u8], encrypted: &Container) -> Result<Container, CipherError> {
        Ok(encrypted.clone())
    }
}
