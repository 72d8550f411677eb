use thiserror::Error;

use crate::cipher::{CipherError, CipherSuite, CipherSuiteId};
use crate::fields::FieldError;
use crate::header::{Header, HeaderError, PduType, HEADER_LEN};
use crate::tlv::{Container, TlvError};

/// Largest datagram either side will emit or accept.
pub const MAX_PDU_SIZE: usize = 1444;

/// UDP port the server listens on unless configured otherwise.
pub const DEFAULT_SERVER_PORT: u16 = 22211;

#[derive(Debug, Error)]
pub enum PduError {
    #[error("pdu too short ({0} bytes)")]
    TooShort(usize),
    #[error("pdu too large ({0} bytes, limit {MAX_PDU_SIZE})")]
    TooLarge(usize),
    #[error("cipher suite required")]
    CipherSuiteRequired,
    #[error("cipher suite mismatch: expected {expected}, got {got}")]
    CipherSuiteMismatch {
        expected: CipherSuiteId,
        got: CipherSuiteId,
    },
    #[error("unexpected pdu type {0:?}")]
    UnexpectedType(PduType),
    #[error("pdu body is empty")]
    EmptyBody,
    #[error("header: {0}")]
    Header(#[from] HeaderError),
    #[error("tlv: {0}")]
    Tlv(#[from] TlvError),
    #[error("field: {0}")]
    Field(#[from] FieldError),
    #[error("cipher: {0}")]
    Cipher(#[from] CipherError),
}

/// `header || secure(body)`, bounded by [`MAX_PDU_SIZE`].
pub(crate) fn seal(
    header: &Header,
    body: &Container,
    metadata: &Container,
    cipher: &dyn CipherSuite,
) -> Result<Vec<u8>, PduError> {
    let header_bytes = header.to_bytes();
    let encrypted = cipher.secure(&header_bytes, body, metadata)?;

    let mut out = Vec::with_capacity(MAX_PDU_SIZE);
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&encrypted.to_bytes());
    if out.len() > MAX_PDU_SIZE {
        return Err(PduError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Parse the header, check it is addressed to `cipher` and unlock the body.
pub(crate) fn open(
    bytes: &[u8],
    expected: PduType,
    cipher: &dyn CipherSuite,
) -> Result<(Header, Container), PduError> {
    if bytes.len() < HEADER_LEN {
        return Err(PduError::TooShort(bytes.len()));
    }
    if bytes.len() > MAX_PDU_SIZE {
        return Err(PduError::TooLarge(bytes.len()));
    }
    let (header_bytes, rest) = bytes.split_at(HEADER_LEN);
    let header = Header::parse(header_bytes)?;
    if header.pdu_type != expected {
        return Err(PduError::UnexpectedType(header.pdu_type));
    }
    if header.cipher_suite == CipherSuiteId::Unknown {
        return Err(PduError::CipherSuiteRequired);
    }
    if header.cipher_suite != cipher.id() {
        return Err(PduError::CipherSuiteMismatch {
            expected: cipher.id(),
            got: header.cipher_suite,
        });
    }
    if rest.is_empty() {
        return Err(PduError::EmptyBody);
    }

    let encrypted = Container::parse(rest)?;
    let body = cipher.unlock(header_bytes, &encrypted)?;
    Ok((header, body))
}
