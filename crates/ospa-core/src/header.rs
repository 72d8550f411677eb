use bytes::Buf;
use thiserror::Error;

use crate::cipher::CipherSuiteId;

/// Length of the fixed OpenSPA header.
pub const HEADER_LEN: usize = 8;

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

const PDU_TYPE_RESPONSE_BIT: u8 = 0x80;
const VERSION_MASK: u8 = 0x70;
const VERSION_SHIFT: u8 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header requires {HEADER_LEN} bytes, got {0}")]
    TooShort(usize),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduType {
    Request,
    Response,
}

/// Fixed 8 byte header: `T|V|reserved`, transaction id, cipher suite, reserved, ADK proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub pdu_type: PduType,
    pub version: u8,
    pub transaction_id: u8,
    pub cipher_suite: CipherSuiteId,
    /// ADK proof in host order; `0` means the sender is not using ADK.
    pub adk_proof: u32,
}

impl Header {
    pub fn new(pdu_type: PduType, cipher_suite: CipherSuiteId) -> Self {
        Self {
            pdu_type,
            version: PROTOCOL_VERSION,
            transaction_id: 0,
            cipher_suite,
            adk_proof: 0,
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: u8) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    pub fn with_adk_proof(mut self, proof: u32) -> Self {
        self.adk_proof = proof;
        self
    }

    pub fn is_response(&self) -> bool {
        self.pdu_type == PduType::Response
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut control = (self.version << VERSION_SHIFT) & VERSION_MASK;
        if self.is_response() {
            control |= PDU_TYPE_RESPONSE_BIT;
        }
        let proof = self.adk_proof.to_be_bytes();
        [
            control,
            self.transaction_id,
            self.cipher_suite.into(),
            0,
            proof[0],
            proof[1],
            proof[2],
            proof[3],
        ]
    }

    /// Parse the leading [`HEADER_LEN`] bytes of a datagram.
    pub fn parse(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < HEADER_LEN {
            return Err(HeaderError::TooShort(bytes.len()));
        }
        let mut cursor = &bytes[..HEADER_LEN];
        let control = cursor.get_u8();
        let version = (control & VERSION_MASK) >> VERSION_SHIFT;
        if version != PROTOCOL_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        let pdu_type = if control & PDU_TYPE_RESPONSE_BIT != 0 {
            PduType::Response
        } else {
            PduType::Request
        };
        let transaction_id = cursor.get_u8();
        let cipher_suite = CipherSuiteId::from(cursor.get_u8());
        let _reserved = cursor.get_u8();
        let adk_proof = cursor.get_u32();

        Ok(Self {
            pdu_type,
            version,
            transaction_id,
            cipher_suite,
            adk_proof,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_bytes() {
        let header = Header::new(PduType::Request, CipherSuiteId::NoSecurity);
        assert_eq!(
            header.to_bytes(),
            [0x10, 0x00, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn response_header_bytes() {
        let header = Header::new(PduType::Response, CipherSuiteId::from(24));
        assert_eq!(
            header.to_bytes(),
            [0x90, 0x00, 0x18, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let header = Header::new(PduType::Response, CipherSuiteId::RsaSha256Aes256Cbc)
            .with_transaction_id(42)
            .with_adk_proof(123_456_789);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[4..], &123_456_789u32.to_be_bytes());
        assert_eq!(Header::parse(&bytes).expect("parse"), header);
    }

    #[test]
    fn rejects_short_and_unknown_version() {
        assert_eq!(
            Header::parse(&[0x10, 0x00]).unwrap_err(),
            HeaderError::TooShort(2)
        );
        assert_eq!(
            Header::parse(&[0x20, 0, 1, 0, 0, 0, 0, 0]).unwrap_err(),
            HeaderError::UnsupportedVersion(2)
        );
    }
}
