//! Wire protocol primitives for OpenSPA.
//!
//! The crate covers everything that can be expressed without touching the
//! network or a concrete cipher: the TLV container, the fixed 8 byte header,
//! field encoders, the request/response PDUs, the `CipherSuite` seam and the
//! ADK proof generator shared by client, server and the kernel fast path.

pub mod adk;
pub mod body;
pub mod cipher;
pub mod fields;
pub mod header;
mod pdu;
pub mod request;
pub mod response;
pub mod tlv;

pub use adk::{
    generate_next_proof, generate_proof, generate_secret, AdkError, AdkProver, ADK_PERIOD,
    ADK_SECRET_ENCODED_LEN,
};
pub use cipher::{CipherError, CipherSuite, CipherSuiteId, NoSecurity};
pub use fields::{FieldError, InternetProtocol, DURATION_MAX_SECS};
pub use header::{Header, HeaderError, PduType, HEADER_LEN, PROTOCOL_VERSION};
pub use pdu::{PduError, DEFAULT_SERVER_PORT, MAX_PDU_SIZE};
pub use request::{FirewallRequest, Request, RequestData, RequestExtendedData};
pub use response::{Grant, Response, ResponseData};
pub use tlv::{Container, Item, TlvError};
