use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::body;
use crate::cipher::CipherSuite;
use crate::fields::{self, FieldError, InternetProtocol, NONCE_LEN};
use crate::header::{Header, PduType};
use crate::pdu::{self, PduError};
use crate::tlv::Container;

/// Caller supplied fields of an access request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestData {
    pub transaction_id: u8,
    pub client_uuid: String,
    pub client_ip: IpAddr,
    pub target_protocol: InternetProtocol,
    pub target_ip: IpAddr,
    pub target_port_start: u16,
    pub target_port_end: u16,
}

/// Fields generated at request creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestExtendedData {
    pub timestamp: DateTime<Utc>,
    pub nonce: [u8; NONCE_LEN],
}

impl RequestExtendedData {
    pub fn generate() -> Self {
        Self {
            timestamp: Utc::now(),
            nonce: fields::random_nonce(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub header: Header,
    pub body: Container,
    /// Passed to the cipher suite, never transmitted.
    pub metadata: Container,
    cipher: Arc<dyn CipherSuite>,
}

impl Request {
    pub fn new(data: &RequestData, cipher: Arc<dyn CipherSuite>) -> Result<Self, PduError> {
        Self::with_extended(data, RequestExtendedData::generate(), cipher)
    }

    pub fn with_extended(
        data: &RequestData,
        extended: RequestExtendedData,
        cipher: Arc<dyn CipherSuite>,
    ) -> Result<Self, PduError> {
        let header =
            Header::new(PduType::Request, cipher.id()).with_transaction_id(data.transaction_id);
        let body = build_body(data, &extended)?;
        Ok(Self {
            header,
            body,
            metadata: Container::new(),
            cipher,
        })
    }

    /// Stamp an ADK proof into the header before marshalling.
    pub fn set_adk_proof(&mut self, proof: u32) {
        self.header.adk_proof = proof;
    }

    pub fn marshal(&self) -> Result<Vec<u8>, PduError> {
        pdu::seal(&self.header, &self.body, &self.metadata, self.cipher.as_ref())
    }

    pub fn unmarshal(bytes: &[u8], cipher: Arc<dyn CipherSuite>) -> Result<Self, PduError> {
        let (header, body) = pdu::open(bytes, PduType::Request, cipher.as_ref())?;
        Ok(Self {
            header,
            body,
            metadata: Container::new(),
            cipher,
        })
    }
}

fn build_body(data: &RequestData, extended: &RequestExtendedData) -> Result<Container, PduError> {
    check_ports(
        data.target_protocol,
        data.target_port_start,
        data.target_port_end,
    )?;

    let mut c = Container::new();
    body::set_timestamp(&mut c, extended.timestamp);
    body::set_client_uuid(&mut c, &data.client_uuid)?;
    body::set_protocol(&mut c, data.target_protocol);
    body::set_port_start(&mut c, data.target_port_start);
    body::set_port_end(&mut c, data.target_port_end);
    body::set_client_ip(&mut c, data.client_ip)?;
    body::set_target_ip(&mut c, data.target_ip)?;
    body::set_nonce(&mut c, extended.nonce);
    Ok(c)
}

fn check_ports(proto: InternetProtocol, start: u16, end: u16) -> Result<(), FieldError> {
    if proto.uses_ports() && start == 0 {
        return Err(FieldError::BadInput("tcp/udp target port cannot be zero"));
    }
    if end < start {
        return Err(FieldError::BadInput("target port end precedes start"));
    }
    Ok(())
}

/// The subset of a request body that the authorization backend and the
/// firewall act upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRequest {
    pub client_uuid: String,
    pub client_ip: IpAddr,
    pub target_ip: IpAddr,
    pub target_protocol: InternetProtocol,
    pub target_port_start: u16,
    pub target_port_end: u16,
}

impl FirewallRequest {
    pub fn from_body(c: &Container) -> Result<Self, FieldError> {
        let target_protocol = body::protocol(c)?;
        let target_port_start = body::port_start(c)?;
        let target_port_end = body::port_end(c)?;
        check_ports(target_protocol, target_port_start, target_port_end)?;

        Ok(Self {
            client_uuid: body::client_uuid(c)?,
            client_ip: body::client_ip(c)?,
            target_ip: body::target_ip(c)?,
            target_protocol,
            target_port_start,
            target_port_end,
        })
    }

    pub fn is_ipv6(&self) -> bool {
        fields::is_ipv6(self.client_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::NoSecurity;
    use chrono::TimeZone;

    fn data() -> RequestData {
        RequestData {
            transaction_id: 42,
            client_uuid: "c3b7a8e0-1b2c-4d5e-8f90-a1b2c3d4e5f6".to_string(),
            client_ip: "88.200.23.30".parse().expect("client ip"),
            target_protocol: InternetProtocol::Tcp,
            target_ip: "88.200.23.19".parse().expect("target ip"),
            target_port_start: 3000,
            target_port_end: 8000,
        }
    }

    #[test]
    fn body_carries_every_field_in_order() {
        let ts = Utc.with_ymd_and_hms(2022, 5, 1, 12, 0, 0).single().expect("ts");
        let extended = RequestExtendedData {
            timestamp: ts,
            nonce: [1, 2, 3],
        };
        let request =
            Request::with_extended(&data(), extended, Arc::new(NoSecurity)).expect("request");

        let kinds: Vec<u8> = request.body.items().iter().map(|item| item.kind).collect();
        assert_eq!(
            kinds,
            vec![
                body::TIMESTAMP_KEY,
                body::CLIENT_UUID_KEY,
                body::PROTOCOL_KEY,
                body::PORT_START_KEY,
                body::PORT_END_KEY,
                body::CLIENT_IPV4_KEY,
                body::TARGET_IPV4_KEY,
                body::NONCE_KEY,
            ]
        );
        assert_eq!(body::timestamp(&request.body).expect("timestamp"), ts);
        assert_eq!(body::nonce(&request.body).expect("nonce"), [1, 2, 3]);
    }

    #[test]
    fn marshal_unmarshal_preserves_transaction_and_body() {
        let mut request = Request::new(&data(), Arc::new(NoSecurity)).expect("request");
        request.set_adk_proof(7);
        let bytes = request.marshal().expect("marshal");
        assert_eq!(bytes[1], 42);

        let parsed = Request::unmarshal(&bytes, Arc::new(NoSecurity)).expect("unmarshal");
        assert_eq!(parsed.header, request.header);
        assert_eq!(parsed.body, request.body);

        let fw = FirewallRequest::from_body(&parsed.body).expect("firewall request");
        assert_eq!(fw.target_port_start, 3000);
        assert_eq!(fw.target_port_end, 8000);
        assert!(!fw.is_ipv6());
    }

    #[test]
    fn tcp_requires_nonzero_port() {
        let mut d = data();
        d.target_port_start = 0;
        assert!(matches!(
            Request::new(&d, Arc::new(NoSecurity)),
            Err(PduError::Field(FieldError::BadInput(_)))
        ));

        d.target_protocol = InternetProtocol::Icmp;
        d.target_port_end = 0;
        assert!(Request::new(&d, Arc::new(NoSecurity)).is_ok());
    }

    #[test]
    fn unmarshal_rejects_short_and_response_pdus() {
        assert!(matches!(
            Request::unmarshal(&[0x10, 0, 0xFF], Arc::new(NoSecurity)),
            Err(PduError::TooShort(3))
        ));
        assert!(matches!(
            Request::unmarshal(&[0x90, 0, 0xFF, 0, 0, 0, 0, 0, 1, 0], Arc::new(NoSecurity)),
            Err(PduError::UnexpectedType(PduType::Response))
        ));
        assert!(matches!(
            Request::unmarshal(&[0x10, 0, 0xFF, 0, 0, 0, 0, 0], Arc::new(NoSecurity)),
            Err(PduError::EmptyBody)
        ));
        assert!(matches!(
            Request::unmarshal(&[0x10, 0, 0x01, 0, 0, 0, 0, 0, 1, 0], Arc::new(NoSecurity)),
            Err(PduError::CipherSuiteMismatch { .. })
        ));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut request = Request::new(&data(), Arc::new(NoSecurity)).expect("request");
        request.body.set(200, vec![0xAB; 1500]);
        assert!(matches!(request.marshal(), Err(PduError::TooLarge(_))));
    }
}
