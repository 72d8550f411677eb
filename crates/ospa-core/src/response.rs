use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::body;
use crate::cipher::CipherSuite;
use crate::fields::{self, FieldError, InternetProtocol};
use crate::header::{Header, PduType};
use crate::pdu::{self, PduError};
use crate::tlv::Container;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseData {
    pub transaction_id: u8,
    /// Used by the server's cipher suite to find the client key; not transmitted.
    pub client_uuid: String,
    pub target_protocol: InternetProtocol,
    pub target_ip: IpAddr,
    pub target_port_start: u16,
    pub target_port_end: u16,
    pub duration: Duration,
}

/// The access window a server granted, as read back from a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub target_protocol: InternetProtocol,
    pub target_ip: IpAddr,
    pub target_port_start: u16,
    pub target_port_end: u16,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub header: Header,
    pub body: Container,
    pub metadata: Container,
    cipher: Arc<dyn CipherSuite>,
}

impl Response {
    pub fn new(data: &ResponseData, cipher: Arc<dyn CipherSuite>) -> Result<Self, PduError> {
        let header =
            Header::new(PduType::Response, cipher.id()).with_transaction_id(data.transaction_id);

        let mut firewall = Container::new();
        body::set_protocol(&mut firewall, data.target_protocol);
        body::set_target_ip(&mut firewall, data.target_ip)?;
        body::set_port_start(&mut firewall, data.target_port_start);
        body::set_port_end(&mut firewall, data.target_port_end);
        body::set_duration(&mut firewall, data.duration)?;

        let mut c = Container::new();
        body::set_firewall(&mut c, &firewall);
        body::set_nonce(&mut c, fields::random_nonce());

        let mut metadata = Container::new();
        body::set_client_uuid(&mut metadata, &data.client_uuid)?;

        Ok(Self {
            header,
            body: c,
            metadata,
            cipher,
        })
    }

    pub fn marshal(&self) -> Result<Vec<u8>, PduError> {
        pdu::seal(&self.header, &self.body, &self.metadata, self.cipher.as_ref())
    }

    pub fn unmarshal(bytes: &[u8], cipher: Arc<dyn CipherSuite>) -> Result<Self, PduError> {
        let (header, body) = pdu::open(bytes, PduType::Response, cipher.as_ref())?;
        Ok(Self {
            header,
            body,
            metadata: Container::new(),
            cipher,
        })
    }

    pub fn grant(&self) -> Result<Grant, FieldError> {
        let firewall = body::firewall(&self.body)?;
        Ok(Grant {
            target_protocol: body::protocol(&firewall)?,
            target_ip: body::target_ip(&firewall)?,
            target_port_start: body::port_start(&firewall)?,
            target_port_end: body::port_end(&firewall)?,
            duration: body::duration(&firewall)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::NoSecurity;

    fn data() -> ResponseData {
        ResponseData {
            transaction_id: 24,
            client_uuid: "c3b7a8e0-1b2c-4d5e-8f90-a1b2c3d4e5f6".to_string(),
            target_protocol: InternetProtocol::Udp,
            target_ip: "2001:db8::10".parse().expect("target"),
            target_port_start: 53,
            target_port_end: 53,
            duration: Duration::from_secs(30),
        }
    }

    #[test]
    fn roundtrip_exposes_grant() {
        let response = Response::new(&data(), Arc::new(NoSecurity)).expect("response");
        let bytes = response.marshal().expect("marshal");
        assert_eq!(bytes[0], 0x90);
        assert_eq!(bytes[1], 24);

        let parsed = Response::unmarshal(&bytes, Arc::new(NoSecurity)).expect("unmarshal");
        let grant = parsed.grant().expect("grant");
        assert_eq!(grant.duration, Duration::from_secs(30));
        assert_eq!(grant.target_protocol, InternetProtocol::Udp);
        assert_eq!(grant.target_ip, data().target_ip);
        assert!(parsed.metadata.is_empty());
    }

    #[test]
    fn metadata_holds_client_uuid_only() {
        let response = Response::new(&data(), Arc::new(NoSecurity)).expect("response");
        assert_eq!(
            body::client_uuid(&response.metadata).expect("uuid"),
            data().client_uuid
        );
        assert!(body::client_uuid(&response.body).is_err());
    }

    #[test]
    fn zero_duration_cannot_be_granted() {
        let mut d = data();
        d.duration = Duration::ZERO;
        assert!(matches!(
            Response::new(&d, Arc::new(NoSecurity)),
            Err(PduError::Field(FieldError::BadInput(_)))
        ));
    }
}
