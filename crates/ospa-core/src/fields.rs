//! Fixed-width encoders and decoders for the values carried in request and
//! response bodies.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use uuid::Uuid;

pub const TIMESTAMP_LEN: usize = 8;
pub const PROTOCOL_LEN: usize = 1;
pub const PORT_LEN: usize = 2;
pub const IPV4_LEN: usize = 4;
pub const IPV6_LEN: usize = 16;
pub const DURATION_LEN: usize = 3;
pub const CLIENT_UUID_LEN: usize = 16;
pub const NONCE_LEN: usize = 3;

/// Largest grant expressible in the 24-bit duration field, in seconds.
pub const DURATION_MAX_SECS: u64 = (1 << (8 * DURATION_LEN)) - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("invalid bytes")]
    InvalidBytes,
    #[error("missing entry: {0}")]
    MissingEntry(&'static str),
    #[error("bad input: {0}")]
    BadInput(&'static str),
    #[error("violation of protocol spec: {0}")]
    ViolationOfProtocolSpec(&'static str),
}

/// IANA internet protocol numbers a client may request access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternetProtocol {
    Icmp,
    Ipv4,
    Tcp,
    Udp,
    Icmpv6,
}

impl InternetProtocol {
    pub const SUPPORTED: [InternetProtocol; 5] = [
        InternetProtocol::Icmp,
        InternetProtocol::Ipv4,
        InternetProtocol::Tcp,
        InternetProtocol::Udp,
        InternetProtocol::Icmpv6,
    ];

    pub fn number(self) -> u8 {
        match self {
            InternetProtocol::Icmp => 1,
            InternetProtocol::Ipv4 => 4,
            InternetProtocol::Tcp => 6,
            InternetProtocol::Udp => 17,
            InternetProtocol::Icmpv6 => 58,
        }
    }

    pub fn from_number(number: u8) -> Result<Self, FieldError> {
        Self::SUPPORTED
            .into_iter()
            .find(|proto| proto.number() == number)
            .ok_or(FieldError::BadInput("unsupported internet protocol"))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InternetProtocol::Icmp => "ICMP",
            InternetProtocol::Ipv4 => "IPv4",
            InternetProtocol::Tcp => "TCP",
            InternetProtocol::Udp => "UDP",
            InternetProtocol::Icmpv6 => "ICMPv6",
        }
    }

    /// TCP and UDP flows are addressed by port, so a zero port is meaningless.
    pub fn uses_ports(self) -> bool {
        matches!(self, InternetProtocol::Tcp | InternetProtocol::Udp)
    }
}

impl fmt::Display for InternetProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InternetProtocol {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::SUPPORTED
            .into_iter()
            .find(|proto| proto.as_str().eq_ignore_ascii_case(s))
            .ok_or(FieldError::BadInput("unsupported internet protocol"))
    }
}

pub fn encode_timestamp(ts: DateTime<Utc>) -> [u8; TIMESTAMP_LEN] {
    ts.timestamp().to_be_bytes()
}

pub fn decode_timestamp(bytes: &[u8]) -> Result<DateTime<Utc>, FieldError> {
    let raw: [u8; TIMESTAMP_LEN] = bytes.try_into().map_err(|_| FieldError::InvalidBytes)?;
    Utc.timestamp_opt(i64::from_be_bytes(raw), 0)
        .single()
        .ok_or(FieldError::BadInput("timestamp out of range"))
}

pub fn encode_protocol(proto: InternetProtocol) -> u8 {
    proto.number()
}

pub fn decode_protocol(bytes: &[u8]) -> Result<InternetProtocol, FieldError> {
    match bytes {
        [number] => InternetProtocol::from_number(*number),
        _ => Err(FieldError::InvalidBytes),
    }
}

pub fn encode_port(port: u16) -> [u8; PORT_LEN] {
    port.to_be_bytes()
}

/// Ports are two bytes on the wire, but a single byte is accepted as the low byte.
pub fn decode_port(bytes: &[u8]) -> Result<u16, FieldError> {
    match bytes {
        [low] => Ok(u16::from(*low)),
        [high, low] => Ok(u16::from_be_bytes([*high, *low])),
        _ => Err(FieldError::InvalidBytes),
    }
}

pub fn encode_ipv4(ip: IpAddr) -> Result<[u8; IPV4_LEN], FieldError> {
    match ip {
        IpAddr::V4(v4) => Ok(v4.octets()),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(|v4| v4.octets())
            .ok_or(FieldError::BadInput("input is not an ipv4 address")),
    }
}

pub fn decode_ipv4(bytes: &[u8]) -> Result<Ipv4Addr, FieldError> {
    let raw: [u8; IPV4_LEN] = bytes.try_into().map_err(|_| FieldError::InvalidBytes)?;
    Ok(Ipv4Addr::from(raw))
}

pub fn encode_ipv6(ip: IpAddr) -> Result<[u8; IPV6_LEN], FieldError> {
    match ip {
        IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => Ok(v6.octets()),
        _ => Err(FieldError::BadInput("input is not an ipv6 address")),
    }
}

pub fn decode_ipv6(bytes: &[u8]) -> Result<Ipv6Addr, FieldError> {
    let raw: [u8; IPV6_LEN] = bytes.try_into().map_err(|_| FieldError::InvalidBytes)?;
    Ok(Ipv6Addr::from(raw))
}

/// IPv4-mapped IPv6 addresses are treated as IPv4.
pub fn is_ipv6(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => false,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_none(),
    }
}

/// Canonical form used everywhere a rule or address is compared.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Whole seconds in `1..=DURATION_MAX_SECS`; sub-second remainders are dropped.
pub fn encode_duration(duration: Duration) -> Result<[u8; DURATION_LEN], FieldError> {
    let secs = duration.as_secs();
    if secs < 1 {
        return Err(FieldError::BadInput("duration too small"));
    }
    if secs > DURATION_MAX_SECS {
        return Err(FieldError::BadInput("duration too long"));
    }
    let wide = (secs as u32).to_be_bytes();
    Ok([wide[1], wide[2], wide[3]])
}

pub fn decode_duration(bytes: &[u8]) -> Result<Duration, FieldError> {
    let raw: [u8; DURATION_LEN] = bytes.try_into().map_err(|_| FieldError::InvalidBytes)?;
    let secs = u32::from_be_bytes([0, raw[0], raw[1], raw[2]]);
    Ok(Duration::from_secs(u64::from(secs)))
}

/// Accepts the hyphenated or the 32 hex character form.
pub fn encode_client_uuid(uuid: &str) -> Result<[u8; CLIENT_UUID_LEN], FieldError> {
    Uuid::parse_str(uuid.trim())
        .map(|parsed| *parsed.as_bytes())
        .map_err(|_| FieldError::BadInput("client uuid is not a valid uuid"))
}

/// Returns the canonical lowercase hyphenated form.
pub fn decode_client_uuid(bytes: &[u8]) -> Result<String, FieldError> {
    let uuid = Uuid::from_slice(bytes).map_err(|_| FieldError::InvalidBytes)?;
    Ok(uuid.hyphenated().to_string())
}

pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn random_transaction_id() -> u8 {
    let mut byte = [0u8; 1];
    OsRng.fill_bytes(&mut byte);
    byte[0]
}
