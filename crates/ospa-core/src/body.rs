//! Typed accessors over the body [`Container`] of requests and responses.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::fields::{self, FieldError, InternetProtocol, NONCE_LEN};
use crate::tlv::Container;

pub const TIMESTAMP_KEY: u8 = 1;
pub const CLIENT_UUID_KEY: u8 = 2;
pub const PROTOCOL_KEY: u8 = 3;
pub const PORT_START_KEY: u8 = 4;
pub const PORT_END_KEY: u8 = 5;
pub const CLIENT_IPV4_KEY: u8 = 6;
pub const CLIENT_IPV6_KEY: u8 = 7;
pub const TARGET_IPV4_KEY: u8 = 8;
pub const TARGET_IPV6_KEY: u8 = 9;
pub const NONCE_KEY: u8 = 10;
pub const DURATION_KEY: u8 = 11;
/// Response bodies nest the granted flow under this key.
pub const FIREWALL_KEY: u8 = 12;

fn required<'a>(c: &'a Container, key: u8, name: &'static str) -> Result<&'a [u8], FieldError> {
    c.get(key).ok_or(FieldError::MissingEntry(name))
}

pub fn set_timestamp(c: &mut Container, ts: DateTime<Utc>) {
    c.set(TIMESTAMP_KEY, fields::encode_timestamp(ts));
}

pub fn timestamp(c: &Container) -> Result<DateTime<Utc>, FieldError> {
    fields::decode_timestamp(required(c, TIMESTAMP_KEY, "timestamp")?)
}

pub fn set_client_uuid(c: &mut Container, uuid: &str) -> Result<(), FieldError> {
    c.set(CLIENT_UUID_KEY, fields::encode_client_uuid(uuid)?);
    Ok(())
}

pub fn client_uuid(c: &Container) -> Result<String, FieldError> {
    fields::decode_client_uuid(required(c, CLIENT_UUID_KEY, "client uuid")?)
}

pub fn set_protocol(c: &mut Container, proto: InternetProtocol) {
    c.set_byte(PROTOCOL_KEY, fields::encode_protocol(proto));
}

pub fn protocol(c: &Container) -> Result<InternetProtocol, FieldError> {
    fields::decode_protocol(required(c, PROTOCOL_KEY, "target protocol")?)
}

pub fn set_port_start(c: &mut Container, port: u16) {
    c.set(PORT_START_KEY, fields::encode_port(port));
}

pub fn port_start(c: &Container) -> Result<u16, FieldError> {
    fields::decode_port(required(c, PORT_START_KEY, "target port start")?)
}

pub fn set_port_end(c: &mut Container, port: u16) {
    c.set(PORT_END_KEY, fields::encode_port(port));
}

pub fn port_end(c: &Container) -> Result<u16, FieldError> {
    fields::decode_port(required(c, PORT_END_KEY, "target port end")?)
}

pub fn set_duration(c: &mut Container, duration: Duration) -> Result<(), FieldError> {
    c.set(DURATION_KEY, fields::encode_duration(duration)?);
    Ok(())
}

pub fn duration(c: &Container) -> Result<Duration, FieldError> {
    fields::decode_duration(required(c, DURATION_KEY, "duration")?)
}

pub fn set_nonce(c: &mut Container, nonce: [u8; NONCE_LEN]) {
    c.set(NONCE_KEY, nonce);
}

pub fn nonce(c: &Container) -> Result<[u8; NONCE_LEN], FieldError> {
    required(c, NONCE_KEY, "nonce")?
        .try_into()
        .map_err(|_| FieldError::InvalidBytes)
}

pub fn set_client_ip(c: &mut Container, ip: IpAddr) -> Result<(), FieldError> {
    set_ip(c, ip, CLIENT_IPV4_KEY, CLIENT_IPV6_KEY)
}

pub fn client_ip(c: &Container) -> Result<IpAddr, FieldError> {
    ip(c, CLIENT_IPV4_KEY, CLIENT_IPV6_KEY, "client ip")
}

pub fn set_target_ip(c: &mut Container, ip: IpAddr) -> Result<(), FieldError> {
    set_ip(c, ip, TARGET_IPV4_KEY, TARGET_IPV6_KEY)
}

pub fn target_ip(c: &Container) -> Result<IpAddr, FieldError> {
    ip(c, TARGET_IPV4_KEY, TARGET_IPV6_KEY, "target ip")
}

fn set_ip(c: &mut Container, ip: IpAddr, v4_key: u8, v6_key: u8) -> Result<(), FieldError> {
    if fields::is_ipv6(ip) {
        c.set(v6_key, fields::encode_ipv6(ip)?);
    } else {
        c.set(v4_key, fields::encode_ipv4(ip)?);
    }
    Ok(())
}

/// Exactly one of the two address families must be present.
fn ip(c: &Container, v4_key: u8, v6_key: u8, name: &'static str) -> Result<IpAddr, FieldError> {
    match (c.get(v4_key), c.get(v6_key)) {
        (Some(_), Some(_)) => Err(FieldError::ViolationOfProtocolSpec(
            "both ipv4 and ipv6 entries present",
        )),
        (Some(v4), None) => fields::decode_ipv4(v4).map(IpAddr::V4),
        (None, Some(v6)) => fields::decode_ipv6(v6).map(IpAddr::V6),
        (None, None) => Err(FieldError::MissingEntry(name)),
    }
}

pub fn set_firewall(c: &mut Container, firewall: &Container) {
    c.set_container(FIREWALL_KEY, firewall);
}

pub fn firewall(c: &Container) -> Result<Container, FieldError> {
    match c.get_container(FIREWALL_KEY) {
        Some(Ok(nested)) => Ok(nested),
        Some(Err(_)) => Err(FieldError::InvalidBytes),
        None => Err(FieldError::MissingEntry("firewall")),
    }
}
