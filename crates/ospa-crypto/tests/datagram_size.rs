use std::sync::Arc;

use ospa_core::{
    body, CipherSuite, FirewallRequest, InternetProtocol, PduError, Request, RequestData,
    MAX_PDU_SIZE,
};
use ospa_crypto::{generate_rsa_keypair, RsaSha256Aes256Cbc, StaticKeyResolver, DEFAULT_RSA_BITS};

/// A suite that talks to itself: it signs and unlocks with the same keypair.
fn loopback_suite() -> Arc<dyn CipherSuite> {
    let (private, public) = generate_rsa_keypair(DEFAULT_RSA_BITS).expect("keypair");
    Arc::new(RsaSha256Aes256Cbc::new(
        private,
        Arc::new(StaticKeyResolver::new(public)),
    ))
}

fn widest_request() -> RequestData {
    RequestData {
        transaction_id: 255,
        client_uuid: "3f2504e0-4f89-11d3-9a0c-0305e82c3301".to_string(),
        client_ip: "2001:db8:ffff:ffff:ffff:ffff:ffff:ffff".parse().expect("client ip"),
        target_protocol: InternetProtocol::Udp,
        target_ip: "2001:db8:ffff:ffff:ffff:ffff:ffff:fffe".parse().expect("target ip"),
        target_port_start: 1,
        target_port_end: 65535,
    }
}

#[test]
fn rsa_sealed_ipv6_request_fits_in_one_datagram() {
    let suite = loopback_suite();
    let mut request = Request::new(&widest_request(), suite.clone()).expect("request");
    request.set_adk_proof(u32::MAX);

    let bytes = request.marshal().expect("marshal");
    assert!(
        bytes.len() <= MAX_PDU_SIZE,
        "sealed request is {} bytes",
        bytes.len()
    );

    let parsed = Request::unmarshal(&bytes, suite).expect("unmarshal");
    let fw = FirewallRequest::from_body(&parsed.body).expect("firewall request");
    assert!(fw.is_ipv6());
    assert_eq!(fw.target_port_end, 65535);
}

#[test]
fn rsa_seal_rejects_oversized_body() {
    let suite = loopback_suite();
    let mut request = Request::new(&widest_request(), suite).expect("request");
    request.body.set(body::NONCE_KEY + 100, vec![0xAB; MAX_PDU_SIZE]);

    assert!(matches!(request.marshal(), Err(PduError::TooLarge(len)) if len > MAX_PDU_SIZE));
}
