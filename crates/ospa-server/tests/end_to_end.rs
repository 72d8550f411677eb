use std::fs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ospa_core::{CipherSuite, InternetProtocol, Request, RequestData, Response};
use ospa_crypto::{
    encode_public_key, generate_rsa_keypair, ClientUuidResolver, PublicKeyLookupDir,
    RsaSha256Aes256Cbc, StaticKeyResolver,
};
use ospa_server::{
    Firewall, FirewallError, FirewallRule, RuleMetadata, Server, ServerBackends, ServerConfig,
    ServerMetrics, SimpleAuthorization,
};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

const CLIENT_UUID: &str = "c3b7a8e0-1b2c-4d5e-8f90-a1b2c3d4e5f6";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Add(FirewallRule),
    Remove(FirewallRule),
}

#[derive(Debug, Default)]
struct Recorder {
    events: Mutex<Vec<(Instant, Event)>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }
}

#[async_trait]
impl Firewall for Recorder {
    async fn firewall_setup(&self) -> Result<(), FirewallError> {
        Ok(())
    }

    async fn rule_add(&self, rule: &FirewallRule, _meta: &RuleMetadata) -> Result<(), FirewallError> {
        self.events
            .lock()
            .push((Instant::now(), Event::Add(rule.clone())));
        Ok(())
    }

    async fn rule_remove(
        &self,
        rule: &FirewallRule,
        _meta: &RuleMetadata,
    ) -> Result<(), FirewallError> {
        self.events
            .lock()
            .push((Instant::now(), Event::Remove(rule.clone())));
        Ok(())
    }
}

struct Suites {
    client: Arc<dyn CipherSuite>,
    server: Arc<dyn CipherSuite>,
    _keys: tempfile::TempDir,
}

fn rsa_suites() -> Suites {
    let (client_private, client_public) = generate_rsa_keypair(2048).expect("client keypair");
    let (server_private, server_public) = generate_rsa_keypair(2048).expect("server keypair");

    let keys = tempfile::tempdir().expect("key dir");
    fs::write(
        keys.path().join(format!("{CLIENT_UUID}.pub")),
        encode_public_key(&client_public).expect("encode"),
    )
    .expect("write client key");

    let server = RsaSha256Aes256Cbc::new(
        server_private,
        Arc::new(ClientUuidResolver::new(PublicKeyLookupDir::new(keys.path()))),
    );
    let client = RsaSha256Aes256Cbc::new(
        client_private,
        Arc::new(StaticKeyResolver::new(server_public)),
    );
    Suites {
        client: Arc::new(client),
        server: Arc::new(server),
        _keys: keys,
    }
}

fn request_data() -> RequestData {
    RequestData {
        transaction_id: 42,
        client_uuid: CLIENT_UUID.to_string(),
        client_ip: "88.200.23.30".parse().expect("client ip"),
        target_protocol: InternetProtocol::Tcp,
        target_ip: "88.200.23.19".parse().expect("target ip"),
        target_port_start: 3000,
        target_port_end: 8000,
    }
}

#[tokio::test]
async fn rsa_request_is_granted_and_rule_expires() {
    let suites = rsa_suites();
    let firewall = Arc::new(Recorder::default());
    let backends = ServerBackends {
        cipher: suites.server.clone(),
        authorization: Arc::new(SimpleAuthorization::new(Duration::from_secs(1))),
        firewall: firewall.clone(),
    };
    let config = ServerConfig::default()
        .with_bind("127.0.0.1:0".parse().expect("bind"))
        .with_request_handlers(4);
    let server = Arc::new(
        Server::bind(config, backends, ServerMetrics::disabled())
            .await
            .expect("server"),
    );
    let server_addr = server.local_addr().expect("server addr");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run(shutdown_rx).await })
    };

    let request = Request::new(&request_data(), suites.client.clone()).expect("request");
    let bytes = request.marshal().expect("marshal");
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("client socket");
    socket.send_to(&bytes, server_addr).await.expect("send");

    let mut buf = vec![0u8; 2048];
    let (len, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("response in time")
        .expect("recv");
    assert_eq!(from, server_addr);

    let response = Response::unmarshal(&buf[..len], suites.client.clone()).expect("response");
    assert_eq!(response.header.transaction_id, 42);
    let grant = response.grant().expect("grant");
    assert_eq!(grant.duration, Duration::from_secs(1));
    assert_eq!(grant.target_protocol, InternetProtocol::Tcp);
    assert_eq!((grant.target_port_start, grant.target_port_end), (3000, 8000));

    let expected = FirewallRule {
        proto: InternetProtocol::Tcp,
        src_ip: "88.200.23.30".parse().expect("src"),
        dst_ip: "88.200.23.19".parse().expect("dst"),
        dst_port_start: 3000,
        dst_port_end: 8000,
    };
    assert_eq!(firewall.events(), vec![Event::Add(expected.clone())]);

    timeout(Duration::from_secs(4), async {
        while firewall.events().len() < 2 {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("rule removed after its duration");

    let events = firewall.events.lock().clone();
    assert_eq!(
        events.iter().map(|(_, e)| e.clone()).collect::<Vec<_>>(),
        vec![Event::Add(expected.clone()), Event::Remove(expected)]
    );
    let lifetime = events[1].0 - events[0].0;
    assert!(lifetime >= Duration::from_secs(1), "{lifetime:?}");
    assert!(lifetime < Duration::from_millis(2500), "{lifetime:?}");

    shutdown_tx.send(true).expect("shutdown");
    serving.await.expect("join").expect("run");
    server.close().await;
    assert_eq!(firewall.events().len(), 2);
}

#[tokio::test]
async fn unknown_client_gets_no_reply() {
    let suites = rsa_suites();
    let firewall = Arc::new(Recorder::default());
    let backends = ServerBackends {
        cipher: suites.server.clone(),
        authorization: Arc::new(SimpleAuthorization::new(Duration::from_secs(30))),
        firewall: firewall.clone(),
    };
    let server = Arc::new(
        Server::bind(
            ServerConfig::default().with_bind("127.0.0.1:0".parse().expect("bind")),
            backends,
            ServerMetrics::disabled(),
        )
        .await
        .expect("server"),
    );
    let server_addr = server.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run(shutdown_rx).await })
    };

    let mut data = request_data();
    data.client_uuid = "0d6f3c8e-9a51-4b7e-a0f2-5c1e7d9b3a44".to_string();
    let bytes = Request::new(&data, suites.client.clone())
        .expect("request")
        .marshal()
        .expect("marshal");
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("client socket");
    socket.send_to(&bytes, server_addr).await.expect("send");

    let mut buf = vec![0u8; 2048];
    assert!(timeout(Duration::from_millis(500), socket.recv_from(&mut buf))
        .await
        .is_err());
    assert!(firewall.events().is_empty());

    shutdown_tx.send(true).expect("shutdown");
    serving.await.expect("join").expect("run");
    server.close().await;
}
