use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use ospa_core::{CipherSuite, CipherSuiteId, ADK_SECRET_ENCODED_LEN, DEFAULT_SERVER_PORT, DURATION_MAX_SECS};
use ospa_crypto::{
    cipher_suite_from_priority, parse_cipher_suite_priority, read_private_key, read_public_key,
    ClientUuidResolver, PublicKey, PublicKeyLookupDir,
};
use ospa_server::{
    AllowAllAuthorization, AuthorizationStrategy, CommandAuthorization, CommandExecutor,
    CommandFirewall, Firewall, IpTables, NoFirewall, ProcessExecutor, ServerBackends, ServerConfig,
    SimpleAuthorization, XdpMode, XdpSettings, DEFAULT_CHAIN, DEFAULT_REQUEST_HANDLERS,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_HTTP_PORT: u16 = 22212;
pub const DEFAULT_FRESHNESS: &str = "10m";
pub const DEFAULT_XDP_OBJECT_PATH: &str = "/usr/lib/openspa/ospa-xdp-ebpf.o";

/// `openspa server` configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFile {
    #[serde(default)]
    pub server: ServerSection,
    pub firewall: FirewallSection,
    pub authorization: AuthorizationSection,
    pub crypto: CryptoSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSection {
    pub ip: String,
    pub port: u16,
    pub request_handlers: usize,
    pub freshness: String,
    pub http: HttpSection,
    pub adk: AdkSection,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            ip: "::".to_string(),
            port: DEFAULT_SERVER_PORT,
            request_handlers: DEFAULT_REQUEST_HANDLERS,
            freshness: DEFAULT_FRESHNESS.to_string(),
            http: HttpSection::default(),
            adk: AdkSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSection {
    pub enable: bool,
    pub ip: String,
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            enable: true,
            ip: "::".to_string(),
            port: DEFAULT_HTTP_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdkSection {
    pub secret: String,
    pub xdp: XdpSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct XdpSection {
    pub mode: String,
    pub interfaces: Vec<String>,
    pub object_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallSection {
    pub backend: String,
    #[serde(default)]
    pub iptables: Option<IpTablesSection>,
    #[serde(default)]
    pub command: Option<FirewallCommandSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpTablesSection {
    #[serde(default = "default_chain")]
    pub chain: String,
}

fn default_chain() -> String {
    DEFAULT_CHAIN.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallCommandSection {
    #[serde(default)]
    pub rule_add: String,
    #[serde(default)]
    pub rule_remove: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_setup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationSection {
    pub backend: String,
    #[serde(default)]
    pub simple: Option<SimpleAuthorizationSection>,
    #[serde(default)]
    pub command: Option<CommandAuthorizationSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleAuthorizationSection {
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAuthorizationSection {
    #[serde(default)]
    pub authorization_cmd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoSection {
    pub cipher_suite_priority: Vec<String>,
    pub rsa: RsaSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaSection {
    pub client: RsaClientSection,
    pub server: RsaServerSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RsaClientSection {
    pub public_key_lookup_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RsaServerSection {
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
}

pub async fn load_server_config(path: &Path) -> Result<ServerFile> {
    let source = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read server config {}", path.display()))?;
    let file = ServerFile::parse(&source)
        .with_context(|| format!("server config {} is not valid YAML", path.display()))?;
    file.verify()
        .with_context(|| format!("invalid server config {}", path.display()))?;
    Ok(file)
}

impl ServerFile {
    /// Missing optional keys take their defaults.
    pub fn parse(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn verify(&self) -> Result<()> {
        self.server.verify().context("server")?;
        self.firewall.verify().context("firewall")?;
        self.authorization.verify().context("authorization")?;
        self.crypto.verify().context("crypto")?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(parse_ip(&self.server.ip)?, self.server.port))
    }

    pub fn http_addr(&self) -> Result<Option<SocketAddr>> {
        let http = &self.server.http;
        if !http.enable {
            return Ok(None);
        }
        Ok(Some(SocketAddr::new(parse_ip(&http.ip)?, http.port)))
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let freshness = humantime::parse_duration(&self.server.freshness)
            .context("server: freshness")?;
        let mut config = ServerConfig::default()
            .with_bind(self.bind_addr()?)
            .with_request_handlers(self.server.request_handlers)
            .with_freshness(freshness);

        let adk = &self.server.adk;
        if !adk.secret.is_empty() {
            config = config.with_adk_secret(adk.secret.clone());
        }
        let mode = adk.xdp.mode()?;
        let object_path = adk
            .xdp
            .object_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_XDP_OBJECT_PATH));
        for interface in &adk.xdp.interfaces {
            config = config.with_xdp(XdpSettings {
                interface: interface.clone(),
                mode,
                object_path: object_path.clone(),
                server_port: self.server.port,
                replace_if_loaded: true,
            });
        }
        Ok(config)
    }

    pub fn backends(&self) -> Result<ServerBackends> {
        let exec: Arc<dyn CommandExecutor> = Arc::new(ProcessExecutor);
        Ok(ServerBackends {
            cipher: self.crypto.cipher_suite()?,
            authorization: self.authorization.build(Arc::clone(&exec))?,
            firewall: self.firewall.build(exec),
        })
    }
}

impl ServerSection {
    fn verify(&self) -> Result<()> {
        parse_ip(&self.ip).context("invalid ip")?;
        ensure!(self.port != 0, "invalid port");
        humantime::parse_duration(&self.freshness).context("invalid freshness")?;
        self.http.verify().context("http")?;
        self.adk.verify().context("adk")?;
        Ok(())
    }
}

impl HttpSection {
    fn verify(&self) -> Result<()> {
        if self.enable {
            parse_ip(&self.ip).context("invalid http ip")?;
            ensure!(self.port != 0, "invalid port");
        }
        Ok(())
    }
}

impl AdkSection {
    fn verify(&self) -> Result<()> {
        if !self.secret.is_empty() {
            ensure!(
                self.secret.len() == ADK_SECRET_ENCODED_LEN,
                "encoded secret should be length {ADK_SECRET_ENCODED_LEN}"
            );
        }
        self.xdp.verify().context("xdp")?;
        if !self.xdp.interfaces.is_empty() {
            ensure!(!self.secret.is_empty(), "xdp requires an adk secret");
        }
        Ok(())
    }
}

impl XdpSection {
    fn mode(&self) -> Result<XdpMode> {
        if self.mode.is_empty() {
            return Ok(XdpMode::default());
        }
        Ok(self.mode.parse()?)
    }

    fn verify(&self) -> Result<()> {
        self.mode().context("unsupported mode")?;
        if !self.mode.is_empty() {
            ensure!(!self.interfaces.is_empty(), "missing interfaces");
        }
        ensure!(
            self.interfaces.iter().all(|iface| !iface.is_empty()),
            "empty interface name"
        );
        Ok(())
    }
}

impl FirewallSection {
    fn verify(&self) -> Result<()> {
        match self.backend.as_str() {
            "iptables" => {
                let Some(iptables) = &self.iptables else {
                    bail!("iptables field is missing");
                };
                ensure!(
                    self.command.is_none(),
                    "command is defined while using iptables backend"
                );
                ensure!(!iptables.chain.is_empty(), "iptables: chain parameter is empty");
            }
            "command" => {
                let Some(command) = &self.command else {
                    bail!("command field is missing");
                };
                ensure!(
                    self.iptables.is_none(),
                    "iptables is defined while using command backend"
                );
                ensure!(!command.rule_add.is_empty(), "command: rule add is empty");
                ensure!(!command.rule_remove.is_empty(), "command: rule remove is empty");
            }
            "none" => {}
            other => bail!("invalid backend {other:?}"),
        }
        Ok(())
    }

    fn build(&self, exec: Arc<dyn CommandExecutor>) -> Arc<dyn Firewall> {
        match (&self.iptables, &self.command) {
            (Some(iptables), _) if self.backend == "iptables" => {
                info!(target: "openspa::firewall", chain = %iptables.chain, "using iptables firewall backend");
                Arc::new(IpTables::new(iptables.chain.clone(), exec))
            }
            (_, Some(command)) if self.backend == "command" => {
                info!(target: "openspa::firewall", rule_add = %command.rule_add, "using command firewall backend");
                Arc::new(CommandFirewall::new(
                    command.firewall_setup.clone().filter(|cmd| !cmd.is_empty()),
                    command.rule_add.clone(),
                    command.rule_remove.clone(),
                    exec,
                ))
            }
            _ => {
                warn!(target: "openspa::firewall", "firewall backend none: rules are not enforced");
                Arc::new(NoFirewall)
            }
        }
    }
}

impl SimpleAuthorizationSection {
    fn duration(&self) -> Result<Duration> {
        let duration = humantime::parse_duration(&self.duration).context("duration parse")?;
        ensure!(
            duration >= Duration::from_secs(1),
            "duration is shorter than a second"
        );
        ensure!(
            duration.as_secs() <= DURATION_MAX_SECS,
            "duration is longer than max allowed duration"
        );
        Ok(duration)
    }
}

impl AuthorizationSection {
    fn verify(&self) -> Result<()> {
        match self.backend.as_str() {
            "simple" => {
                let Some(simple) = &self.simple else {
                    bail!("simple field is missing");
                };
                ensure!(
                    self.command.is_none(),
                    "command is defined while using simple backend"
                );
                simple.duration().context("simple")?;
            }
            "command" => {
                let Some(command) = &self.command else {
                    bail!("command field is missing");
                };
                ensure!(
                    self.simple.is_none(),
                    "simple is defined while using command backend"
                );
                ensure!(
                    !command.authorization_cmd.is_empty(),
                    "command: authorization cmd empty"
                );
            }
            "none" => {}
            other => bail!("invalid backend {other:?}"),
        }
        Ok(())
    }

    fn build(&self, exec: Arc<dyn CommandExecutor>) -> Result<Arc<dyn AuthorizationStrategy>> {
        Ok(match (self.backend.as_str(), &self.simple, &self.command) {
            ("simple", Some(simple), _) => Arc::new(SimpleAuthorization::new(simple.duration()?)),
            ("command", _, Some(command)) => Arc::new(CommandAuthorization::new(
                command.authorization_cmd.clone(),
                exec,
            )),
            ("none", _, _) => {
                warn!(target: "openspa::server", "authorization backend none: every request is granted");
                Arc::new(AllowAllAuthorization)
            }
            (backend, _, _) => bail!("authorization: invalid backend {backend:?}"),
        })
    }
}

impl CryptoSection {
    fn verify(&self) -> Result<()> {
        ensure!(!self.cipher_suite_priority.is_empty(), "cipherSuitePriority empty");
        for name in &self.cipher_suite_priority {
            ensure!(
                name.parse::<CipherSuiteId>().is_ok(),
                "cipherSuitePriority unsupported/unknown cipher: {name}"
            );
        }
        ensure!(
            self.rsa.client.public_key_lookup_dir.is_dir(),
            "rsa: client: public key lookup dir does not exist"
        );
        ensure!(
            self.rsa.server.private_key_path.is_file(),
            "rsa: server: private key path file does not exist"
        );
        ensure!(
            self.rsa.server.public_key_path.is_file(),
            "rsa: server: public key path file does not exist"
        );
        Ok(())
    }

    /// Server side suite: our private key, client keys looked up by UUID.
    pub fn cipher_suite(&self) -> Result<Arc<dyn CipherSuite>> {
        let priority = parse_cipher_suite_priority(&self.cipher_suite_priority)?;
        let server = &self.rsa.server;
        let private = read_private_key(&server.private_key_path).context("server private key")?;
        let public = read_public_key(&server.public_key_path).context("server public key")?;
        ensure!(
            PublicKey::from(&private) == public,
            "server public key {} does not belong to the private key",
            server.public_key_path.display()
        );
        let lookup = PublicKeyLookupDir::new(&self.rsa.client.public_key_lookup_dir);
        Ok(cipher_suite_from_priority(
            &priority,
            private,
            Arc::new(ClientUuidResolver::new(lookup)),
        )?)
    }
}

fn parse_ip(raw: &str) -> Result<IpAddr> {
    raw.parse()
        .with_context(|| format!("{raw:?} is not an ip address"))
}
