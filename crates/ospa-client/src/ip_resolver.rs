use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub const IPV4_RESOLVER_DEFAULT: &str = "https://ipv4.openspa.org";
pub const IPV6_RESOLVER_DEFAULT: &str = "https://ipv6.openspa.org";

const RESOLVER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum IpResolverError {
    #[error("invalid resolver url")]
    InvalidUrl,
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("resolver returned an unparsable ip {0:?}")]
    Parse(String),
}

#[async_trait]
pub trait IpResolver: Send + Sync + std::fmt::Debug {
    async fn public_ip(&self) -> Result<IpAddr, IpResolverError>;
}

#[derive(Debug, Deserialize)]
struct ResolverBody {
    #[serde(rename = "IP")]
    ip: String,
}

/// Asks an echo-ip service which address our requests come from.
#[derive(Debug, Clone)]
pub struct PublicIpResolver {
    url: String,
    http: reqwest::Client,
}

impl PublicIpResolver {
    pub fn new(url: impl Into<String>) -> Result<Self, IpResolverError> {
        let http = reqwest::Client::builder()
            .timeout(RESOLVER_TIMEOUT)
            .build()?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IpResolver for PublicIpResolver {
    async fn public_ip(&self) -> Result<IpAddr, IpResolverError> {
        if self.url.is_empty() {
            return Err(IpResolverError::InvalidUrl);
        }
        let body: ResolverBody = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.ip
            .parse()
            .map_err(|_| IpResolverError::Parse(body.ip))
    }
}

/// Resolve our public address in the same family as `target`.
pub async fn resolve_client_ip(
    ipv4_resolver: &str,
    ipv6_resolver: &str,
    target: IpAddr,
) -> Result<IpAddr, IpResolverError> {
    let url = if target.is_ipv6() {
        ipv6_resolver
    } else {
        ipv4_resolver
    };
    PublicIpResolver::new(url)?.public_ip().await
}

/// `Public IPv4: ...` / `Public IPv6: ...` report; a failing family shows its error.
pub async fn describe_public_ips(ipv4: &dyn IpResolver, ipv6: &dyn IpResolver) -> String {
    let mut out = String::new();
    for (label, resolver) in [("IPv4", ipv4), ("IPv6", ipv6)] {
        match resolver.public_ip().await {
            Ok(ip) => out.push_str(&format!("Public {label}: {ip}\n")),
            Err(err) => out.push_str(&format!("Public {label}: \nError: {err}\n")),
        }
    }
    out
}
