//! OpenSPA client.
//!
//! [`Client::request`] sends one access request and returns the server's
//! [`Grant`](ospa_core::Grant); [`Client::auto_mode`] keeps renewing it.
//! Credentials come from an [`OspaFile`].

mod client;
pub mod ip_resolver;
pub mod ospa;
mod sender;

pub use client::{
    resolve_server, AccessRequest, Client, ClientConfig, ClientError, DEFAULT_RETRY_COUNT,
    DEFAULT_TIMEOUT,
};
pub use ip_resolver::{
    describe_public_ips, resolve_client_ip, IpResolver, IpResolverError, PublicIpResolver,
    IPV4_RESOLVER_DEFAULT, IPV6_RESOLVER_DEFAULT,
};
pub use ospa::{OspaError, OspaFile, OSPA_FILE_VERSION};
pub use sender::{SendError, UdpSend, UdpSender};
