//! Cipher suites for OpenSPA.
//!
//! Only `CipherRSA_SHA256_AES256CBC` is implemented. Key material is loaded
//! from PEM and the peer's key is located per packet through a
//! [`PublicKeyResolver`], so the same suite type serves both the client
//! (static server key) and the server (key directory keyed by client UUID).

mod aes_cbc;
mod keys;
mod resolver;
mod suite;

use std::sync::Arc;

use ospa_core::{CipherError, CipherSuite, CipherSuiteId};
use rsa::RsaPrivateKey;

pub use aes_cbc::{AesError, SessionKey, SESSION_KEY_LEN};
pub use keys::{
    decode_private_key, decode_public_key, encode_private_key, encode_public_key,
    generate_rsa_keypair, read_private_key, read_public_key, KeyError, DEFAULT_RSA_BITS,
};
pub use resolver::{
    ClientUuidResolver, PublicKeyLookup, PublicKeyLookupDir, PublicKeyResolver, StaticKeyResolver,
};
pub use rsa::{RsaPrivateKey as PrivateKey, RsaPublicKey as PublicKey};
pub use suite::RsaSha256Aes256Cbc;

/// Parse a configured cipher suite priority list, preserving order.
pub fn parse_cipher_suite_priority<S: AsRef<str>>(
    names: &[S],
) -> Result<Vec<CipherSuiteId>, CipherError> {
    names.iter().map(|name| name.as_ref().parse()).collect()
}

/// Instantiate the first supported suite of a priority list.
pub fn cipher_suite_from_priority(
    priority: &[CipherSuiteId],
    private: RsaPrivateKey,
    resolver: Arc<dyn PublicKeyResolver>,
) -> Result<Arc<dyn CipherSuite>, CipherError> {
    match priority.first() {
        Some(CipherSuiteId::RsaSha256Aes256Cbc) => {
            Ok(Arc::new(RsaSha256Aes256Cbc::new(private, resolver)))
        }
        Some(other) => Err(CipherError::UnknownSuite(other.name().to_string())),
        None => Err(CipherError::UnknownSuite("empty priority list".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_names_parse_in_order() {
        let parsed = parse_cipher_suite_priority(&["CipherRSA_SHA256_AES256CBC"]).expect("parse");
        assert_eq!(parsed, vec![CipherSuiteId::RsaSha256Aes256Cbc]);
        assert!(parse_cipher_suite_priority(&["CipherRSA_SHA256_AES256CBC", "Rot13"]).is_err());
    }

    #[test]
    fn empty_priority_is_rejected() {
        let (private, public) = generate_rsa_keypair(1024).expect("keypair");
        let resolver: Arc<dyn PublicKeyResolver> = Arc::new(StaticKeyResolver::new(public));
        assert!(cipher_suite_from_priority(&[], private.clone(), resolver.clone()).is_err());
        let suite = cipher_suite_from_priority(
            &[CipherSuiteId::RsaSha256Aes256Cbc],
            private,
            resolver,
        )
        .expect("suite");
        assert_eq!(suite.id(), CipherSuiteId::RsaSha256Aes256Cbc);
    }
}
