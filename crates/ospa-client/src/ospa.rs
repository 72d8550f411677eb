//! The `.ospa` client credential file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ospa_core::{CipherSuite, CipherSuiteId, ADK_SECRET_ENCODED_LEN};
use ospa_crypto::{
    cipher_suite_from_priority, decode_private_key, decode_public_key, parse_cipher_suite_priority,
    KeyError, StaticKeyResolver,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const OSPA_FILE_VERSION: &str = "0.2";

/// A PKIX PEM of a 1024 bit RSA public key is already longer than this.
const MIN_KEY_PEM_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum OspaError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("{context}: {source}")]
    Key {
        context: &'static str,
        #[source]
        source: KeyError,
    },
    #[error("cipher suite: {0}")]
    Cipher(#[from] ospa_core::CipherError),
}

fn invalid(msg: impl Into<String>) -> OspaError {
    OspaError::Invalid(msg.into())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OspaFile {
    pub version: String,
    #[serde(rename = "clientUUID")]
    pub client_uuid: String,
    pub server_host: String,
    pub server_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adk: Option<OspaAdk>,
    pub crypto: OspaCrypto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OspaAdk {
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OspaCrypto {
    pub cipher_suite_priority: Vec<String>,
    pub rsa: OspaRsa,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OspaRsa {
    pub client: OspaRsaClient,
    pub server: OspaRsaServer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OspaRsaClient {
    pub private_key: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OspaRsaServer {
    pub public_key: String,
}

impl OspaFile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OspaError> {
        let path = path.as_ref();
        debug!(target: "openspa::client", path = %path.display(), "reading ospa file");
        let raw = fs::read_to_string(path).map_err(|source| OspaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, OspaError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn to_yaml(&self) -> Result<String, OspaError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn verify(&self) -> Result<(), OspaError> {
        if self.version != OSPA_FILE_VERSION {
            return Err(invalid(format!("unsupported file version {:?}", self.version)));
        }
        if uuid::Uuid::parse_str(&self.client_uuid).is_err() {
            return Err(invalid("clientUUID invalid UUID"));
        }
        if self.server_host.is_empty() {
            return Err(invalid("server host invalid"));
        }
        if self.server_port == 0 || self.server_port == u16::MAX {
            return Err(invalid("server port invalid"));
        }
        if let Some(adk) = &self.adk {
            if adk.secret.len() != ADK_SECRET_ENCODED_LEN {
                return Err(invalid("adk: secret must be 7 characters"));
            }
        }
        self.crypto.verify()
    }

    pub fn adk_secret(&self) -> Option<&str> {
        self.adk.as_ref().map(|adk| adk.secret.as_str())
    }

    /// Client side suite: our private key, the server's public key.
    pub fn cipher_suite(&self) -> Result<Arc<dyn CipherSuite>, OspaError> {
        let priority = parse_cipher_suite_priority(&self.crypto.cipher_suite_priority)?;
        let private = decode_private_key(&self.crypto.rsa.client.private_key).map_err(|source| {
            OspaError::Key {
                context: "client private key",
                source,
            }
        })?;
        let server = decode_public_key(&self.crypto.rsa.server.public_key).map_err(|source| {
            OspaError::Key {
                context: "server public key",
                source,
            }
        })?;
        Ok(cipher_suite_from_priority(
            &priority,
            private,
            Arc::new(StaticKeyResolver::new(server)),
        )?)
    }
}

impl OspaCrypto {
    fn verify(&self) -> Result<(), OspaError> {
        if self.cipher_suite_priority.is_empty() {
            return Err(invalid("crypto: cipherSuitePriority empty"));
        }
        for name in &self.cipher_suite_priority {
            if name.parse::<CipherSuiteId>().is_err() {
                return Err(invalid(format!(
                    "crypto: cipherSuitePriority unsupported/unknown cipher: {name}"
                )));
            }
        }
        if self.rsa.client.private_key.len() < MIN_KEY_PEM_LEN {
            return Err(invalid("crypto: rsa: client: private key empty or too short"));
        }
        if self.rsa.client.public_key.len() < MIN_KEY_PEM_LEN {
            return Err(invalid("crypto: rsa: client: public key empty or too short"));
        }
        if self.rsa.server.public_key.len() < MIN_KEY_PEM_LEN {
            return Err(invalid("crypto: rsa: server: public key empty or too short"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ospa_crypto::{encode_private_key, encode_public_key, generate_rsa_keypair};

    use super::*;

    fn sample() -> OspaFile {
        let (client_private, client_public) = generate_rsa_keypair(1024).expect("client");
        let (_, server_public) = generate_rsa_keypair(1024).expect("server");
        OspaFile {
            version: OSPA_FILE_VERSION.to_string(),
            client_uuid: "c3b7a8e0-1b2c-4d5e-8f90-a1b2c3d4e5f6".to_string(),
            server_host: "openspa.example.org".to_string(),
            server_port: 22211,
            adk: None,
            crypto: OspaCrypto {
                cipher_suite_priority: vec!["CipherRSA_SHA256_AES256CBC".to_string()],
                rsa: OspaRsa {
                    client: OspaRsaClient {
                        private_key: encode_private_key(&client_private).expect("pem").to_string(),
                        public_key: encode_public_key(&client_public).expect("pem"),
                    },
                    server: OspaRsaServer {
                        public_key: encode_public_key(&server_public).expect("pem"),
                    },
                },
            },
        }
    }

    #[test]
    fn yaml_uses_camel_case_keys() {
        let file = sample();
        let yaml = file.to_yaml().expect("yaml");
        assert!(yaml.contains("clientUUID:"));
        assert!(yaml.contains("serverHost:"));
        assert!(yaml.contains("cipherSuitePriority:"));
        assert!(yaml.contains("privateKey:"));
        assert!(!yaml.contains("adk:"));
        assert_eq!(OspaFile::parse(&yaml).expect("parse"), file);
    }

    #[test]
    fn verify_accepts_generated_file_and_builds_suite() {
        let file = sample();
        file.verify().expect("valid");
        assert_eq!(
            file.cipher_suite().expect("suite").id(),
            CipherSuiteId::RsaSha256Aes256Cbc
        );
    }

    #[test]
    fn verify_names_the_failing_field() {
        let mut file = sample();
        file.version = "0.1".to_string();
        assert!(file.verify().expect_err("version").to_string().contains("version"));

        let mut file = sample();
        file.client_uuid = "alice".to_string();
        assert!(file.verify().expect_err("uuid").to_string().contains("clientUUID"));

        let mut file = sample();
        file.server_port = 0;
        assert!(file.verify().is_err());

        let mut file = sample();
        file.crypto.cipher_suite_priority = vec!["CipherNoSecurity".to_string()];
        assert!(file.verify().expect_err("cipher").to_string().contains("unknown cipher"));

        let mut file = sample();
        file.crypto.rsa.server.public_key = "short".to_string();
        assert!(file.verify().expect_err("key").to_string().contains("server"));

        let mut file = sample();
        file.adk = Some(OspaAdk {
            secret: "ABC".to_string(),
        });
        assert!(file.verify().expect_err("adk").to_string().contains("adk"));
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().expect("dir");
        let path = dir.path().join("client.ospa");
        let mut file = sample();
        file.adk = Some(OspaAdk {
            secret: ospa_core::generate_secret(),
        });
        fs::write(&path, file.to_yaml().expect("yaml")).expect("write");

        let read = OspaFile::from_file(&path).expect("read");
        read.verify().expect("valid");
        assert_eq!(read.adk_secret(), file.adk_secret());
        assert!(matches!(
            OspaFile::from_file(dir.path().join("missing.ospa")),
            Err(OspaError::Io { .. })
        ));
    }
}
