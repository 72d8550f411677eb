use std::fs;
use std::path::{Path, PathBuf};

use ospa_core::{body, Container};
use rsa::RsaPublicKey;

use crate::keys::{decode_public_key, KeyError};

/// Locates the peer's public key for a packet.
///
/// `secure` passes the plaintext body together with the caller's metadata,
/// `unlock` passes the decrypted body and an empty metadata container.
pub trait PublicKeyResolver: Send + Sync + std::fmt::Debug {
    fn public_key(&self, body: &Container, metadata: &Container) -> Result<RsaPublicKey, KeyError>;
}

/// Maps a client UUID to that client's public key.
pub trait PublicKeyLookup: Send + Sync + std::fmt::Debug {
    fn lookup_public_key(&self, client_uuid: &str) -> Result<RsaPublicKey, KeyError>;
}

/// Always resolves to the same key; the client uses this for the server key.
#[derive(Debug, Clone)]
pub struct StaticKeyResolver {
    key: RsaPublicKey,
}

impl StaticKeyResolver {
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }
}

impl PublicKeyResolver for StaticKeyResolver {
    fn public_key(&self, _body: &Container, _metadata: &Container) -> Result<RsaPublicKey, KeyError> {
        Ok(self.key.clone())
    }
}

/// Server side resolver: the client UUID is read from the request body, or
/// from the metadata when securing a response.
#[derive(Debug)]
pub struct ClientUuidResolver<L> {
    lookup: L,
}

impl<L: PublicKeyLookup> ClientUuidResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }
}

impl<L: PublicKeyLookup> PublicKeyResolver for ClientUuidResolver<L> {
    fn public_key(&self, packet: &Container, metadata: &Container) -> Result<RsaPublicKey, KeyError> {
        let uuid = body::client_uuid(packet).or_else(|_| body::client_uuid(metadata))?;
        self.lookup.lookup_public_key(&uuid)
    }
}

/// Reads `<uuid>` or `<uuid>.<ext>` from a directory on every lookup, so
/// keys can be added or revoked without a restart.
#[derive(Debug, Clone)]
pub struct PublicKeyLookupDir {
    dir: PathBuf,
}

impl PublicKeyLookupDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn filename_matches(client_uuid: &str, filename: &str) -> bool {
    if filename == client_uuid {
        return true;
    }
    match filename.rsplit_once('.') {
        Some((stem, _)) => stem == client_uuid,
        None => false,
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> KeyError {
    let path = path.to_path_buf();
    move |source| KeyError::Io { path, source }
}

impl PublicKeyLookup for PublicKeyLookupDir {
    fn lookup_public_key(&self, client_uuid: &str) -> Result<RsaPublicKey, KeyError> {
        let entries = fs::read_dir(&self.dir).map_err(io_err(&self.dir))?;
        for entry in entries {
            let entry = entry.map_err(io_err(&self.dir))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if filename_matches(client_uuid, name) {
                let pem = fs::read_to_string(&path).map_err(io_err(&path))?;
                return decode_public_key(&pem);
            }
        }
        Err(KeyError::NotFound(client_uuid.to_string()))
    }
}
