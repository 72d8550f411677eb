use std::fmt;
use std::sync::Arc;

use ospa_core::{fields, CipherError, CipherSuite, CipherSuiteId, Container};
use rand::rngs::OsRng;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::aes_cbc::{AesError, SessionKey};
use crate::resolver::PublicKeyResolver;

/// Outer (transmitted) container keys.
pub const ENCRYPTED_PAYLOAD_KEY: u8 = 1;
pub const ENCRYPTED_SESSION_KEY: u8 = 2;

/// Inner container keys, inside the AES payload.
pub const PACKET_KEY: u8 = 1;
pub const SIGNATURE_KEY: u8 = 2;
pub const PAYLOAD_NONCE_KEY: u8 = 3;

/// RSA-PKCS#1v1.5 session key wrap and SHA-256 signatures over
/// `header || body`, with the signed body sealed under AES-256-CBC.
pub struct RsaSha256Aes256Cbc {
    private: RsaPrivateKey,
    resolver: Arc<dyn PublicKeyResolver>,
}

impl fmt::Debug for RsaSha256Aes256Cbc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaSha256Aes256Cbc")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl RsaSha256Aes256Cbc {
    pub fn new(private: RsaPrivateKey, resolver: Arc<dyn PublicKeyResolver>) -> Self {
        Self { private, resolver }
    }

    fn sign(&self, header: &[u8], packet: &[u8]) -> Result<Vec<u8>, CipherError> {
        let digest = signed_digest(header, packet);
        self.private
            .sign_with_rng(&mut OsRng, Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|err| CipherError::Signing(err.to_string()))
    }

    fn resolve(&self, packet: &Container, metadata: &Container) -> Result<RsaPublicKey, CipherError> {
        self.resolver
            .public_key(packet, metadata)
            .map_err(|err| CipherError::KeyResolution(err.to_string()))
    }
}

fn signed_digest(header: &[u8], packet: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(header);
    hasher.update(packet);
    hasher.finalize().into()
}

impl From<AesError> for CipherError {
    fn from(err: AesError) -> Self {
        match err {
            AesError::InvalidSessionKey(len) => CipherError::InvalidSessionKey(len),
            AesError::NotBlockAligned | AesError::InvalidPadding => CipherError::DecryptFailed,
        }
    }
}

impl CipherSuite for RsaSha256Aes256Cbc {
    fn id(&self) -> CipherSuiteId {
        CipherSuiteId::RsaSha256Aes256Cbc
    }

    fn secure(
        &self,
        header: &[u8],
        body: &Container,
        metadata: &Container,
    ) -> Result<Container, CipherError> {
        let receiver = self.resolve(body, metadata)?;

        let packet = Zeroizing::new(body.to_bytes());
        let signature = self.sign(header, &packet)?;

        let mut payload = Container::new();
        payload.set(PACKET_KEY, packet.to_vec());
        payload.set(SIGNATURE_KEY, signature);
        payload.set(PAYLOAD_NONCE_KEY, fields::random_nonce());
        let plaintext = Zeroizing::new(payload.to_bytes());

        let session = SessionKey::generate();
        let ciphertext = session.encrypt(&plaintext);
        let wrapped = receiver
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &session.to_bytes())
            .map_err(|err| CipherError::Encrypt(err.to_string()))?;

        let mut out = Container::new();
        out.set(ENCRYPTED_PAYLOAD_KEY, ciphertext);
        out.set(ENCRYPTED_SESSION_KEY, wrapped);
        Ok(out)
    }

    fn unlock(&self, header: &[u8], encrypted: &Container) -> Result<Container, CipherError> {
        let wrapped = encrypted
            .get(ENCRYPTED_SESSION_KEY)
            .ok_or(CipherError::MissingEntry("encrypted session key"))?;
        let ciphertext = encrypted
            .get(ENCRYPTED_PAYLOAD_KEY)
            .ok_or(CipherError::MissingEntry("encrypted payload"))?;

        let session_bytes = Zeroizing::new(
            self.private
                .decrypt_blinded(&mut OsRng, Pkcs1v15Encrypt, wrapped)
                .map_err(|_| CipherError::DecryptFailed)?,
        );
        let session = SessionKey::from_bytes(&session_bytes)?;
        let plaintext = Zeroizing::new(session.decrypt(ciphertext)?);

        let payload = Container::parse(&plaintext)?;
        let packet = payload
            .get(PACKET_KEY)
            .ok_or(CipherError::MissingEntry("packet"))?;
        let signature = payload
            .get(SIGNATURE_KEY)
            .ok_or(CipherError::MissingEntry("signature"))?;
        let body = Container::parse(packet)?;

        let sender = self.resolve(&body, &Container::new())?;
        sender
            .verify(
                Pkcs1v15Sign::new::<Sha256>(),
                &signed_digest(header, packet),
                signature,
            )
            .map_err(|_| CipherError::SignatureInvalid)?;

        Ok(body)
    }
}
