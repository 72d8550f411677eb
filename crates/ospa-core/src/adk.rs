//! Anti-DoS Knocking (ADK) proofs.
//!
//! A proof is a 9 digit TOTP code (HMAC-SHA1, 60 second period) derived from
//! a short shared secret. It travels in clear text in the header so a kernel
//! fast path can discard unauthenticated datagrams before any crypto runs.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use thiserror::Error;

/// Raw secret length in bytes.
pub const ADK_SECRET_LEN: usize = 4;
/// Length of the base32 (unpadded) secret.
pub const ADK_SECRET_ENCODED_LEN: usize = 7;
/// TOTP period.
pub const ADK_PERIOD: Duration = Duration::from_secs(60);
/// Number of decimal digits in a proof.
pub const ADK_DIGITS: u32 = 9;

const PROVER_CACHE: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdkError {
    #[error("adk secret is not valid base32")]
    InvalidSecret,
    #[error("adk proof mismatch")]
    ProofMismatch,
}

/// Generate a fresh secret encoded as 7 base32 characters.
pub fn generate_secret() -> String {
    let mut raw = [0u8; ADK_SECRET_LEN];
    OsRng.fill_bytes(&mut raw);
    BASE32_NOPAD.encode(&raw)
}

fn decode_secret(secret: &str) -> Result<Vec<u8>, AdkError> {
    let normalized = secret.trim().trim_end_matches('=').to_ascii_uppercase();
    if normalized.is_empty() {
        return Err(AdkError::InvalidSecret);
    }
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| AdkError::InvalidSecret)
}

fn hotp(key: &[u8], counter: u64) -> Result<u32, AdkError> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| AdkError::InvalidSecret)?;
    mac.update(&counter.to_be_bytes());
    let sum = mac.finalize().into_bytes();

    let offset = (sum[sum.len() - 1] & 0x0f) as usize;
    let truncated = (u32::from(sum[offset] & 0x7f) << 24)
        | (u32::from(sum[offset + 1]) << 16)
        | (u32::from(sum[offset + 2]) << 8)
        | u32::from(sum[offset + 3]);
    Ok(truncated % 10u32.pow(ADK_DIGITS))
}

fn counter_at(at: SystemTime) -> u64 {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    secs / ADK_PERIOD.as_secs()
}

/// Proof for the window containing `at`.
pub fn generate_proof(secret: &str, at: SystemTime) -> Result<u32, AdkError> {
    let key = decode_secret(secret)?;
    hotp(&key, counter_at(at))
}

/// Proof for the window following the one containing `at`.
pub fn generate_next_proof(secret: &str, at: SystemTime) -> Result<u32, AdkError> {
    generate_proof(secret, at + ADK_PERIOD)
}

/// Produces proofs for the current window, recomputing at most once a second.
#[derive(Debug)]
pub struct AdkProver {
    key: Vec<u8>,
    cache: Mutex<(Instant, u32)>,
}

impl AdkProver {
    pub fn new(secret: &str) -> Result<Self, AdkError> {
        let key = decode_secret(secret)?;
        let proof = hotp(&key, counter_at(SystemTime::now()))?;
        Ok(Self {
            key,
            cache: Mutex::new((Instant::now(), proof)),
        })
    }

    pub fn proof(&self) -> Result<u32, AdkError> {
        let mut cache = self.cache.lock();
        if cache.0.elapsed() > PROVER_CACHE {
            let proof = hotp(&self.key, counter_at(SystemTime::now()))?;
            *cache = (Instant::now(), proof);
        }
        Ok(cache.1)
    }

    /// Proof for the window following the current one.
    pub fn next_proof(&self) -> Result<u32, AdkError> {
        hotp(&self.key, counter_at(SystemTime::now() + ADK_PERIOD))
    }

    /// Accepts the current window and one window of skew on either side.
    pub fn valid(&self, proof: u32) -> Result<(), AdkError> {
        if proof == 0 {
            return Err(AdkError::ProofMismatch);
        }
        if self.proof()? == proof {
            return Ok(());
        }
        let counter = counter_at(SystemTime::now());
        for candidate in [counter.saturating_sub(1), counter + 1] {
            if hotp(&self.key, candidate)? == proof {
                return Ok(());
            }
        }
        Err(AdkError::ProofMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_has_expected_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), ADK_SECRET_ENCODED_LEN);
        assert_eq!(decode_secret(&secret).expect("decode").len(), ADK_SECRET_LEN);
    }

    #[test]
    fn hotp_matches_rfc4226_vectors() {
        // RFC 4226 appendix D, truncated to 6 digits there; we keep 9.
        let key = b"12345678901234567890";
        assert_eq!(hotp(key, 0).expect("hotp") % 1_000_000, 755_224);
        assert_eq!(hotp(key, 1).expect("hotp") % 1_000_000, 287_082);
        assert_eq!(hotp(key, 9).expect("hotp") % 1_000_000, 520_489);
    }

    #[test]
    fn proof_is_stable_within_a_window() {
        let secret = generate_secret();
        let start = UNIX_EPOCH + Duration::from_secs(60 * 1000);
        let a = generate_proof(&secret, start).expect("proof");
        let b = generate_proof(&secret, start + Duration::from_secs(59)).expect("proof");
        let next = generate_next_proof(&secret, start).expect("next");
        assert_eq!(a, b);
        assert_eq!(
            next,
            generate_proof(&secret, start + Duration::from_secs(60)).expect("proof")
        );
        assert!(a < 1_000_000_000);
    }

    #[test]
    fn prover_validates_current_and_neighbours() {
        let secret = generate_secret();
        let prover = AdkProver::new(&secret).expect("prover");
        let now = SystemTime::now();
        prover
            .valid(generate_proof(&secret, now).expect("proof"))
            .expect("current window");
        prover.valid(prover.next_proof().expect("next")).expect("next window");
        assert_eq!(prover.valid(0), Err(AdkError::ProofMismatch));
    }

    #[test]
    fn rejects_garbage_secret() {
        assert_eq!(AdkProver::new("!!").unwrap_err(), AdkError::InvalidSecret);
        assert_eq!(generate_proof("", SystemTime::now()), Err(AdkError::InvalidSecret));
    }
}
