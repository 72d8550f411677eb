use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Default freshness window for request timestamps, also the replay retention.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Fresh,
    Duplicate,
}

/// SHA-256 digests of every accepted datagram, kept for one freshness window.
#[derive(Debug)]
pub struct ReplayCache {
    retention: Duration,
    state: Mutex<ReplayState>,
}

#[derive(Debug, Default)]
struct ReplayState {
    seen: HashMap<[u8; 32], Instant>,
    order: VecDeque<([u8; 32], Instant)>,
}

impl ReplayState {
    fn evict(&mut self, now: Instant, retention: Duration) {
        while let Some((digest, at)) = self.order.front().copied() {
            if now.saturating_duration_since(at) < retention {
                break;
            }
            self.order.pop_front();
            if self.seen.get(&digest) == Some(&at) {
                self.seen.remove(&digest);
            }
        }
    }
}

impl ReplayCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            state: Mutex::new(ReplayState::default()),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn check_and_record(&self, pdu: &[u8]) -> ReplayStatus {
        self.check_and_record_at(pdu, Instant::now())
    }

    fn check_and_record_at(&self, pdu: &[u8], now: Instant) -> ReplayStatus {
        let digest: [u8; 32] = Sha256::digest(pdu).into();
        let mut state = self.state.lock();
        state.evict(now, self.retention);
        if state.seen.contains_key(&digest) {
            return ReplayStatus::Duplicate;
        }
        state.seen.insert(digest, now);
        state.order.push_back((digest, now));
        ReplayStatus::Fresh
    }

    /// Evict expired digests without recording anything.
    pub fn purge(&self) {
        self.state.lock().evict(Instant::now(), self.retention);
    }

    pub fn len(&self) -> usize {
        self.state.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_FRESHNESS)
    }
}
