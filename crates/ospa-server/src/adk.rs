use std::sync::Arc;
use std::time::Duration;

use ospa_core::{AdkError, AdkProver};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error};

/// How often the expected proofs are pushed to the fast path.
pub const ADK_SYNC_PERIOD: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum AdkSyncError {
    #[error("adk proof: {0}")]
    Proof(#[from] AdkError),
    #[error("refusing to install a zero adk proof")]
    ZeroProof,
    #[error("adk proof sink: {0}")]
    Sink(String),
}

/// Receives the proofs the fast path should accept.
pub trait AdkProofSink: Send + Sync + std::fmt::Debug {
    fn set_proofs(&self, current: u32, next: u32) -> Result<(), AdkSyncError>;
}

struct SyncTask {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Periodically writes the current and next proof into an [`AdkProofSink`].
pub struct AdkProofSynchronizer {
    prover: Arc<AdkProver>,
    sink: Arc<dyn AdkProofSink>,
    period: Duration,
    task: Mutex<Option<SyncTask>>,
}

impl std::fmt::Debug for AdkProofSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdkProofSynchronizer")
            .field("sink", &self.sink)
            .field("period", &self.period)
            .field("running", &self.task.lock().is_some())
            .finish()
    }
}

impl AdkProofSynchronizer {
    pub fn new(prover: Arc<AdkProver>, sink: Arc<dyn AdkProofSink>) -> Self {
        Self {
            prover,
            sink,
            period: ADK_SYNC_PERIOD,
            task: Mutex::new(None),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn sync_once(&self) -> Result<(), AdkSyncError> {
        sync(&self.prover, self.sink.as_ref())
    }

    /// Start syncing; the first sync happens immediately. No-op when running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let prover = Arc::clone(&self.prover);
        let sink = Arc::clone(&self.sink);
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Err(err) = sync(&prover, sink.as_ref()) {
                            error!(target: "openspa::adk", error = %err, "failed to set adk proof");
                        }
                    }
                }
            }
        });
        *task = Some(SyncTask { shutdown, join });
    }

    /// Stop syncing. Safe to call more than once.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            let _ = task.join.await;
            debug!(target: "openspa::adk", "adk proof synchronizer stopped");
        }
    }
}

fn sync(prover: &AdkProver, sink: &dyn AdkProofSink) -> Result<(), AdkSyncError> {
    let current = prover.proof()?;
    let next = prover.next_proof()?;
    if current == 0 || next == 0 {
        return Err(AdkSyncError::ZeroProof);
    }
    sink.set_proofs(current, next)
}
