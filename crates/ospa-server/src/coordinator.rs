use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Worker count used when the configuration does not set one.
pub const DEFAULT_REQUEST_HANDLERS: usize = 100;

/// A received datagram; `data` is a private copy of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub peer: SocketAddr,
}

#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn handle(&self, datagram: Datagram);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("request coordinator is stopped")]
    Stopped,
}

type Job = (Datagram, OwnedSemaphorePermit);

/// Fixed pool of workers fed through a bounded queue.
///
/// A submission holds one of `workers` permits until its handler returns, so
/// with every worker busy the next `submit` waits. With zero workers nothing
/// is ever admitted.
pub struct RequestCoordinator {
    permits: Arc<Semaphore>,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("available", &self.permits.available_permits())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl RequestCoordinator {
    pub fn new(workers: usize, handler: Arc<dyn DatagramHandler>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(workers.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some((datagram, permit)) = job else {
                            break;
                        };
                        handler.handle(datagram).await;
                        drop(permit);
                    }
                    debug!(target: "openspa::server", worker = id, "request worker exited");
                })
            })
            .collect();

        Self {
            permits: Arc::new(Semaphore::new(workers)),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub async fn submit(&self, datagram: Datagram) -> Result<(), CoordinatorError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        let tx = self.tx.lock().clone().ok_or(CoordinatorError::Stopped)?;
        tx.send((datagram, permit))
            .await
            .map_err(|_| CoordinatorError::Stopped)
    }

    /// Close the queue, let the workers drain it and wait for them to exit.
    pub async fn stop(&self) {
        self.tx.lock().take();
        self.permits.close();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(target: "openspa::server", error = %err, "request worker panicked");
            }
        }
    }
}

/// How the listener hands datagrams over: a bounded worker pool, or a task
/// per datagram when the handler count is configured as zero.
pub enum Dispatch {
    Workers(RequestCoordinator),
    Unbounded(Arc<dyn DatagramHandler>),
}

impl Dispatch {
    pub fn new(workers: usize, handler: Arc<dyn DatagramHandler>) -> Self {
        if workers == 0 {
            Dispatch::Unbounded(handler)
        } else {
            Dispatch::Workers(RequestCoordinator::new(workers, handler))
        }
    }

    pub async fn dispatch(&self, datagram: Datagram) -> Result<(), CoordinatorError> {
        match self {
            Dispatch::Workers(coordinator) => coordinator.submit(datagram).await,
            Dispatch::Unbounded(handler) => {
                let handler = Arc::clone(handler);
                tokio::spawn(async move { handler.handle(datagram).await });
                Ok(())
            }
        }
    }

    pub async fn stop(&self) {
        if let Dispatch::Workers(coordinator) = self {
            coordinator.stop().await;
        }
    }
}
