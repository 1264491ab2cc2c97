use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Restart policy for a process.
#[derive(Debug, Clone, Copy, Default)]
pub struct Params {
    /// Re-run the process after every return until cancellation fires.
    pub restart: bool,
    /// Pause between restarts.
    pub delay: Duration,
}

/// A long-running unit of work owned by a [`ProcessPool`]. Restartable
/// processes keep their state between runs.
#[async_trait]
pub trait Process: Send {
    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Unbounded group of background processes sharing an error fan-in channel.
///
/// The error channel exists from construction and is unbounded, so process
/// failures are never dropped and [`wait`] cannot deadlock when nobody
/// drains them. The usual pairing is a second, one-process pool whose only
/// job is to drain this pool's [`errors`] into the log, started before any
/// worker process is submitted.
///
/// [`wait`]: ProcessPool::wait
/// [`errors`]: ProcessPool::errors
pub struct ProcessPool {
    err_tx: Mutex<Option<mpsc::UnboundedSender<anyhow::Error>>>,
    err_rx: Mutex<Option<mpsc::UnboundedReceiver<anyhow::Error>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessPool {
    pub fn new() -> Self {
        let (err_tx, err_rx) = mpsc::unbounded_channel();

        Self {
            err_tx: Mutex::new(Some(err_tx)),
            err_rx: Mutex::new(Some(err_rx)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Launch a process in the background. With `Params { restart: true }`
    /// it is re-run after every return, sleeping `delay` between attempts,
    /// until the token is cancelled.
    pub async fn run_process(
        &self,
        cancel: CancellationToken,
        mut process: Box<dyn Process>,
        params: Option<Params>,
    ) {
        let err_tx = self.err_tx.lock().await.clone();

        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = process.run(cancel.clone()).await {
                    if let Some(tx) = &err_tx {
                        let _ = tx.send(err);
                    }
                }

                if !params.is_some_and(|p| p.restart) || cancel.is_cancelled() {
                    break;
                }

                let delay = params.map(|p| p.delay).unwrap_or_default();
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            debug!("process finished");
        });

        self.handles.lock().await.push(handle);
    }

    /// Error fan-in channel. May be taken once; closed by [`wait`].
    ///
    /// [`wait`]: ProcessPool::wait
    pub async fn errors(&self) -> Option<mpsc::UnboundedReceiver<anyhow::Error>> {
        self.err_rx.lock().await.take()
    }

    /// Join every process, then close the error channel.
    pub async fn wait(&self) {
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        join_all(handles).await;

        self.err_tx.lock().await.take();
    }
}

impl Default for ProcessPool {
    fn default() -> Self {
        Self::new()
    }
}
