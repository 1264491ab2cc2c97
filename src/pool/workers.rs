use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_POOL_SIZE: usize = 8;

/// Unit of work with an identity, executed by a [`WorkersPool`].
#[async_trait]
pub trait Task: Send {
    fn id(&self) -> usize;

    async fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

type BoxedTask = Box<dyn Task>;

/// Fixed-size, single-shot task executor: a set of workers drains one task
/// channel, then the whole pool is waited and discarded.
///
/// Task failures are offered to the error channel with a non-blocking send;
/// when nobody holds the receiver the error is dropped. Take [`errors`]
/// before adding tasks if failures matter.
///
/// [`errors`]: WorkersPool::errors
pub struct WorkersPool {
    tasks: Mutex<Option<mpsc::Sender<BoxedTask>>>,
    err_tx: Mutex<Option<mpsc::Sender<anyhow::Error>>>,
    err_rx: Mutex<Option<mpsc::Receiver<anyhow::Error>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    waited: Mutex<bool>,
}

impl WorkersPool {
    /// Size 0 selects [`DEFAULT_POOL_SIZE`].
    pub fn new(size: usize, cancel: CancellationToken) -> Self {
        let size = if size == 0 { DEFAULT_POOL_SIZE } else { size };
        let (task_tx, task_rx) = mpsc::channel::<BoxedTask>(1);
        // one buffered error per worker keeps the non-blocking offer from
        // discarding simultaneous failures while a reader is attached
        let (err_tx, err_rx) = mpsc::channel(size);

        let task_rx = Arc::new(Mutex::new(task_rx));
        let mut workers = Vec::with_capacity(size);

        for n in 0..size {
            workers.push(tokio::spawn(worker(
                n,
                Arc::clone(&task_rx),
                err_tx.clone(),
                cancel.clone(),
            )));
        }

        Self {
            tasks: Mutex::new(Some(task_tx)),
            err_tx: Mutex::new(Some(err_tx)),
            err_rx: Mutex::new(Some(err_rx)),
            workers: Mutex::new(workers),
            waited: Mutex::new(false),
        }
    }

    /// Hand a task to the pool. Blocks while every worker is busy; that is
    /// the backpressure bound on callers.
    pub async fn add(&self, task: BoxedTask) -> anyhow::Result<()> {
        let tx = self.tasks.lock().await.clone();

        match tx {
            Some(tx) => task_send(tx, task).await,
            None => Err(anyhow::anyhow!("workers pool is shut down")),
        }
    }

    /// Fan-in of task failures. May be taken once.
    pub async fn errors(&self) -> Option<mpsc::Receiver<anyhow::Error>> {
        self.err_rx.lock().await.take()
    }

    /// Close the task channel, join every worker, then close the error
    /// channel. Safe under concurrent callers: the first one does the work,
    /// the rest observe the flag and return.
    pub async fn wait(&self) {
        let mut waited = self.waited.lock().await;
        if *waited {
            return;
        }
        *waited = true;

        self.tasks.lock().await.take();

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        join_all(workers).await;

        self.err_tx.lock().await.take();
    }
}

async fn task_send(tx: mpsc::Sender<BoxedTask>, task: BoxedTask) -> anyhow::Result<()> {
    tx.send(task)
        .await
        .map_err(|_| anyhow::anyhow!("workers pool is shut down"))
}

async fn worker(
    n: usize,
    tasks: Arc<Mutex<mpsc::Receiver<BoxedTask>>>,
    errors: mpsc::Sender<anyhow::Error>,
    cancel: CancellationToken,
) {
    debug!(worker = n, "worker started");

    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = async { tasks.lock().await.recv().await } => task,
        };

        let Some(mut task) = task else { break };

        let id = task.id();
        if let Err(err) = task.run(&cancel).await {
            debug!(task = id, "task failed: {err:#}");
            let _ = errors.try_send(err);
        }
    }

    debug!(worker = n, "worker finished");
}
