pub mod batch;
pub mod catalog;
pub mod producer;
pub mod sink;
pub mod table;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use mysql_async::Pool;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dump::batch::InsertBuffer;
use crate::dump::catalog::{resolve_tables, Catalog};
use crate::dump::producer::{Producer, Tuple};
use crate::dump::sink::{DirSink, Sink};
use crate::dump::table::Table;
use crate::error::DumpError;
use crate::pool::{Process, ProcessPool};

pub const SCHEMA_FILE: &str = "__dll.sql";

/// Knobs the dump pipeline reads. Output paths and compression belong to
/// the sinks, which the caller constructs.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Tables dumped concurrently.
    pub threads: usize,
    /// LIMIT/OFFSET shards per table.
    pub workers: usize,
    /// Tuple channel capacity, in rows.
    pub buffer: usize,
    /// Rows per INSERT statement.
    pub max_rows: usize,
    pub no_headers: bool,
    pub no_drop_table: bool,
    /// Show a table-level progress bar during the data phase.
    pub progress: bool,
}

pub struct Dumper {
    pool: Pool,
    cfg: DumpConfig,
}

impl Dumper {
    pub fn new(pool: Pool, cfg: DumpConfig) -> Self {
        Self { pool, cfg }
    }

    /// Write DDL for every selected table (views included) in catalog
    /// order. The sink is closed on every path; a primary error takes
    /// precedence over a close error.
    pub async fn dump_schema(
        &self,
        cancel: &CancellationToken,
        sink: &dyn Sink,
        names: &[String],
    ) -> Result<()> {
        let result = self.write_schema(cancel, sink, names).await;
        close_sink(sink, result)
    }

    async fn write_schema(
        &self,
        cancel: &CancellationToken,
        sink: &dyn Sink,
        names: &[String],
    ) -> Result<()> {
        let catalog = Catalog::new(self.pool.clone());
        let tables = catalog.list_tables().await.context("unable to get tables")?;
        let tables = resolve_tables(tables, names)?;

        info!("dumping schema for {} table(s)", tables.len());

        let mut out = Vec::new();
        if !self.cfg.no_headers {
            out.extend_from_slice(
                format!("-- Generated by paradump at {}\n\n", Utc::now().to_rfc3339()).as_bytes(),
            );
        }

        for table in &tables {
            if cancel.is_cancelled() {
                return Err(DumpError::Cancelled.into());
            }

            let ddl = catalog
                .create_statement(table)
                .await
                .with_context(|| format!("unable to get create statement for '{}'", table.name))?;

            out.extend_from_slice(&schema_section(
                table,
                &ddl,
                self.cfg.no_headers,
                self.cfg.no_drop_table,
            ));
        }

        sink.write(&out).context("unable to write schema")?;

        Ok(())
    }

    /// Dump data for every selected base table under one global read-lock
    /// snapshot. At most `threads` tables run concurrently; each one
    /// streams through its own producer and batch writer into the router.
    pub async fn dump_data(
        &self,
        cancel: &CancellationToken,
        sink: Arc<DirSink>,
        names: &[String],
    ) -> Result<()> {
        let result = self.write_data(cancel, Arc::clone(&sink), names).await;
        close_sink(sink.as_ref(), result)
    }

    async fn write_data(
        &self,
        cancel: &CancellationToken,
        sink: Arc<DirSink>,
        names: &[String],
    ) -> Result<()> {
        let catalog = Arc::new(Catalog::new(self.pool.clone()));
        let tables = catalog.list_tables().await.context("unable to get tables")?;
        let tables: Vec<Table> = resolve_tables(tables, names)?
            .into_iter()
            .filter(|table| !table.is_view())
            .collect();

        info!("dumping data for {} table(s)", tables.len());

        let progress = (self.cfg.progress && !tables.is_empty())
            .then(|| table_progress(tables.len() as u64));
        let queue = fill_queue(tables).await;

        let processes = ProcessPool::new();
        let drainer = ProcessPool::new();
        let first_error = Arc::new(Mutex::new(None));

        // the drainer starts before any table worker so early failures are
        // not missed
        if let Some(errs) = processes.errors().await {
            drainer
                .run_process(
                    cancel.clone(),
                    Box::new(ErrorDrain {
                        errs,
                        first: Arc::clone(&first_error),
                    }),
                    None,
                )
                .await;
        }

        catalog
            .flush_with_read_lock(cancel)
            .await
            .context("flush tables with read lock failed")?;

        for _ in 0..self.cfg.threads.max(1) {
            processes
                .run_process(
                    cancel.clone(),
                    Box::new(TableWorker {
                        catalog: Arc::clone(&catalog),
                        producer: Producer::new(self.pool.clone()),
                        sink: Arc::clone(&sink),
                        queue: Arc::clone(&queue),
                        buffer: self.cfg.buffer,
                        shards: self.cfg.workers,
                        max_rows: self.cfg.max_rows,
                        no_headers: self.cfg.no_headers,
                        progress: progress.clone(),
                    }),
                    None,
                )
                .await;
        }

        processes.wait().await;

        // paired with the flush above on every path past it
        if let Err(err) = catalog.unlock().await {
            error!("unlock tables failed: {err:#}");
        }

        drainer.wait().await;

        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        if let Some(err) = first_error.lock().await.take() {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(DumpError::Cancelled.into());
        }

        Ok(())
    }
}

/// One section of the schema file.
fn schema_section(table: &Table, ddl: &str, no_headers: bool, no_drop_table: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(ddl.len() + 128);

    if !no_headers {
        out.extend_from_slice(
            format!("--\n-- Structure for table `{}`\n--\n\n", table.name).as_bytes(),
        );
    }
    if !no_drop_table {
        out.extend_from_slice(format!("DROP TABLE IF EXISTS `{}`;\n", table.name).as_bytes());
    }
    out.extend_from_slice(ddl.as_bytes());
    out.extend_from_slice(b";\n\n");

    out
}

/// Pre-filled, closed channel the table workers drain.
async fn fill_queue(tables: Vec<Table>) -> Arc<Mutex<mpsc::Receiver<Table>>> {
    let (tx, rx) = mpsc::channel(tables.len().max(1));

    for table in tables {
        // capacity equals the table count, the send cannot block
        let _ = tx.send(table).await;
    }

    Arc::new(Mutex::new(rx))
}

/// Pack tuples into capped INSERT statements and flush them to the sink.
/// Returns the number of rows written.
async fn write_batches(
    tuples: &mut mpsc::Receiver<Tuple>,
    mut batch: InsertBuffer,
    sink: &dyn Sink,
) -> Result<u64, DumpError> {
    let mut written = 0u64;

    while let Some(tuple) = tuples.recv().await {
        if let Some(statement) = batch.push(&tuple) {
            sink.write(&statement)?;
        }
        written += 1;
    }

    if let Some(statement) = batch.finish() {
        sink.write(&statement)?;
    }

    Ok(written)
}

/// Primary error wins; a close error alone still surfaces.
fn close_sink(sink: &dyn Sink, result: Result<()>) -> Result<()> {
    match (result, sink.close()) {
        (Err(err), Err(close_err)) => {
            warn!("closing sink failed: {close_err}");
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
        (Ok(()), Err(close_err)) => Err(close_err.into()),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn table_progress(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tables")
            .unwrap()
            .progress_chars("#>-"),
    );
    bar
}

/// Drains one table at a time from the shared queue until it is empty or
/// cancellation fires.
struct TableWorker {
    catalog: Arc<Catalog>,
    producer: Producer,
    sink: Arc<DirSink>,
    queue: Arc<Mutex<mpsc::Receiver<Table>>>,
    buffer: usize,
    shards: usize,
    max_rows: usize,
    no_headers: bool,
    progress: Option<ProgressBar>,
}

#[async_trait]
impl Process for TableWorker {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        loop {
            let table = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                table = async { self.queue.lock().await.recv().await } => table,
            };

            let Some(table) = table else { return Ok(()) };

            info!(table = %table.name, "start dump table");
            self.dump_table(&cancel, table).await?;

            if let Some(bar) = &self.progress {
                bar.inc(1);
            }
        }
    }
}

impl TableWorker {
    async fn dump_table(&self, cancel: &CancellationToken, mut table: Table) -> Result<()> {
        table.columns = self
            .catalog
            .columns(&table.name)
            .await
            .with_context(|| format!("unable to get columns of '{}'", table.name))?;

        // the count has to be in place before the shard plan is derived
        table.row_count = self
            .catalog
            .count(&table.name)
            .await
            .with_context(|| format!("unable to count rows of '{}'", table.name))?;

        let file = self.sink.open(&table.name)?;
        if !self.no_headers {
            file.write(
                format!("-- {}'s data [count={}]\n\n", table.name, table.row_count).as_bytes(),
            )?;
        }

        let name = table.name.clone();
        let (mut tuples, mut errs) =
            self.producer
                .stream(cancel.clone(), table, self.buffer, self.shards);

        // shard failures are logged; the rest of the table keeps streaming
        let err_table = name.clone();
        let drain = tokio::spawn(async move {
            while let Some(err) = errs.recv().await {
                error!(table = %err_table, "shard failed: {err:#}");
            }
        });

        let batch = InsertBuffer::new(&name, self.max_rows);
        let written = write_batches(&mut tuples, batch, self.sink.as_ref()).await?;

        let _ = drain.await;

        info!(table = %name, rows = written, "finished dump table");
        Ok(())
    }
}

/// Forwards worker failures to the log and keeps the first one for the
/// orchestrator to surface.
struct ErrorDrain {
    errs: mpsc::UnboundedReceiver<anyhow::Error>,
    first: Arc<Mutex<Option<anyhow::Error>>>,
}

#[async_trait]
impl Process for ErrorDrain {
    async fn run(&mut self, _cancel: CancellationToken) -> Result<()> {
        while let Some(err) = self.errs.recv().await {
            error!("table dump failed: {err:#}");

            let mut first = self.first.lock().await;
            if first.is_none() {
                *first = Some(err);
            }
        }

        Ok(())
    }
}
