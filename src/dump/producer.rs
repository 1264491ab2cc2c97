use anyhow::Context;
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::Pool;
use mysql_common::value::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dump::table::Table;
use crate::pool::{Task, WorkersPool};
use crate::util::sql_escape::{escape_identifier, value_literal};

/// One row, each column already rendered as its SQL literal fragment.
pub type Tuple = Vec<Vec<u8>>;

/// Plan for splitting one table scan into LIMIT/OFFSET sub-scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShardPlan {
    limit: u64,
    shards: u64,
}

impl ShardPlan {
    /// Sharding only pays off when a shard no longer fits the channel
    /// buffer; otherwise a single full scan (limit 0 = no LIMIT clause).
    fn compute(row_count: u64, shards: usize, buffer: usize) -> Self {
        if shards <= 1 || buffer == 0 {
            return Self::single();
        }

        let shards = shards as u64;
        let limit = row_count.div_ceil(shards);
        if limit <= buffer as u64 {
            return Self::single();
        }

        Self { limit, shards }
    }

    fn single() -> Self {
        Self { limit: 0, shards: 1 }
    }
}

/// Streams table rows as wire-ready tuples over a bounded channel.
///
/// The LIMIT/OFFSET sub-scans are only consistent with each other while
/// the orchestrator holds the global read lock; never run this against a
/// live snapshot-less server with more than one shard.
pub struct Producer {
    pool: Pool,
}

impl Producer {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Stream every row of `table`. Returns the tuple channel and the
    /// shard-error channel; both close exactly once, tuples first, when
    /// all shards finish or cancellation fires. Views yield channels that
    /// are already closed.
    ///
    /// `table.row_count` and `table.columns` must be populated before the
    /// call; the shard plan is derived from the count. Rows within one
    /// shard keep query order, rows across shards interleave arbitrarily.
    pub fn stream(
        &self,
        cancel: CancellationToken,
        table: Table,
        buffer: usize,
        shards: usize,
    ) -> (mpsc::Receiver<Tuple>, mpsc::Receiver<anyhow::Error>) {
        let (tuple_tx, tuple_rx) = mpsc::channel(buffer.max(1));
        let (err_tx, err_rx) = mpsc::channel(1);

        if table.is_view() {
            // senders dropped right here: both channels come back closed
            return (tuple_rx, err_rx);
        }

        let plan = ShardPlan::compute(table.row_count, shards, buffer);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            run_shards(cancel, pool, table, plan, tuple_tx, err_tx).await;
        });

        (tuple_rx, err_rx)
    }
}

async fn run_shards(
    cancel: CancellationToken,
    pool: Pool,
    table: Table,
    plan: ShardPlan,
    tuple_tx: mpsc::Sender<Tuple>,
    err_tx: mpsc::Sender<anyhow::Error>,
) {
    let workers = WorkersPool::new(plan.shards as usize, cancel.clone());

    // take the pool's fan-in before any task runs, so no failure is missed
    let pool_errs = workers.errors().await;
    let forward = tokio::spawn({
        let err_tx = err_tx.clone();
        async move {
            if let Some(mut errs) = pool_errs {
                while let Some(err) = errs.recv().await {
                    let _ = err_tx.send(err).await;
                }
            }
        }
    });

    for i in 0..plan.shards {
        let shard = Shard {
            id: (i + 1) as usize,
            limit: plan.limit,
            offset: i * plan.limit,
            table: table.clone(),
            pool: pool.clone(),
            tuples: tuple_tx.clone(),
        };

        if workers.add(Box::new(shard)).await.is_err() {
            break;
        }
    }

    // the tuple channel closes when the last shard drops its sender; the
    // error channel stays open until after the join, so it closes second
    drop(tuple_tx);
    workers.wait().await;
    let _ = forward.await;
    drop(err_tx);
}

struct Shard {
    id: usize,
    limit: u64,
    offset: u64,
    table: Table,
    pool: Pool,
    tuples: mpsc::Sender<Tuple>,
}

#[async_trait]
impl Task for Shard {
    fn id(&self) -> usize {
        self.id
    }

    /// A failed shard terminates alone; its error fans in through the
    /// worker pool while the remaining shards keep streaming.
    async fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        debug!(shard = self.id, table = %self.table.name, "shard started");
        let result = self.scan(cancel).await;
        debug!(shard = self.id, table = %self.table.name, "shard finished");
        result
    }
}

impl Shard {
    async fn scan(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let query = select_query(&self.table, self.limit, self.offset);
        let mut conn = self.pool.get_conn().await.context("unable to get connection")?;

        let mut result = conn
            .query_iter(query.as_str())
            .await
            .with_context(|| format!("unable to execute query '{query}'"))?;

        while let Some(row) = result.next().await.context("unable to scan row")? {
            let n = row.len();
            let mut tuple = Vec::with_capacity(n);

            for i in 0..n {
                tuple.push(match row.as_ref(i) {
                    Some(value) => value_literal(value),
                    None => value_literal(&Value::NULL),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = self.tuples.send(tuple) => {
                    if sent.is_err() {
                        // consumer went away; nothing left to stream for
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

/// `SELECT` over the table's known columns; limit 0 means a full scan.
fn select_query(table: &Table, limit: u64, offset: u64) -> String {
    let mut query = format!(
        "SELECT {} FROM {}",
        table.column_list(),
        escape_identifier(&table.name)
    );

    if limit > 0 {
        query.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
    }

    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::table::TableKind;

    fn table_with_columns() -> Table {
        let mut table = Table::new("events", TableKind::Base);
        table.columns = vec!["id".to_string(), "payload".to_string()];
        table
    }

    #[test]
    fn test_shard_plan_splits_large_tables() {
        let plan = ShardPlan::compute(1_000, 4, 100);
        assert_eq!(plan, ShardPlan { limit: 250, shards: 4 });
    }

    #[test]
    fn test_shard_plan_rounds_up() {
        let plan = ShardPlan::compute(1_001, 4, 100);
        assert_eq!(plan.limit, 251);
    }

    #[test]
    fn test_shard_plan_degrades_to_single_scan() {
        // one shard requested
        assert_eq!(ShardPlan::compute(1_000, 1, 100), ShardPlan::single());
        // unbuffered channel
        assert_eq!(ShardPlan::compute(1_000, 4, 0), ShardPlan::single());
        // every shard fits the buffer
        assert_eq!(ShardPlan::compute(1_000, 4, 100_000), ShardPlan::single());
        // empty table
        assert_eq!(ShardPlan::compute(0, 4, 100), ShardPlan::single());
    }

    #[test]
    fn test_select_query() {
        let table = table_with_columns();
        assert_eq!(
            select_query(&table, 0, 0),
            "SELECT `id`, `payload` FROM `events`"
        );
        assert_eq!(
            select_query(&table, 250, 500),
            "SELECT `id`, `payload` FROM `events` LIMIT 250 OFFSET 500"
        );
    }

    #[test]
    fn test_select_query_without_columns() {
        let table = Table::new("events", TableKind::Base);
        assert_eq!(select_query(&table, 0, 0), "SELECT * FROM `events`");
    }

    #[tokio::test]
    async fn test_views_produce_closed_channels() {
        // the pool connects lazily; the view short-circuit never touches it
        let opts = mysql_async::Opts::from_url("mysql://root@localhost:3306/unused").unwrap();
        let producer = Producer::new(Pool::new(opts));

        let view = Table::new("active_users", TableKind::View);
        let (mut tuples, mut errors) =
            producer.stream(CancellationToken::new(), view, 16, 4);

        assert!(tuples.recv().await.is_none());
        assert!(errors.recv().await.is_none());
    }
}
