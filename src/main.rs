mod cli;
mod dump;
mod error;
mod pool;
mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use flate2::Compression;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use dump::sink::{DirSink, FileSink};
use dump::{DumpConfig, Dumper, SCHEMA_FILE};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let opts = mysql_async::Opts::from_url(&cli.source).context("invalid --source URL")?;
    info!("connecting to {}", Cli::redact_url(&cli.source));
    let pool = mysql_async::Pool::new(opts);

    // an interrupt cancels the root token so the deferred UNLOCK TABLES
    // still runs; never exit mid-dump
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling dump");
            signal.cancel();
        }
    });

    let cfg = DumpConfig {
        threads: cli.threads,
        workers: cli.workers,
        buffer: cli.buffer,
        max_rows: cli.max_rows,
        no_headers: cli.no_headers,
        no_drop_table: cli.no_drop_table,
        progress: cli.verbose,
    };
    let compression = Compression::new(cli.gzip_level.min(9));
    let dumper = Dumper::new(pool.clone(), cfg);

    let schema_sink = FileSink::create(&cli.output, SCHEMA_FILE, cli.gzip, compression)?;
    dumper
        .dump_schema(&cancel, &schema_sink, &cli.tables)
        .await?;

    if !cli.no_data {
        let data_sink = Arc::new(DirSink::create(&cli.output, cli.gzip, compression)?);
        dumper.dump_data(&cancel, data_sink, &cli.tables).await?;
    }

    pool.disconnect().await.context("closing connection pool")?;
    info!("dump finished");

    Ok(())
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
