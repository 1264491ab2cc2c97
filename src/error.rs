use thiserror::Error;

/// Typed failures surfaced by the dump pipeline. Orchestration code wraps
/// these in `anyhow::Error` for context; callers that need to react to a
/// specific kind can downcast.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("table {0} does not exist")]
    UnknownTable(String),

    #[error("no create statement for table {name} ({kind})")]
    MissingDdl { name: String, kind: String },

    #[error("unable to parse a table name from the payload")]
    UnparsedSinkTarget,

    #[error("sink {0} is already closed")]
    SinkClosed(String),

    #[error("database error: {0}")]
    Mysql(#[from] mysql_async::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}
