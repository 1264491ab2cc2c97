use std::collections::HashMap;

use anyhow::{Context, Result};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Pool, Row};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::dump::table::{Table, TableKind};
use crate::error::DumpError;
use crate::util::sql_escape::escape_identifier;

/// Catalog queries against the source server. Each call checks a
/// connection out of the pool; the read-lock connection is the exception
/// and stays pinned here between `flush_with_read_lock` and `unlock`.
pub struct Catalog {
    pool: Pool,
    lock_conn: Mutex<Option<Conn>>,
}

impl Catalog {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            lock_conn: Mutex::new(None),
        }
    }

    async fn conn(&self) -> Result<Conn, DumpError> {
        Ok(self.pool.get_conn().await?)
    }

    pub async fn list_tables(&self) -> Result<Vec<Table>> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, String)> = conn
            .query("SHOW FULL TABLES")
            .await
            .context("unable to list tables")?;

        Ok(rows
            .into_iter()
            .map(|(name, kind)| Table::new(name, TableKind::parse(&kind)))
            .collect())
    }

    /// `SHOW CREATE TABLE` statement. Base tables return two columns and
    /// views four; the DDL sits at index 1 either way.
    pub async fn create_statement(&self, table: &Table) -> Result<String> {
        let mut conn = self.conn().await?;
        let query = format!("SHOW CREATE TABLE {}", escape_identifier(&table.name));
        let row: Option<Row> = conn.query_first(&query).await?;

        let ddl = row.and_then(|row| row.get::<String, _>(1)).unwrap_or_default();
        if ddl.is_empty() {
            return Err(DumpError::MissingDdl {
                name: table.name.clone(),
                kind: table.kind.as_str().to_string(),
            }
            .into());
        }

        Ok(ddl)
    }

    /// Column names from the result-set metadata of a one-row probe; works
    /// for empty tables too.
    pub async fn columns(&self, table: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let query = format!("SELECT * FROM {} LIMIT 1", escape_identifier(table));
        let result = conn.query_iter(&query).await?;

        let columns = result
            .columns()
            .map(|columns| {
                columns
                    .iter()
                    .map(|column| column.name_str().into_owned())
                    .collect()
            })
            .unwrap_or_default();

        result.drop_result().await?;

        Ok(columns)
    }

    pub async fn count(&self, table: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let query = format!("SELECT COUNT(*) FROM {}", escape_identifier(table));
        let count: Option<u64> = conn.query_first(&query).await?;

        Ok(count.unwrap_or(0))
    }

    /// Establish the global snapshot. The lock lives on the connection
    /// that ran it, so that connection stays checked out until `unlock`.
    pub async fn flush_with_read_lock(&self, cancel: &CancellationToken) -> Result<()> {
        let mut conn = self.conn().await?;

        tokio::select! {
            _ = cancel.cancelled() => return Err(DumpError::Cancelled.into()),
            result = conn.query_drop("FLUSH TABLES WITH READ LOCK") => {
                result.context("flush tables with read lock failed")?;
            }
        }

        *self.lock_conn.lock().await = Some(conn);
        Ok(())
    }

    /// Release the snapshot and hand the lock connection back to the pool.
    /// A no-op when no lock is held.
    pub async fn unlock(&self) -> Result<()> {
        let conn = self.lock_conn.lock().await.take();

        if let Some(mut conn) = conn {
            conn.query_drop("UNLOCK TABLES")
                .await
                .context("unlock tables failed")?;
        }

        Ok(())
    }
}

/// Apply the allow-list: every requested name must exist in the catalog.
/// An empty request selects the whole catalog in catalog order.
pub fn resolve_tables(catalog: Vec<Table>, requested: &[String]) -> Result<Vec<Table>, DumpError> {
    if requested.is_empty() {
        return Ok(catalog);
    }

    let mut by_name: HashMap<String, Table> = catalog
        .into_iter()
        .map(|table| (table.name.clone(), table))
        .collect();

    let mut selected = Vec::with_capacity(requested.len());
    for name in requested {
        match by_name.remove(name) {
            Some(table) => selected.push(table),
            None => return Err(DumpError::UnknownTable(name.clone())),
        }
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_fixture() -> Vec<Table> {
        vec![
            Table::new("users", TableKind::Base),
            Table::new("orders", TableKind::Base),
            Table::new("active_users", TableKind::View),
        ]
    }

    #[test]
    fn test_resolve_all_when_empty() {
        let selected = resolve_tables(catalog_fixture(), &[]).unwrap();
        let names: Vec<_> = selected.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["users", "orders", "active_users"]);
    }

    #[test]
    fn test_resolve_keeps_requested_order() {
        let requested = vec!["orders".to_string(), "users".to_string()];
        let selected = resolve_tables(catalog_fixture(), &requested).unwrap();
        let names: Vec<_> = selected.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["orders", "users"]);
    }

    #[test]
    fn test_resolve_unknown_table() {
        let requested = vec!["missing".to_string()];
        let err = resolve_tables(catalog_fixture(), &requested).unwrap_err();
        assert!(matches!(err, DumpError::UnknownTable(name) if name == "missing"));
    }
}
