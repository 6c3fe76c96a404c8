//! Bulk inserts to ClickHouse over its HTTP interface.
//!
//! One batch becomes one POST whose body is the concatenation of the
//! already-encoded rows. Inserts run with `insert_distributed_sync=1` and
//! `load_balancing=in_order`, so the call returns only once the store has
//! confirmed the write on the target replicas.

use anyhow::{bail, Context as _, Result};
use hopper_core::{BatchWriter, ClickhouseSpec, RowFormat, StorageSpec};
use tracing::debug;

/// `BatchWriter` backed by ClickHouse's HTTP bulk insert endpoint.
pub struct ClickhouseHttpWriter {
    client: reqwest::blocking::Client,
    url: String,
    query: String,
    database: String,
    table: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickhouseHttpWriter {
    /// `slice_id` selects the shard endpoint among the configured urls.
    pub fn new(
        client: reqwest::blocking::Client,
        clickhouse: &ClickhouseSpec,
        storage: &StorageSpec,
        slice_id: Option<usize>,
    ) -> Result<Self> {
        let url = match slice_id {
            Some(slice) => clickhouse
                .urls
                .get(slice)
                .with_context(|| format!("slice {slice} out of range"))?,
            None => clickhouse
                .urls
                .first()
                .context("no clickhouse urls configured")?,
        }
        .clone();

        Ok(ClickhouseHttpWriter {
            client,
            url,
            query: insert_query(&clickhouse.database, storage),
            database: clickhouse.database.clone(),
            table: storage.table.clone(),
            user: clickhouse.user.clone(),
            password: clickhouse.password.clone(),
        })
    }
}

fn insert_query(database: &str, storage: &StorageSpec) -> String {
    match storage.row_format {
        RowFormat::Json => format!("INSERT INTO {}.{} FORMAT JSONEachRow", database, storage.table),
        RowFormat::Values => format!(
            "INSERT INTO {}.{} ({}) FORMAT TabSeparated",
            database,
            storage.table,
            storage.writable_columns.join(", ")
        ),
    }
}

impl BatchWriter for ClickhouseHttpWriter {
    fn write(&mut self, rows: &mut dyn Iterator<Item = &[u8]>) -> Result<()> {
        let mut body = Vec::new();
        let mut count = 0usize;
        for row in rows {
            body.extend_from_slice(row);
            count += 1;
        }
        if count == 0 {
            return Ok(());
        }

        let mut request = self
            .client
            .post(&self.url)
            .query(&[
                ("query", self.query.as_str()),
                ("database", self.database.as_str()),
                ("insert_distributed_sync", "1"),
                ("load_balancing", "in_order"),
            ])
            .body(body);
        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request
            .send()
            .with_context(|| format!("insert into {} failed", self.table))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            bail!(
                "insert into {} failed with {}: {}",
                self.table,
                status,
                detail.trim()
            );
        }

        debug!(rows = count, table = %self.table, "insert confirmed");
        Ok(())
    }
}
