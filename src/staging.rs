//! Staging database access.
//!
//! Rows are read and written generically: a table's columns come from
//! `PRAGMA table_info`, values are decoded by their SQLite storage class and
//! bound by their [`Value`] variant. Every staging table is keyed by an
//! integer `id` equal to the source system's id, so the external id and the
//! internal id of a staging row are the same.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rentsync_core::record::{id_of, normalize_id};
use rentsync_core::sink::Sink;
use rentsync_core::{Fields, Record, Scalar, Value};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqliteRow};
use sqlx::{Acquire, Column, Row, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::migrate::STAGING_TABLES;

/// Handle on the staging tables.
#[derive(Clone)]
pub struct StagingStore {
    pool: SqlitePool,
}

impl StagingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Column names of a staging table, in declaration order.
    pub async fn columns(&self, table: &str) -> Result<Vec<String>> {
        check_table(table)?;
        let rows = sqlx::query(&format!("PRAGMA table_info(\"{}\")", table))
            .fetch_all(&self.pool)
            .await?;
        let columns = rows
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            bail!("Staging table '{}' does not exist. Run `rentsync init` first.", table);
        }
        Ok(columns)
    }

    /// Every row of a table as target-side records.
    pub async fn read_all(&self, table: &str) -> Result<Vec<Record>> {
        check_table(table)?;
        let rows = sqlx::query(&format!("SELECT * FROM \"{}\" ORDER BY id", table))
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to read staging table {}", table))?;

        rows.iter()
            .map(|row| {
                let fields = decode_row(row)?;
                let id = fields.get("id").and_then(id_of).unwrap_or_default();
                Ok(Record::from_target(id, fields))
            })
            .collect()
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        check_table(table)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Empty the given tables, children first, with foreign-key checks off.
    pub async fn clean(&self, tables: &[String]) -> Result<()> {
        for table in tables {
            check_table(table)?;
        }

        // The pragma is a no-op inside a transaction, so it is set on the
        // connection and put back to its previous value afterwards.
        let mut conn = self.pool.acquire().await?;
        let previous: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&mut *conn)
            .await?;
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await?;

        let result = async {
            let mut tx = conn.begin().await?;
            for table in tables.iter().rev() {
                let deleted = sqlx::query(&format!("DELETE FROM \"{}\"", table))
                    .execute(&mut *tx)
                    .await?;
                info!(table = %table, rows = deleted.rows_affected(), "staging table cleaned");
            }
            tx.commit().await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        let restore = if previous != 0 { "PRAGMA foreign_keys = ON" } else { "PRAGMA foreign_keys = OFF" };
        sqlx::query(restore).execute(&mut *conn).await?;
        result
    }

    /// A [`Sink`] writing one staging table, inserting `chunk_size` rows per statement.
    pub async fn sink(&self, table: &str, chunk_size: usize) -> Result<StagingSink> {
        let columns = self.columns(table).await?;
        Ok(StagingSink {
            store: self.clone(),
            table: table.to_string(),
            columns,
            chunk_size: chunk_size.max(1),
        })
    }
}

fn check_table(table: &str) -> Result<()> {
    if !STAGING_TABLES.contains(&table) {
        bail!("Unknown staging table: '{}'", table);
    }
    Ok(())
}

fn decode_row(row: &SqliteRow) -> Result<Fields> {
    let mut fields = Fields::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::int(row.try_get::<i64, _>(i)?),
                "REAL" => Value::float(row.try_get::<f64, _>(i)?),
                _ => Value::text(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        fields.insert(column.name().to_string(), value);
    }
    Ok(fields)
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Scalar(Scalar::Text(s)) => query.bind(s.clone()),
        Value::Scalar(Scalar::Int(i)) => query.bind(*i),
        Value::Scalar(Scalar::Float(f)) => query.bind(*f),
        Value::Scalar(Scalar::Bool(b)) => query.bind(*b),
        other => query.bind(other.canonical()),
    }
}

/// Integer ids are bound as integers so they hit the primary key index.
fn bind_id<'q>(query: SqliteQuery<'q>, id: &str) -> SqliteQuery<'q> {
    let id = normalize_id(id);
    match id.parse::<i64>() {
        Ok(i) => query.bind(i),
        Err(_) => query.bind(id),
    }
}

fn quoted(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One staging table as a reconciliation target.
pub struct StagingSink {
    store: StagingStore,
    table: String,
    columns: Vec<String>,
    chunk_size: usize,
}

impl StagingSink {
    fn insert_sql(&self, rows: usize) -> String {
        let placeholders = format!("({})", vec!["?"; self.columns.len()].join(", "));
        format!(
            "INSERT INTO \"{}\" ({}) VALUES {}",
            self.table,
            quoted(&self.columns),
            vec![placeholders; rows].join(", ")
        )
    }
}

#[async_trait]
impl Sink for StagingSink {
    fn entity(&self) -> &str {
        &self.table
    }

    async fn current(&self) -> Result<Vec<Record>> {
        self.store.read_all(&self.table).await
    }

    async fn remove(&self, internal_id: &str) -> Result<()> {
        let sql = format!("DELETE FROM \"{}\" WHERE id = ?", self.table);
        bind_id(sqlx::query(&sql), internal_id)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    async fn update(&self, record: &Record) -> Result<()> {
        let Some(internal_id) = record.internal_id.as_deref() else {
            bail!("update without internal id ({})", record.external_id);
        };
        let columns: Vec<&String> = self
            .columns
            .iter()
            .filter(|c| c.as_str() != "id" && record.fields.contains_key(c.as_str()))
            .collect();
        if columns.is_empty() {
            debug!(table = %self.table, id = %internal_id, "nothing to update");
            return Ok(());
        }

        let assignments = columns
            .iter()
            .map(|c| format!("\"{}\" = ?", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE \"{}\" SET {} WHERE id = ?", self.table, assignments);
        let mut query = sqlx::query(&sql);
        for column in &columns {
            query = bind_value(query, record.value(column));
        }
        let result = bind_id(query, internal_id).execute(&self.store.pool).await?;
        if result.rows_affected() == 0 {
            bail!("no {} row with id {}", self.table, internal_id);
        }
        Ok(())
    }

    async fn add(&self, record: &Record) -> Result<String> {
        let mut ids = self.add_batch(std::slice::from_ref(record)).await?;
        ids.pop()
            .with_context(|| format!("insert into {} returned no id", self.table))
    }

    fn batch_size(&self) -> usize {
        self.chunk_size
    }

    async fn add_batch(&self, records: &[Record]) -> Result<Vec<String>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let sql = self.insert_sql(records.len());
        let mut query = sqlx::query(&sql);
        for record in records {
            for column in &self.columns {
                query = bind_value(query, record.value(column));
            }
        }
        query
            .execute(&self.store.pool)
            .await
            .with_context(|| format!("Failed to insert {} rows into {}", records.len(), self.table))?;

        Ok(records
            .iter()
            .map(|r| {
                id_of(r.value("id"))
                    .unwrap_or_else(|| normalize_id(&r.external_id))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::create_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> StagingStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();
        StagingStore::new(pool)
    }

    fn client(id: i64, name: &str) -> Record {
        Record::new(id.to_string())
            .with("id", id)
            .with("fullname", name)
            .with("email", "")
    }

    #[tokio::test]
    async fn insert_read_update_delete() {
        let store = store().await;
        let sink = store.sink("clients", 500).await.unwrap();

        let ids = sink.add_batch(&[client(1, "Ada"), client(2, "Grace")]).await.unwrap();
        assert_eq!(ids, vec!["1", "2"]);

        let rows = sink.current().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].internal_id.as_deref(), Some("1"));
        assert_eq!(rows[0].value("fullname"), &Value::text("Ada"));
        assert_eq!(rows[0].value("phone"), &Value::Null);

        let mut changed = client(2, "Grace Hopper");
        changed.internal_id = Some("2".into());
        sink.update(&changed).await.unwrap();
        sink.remove("1").await.unwrap();

        let rows = store.read_all("clients").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("fullname"), &Value::text("Grace Hopper"));
    }

    #[tokio::test]
    async fn duplicate_insert_fails_whole_batch() {
        let store = store().await;
        let sink = store.sink("clients", 500).await.unwrap();
        sink.add(&client(1, "Ada")).await.unwrap();
        assert!(sink.add_batch(&[client(2, "Grace"), client(1, "Ada")]).await.is_err());
        assert_eq!(store.count("clients").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn typed_values_survive_storage() {
        let store = store().await;
        let sink = store.sink("bookings", 10).await.unwrap();
        let ts = rentsync_core::value::parse_timestamp("2024-01-28T16:00:00Z").unwrap();
        let booking = Record::new("7")
            .with("id", 7i64)
            .with("final_price", 600.5)
            .with("booked", true)
            .with("start_at", ts);
        sink.add(&booking).await.unwrap();

        let row = &store.read_all("bookings").await.unwrap()[0];
        assert_eq!(row.value("final_price"), &Value::float(600.5));
        assert_eq!(row.value("booked"), &Value::int(1));
        assert_eq!(row.value("start_at").as_timestamp(), Some(ts));
    }

    #[tokio::test]
    async fn subsecond_timestamps_survive_storage() {
        let store = store().await;
        let sink = store.sink("bookings", 10).await.unwrap();
        let ts = rentsync_core::value::parse_timestamp("2024-01-28T16:00:00.500Z").unwrap();
        let booking = Record::new("8").with("id", 8i64).with("start_at", ts);
        sink.add(&booking).await.unwrap();

        let stored = store.read_all("bookings").await.unwrap().remove(0);
        assert_eq!(stored.value("start_at"), &Value::text("2024-01-28T16:00:00.500+00:00"));
        assert_eq!(stored.value("start_at").as_timestamp(), Some(ts));

        let changes = rentsync_core::reconcile(
            vec![booking],
            vec![stored],
            &rentsync_core::ReconcileOptions::new("id"),
        );
        assert!(changes.is_empty(), "{:?}", changes);
    }

    #[tokio::test]
    async fn clean_empties_tables() {
        let store = store().await;
        let sink = store.sink("clients", 10).await.unwrap();
        sink.add(&client(1, "Ada")).await.unwrap();
        store.clean(&["clients".to_string(), "bookings".to_string()]).await.unwrap();
        assert_eq!(store.count("clients").await.unwrap(), 0);
        assert!(store.read_all("invoices").await.is_err());
    }

    async fn foreign_keys(store: &StagingStore) -> i64 {
        sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn clean_restores_foreign_key_setting() {
        let store = store().await;

        sqlx::query("PRAGMA foreign_keys = ON").execute(store.pool()).await.unwrap();
        store.clean(&["clients".to_string()]).await.unwrap();
        assert_eq!(foreign_keys(&store).await, 1);

        sqlx::query("PRAGMA foreign_keys = OFF").execute(store.pool()).await.unwrap();
        store.clean(&["clients".to_string()]).await.unwrap();
        assert_eq!(foreign_keys(&store).await, 0);
    }
}
