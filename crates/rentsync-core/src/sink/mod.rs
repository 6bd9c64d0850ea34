//! Target abstraction for rentsync.
//!
//! The [`Sink`] trait is the "record write" capability the writer needs,
//! plus the "read all current records" capability the reconciler needs.
//! Two implementations live in the application crate (SQLite staging
//! tables and CRM entities); [`memory::InMemorySink`] backs tests.
//!
//! Implementations must be `Send + Sync` so adds can run on a worker pool.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::record::Record;

/// A target entity collection that can be read and written record by record.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`current`](Sink::current) | Read every record currently held by the target |
/// | [`remove`](Sink::remove) | Delete one record by internal id |
/// | [`update`](Sink::update) | Overwrite one record identified by its `internal_id` |
/// | [`add`](Sink::add) | Create one record, returning its new internal id |
/// | [`add_batch`](Sink::add_batch) | Create many records in one statement, when supported |
#[async_trait]
pub trait Sink: Send + Sync {
    /// Entity label used in logs and summaries (e.g. `"bookings"`, `"deal"`).
    fn entity(&self) -> &str;

    /// Every record the target holds for this entity.
    ///
    /// Returned records carry their `internal_id`; the external id lives in
    /// the field the reconciler is told to match on.
    async fn current(&self) -> Result<Vec<Record>>;

    async fn remove(&self, internal_id: &str) -> Result<()>;

    /// Overwrite a record. `record.internal_id` must be set.
    async fn update(&self, record: &Record) -> Result<()>;

    /// Create a record and return the internal id the target assigned.
    async fn add(&self, record: &Record) -> Result<String>;

    /// Preferred number of records per [`add_batch`](Sink::add_batch) call.
    /// `1` means the target only supports single-record creates.
    fn batch_size(&self) -> usize {
        1
    }

    /// Create several records at once. The whole batch fails or succeeds.
    async fn add_batch(&self, records: &[Record]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(self.add(record).await?);
        }
        Ok(ids)
    }
}
