//! In-memory [`Sink`] implementation for tests and dry runs.
//!
//! Records live in a `BTreeMap` behind `std::sync::RwLock`. Internal ids are
//! sequential (`"1"`, `"2"`, ...). Writes for selected external ids can be
//! made to fail, to exercise per-record failure isolation.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::record::{id_of, Record};
use crate::value::Value;

use super::Sink;

pub struct InMemorySink {
    entity: String,
    id_field: String,
    records: RwLock<BTreeMap<String, Record>>,
    next_id: AtomicU64,
    failing: RwLock<HashSet<String>>,
    batch_size: usize,
}

impl InMemorySink {
    /// New sink whose records store their external id under `id_field`.
    pub fn new(entity: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id_field: id_field.into(),
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            failing: RwLock::new(HashSet::new()),
            batch_size: 1,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Seed a record as if the target already held it. Returns its internal id.
    pub fn seed(&self, record: Record) -> String {
        let id = self.allocate_id();
        let mut stored = record;
        stored.internal_id = Some(id.clone());
        self.records.write().unwrap().insert(id.clone(), stored);
        id
    }

    /// Make every write touching this external id (or internal id) fail.
    pub fn fail_on(&self, id: impl Into<String>) {
        self.failing.write().unwrap().insert(id.into());
    }

    /// Snapshot of the stored records, ordered by internal id.
    pub fn records(&self) -> Vec<Record> {
        self.records.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn check(&self, id: &str) -> Result<()> {
        if self.failing.read().unwrap().contains(id) {
            bail!("injected failure for {}", id);
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for InMemorySink {
    fn entity(&self) -> &str {
        &self.entity
    }

    async fn current(&self) -> Result<Vec<Record>> {
        Ok(self.records())
    }

    async fn remove(&self, internal_id: &str) -> Result<()> {
        self.check(internal_id)?;
        self.records
            .write()
            .unwrap()
            .remove(internal_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("no {} record with id {}", self.entity, internal_id))
    }

    async fn update(&self, record: &Record) -> Result<()> {
        let id = record
            .internal_id
            .clone()
            .ok_or_else(|| anyhow!("update without internal id ({})", record.external_id))?;
        self.check(&record.external_id)?;
        let mut records = self.records.write().unwrap();
        let stored = records
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no {} record with id {}", self.entity, id))?;
        stored.fields = record.fields.clone();
        Ok(())
    }

    async fn add(&self, record: &Record) -> Result<String> {
        self.check(&record.external_id)?;
        let mut stored = record.clone();
        if id_of(stored.value(&self.id_field)).is_none() {
            stored.set(self.id_field.clone(), Value::text(record.external_id.clone()));
        }
        Ok(self.seed(stored))
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn add_batch(&self, records: &[Record]) -> Result<Vec<String>> {
        for record in records {
            self.check(&record.external_id)?;
        }
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(self.add(record).await?);
        }
        Ok(ids)
    }
}
