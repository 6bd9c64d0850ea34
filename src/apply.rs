//! Change-set application.
//!
//! A [`Writer`] applies one entity's [`ChangeSet`] to its [`Sink`] in a
//! fixed order: deletes (only when `remove_old_rows` is on), then updates,
//! then adds. A failing record is logged and counted; it never aborts the
//! rest of the batch.
//!
//! Adds go through one of two paths:
//!
//! - sinks with a batch size above one (staging tables) receive chunks via
//!   [`Sink::add_batch`]; a failed chunk is retried record by record so one
//!   bad row cannot sink its neighbours,
//! - other sinks (the CRM) receive single adds on a bounded worker pool,
//!   with results consumed in input order.
//!
//! An optional [`AddHook`] runs after each successful add with the new
//! internal id, to link the fresh record to records that already exist.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rentsync_core::sink::Sink;
use rentsync_core::{ChangeSet, Record};
use tracing::{debug, info, warn};

use crate::progress::{ApplyPhase, ApplyProgressEvent, ApplyProgressReporter};

/// Follow-up run after a record was created.
#[async_trait]
pub trait AddHook: Send + Sync {
    async fn after_add(&self, record: &Record, internal_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Delete stale target records. Off means they are only counted.
    pub remove_old_rows: bool,
    /// Concurrent single-record adds.
    pub workers: usize,
    /// Drop nullish fields from create/update payloads.
    pub scrub_empty: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            remove_old_rows: false,
            workers: 1,
            scrub_empty: false,
        }
    }
}

/// Outcome of applying one change set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub entity: String,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Stale records left in place because removal is off.
    pub stale_kept: usize,
    pub unchanged: usize,
    /// `(external id, internal id)` of every created record.
    pub added_ids: Vec<(String, String)>,
}

impl ApplyReport {
    /// Report for a change set that was computed but not written.
    pub fn planned(entity: &str, changes: &ChangeSet) -> Self {
        Self {
            entity: entity.to_string(),
            added: changes.to_add.len(),
            updated: changes.to_update.len(),
            deleted: changes.to_remove.len(),
            unchanged: changes.unchanged,
            ..Default::default()
        }
    }
}

pub struct Writer<'a> {
    sink: &'a dyn Sink,
    options: WriteOptions,
    progress: &'a dyn ApplyProgressReporter,
}

impl<'a> Writer<'a> {
    pub fn new(sink: &'a dyn Sink, options: WriteOptions, progress: &'a dyn ApplyProgressReporter) -> Self {
        Self {
            sink,
            options,
            progress,
        }
    }

    pub async fn apply(&self, changes: ChangeSet, hook: Option<&dyn AddHook>) -> ApplyReport {
        let entity = self.sink.entity().to_string();
        let mut report = ApplyReport {
            entity: entity.clone(),
            unchanged: changes.unchanged,
            ..Default::default()
        };
        self.progress.report(ApplyProgressEvent::Reconciled {
            entity: entity.clone(),
            add: changes.to_add.len() as u64,
            update: changes.to_update.len() as u64,
            remove: changes.to_remove.len() as u64,
        });

        if self.options.remove_old_rows {
            self.delete(&changes.to_remove, &mut report).await;
        } else {
            report.stale_kept = changes.to_remove.len();
            if report.stale_kept > 0 {
                info!(entity = %entity, stale = report.stale_kept, "stale records kept, removal is off");
            }
        }

        self.update(&changes.to_update, &mut report).await;

        if self.sink.batch_size() > 1 {
            self.add_batched(changes.to_add, hook, &mut report).await;
        } else {
            self.add_pooled(changes.to_add, hook, &mut report).await;
        }

        info!(
            entity = %entity,
            added = report.added,
            updated = report.updated,
            deleted = report.deleted,
            failed = report.failed,
            unchanged = report.unchanged,
            "changes applied"
        );
        report
    }

    async fn delete(&self, ids: &[String], report: &mut ApplyReport) {
        let total = ids.len() as u64;
        for (i, id) in ids.iter().enumerate() {
            match self.sink.remove(id).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(entity = %report.entity, internal_id = %id, error = %format!("{:#}", e), "delete failed");
                }
            }
            self.tick(ApplyPhase::Deleting, i as u64 + 1, total);
        }
    }

    async fn update(&self, records: &[Record], report: &mut ApplyReport) {
        let total = records.len() as u64;
        for (i, record) in records.iter().enumerate() {
            let payload = self.payload(record);
            match self.sink.update(&payload).await {
                Ok(()) => report.updated += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        entity = %report.entity,
                        external_id = %record.external_id,
                        error = %format!("{:#}", e),
                        "update failed"
                    );
                }
            }
            self.tick(ApplyPhase::Updating, i as u64 + 1, total);
        }
    }

    async fn add_pooled(&self, records: Vec<Record>, hook: Option<&dyn AddHook>, report: &mut ApplyReport) {
        let total = records.len() as u64;
        let sink = self.sink;
        let scrub = self.options.scrub_empty;

        let mut outcomes = stream::iter(records)
            .map(|record| async move {
                let payload = scrubbed(&record, scrub);
                let result = sink.add(&payload).await;
                if let (Ok(id), Some(hook)) = (&result, hook) {
                    run_hook(hook, &record, id).await;
                }
                (record, result)
            })
            .buffered(self.options.workers.max(1));

        let mut n = 0;
        while let Some((record, result)) = outcomes.next().await {
            n += 1;
            self.record_add(report, record, result);
            self.tick(ApplyPhase::Adding, n, total);
        }
    }

    async fn add_batched(&self, records: Vec<Record>, hook: Option<&dyn AddHook>, report: &mut ApplyReport) {
        let total = records.len() as u64;
        let mut n = 0;
        for chunk in records.chunks(self.sink.batch_size()) {
            let payloads: Vec<Record> = chunk.iter().map(|r| self.payload(r)).collect();
            match self.sink.add_batch(&payloads).await {
                Ok(ids) => {
                    for (record, id) in chunk.iter().zip(ids) {
                        if let Some(hook) = hook {
                            run_hook(hook, record, &id).await;
                        }
                        self.record_add(report, record.clone(), Ok(id));
                    }
                }
                Err(e) => {
                    warn!(
                        entity = %report.entity,
                        rows = chunk.len(),
                        error = %format!("{:#}", e),
                        "batch insert failed, retrying row by row"
                    );
                    for (record, payload) in chunk.iter().zip(&payloads) {
                        let result = self.sink.add(payload).await;
                        if let (Ok(id), Some(hook)) = (&result, hook) {
                            run_hook(hook, record, id).await;
                        }
                        self.record_add(report, record.clone(), result);
                    }
                }
            }
            n += chunk.len() as u64;
            self.tick(ApplyPhase::Adding, n, total);
        }
    }

    fn record_add(&self, report: &mut ApplyReport, record: Record, result: Result<String>) {
        match result {
            Ok(id) => {
                debug!(entity = %report.entity, external_id = %record.external_id, internal_id = %id, "added");
                report.added += 1;
                report.added_ids.push((record.external_id, id));
            }
            Err(e) => {
                report.failed += 1;
                warn!(
                    entity = %report.entity,
                    external_id = %record.external_id,
                    error = %format!("{:#}", e),
                    "add failed"
                );
            }
        }
    }

    fn payload(&self, record: &Record) -> Record {
        scrubbed(record, self.options.scrub_empty)
    }

    fn tick(&self, phase: ApplyPhase, n: u64, total: u64) {
        self.progress.report(ApplyProgressEvent::Writing {
            entity: self.sink.entity().to_string(),
            phase,
            n,
            total,
        });
    }
}

fn scrubbed(record: &Record, scrub: bool) -> Record {
    Record {
        external_id: record.external_id.clone(),
        internal_id: record.internal_id.clone(),
        fields: record.payload(scrub),
    }
}

async fn run_hook(hook: &dyn AddHook, record: &Record, internal_id: &str) {
    if let Err(e) = hook.after_add(record, internal_id).await {
        warn!(
            external_id = %record.external_id,
            internal_id = %internal_id,
            error = %format!("{:#}", e),
            "post-add hook failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use rentsync_core::sink::memory::InMemorySink;
    use rentsync_core::{reconcile, ReconcileOptions, Value};
    use std::sync::Mutex;

    fn desired(ids: &[&str]) -> Vec<Record> {
        ids.iter()
            .map(|id| Record::new(*id).with("SRC", *id).with("TITLE", format!("t{}", id)))
            .collect()
    }

    #[tokio::test]
    async fn removal_is_gated() {
        let sink = InMemorySink::new("deal", "SRC");
        sink.seed(Record::new("").with("SRC", "9").with("TITLE", "old"));
        let opts = ReconcileOptions::new("SRC");

        let changes = reconcile(desired(&["1"]), sink.current().await.unwrap(), &opts);
        let writer = Writer::new(&sink, WriteOptions::default(), &NoProgress);
        let report = writer.apply(changes, None).await;
        assert_eq!((report.added, report.deleted, report.stale_kept), (1, 0, 1));
        assert_eq!(sink.len(), 2);

        let changes = reconcile(desired(&["1"]), sink.current().await.unwrap(), &opts);
        let options = WriteOptions {
            remove_old_rows: true,
            ..Default::default()
        };
        let report = Writer::new(&sink, options, &NoProgress).apply(changes, None).await;
        assert_eq!((report.added, report.deleted, report.unchanged), (0, 1, 1));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let sink = InMemorySink::new("deal", "SRC");
        sink.fail_on("2");
        let changes = reconcile(desired(&["1", "2", "3"]), Vec::new(), &ReconcileOptions::new("SRC"));
        let options = WriteOptions {
            workers: 3,
            ..Default::default()
        };
        let report = Writer::new(&sink, options, &NoProgress).apply(changes, None).await;
        assert_eq!((report.added, report.failed), (2, 1));
        let added: Vec<&str> = report.added_ids.iter().map(|(ext, _)| ext.as_str()).collect();
        assert_eq!(added, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn failed_batch_falls_back_to_single_rows() {
        let sink = InMemorySink::new("clients", "SRC").with_batch_size(500);
        sink.fail_on("2");
        let changes = reconcile(desired(&["1", "2", "3"]), Vec::new(), &ReconcileOptions::new("SRC"));
        let report = Writer::new(&sink, WriteOptions::default(), &NoProgress)
            .apply(changes, None)
            .await;
        assert_eq!((report.added, report.failed), (2, 1));
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn scrubbing_drops_empty_fields() {
        let sink = InMemorySink::new("deal", "SRC");
        let record = Record::new("1").with("SRC", "1").with("NOTES", "").with("TITLE", "x");
        let changes = reconcile(vec![record], Vec::new(), &ReconcileOptions::new("SRC"));
        let options = WriteOptions {
            scrub_empty: true,
            ..Default::default()
        };
        Writer::new(&sink, options, &NoProgress).apply(changes, None).await;
        let stored = &sink.records()[0];
        assert!(stored.get("NOTES").is_none());
        assert_eq!(stored.value("TITLE"), &Value::text("x"));
    }

    struct Recorder(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl AddHook for Recorder {
        async fn after_add(&self, record: &Record, internal_id: &str) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((record.external_id.clone(), internal_id.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn hook_sees_new_internal_ids() {
        let sink = InMemorySink::new("deal", "SRC");
        let hook = Recorder(Mutex::new(Vec::new()));
        let changes = reconcile(desired(&["1", "2"]), Vec::new(), &ReconcileOptions::new("SRC"));
        Writer::new(&sink, WriteOptions::default(), &NoProgress)
            .apply(changes, Some(&hook))
            .await;
        let seen = hook.0.lock().unwrap().clone();
        assert_eq!(seen, vec![("1".to_string(), "1".to_string()), ("2".to_string(), "2".to_string())]);
    }
}
