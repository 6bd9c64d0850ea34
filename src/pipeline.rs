//! Flow orchestration.
//!
//! - `import`: source API → staging tables, one table at a time in
//!   dependency order.
//! - `export`: staging tables → CRM contacts, products, then deals. The
//!   contact and product id maps are re-read after their writes so deals can
//!   reference records created in the same run.
//! - `sync`: import, then export.
//!
//! Each entity goes through the same steps: build the desired records, read
//! the current ones, [`reconcile`], then apply with a [`Writer`]. The
//! deal field mapping is validated before any write. Every run ends with a
//! [`RunSummary`] that is printed, logged, and stored in `sync_runs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use rentsync_core::sink::Sink;
use rentsync_core::{reconcile, FieldMapping, ReconcileOptions, Record};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::apply::{AddHook, ApplyReport, WriteOptions, Writer};
use crate::config::Config;
use crate::crm::{CrmClient, CrmEntity, CrmSink};
use crate::db;
use crate::deals::{
    contact_from_client, deal_from_booking, id_map, product_from_rental, DealContext, ProductRowLinker,
    CONTACT_ID_FIELD, PRODUCT_ID_FIELD,
};
use crate::fetch::Fetcher;
use crate::progress::{ApplyProgressReporter, ProgressMode};
use crate::remote::{self, AuthStyle, RemoteClient, RetryPolicy};
use crate::session::Session;
use crate::source::{build_tables, SourceApi, SourceData};
use crate::staging::StagingStore;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Reconcile and report, but write nothing.
    pub dry_run: bool,
    pub progress: ProgressMode,
    /// Reference time for stage and probability rules. Defaults to local now.
    pub now: Option<DateTime<FixedOffset>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            progress: ProgressMode::Off,
            now: None,
        }
    }
}

impl RunOptions {
    fn now(&self) -> DateTime<FixedOffset> {
        self.now.unwrap_or_else(|| chrono::Local::now().fixed_offset())
    }
}

/// Per-entity results of one flow.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub flow: &'static str,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub dry_run: bool,
    pub reports: Vec<ApplyReport>,
}

impl RunSummary {
    fn new(flow: &'static str, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            flow,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            dry_run,
            reports: Vec::new(),
        }
    }

    pub fn report(&self, entity: &str) -> Option<&ApplyReport> {
        self.reports.iter().find(|r| r.entity == entity)
    }

    pub fn failed(&self) -> usize {
        self.reports.iter().map(|r| r.failed).sum()
    }

    /// Print the summary on stdout and log the totals.
    pub fn print(&self) {
        let sum = |f: fn(&ApplyReport) -> usize| self.reports.iter().map(f).sum::<usize>();
        let (added, updated, deleted, failed, stale) = (
            sum(|r| r.added),
            sum(|r| r.updated),
            sum(|r| r.deleted),
            sum(|r| r.failed),
            sum(|r| r.stale_kept),
        );

        if self.dry_run {
            println!("{} (dry-run)", self.flow);
        } else {
            println!("{}", self.flow);
        }
        for r in &self.reports {
            println!(
                "  {:<18} +{:<6} ~{:<6} -{:<6} failed {:<4} unchanged {}",
                r.entity, r.added, r.updated, r.deleted, r.failed, r.unchanged
            );
        }
        let suffix = if self.dry_run { " (planned)" } else { "" };
        println!(
            "  total{}: added {}, updated {}, deleted {}, failed {}",
            suffix, added, updated, deleted, failed
        );
        if stale > 0 {
            println!("  note: {} stale records were kept because remove_old_rows is off", stale);
        }
        println!("  time: {:.1}s", self.elapsed.as_secs_f64());

        info!(
            flow = self.flow,
            run_id = %self.run_id,
            dry_run = self.dry_run,
            added,
            updated,
            deleted,
            failed,
            stale_kept = stale,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "run finished"
        );
    }

    /// Store one ledger row per entity.
    pub async fn record(&self, pool: &SqlitePool) -> Result<()> {
        for r in &self.reports {
            sqlx::query(
                r#"
                INSERT INTO sync_runs
                    (run_id, flow, entity, started_at, elapsed_ms, added, updated, deleted, failed, stale_kept, unchanged)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&self.run_id)
            .bind(self.flow)
            .bind(&r.entity)
            .bind(self.started_at.to_rfc3339())
            .bind(self.elapsed.as_millis() as i64)
            .bind(r.added as i64)
            .bind(r.updated as i64)
            .bind(r.deleted as i64)
            .bind(r.failed as i64)
            .bind(r.stale_kept as i64)
            .bind(r.unchanged as i64)
            .execute(pool)
            .await
            .context("Failed to record run in sync_runs")?;
        }
        Ok(())
    }
}

async fn remote_client(
    name: &str,
    oauth: &crate::config::OAuthConfig,
    auth: AuthStyle,
    config: &Config,
    http: &reqwest::Client,
) -> Result<Arc<RemoteClient>> {
    let session = Session::from_config(name, oauth, http.clone()).await?;
    Ok(Arc::new(RemoteClient::new(
        http.clone(),
        Arc::new(session),
        auth,
        RetryPolicy::from(&config.retry),
    )))
}

pub async fn source_api(config: &Config, http: &reqwest::Client) -> Result<SourceApi> {
    let client = remote_client("source", &config.source.oauth, AuthStyle::Bearer, config, http).await?;
    Ok(SourceApi::new(
        Fetcher::new(client, &config.source.base_url),
        &config.source,
    ))
}

pub async fn crm_client(config: &Config, http: &reqwest::Client) -> Result<CrmClient> {
    let client = remote_client(
        "crm",
        &config.crm.oauth,
        AuthStyle::QueryParam("auth".to_string()),
        config,
        http,
    )
    .await?;
    Ok(CrmClient::new(Fetcher::new(client, &config.crm.base_url)))
}

/// Reconcile one entity and apply (or, on a dry run, only count) the changes.
async fn sync_entity(
    sink: &dyn Sink,
    desired: Vec<Record>,
    reconcile_options: &ReconcileOptions,
    write_options: WriteOptions,
    hook: Option<&dyn AddHook>,
    options: &RunOptions,
    progress: &dyn ApplyProgressReporter,
) -> Result<ApplyReport> {
    let current = sink
        .current()
        .await
        .with_context(|| format!("Failed to read current {} records", sink.entity()))?;
    let changes = reconcile(desired, current, reconcile_options);
    info!(
        entity = sink.entity(),
        add = changes.to_add.len(),
        update = changes.to_update.len(),
        remove = changes.to_remove.len(),
        unchanged = changes.unchanged,
        "reconciled"
    );

    if options.dry_run {
        return Ok(ApplyReport::planned(sink.entity(), &changes));
    }
    Ok(Writer::new(sink, write_options, progress).apply(changes, hook).await)
}

pub async fn run_import(config: &Config, options: &RunOptions) -> Result<RunSummary> {
    let pool = db::connect(config).await?;
    let http = remote::http_client(&config.retry)?;
    let api = source_api(config, &http).await?;
    let data = api.fetch().await?;
    let store = StagingStore::new(pool);
    let summary = import_data(config, &store, data, options).await?;
    store.pool().close().await;
    Ok(summary)
}

/// Write fetched source data into the staging tables.
pub async fn import_data(
    config: &Config,
    store: &StagingStore,
    data: SourceData,
    options: &RunOptions,
) -> Result<RunSummary> {
    let started = Instant::now();
    let mut summary = RunSummary::new("import", options.dry_run);
    let mut tables = build_tables(&data, &config.rules, options.now())?;
    let progress = options.progress.reporter();

    if config.staging.clean_before_insert && !options.dry_run {
        store.clean(&config.staging.tables).await?;
    }

    let write = WriteOptions {
        remove_old_rows: config.staging.remove_old_rows,
        workers: 1,
        scrub_empty: false,
    };
    for table in &config.staging.tables {
        let desired = tables.take(table).unwrap_or_default();
        let sink = store.sink(table, config.staging.chunk_size).await?;
        let report = sync_entity(
            &sink,
            desired,
            &ReconcileOptions::new("id"),
            write.clone(),
            None,
            options,
            progress.as_ref(),
        )
        .await?;
        summary.reports.push(report);
    }

    summary.elapsed = started.elapsed();
    if !options.dry_run {
        summary.record(store.pool()).await?;
    }
    Ok(summary)
}

pub async fn run_export(config: &Config, options: &RunOptions) -> Result<RunSummary> {
    let pool = db::connect(config).await?;
    let http = remote::http_client(&config.retry)?;
    let crm = crm_client(config, &http).await?;
    let store = StagingStore::new(pool);
    let summary = export_data(config, &store, Arc::new(crm), options).await?;
    store.pool().close().await;
    Ok(summary)
}

/// Reconcile option for a CRM entity, honouring its configured allow-list.
///
/// Allow-list entries are resolved as labels first, then taken as field ids.
fn crm_options(config: &Config, entity: CrmEntity, id_field: &str, mapping: &FieldMapping) -> ReconcileOptions {
    let options = ReconcileOptions::new(id_field).with_ignored_fields(["ID"]);
    match config.crm.mutable_fields.get(entity.name()) {
        Some(fields) => options.with_mutable_fields(
            fields
                .iter()
                .map(|f| mapping.field(f).map(str::to_string).unwrap_or_else(|_| f.clone())),
        ),
        None => options,
    }
}

/// Push the staging tables to the CRM.
pub async fn export_data(
    config: &Config,
    store: &StagingStore,
    crm: Arc<CrmClient>,
    options: &RunOptions,
) -> Result<RunSummary> {
    let started = Instant::now();
    let mut summary = RunSummary::new("export", options.dry_run);
    let progress = options.progress.reporter();
    let labels = &config.crm.labels;

    // Field mapping must be complete before anything is written
    let mapping = crm.field_mapping(CrmEntity::Deal).await?;
    mapping
        .validate(labels.all())
        .context("CRM deal fields do not match the configured labels")?;
    let no_mapping = FieldMapping::new();

    let clients = store.read_all("clients").await?;
    let rentals = store.read_all("rentals").await?;
    let bookings = store.read_all("bookings").await?;

    let write = WriteOptions {
        remove_old_rows: config.crm.remove_old_rows,
        workers: config.crm.workers,
        scrub_empty: true,
    };

    let contact_sink = CrmSink::new(crm.clone(), CrmEntity::Contact);
    let report = sync_entity(
        &contact_sink,
        clients.iter().map(contact_from_client).collect(),
        &crm_options(config, CrmEntity::Contact, CONTACT_ID_FIELD, &no_mapping),
        write.clone(),
        None,
        options,
        progress.as_ref(),
    )
    .await?;
    summary.reports.push(report);
    let contact_ids = id_map(&contact_sink.current().await?, CONTACT_ID_FIELD);

    let product_sink = CrmSink::new(crm.clone(), CrmEntity::Product);
    let report = sync_entity(
        &product_sink,
        rentals.iter().map(product_from_rental).collect(),
        &crm_options(config, CrmEntity::Product, PRODUCT_ID_FIELD, &no_mapping),
        write.clone(),
        None,
        options,
        progress.as_ref(),
    )
    .await?;
    summary.reports.push(report);
    let product_ids: HashMap<String, String> = id_map(&product_sink.current().await?, PRODUCT_ID_FIELD);

    let ctx = DealContext::new(
        &mapping,
        labels,
        &config.crm.stages,
        &config.rules,
        &config.source.booking_link,
        options.now(),
        &clients,
        &rentals,
        &bookings,
    )
    .with_contact_ids(contact_ids);
    let deals = bookings
        .iter()
        .map(|b| deal_from_booking(b, &ctx))
        .collect::<Result<Vec<_>, _>>()?;

    let deal_id_field = mapping.field(&labels.source_id)?.to_string();
    let linker = ProductRowLinker::new(&crm, &bookings, &product_ids);
    let deal_sink = CrmSink::new(crm.clone(), CrmEntity::Deal);
    let report = sync_entity(
        &deal_sink,
        deals,
        &crm_options(config, CrmEntity::Deal, &deal_id_field, &mapping),
        write,
        Some(&linker),
        options,
        progress.as_ref(),
    )
    .await?;
    summary.reports.push(report);

    summary.elapsed = started.elapsed();
    if !options.dry_run {
        summary.record(store.pool()).await?;
    }
    Ok(summary)
}

/// `import` then `export`.
pub async fn run_sync(config: &Config, options: &RunOptions) -> Result<Vec<RunSummary>> {
    let import = run_import(config, options).await?;
    import.print();
    let export = run_export(config, options).await?;
    export.print();
    Ok(vec![import, export])
}

/// Print the custom fields of a CRM entity, for filling in `[crm.labels]`.
pub async fn run_fields(config: &Config, entity: CrmEntity) -> Result<()> {
    let http = remote::http_client(&config.retry)?;
    let crm = crm_client(config, &http).await?;
    let fields = crm.custom_fields(entity).await?;

    println!("{} custom fields", entity.name());
    println!("  {:<40} {:<24} TYPE", "LABEL", "FIELD");
    println!("  {}", "-".repeat(76));
    for f in &fields {
        println!("  {:<40} {:<24} {}", f.label.to_lowercase(), f.id, f.kind);
    }
    if entity == CrmEntity::Deal {
        let mapping: FieldMapping = fields.iter().map(|f| (f.label.as_str(), f.id.clone())).collect();
        if let Err(e) = mapping.validate(config.crm.labels.all()) {
            println!();
            println!("  {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::create_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    fn report(entity: &str, added: usize, failed: usize) -> ApplyReport {
        ApplyReport {
            entity: entity.to_string(),
            added,
            failed,
            ..Default::default()
        }
    }

    #[test]
    fn summary_totals_and_lookup() {
        let mut summary = RunSummary::new("export", false);
        summary.reports.push(report("contact", 2, 1));
        summary.reports.push(report("deal", 5, 0));

        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.report("deal").map(|r| r.added), Some(5));
        assert!(summary.report("product").is_none());
    }

    #[tokio::test]
    async fn record_writes_one_row_per_entity() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();

        let mut summary = RunSummary::new("import", false);
        summary.reports.push(report("clients", 3, 0));
        summary.reports.push(report("bookings", 1, 2));
        summary.record(&pool).await.unwrap();

        let rows: Vec<(String, String, i64, i64)> =
            sqlx::query_as("SELECT run_id, entity, added, failed FROM sync_runs ORDER BY id")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.0 == summary.run_id));
        assert_eq!((rows[1].1.as_str(), rows[1].2, rows[1].3), ("bookings", 1, 2));
    }
}
