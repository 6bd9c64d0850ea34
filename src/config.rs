//! TOML configuration.
//!
//! Every business rule the pipeline applies is configuration: label maps,
//! mutable-field allow-lists, the payment window, the remove-old-rows
//! toggles, the staging table order, page sizes, and retry timings.
//! See `config/rentsync.example.toml` for a complete file.

use anyhow::{bail, Context, Result};
use rentsync_core::rules::{NightAttribution, ProbabilityInterval, StagePolicy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::migrate::STAGING_TABLES;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    pub crm: CrmConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_log_level() -> String {
    "info".to_string()
}

/// OAuth client registration shared by both remote systems.
#[derive(Debug, Deserialize, Clone)]
pub struct OAuthConfig {
    pub token_url: String,
    pub token_file: PathBuf,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
}

/// Property-management API (the source).
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(flatten)]
    pub oauth: OAuthConfig,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    /// Lower bound passed as the `from` filter (`YYYYMMDD`).
    #[serde(default = "default_from")]
    pub from: String,
    /// Link template for a booking in the source UI; `{id}` is replaced.
    #[serde(default = "default_booking_link")]
    pub booking_link: String,
}

fn default_per_page() -> u32 {
    100
}
fn default_from() -> String {
    "20111101".to_string()
}
fn default_booking_link() -> String {
    "https://www.bookingsync.com/en/bookings/{id}".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    /// Staging tables in dependency order (referenced tables first).
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub clean_before_insert: bool,
    #[serde(default = "default_true")]
    pub remove_old_rows: bool,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            tables: default_tables(),
            chunk_size: default_chunk_size(),
            clean_before_insert: false,
            remove_old_rows: true,
        }
    }
}

fn default_tables() -> Vec<String> {
    STAGING_TABLES.iter().map(|t| t.to_string()).collect()
}
fn default_chunk_size() -> usize {
    500
}
fn default_true() -> bool {
    true
}

/// CRM (the sink).
#[derive(Debug, Deserialize, Clone)]
pub struct CrmConfig {
    /// REST root; methods are appended (`<base_url>/crm.deal.list`).
    pub base_url: String,
    #[serde(flatten)]
    pub oauth: OAuthConfig,
    /// Worker pool size for record creation.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub remove_old_rows: bool,
    #[serde(default)]
    pub stages: StageCodes,
    #[serde(default)]
    pub labels: DealLabels,
    /// Mutable-field allow-lists keyed by entity (`contact`, `product`, `deal`).
    #[serde(default)]
    pub mutable_fields: BTreeMap<String, Vec<String>>,
}

fn default_workers() -> usize {
    1
}

/// CRM stage codes for each derived stage.
#[derive(Debug, Deserialize, Clone)]
pub struct StageCodes {
    #[serde(default = "default_stage_arrived")]
    pub arrived: String,
    #[serde(default = "default_stage_in_progress")]
    pub in_progress: String,
    #[serde(default = "default_stage_completed")]
    pub completed: String,
    #[serde(default = "default_stage_payment_due")]
    pub payment_due: String,
    #[serde(default = "default_stage_booked")]
    pub booked: String,
}

fn default_stage_arrived() -> String {
    "PREPAYMENT_INVOICE".to_string()
}
fn default_stage_in_progress() -> String {
    "EXECUTING".to_string()
}
fn default_stage_completed() -> String {
    "WON".to_string()
}
fn default_stage_payment_due() -> String {
    "PREPARATION".to_string()
}
fn default_stage_booked() -> String {
    "NEW".to_string()
}

impl Default for StageCodes {
    fn default() -> Self {
        Self {
            arrived: default_stage_arrived(),
            in_progress: default_stage_in_progress(),
            completed: default_stage_completed(),
            payment_due: default_stage_payment_due(),
            booked: default_stage_booked(),
        }
    }
}

/// Human labels of the CRM custom deal fields, resolved through the field mapping.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DealLabels {
    pub source_id: String,
    pub available_to_everyone: String,
    pub close_date: String,
    pub start_date: String,
    pub adults: String,
    pub children: String,
    pub comments: String,
    pub check_in_time: String,
    pub check_out_time: String,
    pub nights: String,
    pub returning: String,
    pub description: String,
    pub source: String,
    pub quantity: String,
    pub link: String,
}

impl Default for DealLabels {
    fn default() -> Self {
        Self {
            source_id: "id booking (source)".into(),
            available_to_everyone: "available to everyone".into(),
            close_date: "assumed close date".into(),
            start_date: "start date".into(),
            adults: "adults arrived".into(),
            children: "children arrived".into(),
            comments: "comments booking".into(),
            check_in_time: "check in time".into(),
            check_out_time: "check out time".into(),
            nights: "number of nights".into(),
            returning: "returning host".into(),
            description: "event description".into(),
            source: "source".into(),
            quantity: "quantity".into(),
            link: "bookingsync link".into(),
        }
    }
}

impl DealLabels {
    /// Every label the deal normalizer resolves.
    pub fn all(&self) -> Vec<&str> {
        [
            &self.source_id,
            &self.available_to_everyone,
            &self.close_date,
            &self.start_date,
            &self.adults,
            &self.children,
            &self.comments,
            &self.check_in_time,
            &self.check_out_time,
            &self.nights,
            &self.returning,
            &self.description,
            &self.source,
            &self.quantity,
            &self.link,
        ]
        .into_iter()
        .map(String::as_str)
        .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RulesConfig {
    #[serde(flatten)]
    pub stage: StagePolicy,
    #[serde(default)]
    pub night_attribution: NightAttribution,
    #[serde(default = "default_returning_yes")]
    pub returning_yes: String,
    #[serde(default = "default_returning_no")]
    pub returning_no: String,
    /// Lower-cased fee name (any locale) → canonical fee name.
    #[serde(default)]
    pub fee_names: BTreeMap<String, String>,
    /// `"<from>-<to|inf> days <percent>%"` entries.
    #[serde(default)]
    pub probability_intervals: Vec<String>,
}

fn default_returning_yes() -> String {
    "1".to_string()
}
fn default_returning_no() -> String {
    "0".to_string()
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            stage: StagePolicy::default(),
            night_attribution: NightAttribution::default(),
            returning_yes: default_returning_yes(),
            returning_no: default_returning_no(),
            fee_names: BTreeMap::new(),
            probability_intervals: Vec::new(),
        }
    }
}

impl RulesConfig {
    pub fn intervals(&self) -> Result<Vec<ProbabilityInterval>> {
        self.probability_intervals
            .iter()
            .map(|s| s.parse().map_err(anyhow::Error::from))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Attempts per request, the first one included. `2` = retry once.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause after a token refresh before re-issuing the request.
    #[serde(default = "default_auth_delay")]
    pub auth_delay_secs: u64,
    /// Pause before retrying a 5xx or a timed-out request.
    #[serde(default = "default_server_delay")]
    pub server_delay_secs: u64,
    /// Wait used on 429 when the server sends no usable reset header.
    #[serde(default = "default_rate_limit_fallback")]
    pub rate_limit_fallback_secs: u64,
    /// Longest wait honoured for a server-supplied reset time.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    2
}
fn default_auth_delay() -> u64 {
    10
}
fn default_server_delay() -> u64 {
    5
}
fn default_rate_limit_fallback() -> u64 {
    60
}
fn default_rate_limit_max() -> u64 {
    3600
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            auth_delay_secs: default_auth_delay(),
            server_delay_secs: default_server_delay(),
            rate_limit_fallback_secs: default_rate_limit_fallback(),
            rate_limit_max_secs: default_rate_limit_max(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Secrets from the environment win over the file
    if let Ok(secret) = std::env::var("RENTSYNC_SOURCE_CLIENT_SECRET") {
        config.source.oauth.client_secret = secret;
    }
    if let Ok(secret) = std::env::var("RENTSYNC_CRM_CLIENT_SECRET") {
        config.crm.oauth.client_secret = secret;
    }

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.source.per_page == 0 {
        bail!("source.per_page must be > 0");
    }
    if config.crm.workers == 0 {
        bail!("crm.workers must be >= 1");
    }
    if config.staging.chunk_size == 0 {
        bail!("staging.chunk_size must be > 0");
    }
    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }

    if config.staging.tables.is_empty() {
        bail!("staging.tables must list at least one table");
    }
    for table in &config.staging.tables {
        if !STAGING_TABLES.contains(&table.as_str()) {
            bail!(
                "Unknown staging table: '{}'. Must be one of: {}",
                table,
                STAGING_TABLES.join(", ")
            );
        }
    }
    // Referenced tables must come before the tables pointing at them
    for (i, table) in STAGING_TABLES.iter().enumerate() {
        let Some(pos) = config.staging.tables.iter().position(|t| t == table) else {
            continue;
        };
        for parent in &STAGING_TABLES[..i] {
            if let Some(parent_pos) = config.staging.tables.iter().position(|t| t == parent) {
                if parent_pos > pos {
                    bail!("staging.tables: '{}' must be listed before '{}'", parent, table);
                }
            }
        }
    }

    if !(0..=365).contains(&config.rules.stage.payment_window_days) {
        bail!("rules.payment_window_days must be in [0, 365]");
    }
    config.rules.intervals()?;

    for entity in config.crm.mutable_fields.keys() {
        match entity.as_str() {
            "contact" | "product" | "deal" => {}
            other => bail!(
                "Unknown entity in crm.mutable_fields: '{}'. Must be contact, product, or deal.",
                other
            ),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#"
[db]
path = "./data/rentsync.sqlite"

[source]
base_url = "https://pm.example.com/api/v3"
token_url = "https://pm.example.com/oauth/token"
token_file = "./config/source_token.json"
client_id = "src"

[crm]
base_url = "https://crm.example.com/rest"
token_url = "https://crm.example.com/oauth/token"
token_file = "./config/crm_token.json"
client_id = "crm"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.staging.chunk_size, 500);
        assert_eq!(config.crm.workers, 1);
        assert!(!config.crm.remove_old_rows);
        assert!(config.staging.remove_old_rows);
        assert_eq!(config.rules.stage.payment_window_days, 32);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.crm.labels.source_id, "id booking (source)");
        assert_eq!(config.staging.tables.first().map(String::as_str), Some("clients"));
    }

    #[test]
    fn rules_section_overrides_policy() {
        let text = format!(
            "{MINIMAL}\n[rules]\npayment_window_days = 14\nin_progress_includes_start = false\nnight_attribution = \"checkin\"\nprobability_intervals = [\"0-7 days 90%\"]\n"
        );
        let config: Config = toml::from_str(&text).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.rules.stage.payment_window_days, 14);
        assert!(!config.rules.stage.in_progress_includes_start);
        assert_eq!(config.rules.night_attribution, NightAttribution::Checkin);
        assert_eq!(config.rules.intervals().unwrap()[0].percent, 90);
    }

    #[test]
    fn example_config_is_valid() {
        let config: Config = toml::from_str(include_str!("../config/rentsync.example.toml")).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.crm.workers, 4);
        assert_eq!(config.rules.intervals().unwrap().len(), 3);
        assert_eq!(config.rules.fee_names.get("ménage").map(String::as_str), Some("Cleaning"));
    }

    #[test]
    fn table_order_is_checked() {
        let text = format!("{MINIMAL}\n[staging]\ntables = [\"bookings\", \"clients\"]\n");
        let config: Config = toml::from_str(&text).unwrap();
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("'clients' must be listed before 'bookings'"), "{err}");
    }

    #[test]
    fn unknown_table_and_bad_interval_are_rejected() {
        let text = format!("{MINIMAL}\n[staging]\ntables = [\"clients\", \"invoices\"]\n");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());

        let text = format!("{MINIMAL}\n[rules]\nprobability_intervals = [\"soon\"]\n");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());
    }
}
