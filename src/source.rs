//! Property-management API → staging rows.
//!
//! [`SourceApi::fetch`] pulls the raw collections (bookings, clients,
//! rentals, fees) plus the lookup collections used to enrich bookings.
//! [`build_tables`] turns them into canonical staging rows:
//!
//! - clients are flattened (e-mails joined, phone/mobile and address parts
//!   picked by label, missing text coalesced to `""`),
//! - bookings get their source name, comments, account name and win
//!   probability resolved,
//! - fees get their configured canonical name,
//! - bookings and fees are split per calendar month into segment rows,
//! - references to rows that do not exist are nulled.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use rentsync_core::record::id_of;
use rentsync_core::rules::{
    allocate, coalesce, days_until, split_by_month, win_probability, ProbabilityInterval,
};
use rentsync_core::{Fields, Record, Value};
use tracing::{debug, info, warn};

use crate::config::{RulesConfig, SourceConfig};
use crate::fetch::{Fetcher, ResourceSpec};

const BOOKING_NUMERIC: &[&str] = &[
    "initial_price",
    "final_price",
    "paid_amount",
    "damage_deposit",
    "commission",
    "adults",
    "children",
];
const RENTAL_NUMERIC: &[&str] = &[
    "min_price",
    "max_price",
    "base_rate",
    "damage_deposit",
    "bedrooms_count",
    "bathrooms_count",
    "sleeps",
    "sleeps_max",
];
const FEE_NUMERIC: &[&str] = &["price", "times_booked"];

const ADDRESS_PARTS: &[&str] = &["address1", "address2", "city", "zip", "state", "country_code"];

/// Raw collections fetched from the property-management API.
#[derive(Debug, Default)]
pub struct SourceData {
    pub bookings: Vec<Fields>,
    pub clients: Vec<Fields>,
    pub rentals: Vec<Fields>,
    pub fees: Vec<Fields>,
    /// Booking source id → name.
    pub sources: HashMap<String, String>,
    /// Booking comment id → content.
    pub comments: HashMap<String, String>,
    /// Account id → business name.
    pub accounts: HashMap<String, String>,
}

pub struct SourceApi {
    fetcher: Fetcher,
    per_page: u32,
    from: String,
}

impl SourceApi {
    pub fn new(fetcher: Fetcher, config: &SourceConfig) -> Self {
        Self {
            fetcher,
            per_page: config.per_page,
            from: config.from.clone(),
        }
    }

    /// Fetch every collection the import needs. Lookups come first.
    pub async fn fetch(&self) -> Result<SourceData> {
        let started = Instant::now();

        let sources = self
            .lookup("sources", "name", true)
            .await
            .context("Failed to fetch booking sources")?;
        let comments = self
            .lookup("booking_comments", "content", true)
            .await
            .context("Failed to fetch booking comments")?;
        let accounts = self
            .lookup("accounts", "business_name", false)
            .await
            .context("Failed to fetch accounts")?;

        let fees = self
            .collection(ResourceSpec::paged("bookings_fees", self.per_page).with_numeric_fields(FEE_NUMERIC), false)
            .await
            .context("Failed to fetch booking fees")?;
        let bookings = self
            .collection(
                ResourceSpec::paged("bookings", self.per_page).with_numeric_fields(BOOKING_NUMERIC),
                true,
            )
            .await
            .context("Failed to fetch bookings")?;
        let clients = self
            .collection(ResourceSpec::paged("clients", self.per_page), true)
            .await
            .context("Failed to fetch clients")?;
        let rentals = self
            .collection(
                ResourceSpec::paged("rentals", self.per_page).with_numeric_fields(RENTAL_NUMERIC),
                true,
            )
            .await
            .context("Failed to fetch rentals")?;

        info!(
            bookings = bookings.len(),
            clients = clients.len(),
            rentals = rentals.len(),
            fees = fees.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "source data fetched"
        );

        Ok(SourceData {
            bookings,
            clients,
            rentals,
            fees,
            sources,
            comments,
            accounts,
        })
    }

    async fn collection(&self, spec: ResourceSpec, since: bool) -> Result<Vec<Fields>> {
        let started = Instant::now();
        let mut params = serde_json::Map::new();
        if since {
            params.insert("from".into(), self.from.clone().into());
        }
        let records = self.fetcher.fetch_all(&spec, &params).await?;
        debug!(
            resource = %spec.name,
            count = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "collection fetched"
        );
        Ok(records)
    }

    async fn lookup(&self, resource: &str, field: &str, since: bool) -> Result<HashMap<String, String>> {
        let spec = ResourceSpec::paged(resource, self.per_page);
        let mut params = serde_json::Map::new();
        params.insert("fields".into(), format!("id,{}", field).into());
        if since {
            params.insert("from".into(), self.from.clone().into());
        }
        let records = self.fetcher.fetch_all(&spec, &params).await?;
        Ok(lookup_map(&records, field))
    }
}

/// `id → field` text map from fetched records.
pub fn lookup_map(records: &[Fields], field: &str) -> HashMap<String, String> {
    records
        .iter()
        .filter_map(|r| {
            let id = id_of(r.get("id")?)?;
            Some((id, r.get(field).map(Value::canonical).unwrap_or_default()))
        })
        .collect()
}

/// Staging rows per table, in dependency order.
#[derive(Debug, Default)]
pub struct StagingTables {
    pub clients: Vec<Record>,
    pub rentals: Vec<Record>,
    pub bookings: Vec<Record>,
    pub booking_segments: Vec<Record>,
    pub bookings_fees: Vec<Record>,
    pub fee_segments: Vec<Record>,
}

impl StagingTables {
    /// Rows of a table by name.
    pub fn take(&mut self, table: &str) -> Option<Vec<Record>> {
        let rows = match table {
            "clients" => &mut self.clients,
            "rentals" => &mut self.rentals,
            "bookings" => &mut self.bookings,
            "booking_segments" => &mut self.booking_segments,
            "bookings_fees" => &mut self.bookings_fees,
            "fee_segments" => &mut self.fee_segments,
            _ => return None,
        };
        Some(std::mem::take(rows))
    }
}

/// Normalize fetched data into staging rows.
pub fn build_tables(data: &SourceData, rules: &RulesConfig, now: DateTime<FixedOffset>) -> Result<StagingTables> {
    let intervals = rules.intervals()?;

    let clients: Vec<Record> = data.clients.iter().filter_map(normalize_client).collect();
    let rentals: Vec<Record> = data.rentals.iter().filter_map(normalize_rental).collect();
    let mut bookings: Vec<Record> = data
        .bookings
        .iter()
        .filter_map(|raw| normalize_booking(raw, data, &intervals, now))
        .collect();
    let mut fees: Vec<Record> = data
        .fees
        .iter()
        .filter_map(|raw| normalize_fee(raw, rules))
        .collect();

    let client_ids: HashSet<&str> = clients.iter().map(|r| r.external_id.as_str()).collect();
    let rental_ids: HashSet<&str> = rentals.iter().map(|r| r.external_id.as_str()).collect();
    for booking in &mut bookings {
        null_dangling(booking, "client_id", &client_ids);
        null_dangling(booking, "rental_id", &rental_ids);
    }
    let booking_ids: HashSet<&str> = bookings.iter().map(|r| r.external_id.as_str()).collect();
    for fee in &mut fees {
        null_dangling(fee, "booking_id", &booking_ids);
    }

    let booking_segments = bookings
        .iter()
        .flat_map(|b| booking_segments(b, rules))
        .collect();
    let by_id: HashMap<&str, &Record> = bookings.iter().map(|b| (b.external_id.as_str(), b)).collect();
    let fee_segments = fees
        .iter()
        .flat_map(|fee| {
            let booking = id_of(fee.value("booking_id")).and_then(|id| by_id.get(id.as_str()).copied());
            match booking {
                Some(booking) => fee_segments(fee, booking, rules),
                None => {
                    debug!(fee = %fee.external_id, "fee without booking, not split");
                    Vec::new()
                }
            }
        })
        .collect();

    Ok(StagingTables {
        clients,
        rentals,
        bookings,
        booking_segments,
        bookings_fees: fees,
        fee_segments,
    })
}

fn null_dangling(record: &mut Record, field: &str, known: &HashSet<&str>) {
    if let Some(id) = id_of(record.value(field)) {
        if !known.contains(id.as_str()) {
            debug!(record = %record.external_id, field, id = %id, "dangling reference nulled");
            record.set(field, Value::Null);
        }
    }
}

fn record_id(raw: &Fields) -> Option<String> {
    let id = raw.get("id").and_then(id_of);
    if id.is_none() {
        warn!("source record without id skipped");
    }
    id
}

fn text(raw: &Fields, key: &str) -> Value {
    match raw.get(key) {
        Some(Value::List(_)) | Some(Value::Record(_)) => Value::empty(),
        other => coalesce(other.cloned()),
    }
}

fn number(raw: &Fields, key: &str) -> Value {
    raw.get(key).cloned().unwrap_or_default().coerce_number()
}

fn timestamp(raw: &Fields, key: &str) -> Value {
    raw.get(key)
        .and_then(Value::as_timestamp)
        .map(Value::Timestamp)
        .unwrap_or_default()
}

fn flag(raw: &Fields, key: &str) -> Value {
    match raw.get(key) {
        Some(Value::Scalar(rentsync_core::Scalar::Bool(b))) => Value::bool(*b),
        Some(v) if !v.is_nullish() => Value::bool(true),
        Some(_) => Value::bool(false),
        None => Value::Null,
    }
}

/// Id held under `links.<name>`.
fn link(raw: &Fields, name: &str) -> Option<String> {
    match raw.get("links")? {
        Value::Record(links) => links.get(name).and_then(id_of),
        _ => None,
    }
}

fn link_ids(raw: &Fields, name: &str) -> Vec<String> {
    match raw.get("links") {
        Some(Value::Record(links)) => match links.get(name) {
            Some(Value::List(items)) => items.iter().filter_map(id_of).collect(),
            Some(v) => id_of(v).into_iter().collect(),
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn id_value(id: Option<String>) -> Value {
    match id {
        Some(id) => id.parse::<i64>().map(Value::int).unwrap_or_else(|_| Value::text(id)),
        None => Value::Null,
    }
}

pub fn normalize_client(raw: &Fields) -> Option<Record> {
    let id = record_id(raw)?;
    let mut client = Record::new(id.clone()).with("id", id_value(Some(id)));

    let emails: Vec<String> = list(raw, "emails")
        .filter_map(|e| e.get("email").map(Value::canonical))
        .filter(|e| !e.is_empty())
        .collect();
    client.set("email", emails.join(", "));

    client.set("phone", "");
    client.set("mobile", "");
    for phone in list(raw, "phones") {
        let label = phone.get("label").map(Value::canonical).unwrap_or_default();
        if label == "phone" || label == "mobile" {
            client.set(label, text(phone, "number"));
        }
    }

    // The labelled "default" address wins, otherwise the first one
    let addresses: Vec<&Fields> = list(raw, "addresses").collect();
    let address = addresses
        .iter()
        .find(|a| a.get("label").map(Value::canonical).as_deref() == Some("default"))
        .or_else(|| addresses.first());
    for part in ADDRESS_PARTS {
        let value = address.map(|a| text(a, part)).unwrap_or_else(Value::empty);
        client.set(*part, value);
    }

    for key in [
        "fullname",
        "firstname",
        "lastname",
        "company",
        "preferred_locale",
        "notes",
        "vat_number",
    ] {
        client.set(key, text(raw, key));
    }
    client.set("created_at", timestamp(raw, "created_at"));
    client.set("updated_at", timestamp(raw, "updated_at"));
    Some(client)
}

fn list<'a>(raw: &'a Fields, key: &str) -> impl Iterator<Item = &'a Fields> {
    let items: &'a [Value] = match raw.get(key) {
        Some(Value::List(items)) => items,
        _ => &[],
    };
    items.iter().filter_map(|v| match v {
        Value::Record(fields) => Some(fields),
        _ => None,
    })
}

pub fn normalize_rental(raw: &Fields) -> Option<Record> {
    let id = record_id(raw)?;
    let mut rental = Record::new(id.clone()).with("id", id_value(Some(id)));
    for key in [
        "name",
        "headline",
        "address1",
        "address2",
        "city",
        "zip",
        "state",
        "country_code",
        "currency",
        "rental_type",
        "checkin_time",
        "checkout_time",
    ] {
        rental.set(key, text(raw, key));
    }
    for key in RENTAL_NUMERIC {
        rental.set(*key, number(raw, key));
    }
    for key in ["created_at", "updated_at", "published_at"] {
        rental.set(key, timestamp(raw, key));
    }
    Some(rental)
}

pub fn normalize_booking(
    raw: &Fields,
    lookups: &SourceData,
    intervals: &[ProbabilityInterval],
    now: DateTime<FixedOffset>,
) -> Option<Record> {
    let id = record_id(raw)?;
    let mut booking = Record::new(id.clone()).with("id", id_value(Some(id.clone())));

    booking.set("client_id", id_value(link(raw, "client")));
    booking.set("rental_id", id_value(link(raw, "rental")));
    let account_id = link(raw, "account");
    booking.set(
        "account",
        account_id
            .as_ref()
            .and_then(|a| lookups.accounts.get(a))
            .cloned()
            .unwrap_or_default(),
    );
    booking.set("account_id", id_value(account_id));

    let source = link(raw, "source")
        .map(|s| lookups.sources.get(&s).cloned().unwrap_or(s))
        .unwrap_or_default();
    booking.set("source", source);

    let comments: Vec<String> = link_ids(raw, "booking_comments")
        .iter()
        .filter_map(|c| lookups.comments.get(c).cloned())
        .filter(|c| !c.is_empty())
        .collect();
    booking.set("comments", comments.join("\n"));

    for key in [
        "status",
        "reference",
        "currency",
        "discount",
        "notes",
        "expected_checkin_time",
        "expected_checkout_time",
    ] {
        booking.set(key, text(raw, key));
    }
    booking.set("booked", flag(raw, "booked"));
    booking.set("unavailable", flag(raw, "unavailable"));
    for key in BOOKING_NUMERIC {
        booking.set(*key, number(raw, key));
    }
    for key in [
        "start_at",
        "end_at",
        "created_at",
        "updated_at",
        "canceled_at",
        "tentative_expires_at",
    ] {
        booking.set(key, timestamp(raw, key));
    }

    let probability = booking.value("start_at").as_timestamp().and_then(|start| {
        let days = days_until(start, now);
        let p = win_probability(intervals, days);
        if p.is_none() && !intervals.is_empty() {
            warn!(booking = %id, days, "no win-probability interval matches");
        }
        p
    });
    booking.set("probability_win", Value::from(probability));
    Some(booking)
}

pub fn normalize_fee(raw: &Fields, rules: &RulesConfig) -> Option<Record> {
    let id = record_id(raw)?;
    let mut fee = Record::new(id.clone()).with("id", id_value(Some(id.clone())));
    fee.set("booking_id", id_value(link(raw, "booking")));
    fee.set("fee_id", id_value(link(raw, "fee")));
    fee.set("name", fee_name(raw, rules, &id));
    for key in FEE_NUMERIC {
        fee.set(*key, number(raw, key));
    }
    fee.set("required", flag(raw, "required"));
    fee.set("included_in_price", flag(raw, "included_in_price"));
    fee.set("created_at", timestamp(raw, "created_at"));
    fee.set("updated_at", timestamp(raw, "updated_at"));
    Some(fee)
}

/// Canonical fee name from the first non-empty locale that maps.
///
/// With no `fee_names` configured the first non-empty localized name is used as is.
pub fn fee_name(raw: &Fields, rules: &RulesConfig, id: &str) -> String {
    let names: Vec<String> = match raw.get("name") {
        Some(Value::Record(locales)) => locales
            .values()
            .map(Value::canonical)
            .filter(|n| !n.trim().is_empty())
            .collect(),
        Some(v) if !v.is_nullish() => vec![v.canonical()],
        _ => Vec::new(),
    };

    if rules.fee_names.is_empty() {
        return names.into_iter().next().unwrap_or_default();
    }
    for name in &names {
        if let Some(canonical) = rules.fee_names.get(&name.trim().to_lowercase()) {
            return canonical.clone();
        }
    }
    warn!(fee = %id, names = ?names, "no configured fee name matches");
    String::new()
}

fn stay(booking: &Record) -> Option<(chrono::NaiveDate, chrono::NaiveDate)> {
    Some((
        booking.value("start_at").as_date()?,
        booking.value("end_at").as_date()?,
    ))
}

fn parent_id(record: &Record) -> Option<i64> {
    record.external_id.parse().ok()
}

/// Per-month slices of a booking with price and paid amount allocated by nights.
pub fn booking_segments(booking: &Record, rules: &RulesConfig) -> Vec<Record> {
    let (Some((start, end)), Some(parent)) = (stay(booking), parent_id(booking)) else {
        return Vec::new();
    };
    let Some(segments) = split_by_month(parent, start, end, rules.night_attribution) else {
        warn!(booking = parent, "booking id too large for segment ids, segments skipped");
        return Vec::new();
    };
    let price = allocate(booking.value("final_price").as_f64().unwrap_or(0.0), &segments);
    let paid = allocate(booking.value("paid_amount").as_f64().unwrap_or(0.0), &segments);

    segments
        .iter()
        .enumerate()
        .map(|(i, s)| {
            Record::new(s.id.to_string())
                .with("id", s.id)
                .with("booking_id", parent)
                .with("segment_index", s.index as i64)
                .with("start_date", s.start)
                .with("end_date", s.end)
                .with("nights", s.nights)
                .with("final_price", price[i])
                .with("paid_amount", paid[i])
        })
        .collect()
}

/// Per-month slices of a fee over its booking's stay.
pub fn fee_segments(fee: &Record, booking: &Record, rules: &RulesConfig) -> Vec<Record> {
    let (Some((start, end)), Some(parent)) = (stay(booking), parent_id(fee)) else {
        return Vec::new();
    };
    let Some(segments) = split_by_month(parent, start, end, rules.night_attribution) else {
        warn!(fee = parent, "fee id too large for segment ids, segments skipped");
        return Vec::new();
    };
    let price = allocate(fee.value("price").as_f64().unwrap_or(0.0), &segments);

    segments
        .iter()
        .enumerate()
        .map(|(i, s)| {
            Record::new(s.id.to_string())
                .with("id", s.id)
                .with("bookings_fee_id", parent)
                .with("booking_id", booking.value("id").clone())
                .with("segment_index", s.index as i64)
                .with("name", fee.value("name").clone())
                .with("start_date", s.start)
                .with("end_date", s.end)
                .with("nights", s.nights)
                .with("price", price[i])
        })
        .collect()
}
