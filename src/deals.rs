//! Staging rows → desired CRM contacts, products and deals.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use rentsync_core::record::id_of;
use rentsync_core::rules::{derive_stage, night_count, returning_clients, Stage};
use rentsync_core::{FieldMapping, MappingError, Record, Value};
use tracing::warn;

use crate::apply::AddHook;
use crate::config::{DealLabels, RulesConfig, StageCodes};
use crate::crm::CrmClient;

/// Field holding the client id on contacts.
pub const CONTACT_ID_FIELD: &str = "ORIGIN_ID";
/// Field holding the rental id on products.
pub const PRODUCT_ID_FIELD: &str = "XML_ID";

fn multi_value(value: &str, kind: &str) -> Value {
    Value::Record(
        [
            ("VALUE".to_string(), Value::text(value)),
            ("VALUE_TYPE".to_string(), Value::text(kind)),
        ]
        .into_iter()
        .collect(),
    )
}

/// A staging client as a CRM contact.
pub fn contact_from_client(client: &Record) -> Record {
    let text = |key: &str| client.value(key).canonical();

    let emails: Vec<Value> = text("email")
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|e| multi_value(e, "WORK"))
        .collect();
    let mut phones = Vec::new();
    if !text("phone").is_empty() {
        phones.push(multi_value(&text("phone"), "WORK"));
    }
    if !text("mobile").is_empty() {
        phones.push(multi_value(&text("mobile"), "MOBILE"));
    }

    let name = match text("firstname") {
        n if n.is_empty() => text("fullname"),
        n => n,
    };

    Record::new(client.external_id.clone())
        .with(CONTACT_ID_FIELD, client.external_id.clone())
        .with("NAME", name)
        .with("LAST_NAME", text("lastname"))
        .with("EMAIL", Value::List(emails))
        .with("PHONE", Value::List(phones))
        .with("ADDRESS", text("address1"))
        .with("ADDRESS_2", text("address2"))
        .with("ADDRESS_CITY", text("city"))
        .with("ADDRESS_POSTAL_CODE", text("zip"))
        .with("ADDRESS_PROVINCE", text("state"))
        .with("ADDRESS_COUNTRY_CODE", text("country_code"))
        .with("COMMENTS", text("notes"))
}

/// A staging rental as a CRM product.
pub fn product_from_rental(rental: &Record) -> Record {
    Record::new(rental.external_id.clone())
        .with(PRODUCT_ID_FIELD, rental.external_id.clone())
        .with("NAME", rental.value("name").canonical())
        .with("DESCRIPTION", rental.value("headline").canonical())
        .with("CURRENCY_ID", rental.value("currency").canonical())
        .with("PRICE", rental.value("base_rate").clone())
}

/// Everything a deal needs besides its booking row.
pub struct DealContext<'a> {
    pub mapping: &'a FieldMapping,
    pub labels: &'a DealLabels,
    pub stages: &'a StageCodes,
    pub rules: &'a RulesConfig,
    pub booking_link: &'a str,
    pub now: DateTime<FixedOffset>,
    clients: HashMap<String, &'a Record>,
    rentals: HashMap<String, &'a Record>,
    returning: HashSet<String>,
    contact_ids: HashMap<String, String>,
}

impl<'a> DealContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mapping: &'a FieldMapping,
        labels: &'a DealLabels,
        stages: &'a StageCodes,
        rules: &'a RulesConfig,
        booking_link: &'a str,
        now: DateTime<FixedOffset>,
        clients: &'a [Record],
        rentals: &'a [Record],
        bookings: &[Record],
    ) -> Self {
        let client_ids: Vec<String> = bookings
            .iter()
            .filter_map(|b| id_of(b.value("client_id")))
            .collect();
        Self {
            mapping,
            labels,
            stages,
            rules,
            booking_link,
            now,
            clients: clients.iter().map(|c| (c.external_id.clone(), c)).collect(),
            rentals: rentals.iter().map(|r| (r.external_id.clone(), r)).collect(),
            returning: returning_clients(client_ids.iter().map(String::as_str)),
            contact_ids: HashMap::new(),
        }
    }

    /// Client id → CRM contact id, resolved after contacts were written.
    pub fn with_contact_ids(mut self, contact_ids: HashMap<String, String>) -> Self {
        self.contact_ids = contact_ids;
        self
    }

    fn stage_code(&self, stage: Stage) -> &str {
        match stage {
            Stage::Arrived => &self.stages.arrived,
            Stage::InProgress => &self.stages.in_progress,
            Stage::Completed => &self.stages.completed,
            Stage::PaymentDue => &self.stages.payment_due,
            Stage::Booked => &self.stages.booked,
        }
    }
}

/// A staging booking as a CRM deal.
pub fn deal_from_booking(booking: &Record, ctx: &DealContext<'_>) -> Result<Record, MappingError> {
    let field = |label: &str| ctx.mapping.field(label).map(str::to_string);
    let labels = ctx.labels;

    let client_id = id_of(booking.value("client_id"));
    let client = client_id.as_ref().and_then(|id| ctx.clients.get(id));
    let rental = id_of(booking.value("rental_id")).and_then(|id| ctx.rentals.get(&id).copied());

    let client_name = client
        .map(|c| c.value("fullname").canonical())
        .filter(|n| !n.is_empty());
    let rental_name = rental.map(|r| r.value("name").canonical()).unwrap_or_default();

    let start_at = booking.value("start_at").as_timestamp();
    let end_at = booking.value("end_at").as_timestamp();
    let nights = night_count(booking.value("start_at"), booking.value("end_at"));

    let stage = derive_stage(
        start_at,
        end_at,
        &booking.value("status").canonical(),
        ctx.now,
        &ctx.rules.stage,
    );

    let returning = match &client_id {
        Some(id) if ctx.returning.contains(id) => &ctx.rules.returning_yes,
        _ => &ctx.rules.returning_no,
    };

    let contact_id = match &client_id {
        Some(id) => match ctx.contact_ids.get(id) {
            Some(contact) => Value::text(contact.clone()),
            None => {
                warn!(booking = %booking.external_id, client = %id, "no CRM contact for client");
                Value::Null
            }
        },
        None => Value::Null,
    };

    let description = format!(
        "{}, {}, from {}, {} night(s)",
        client_name.as_deref().unwrap_or("unknown"),
        rental_name,
        start_at
            .map(|s| s.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        nights.map(|n| n.to_string()).unwrap_or_default(),
    );

    let deal = Record::new(booking.external_id.clone())
        .with(field(&labels.source_id)?, booking.external_id.clone())
        .with("TITLE", client_name.unwrap_or_else(|| "Unknown".to_string()))
        .with("OPPORTUNITY", booking.value("final_price").as_f64())
        .with("CURRENCY_ID", booking.value("currency").canonical())
        .with("STAGE_ID", stage.map(|s| ctx.stage_code(s).to_string()))
        .with("PROBABILITY", booking.value("probability_win").as_i64())
        .with("CONTACT_ID", contact_id)
        .with("COMMENTS", booking.value("notes").canonical())
        .with(field(&labels.available_to_everyone)?, "1")
        .with(field(&labels.close_date)?, end_at)
        .with(field(&labels.start_date)?, start_at)
        .with(field(&labels.adults)?, booking.value("adults").as_i64())
        .with(field(&labels.children)?, booking.value("children").as_i64())
        .with(field(&labels.comments)?, booking.value("comments").canonical())
        .with(field(&labels.check_in_time)?, booking.value("expected_checkin_time").clone())
        .with(field(&labels.check_out_time)?, booking.value("expected_checkout_time").clone())
        .with(field(&labels.nights)?, nights)
        .with(field(&labels.returning)?, returning.clone())
        .with(field(&labels.description)?, description)
        .with(field(&labels.source)?, booking.value("source").canonical())
        .with(field(&labels.quantity)?, "1")
        .with(
            field(&labels.link)?,
            ctx.booking_link.replace("{id}", &booking.external_id),
        );
    Ok(deal)
}

/// Attaches the booked rental's product to every newly created deal.
pub struct ProductRowLinker<'a> {
    client: &'a CrmClient,
    /// Deal external id → (product id, price).
    rows: HashMap<String, (String, Option<f64>)>,
}

impl<'a> ProductRowLinker<'a> {
    pub fn new(client: &'a CrmClient, bookings: &[Record], product_ids: &HashMap<String, String>) -> Self {
        let rows = bookings
            .iter()
            .filter_map(|b| {
                let rental = id_of(b.value("rental_id"))?;
                let product = product_ids.get(&rental)?;
                Some((
                    b.external_id.clone(),
                    (product.clone(), b.value("final_price").as_f64()),
                ))
            })
            .collect();
        Self { client, rows }
    }
}

#[async_trait]
impl AddHook for ProductRowLinker<'_> {
    async fn after_add(&self, record: &Record, internal_id: &str) -> anyhow::Result<()> {
        if let Some((product, price)) = self.rows.get(&record.external_id) {
            self.client.set_product_row(internal_id, product, *price).await?;
        }
        Ok(())
    }
}

/// External id → internal id of target records, read from their id field.
pub fn id_map(records: &[Record], id_field: &str) -> HashMap<String, String> {
    records
        .iter()
        .filter_map(|r| Some((id_of(r.value(id_field))?, r.internal_id.clone()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mapping(labels: &DealLabels) -> FieldMapping {
        labels
            .all()
            .into_iter()
            .enumerate()
            .map(|(i, label)| (label.to_string(), format!("UF_CRM_{}", i)))
            .collect()
    }

    fn now() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap()
    }

    fn ts(s: &str) -> Value {
        Value::Timestamp(rentsync_core::value::parse_timestamp(s).unwrap())
    }

    fn booking(id: &str, client: i64) -> Record {
        Record::new(id)
            .with("id", id)
            .with("client_id", client)
            .with("rental_id", 7i64)
            .with("status", "Booked")
            .with("final_price", 600.0)
            .with("currency", "EUR")
            .with("start_at", ts("2024-01-28T16:00:00Z"))
            .with("end_at", ts("2024-02-03T10:00:00Z"))
            .with("adults", 2i64)
            .with("probability_win", 80i64)
    }

    #[test]
    fn deal_fields_are_composed() {
        let labels = DealLabels::default();
        let mapping = mapping(&labels);
        let stages = StageCodes::default();
        let rules = RulesConfig::default();
        let clients = vec![Record::new("5").with("fullname", "Ada Lovelace")];
        let rentals = vec![Record::new("7").with("name", "Loft")];
        let bookings = vec![booking("42", 5), booking("43", 5)];
        let ctx = DealContext::new(
            &mapping,
            &labels,
            &stages,
            &rules,
            "https://pm.example.com/bookings/{id}",
            now(),
            &clients,
            &rentals,
            &bookings,
        )
        .with_contact_ids([("5".to_string(), "900".to_string())].into_iter().collect());

        let deal = deal_from_booking(&bookings[0], &ctx).unwrap();
        let uf = |label: &str| mapping.field(label).unwrap().to_string();
        assert_eq!(deal.value("TITLE"), &Value::text("Ada Lovelace"));
        assert_eq!(deal.value("STAGE_ID"), &Value::text("PREPARATION"));
        assert_eq!(deal.value("CONTACT_ID"), &Value::text("900"));
        assert_eq!(deal.value("OPPORTUNITY"), &Value::float(600.0));
        assert_eq!(deal.value(&uf("id booking (source)")), &Value::text("42"));
        assert_eq!(deal.value(&uf("number of nights")), &Value::int(6));
        assert_eq!(deal.value(&uf("returning host")), &Value::text("1"));
        assert_eq!(
            deal.value(&uf("event description")),
            &Value::text("Ada Lovelace, Loft, from 2024-01-28, 6 night(s)")
        );
        assert_eq!(
            deal.value(&uf("bookingsync link")),
            &Value::text("https://pm.example.com/bookings/42")
        );
    }

    #[test]
    fn unknown_client_and_missing_label() {
        let labels = DealLabels::default();
        let mapping = mapping(&labels);
        let stages = StageCodes::default();
        let rules = RulesConfig::default();
        let bookings = vec![booking("42", 99)];
        let ctx = DealContext::new(&mapping, &labels, &stages, &rules, "{id}", now(), &[], &[], &bookings);
        let deal = deal_from_booking(&bookings[0], &ctx).unwrap();
        assert_eq!(deal.value("TITLE"), &Value::text("Unknown"));
        assert_eq!(deal.value("CONTACT_ID"), &Value::Null);

        let empty = FieldMapping::new();
        let ctx = DealContext::new(&empty, &labels, &stages, &rules, "{id}", now(), &[], &[], &bookings);
        assert!(matches!(deal_from_booking(&bookings[0], &ctx), Err(MappingError::Unknown(_))));
    }

    #[test]
    fn contact_multi_values() {
        let client = Record::new("5")
            .with("firstname", "Ada")
            .with("email", "ada@example.com, ada@work.example")
            .with("mobile", "+420 1")
            .with("phone", "");
        let contact = contact_from_client(&client);
        assert_eq!(contact.value(CONTACT_ID_FIELD), &Value::text("5"));
        match contact.value("EMAIL") {
            Value::List(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        match contact.value("PHONE") {
            Value::List(items) => assert_eq!(items, &vec![multi_value("+420 1", "MOBILE")]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn id_map_skips_records_without_id() {
        let records = vec![
            Record::from_target("1", [("ORIGIN_ID".to_string(), Value::text("5"))].into_iter().collect()),
            Record::from_target("2", Default::default()),
        ];
        let map = id_map(&records, "ORIGIN_ID");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("5").map(String::as_str), Some("1"));
    }
}
