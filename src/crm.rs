//! CRM REST client.
//!
//! Methods are called as `<base_url>/<method>` with a JSON body and the
//! access token in the `auth` query parameter. Lists are cursor-paginated
//! (`start` / `next`). Write calls answer `{"result": ...}` or
//! `{"error": ..., "error_description": ...}`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rentsync_core::record::id_of;
use rentsync_core::sink::Sink;
use rentsync_core::{FieldMapping, Fields, Record, Value};
use serde_json::json;
use tracing::{debug, info};

use crate::fetch::{Fetcher, ResourceSpec};
use crate::remote::{ApiRequest, RemoteError};

/// Prefix of user-defined fields; their human label lives in the field metadata.
pub const CUSTOM_FIELD_PREFIX: &str = "UF_CRM_";

/// The CRM entity types rentsync writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CrmEntity {
    Contact,
    Product,
    Deal,
}

impl CrmEntity {
    pub fn name(&self) -> &'static str {
        match self {
            CrmEntity::Contact => "contact",
            CrmEntity::Product => "product",
            CrmEntity::Deal => "deal",
        }
    }

    fn method(&self, action: &str) -> String {
        format!("crm.{}.{}", self.name(), action)
    }

    fn select(&self) -> serde_json::Value {
        match self {
            CrmEntity::Contact => json!(["*", "UF_*", "PHONE", "EMAIL"]),
            CrmEntity::Product => json!(["*"]),
            CrmEntity::Deal => json!(["*", "UF_*"]),
        }
    }
}

/// One custom field as reported by the `*.fields` method.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub id: String,
    pub label: String,
    pub kind: String,
}

pub struct CrmClient {
    fetcher: Fetcher,
}

impl CrmClient {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value, RemoteError> {
        let url = self.fetcher.url(method);
        let response = self.fetcher.client().send(&ApiRequest::post(url.clone(), body)).await?;
        if let Some(code) = response.get("error") {
            return Err(RemoteError::Api {
                url,
                code: code.as_str().map(str::to_string).unwrap_or_else(|| code.to_string()),
                description: response
                    .get("error_description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(response)
    }

    /// Custom fields of an entity with their human labels.
    pub async fn custom_fields(&self, entity: CrmEntity) -> Result<Vec<FieldInfo>> {
        let response = self
            .call(&entity.method("fields"), json!({}))
            .await
            .with_context(|| format!("Failed to read {} field metadata", entity.name()))?;
        Ok(parse_custom_fields(&response))
    }

    /// Label → field id mapping of an entity's custom fields.
    pub async fn field_mapping(&self, entity: CrmEntity) -> Result<FieldMapping> {
        let fields = self.custom_fields(entity).await?;
        let mapping: FieldMapping = fields.iter().map(|f| (f.label.as_str(), f.id.clone())).collect();
        info!(entity = entity.name(), fields = mapping.len(), "field mapping loaded");
        Ok(mapping)
    }

    /// Every record of an entity, keyed by the CRM's own `ID`.
    pub async fn list(&self, entity: CrmEntity) -> Result<Vec<Record>> {
        let spec = ResourceSpec::cursor(&entity.method("list"), "ID").with_numeric_fields(&["OPPORTUNITY", "PRICE"]);
        let mut params = serde_json::Map::new();
        params.insert("select".into(), entity.select());
        params.insert("order".into(), json!({"ID": "ASC"}));

        let records = self
            .fetcher
            .fetch_all(&spec, &params)
            .await
            .with_context(|| format!("Failed to list {} records", entity.name()))?;
        Ok(records
            .into_iter()
            .filter_map(|fields| {
                let id = fields.get("ID").and_then(id_of)?;
                Some(Record::from_target(id, fields))
            })
            .collect())
    }

    pub async fn add(&self, entity: CrmEntity, fields: &Fields) -> Result<String> {
        let response = self
            .call(
                &entity.method("add"),
                json!({"fields": to_json(fields), "params": {"REGISTER_SONET_EVENT": "N"}}),
            )
            .await?;
        response
            .get("result")
            .map(Value::from_json)
            .as_ref()
            .and_then(id_of)
            .with_context(|| format!("{} add returned no id: {}", entity.name(), response))
    }

    pub async fn update(&self, entity: CrmEntity, id: &str, fields: &Fields) -> Result<()> {
        self.call(&entity.method("update"), json!({"id": id, "fields": to_json(fields)}))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, entity: CrmEntity, id: &str) -> Result<()> {
        self.call(&entity.method("delete"), json!({"id": id})).await?;
        Ok(())
    }

    /// Replace a deal's product rows with a single product.
    pub async fn set_product_row(&self, deal_id: &str, product_id: &str, price: Option<f64>) -> Result<()> {
        let mut row = json!({"PRODUCT_ID": product_id, "QUANTITY": 1});
        if let Some(price) = price {
            row["PRICE"] = json!(price);
        }
        self.call("crm.deal.productrows.set", json!({"id": deal_id, "rows": [row]}))
            .await?;
        debug!(deal = %deal_id, product = %product_id, "product row attached");
        Ok(())
    }
}

fn to_json(fields: &Fields) -> serde_json::Value {
    serde_json::Value::Object(fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

/// Custom fields (`UF_CRM_*`) with a form label, falling back to the list label.
pub fn parse_custom_fields(response: &serde_json::Value) -> Vec<FieldInfo> {
    let Some(result) = response.get("result").and_then(|r| r.as_object()) else {
        return Vec::new();
    };
    result
        .iter()
        .filter(|(id, _)| id.starts_with(CUSTOM_FIELD_PREFIX))
        .filter_map(|(id, meta)| {
            let label = ["formLabel", "listLabel"]
                .iter()
                .filter_map(|k| meta.get(*k).and_then(|l| l.as_str()))
                .find(|l| !l.trim().is_empty())?;
            Some(FieldInfo {
                id: id.clone(),
                label: label.to_string(),
                kind: meta.get("type").and_then(|t| t.as_str()).unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// One CRM entity as a reconciliation target.
pub struct CrmSink {
    client: Arc<CrmClient>,
    entity: CrmEntity,
}

impl CrmSink {
    pub fn new(client: Arc<CrmClient>, entity: CrmEntity) -> Self {
        Self { client, entity }
    }
}

#[async_trait]
impl Sink for CrmSink {
    fn entity(&self) -> &str {
        self.entity.name()
    }

    async fn current(&self) -> Result<Vec<Record>> {
        self.client.list(self.entity).await
    }

    async fn remove(&self, internal_id: &str) -> Result<()> {
        self.client.delete(self.entity, internal_id).await
    }

    async fn update(&self, record: &Record) -> Result<()> {
        let id = record
            .internal_id
            .as_deref()
            .with_context(|| format!("update without internal id ({})", record.external_id))?;
        self.client.update(self.entity, id, &record.fields).await
    }

    async fn add(&self, record: &Record) -> Result<String> {
        self.client.add(self.entity, &record.fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_fields_need_prefix_and_label() {
        let response = json!({"result": {
            "TITLE": {"type": "string", "formLabel": "Title"},
            "UF_CRM_1": {"type": "string", "formLabel": "ID booking (source)", "listLabel": "id"},
            "UF_CRM_2": {"type": "date", "formLabel": "", "listLabel": "Start date"},
            "UF_CRM_3": {"type": "string"}
        }});
        let fields = parse_custom_fields(&response);
        assert_eq!(fields.len(), 2);

        let mapping: FieldMapping = fields.iter().map(|f| (f.label.as_str(), f.id.clone())).collect();
        assert_eq!(mapping.field("id booking (source)").unwrap(), "UF_CRM_1");
        assert_eq!(mapping.field("START DATE").unwrap(), "UF_CRM_2");
        assert!(mapping.field("title").is_err());
    }

    #[test]
    fn entity_methods() {
        assert_eq!(CrmEntity::Deal.method("list"), "crm.deal.list");
        use clap::ValueEnum;
        assert_eq!(CrmEntity::from_str("contact", false).unwrap(), CrmEntity::Contact);
        assert!(CrmEntity::from_str("lead", false).is_err());
        let names: Vec<&str> = CrmEntity::value_variants()
            .iter()
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec!["contact", "product", "deal"]);
    }
}
