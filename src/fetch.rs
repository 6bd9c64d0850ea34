//! Paginated retrieval of remote collections.
//!
//! Two pagination styles are supported:
//!
//! - [`Pagination::Pages`]: numbered pages. The first response's `meta`
//!   object carries `X-Total-Pages` (and `X-Per-Page`); pages `1..=total`
//!   are requested with a `page` query parameter.
//! - [`Pagination::Cursor`]: the response carries a `next` token which is
//!   sent back in the named request parameter until it disappears.
//!
//! Records are deduplicated by id across pages. A page that contributes no
//! new record ends the traversal, which protects against servers that keep
//! returning the last page. Fields listed as numeric are coerced from text.

use std::collections::HashSet;
use std::sync::Arc;

use reqwest::Method;
use rentsync_core::record::id_of;
use rentsync_core::{Fields, Value};
use tracing::{debug, warn};

use crate::remote::{ApiRequest, RemoteClient, RemoteError};

/// Upper bound on pages per collection, whatever the server claims.
const MAX_PAGES: u32 = 10_000;

#[derive(Debug, Clone)]
pub enum Pagination {
    /// Page-numbered collections (`?page=N&per_page=M`).
    Pages { per_page: u32 },
    /// Offset/cursor collections; `next` from the response goes into `param`.
    Cursor { param: String },
}

/// Description of one remote collection.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub name: String,
    /// Path appended to the client's base URL.
    pub path: String,
    pub method: Method,
    /// Key of the record array in the response (`"result"`, `"bookings"`).
    pub result_key: String,
    pub id_field: String,
    pub pagination: Pagination,
    /// Fields whose numeric text is turned into numbers.
    pub numeric_fields: Vec<String>,
}

impl ResourceSpec {
    /// A `GET` collection with numbered pages whose array key is the resource name.
    pub fn paged(name: &str, per_page: u32) -> Self {
        Self {
            name: name.to_string(),
            path: name.to_string(),
            method: Method::GET,
            result_key: name.to_string(),
            id_field: "id".to_string(),
            pagination: Pagination::Pages { per_page },
            numeric_fields: Vec::new(),
        }
    }

    /// A `POST` method call returning `{"result": [...], "next": N}`.
    pub fn cursor(method: &str, id_field: &str) -> Self {
        Self {
            name: method.to_string(),
            path: method.to_string(),
            method: Method::POST,
            result_key: "result".to_string(),
            id_field: id_field.to_string(),
            pagination: Pagination::Cursor {
                param: "start".to_string(),
            },
            numeric_fields: Vec::new(),
        }
    }

    pub fn with_numeric_fields(mut self, fields: &[&str]) -> Self {
        self.numeric_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

pub struct Fetcher {
    client: Arc<RemoteClient>,
    base_url: String,
}

impl Fetcher {
    pub fn new(client: Arc<RemoteClient>, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn client(&self) -> &Arc<RemoteClient> {
        &self.client
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Fetch every record of a collection.
    ///
    /// `params` are sent as query parameters for `GET` and as JSON body
    /// members for `POST`.
    pub async fn fetch_all(
        &self,
        spec: &ResourceSpec,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<Fields>, RemoteError> {
        let mut collected = Collected::new(spec);

        match &spec.pagination {
            Pagination::Pages { per_page } => {
                let mut page = 1u32;
                let mut total_pages = 1u32;
                while page <= total_pages && page <= MAX_PAGES {
                    let mut extra = params.clone();
                    extra.insert("per_page".into(), (*per_page).into());
                    extra.insert("page".into(), page.into());
                    let response = self.client.send(&self.request(spec, &extra)).await?;

                    if page == 1 {
                        total_pages = total_pages_of(&response, &spec.name);
                        if let Some(server_per_page) = meta_number(&response, "X-Per-Page") {
                            if server_per_page != *per_page as i64 {
                                debug!(resource = %spec.name, server_per_page, "server page size differs");
                            }
                        }
                    }

                    let added = collected.push_page(records_in(&response, &spec.result_key));
                    debug!(resource = %spec.name, page, total_pages, added, "page fetched");
                    if added == 0 {
                        break;
                    }
                    page += 1;
                }
            }
            Pagination::Cursor { param } => {
                let mut cursor: Option<serde_json::Value> = None;
                for page in 1..=MAX_PAGES {
                    let mut extra = params.clone();
                    if let Some(next) = cursor.take() {
                        extra.insert(param.clone(), next);
                    }
                    let response = self.client.send(&self.request(spec, &extra)).await?;

                    let added = collected.push_page(records_in(&response, &spec.result_key));
                    debug!(resource = %spec.name, page, added, "page fetched");
                    match response.get("next") {
                        Some(next) if !next.is_null() && added > 0 => cursor = Some(next.clone()),
                        _ => break,
                    }
                }
            }
        }

        Ok(collected.records)
    }

    fn request(&self, spec: &ResourceSpec, params: &serde_json::Map<String, serde_json::Value>) -> ApiRequest {
        let url = self.url(&spec.path);
        if spec.method == Method::GET {
            params
                .iter()
                .fold(ApiRequest::get(url), |req, (k, v)| req.query(k.clone(), query_value(v)))
        } else {
            ApiRequest::post(url, serde_json::Value::Object(params.clone()))
        }
    }
}

/// Records accumulated across pages, deduplicated by id.
struct Collected<'a> {
    spec: &'a ResourceSpec,
    seen: HashSet<String>,
    records: Vec<Fields>,
}

impl<'a> Collected<'a> {
    fn new(spec: &'a ResourceSpec) -> Self {
        Self {
            spec,
            seen: HashSet::new(),
            records: Vec::new(),
        }
    }

    /// Add one page; returns how many records were new.
    fn push_page(&mut self, page: &[serde_json::Value]) -> usize {
        let mut added = 0;
        for raw in page {
            let Value::Record(mut fields) = Value::from_json(raw) else {
                warn!(resource = %self.spec.name, "skipping non-object record");
                continue;
            };
            for name in &self.spec.numeric_fields {
                if let Some(v) = fields.remove(name) {
                    fields.insert(name.clone(), v.coerce_number());
                }
            }
            match fields.get(&self.spec.id_field).and_then(id_of) {
                Some(id) => {
                    if !self.seen.insert(id) {
                        continue;
                    }
                }
                None => warn!(resource = %self.spec.name, "record without id"),
            }
            self.records.push(fields);
            added += 1;
        }
        added
    }
}

fn records_in<'v>(response: &'v serde_json::Value, key: &str) -> &'v [serde_json::Value] {
    response
        .get(key)
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Page count announced in `meta`. Missing or non-positive means one page;
/// a count too large to use is unknown and the walk ends on an empty page.
fn total_pages_of(response: &serde_json::Value, resource: &str) -> u32 {
    match meta_number(response, "X-Total-Pages") {
        None => 1,
        Some(n) if n < 1 => 1,
        Some(n) => u32::try_from(n).unwrap_or_else(|_| {
            warn!(resource, total_pages = n, "page count out of range, paging until empty");
            MAX_PAGES
        }),
    }
}

fn meta_number(response: &serde_json::Value, key: &str) -> Option<i64> {
    let v = response.get("meta")?.get(key)?;
    v.as_i64().or_else(|| v.as_str()?.trim().parse().ok())
}

fn query_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items.iter().map(query_value).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedupes_and_counts_new_records() {
        let spec = ResourceSpec::paged("bookings", 2).with_numeric_fields(&["final_price"]);
        let mut collected = Collected::new(&spec);
        let first = json!([{"id": 1, "final_price": "10.50"}, {"id": 2, "final_price": ""}]);
        let repeat = json!([{"id": "1"}, {"id": 2.0}]);
        assert_eq!(collected.push_page(first.as_array().unwrap()), 2);
        assert_eq!(collected.push_page(repeat.as_array().unwrap()), 0);
        assert_eq!(collected.records[0].get("final_price"), Some(&Value::float(10.5)));
        assert_eq!(collected.records[1].get("final_price"), Some(&Value::Null));
    }

    #[test]
    fn meta_numbers_accept_text() {
        let response = json!({"meta": {"X-Total-Pages": "3", "X-Per-Page": 100}});
        assert_eq!(meta_number(&response, "X-Total-Pages"), Some(3));
        assert_eq!(meta_number(&response, "X-Per-Page"), Some(100));
        assert_eq!(meta_number(&json!({}), "X-Total-Pages"), None);
    }

    #[test]
    fn total_pages_out_of_range() {
        assert_eq!(total_pages_of(&json!({"meta": {"X-Total-Pages": 4}}), "r"), 4);
        assert_eq!(total_pages_of(&json!({}), "r"), 1);
        assert_eq!(total_pages_of(&json!({"meta": {"X-Total-Pages": -3}}), "r"), 1);
        assert_eq!(total_pages_of(&json!({"meta": {"X-Total-Pages": 0}}), "r"), 1);
        assert_eq!(total_pages_of(&json!({"meta": {"X-Total-Pages": 4_294_967_296i64}}), "r"), MAX_PAGES);
        assert_eq!(total_pages_of(&json!({"meta": {"X-Total-Pages": "99999999999"}}), "r"), MAX_PAGES);
    }

    #[test]
    fn query_values_flatten_lists() {
        assert_eq!(query_value(&json!(["id", "name"])), "id,name");
        assert_eq!(query_value(&json!(20111101)), "20111101");
        assert_eq!(query_value(&json!("abc")), "abc");
    }
}
