//! Field values carried by canonical records.
//!
//! The two remote systems and the staging database disagree on how they
//! spell the same data: a timestamp may arrive typed or as a string with an
//! offset, an empty field may be `null`, `""` or `"0"`, and a multi-value
//! field (phones, e-mails) is a list of sub-records. [`Value`] is the single
//! tagged representation everything is converted into before comparison.
//!
//! # Canonical strings
//!
//! [`Value::canonical`] renders a value the way both sides are compared when
//! no more specific rule applies:
//!
//! | Variant | Canonical form |
//! |---------|----------------|
//! | `Null` | `""` |
//! | `Text` | the text itself |
//! | `Int` | decimal digits |
//! | `Float` | shortest form, integral floats without a fraction (`300.0` → `300`) |
//! | `Bool` | `"1"` / `"0"` |
//! | `Timestamp` | `%Y-%m-%dT%H:%M:%S%.f%:z` (fraction only when non-zero) |
//! | `Date` | `%Y-%m-%d` |

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Field identifier → value. Ordered by field identifier.
pub type Fields = BTreeMap<String, Value>;

/// A plain scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// A field value: nullish, scalar, timestamp, calendar date, list, or sub-record.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Scalar(Scalar),
    Timestamp(DateTime<FixedOffset>),
    Date(NaiveDate),
    List(Vec<Value>),
    Record(Fields),
}

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%:z";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Scalar(Scalar::Text(s.into()))
    }

    pub fn int(i: i64) -> Self {
        Value::Scalar(Scalar::Int(i))
    }

    pub fn float(f: f64) -> Self {
        Value::Scalar(Scalar::Float(f))
    }

    pub fn bool(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }

    /// Empty text, the coalesced form of a missing optional field.
    pub fn empty() -> Self {
        Value::text("")
    }

    /// Whether this value counts as "no value".
    ///
    /// Null, empty text, `"0"`, numeric zero, `false`, and empty lists or
    /// sub-records are all nullish. Two nullish values are never different.
    pub fn is_nullish(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Scalar(Scalar::Text(s)) => s.is_empty() || s == "0",
            Value::Scalar(Scalar::Int(i)) => *i == 0,
            Value::Scalar(Scalar::Float(f)) => *f == 0.0,
            Value::Scalar(Scalar::Bool(b)) => !b,
            Value::List(items) => items.is_empty(),
            Value::Record(fields) => fields.is_empty(),
            Value::Timestamp(_) | Value::Date(_) => false,
        }
    }

    /// Canonical string form used for format-tolerant comparison.
    pub fn canonical(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Scalar(Scalar::Text(s)) => s.clone(),
            Value::Scalar(Scalar::Int(i)) => i.to_string(),
            Value::Scalar(Scalar::Float(f)) => format_float(*f),
            Value::Scalar(Scalar::Bool(b)) => if *b { "1" } else { "0" }.to_string(),
            Value::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
            Value::Date(d) => d.format(DATE_FORMAT).to_string(),
            Value::List(items) => items
                .iter()
                .map(Value::canonical)
                .collect::<Vec<_>>()
                .join(", "),
            Value::Record(_) => self.to_json().to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(Scalar::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Integer view: ints, integral floats, and numeric text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Scalar(Scalar::Int(i)) => Some(*i),
            Value::Scalar(Scalar::Float(f)) if f.fract() == 0.0 => Some(*f as i64),
            Value::Scalar(Scalar::Text(s)) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| f as i64)
                })
            }
            _ => None,
        }
    }

    /// Float view: ints, floats, and numeric text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Scalar(Scalar::Int(i)) => Some(*i as f64),
            Value::Scalar(Scalar::Float(f)) => Some(*f),
            Value::Scalar(Scalar::Text(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Timestamp view: typed timestamps and text parsed with its embedded offset.
    pub fn as_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Scalar(Scalar::Text(s)) => parse_timestamp(s),
            _ => None,
        }
    }

    /// Calendar date view. Timestamps keep the date of their own offset.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date_naive()),
            Value::Scalar(Scalar::Text(s)) => parse_date(s).or_else(|| parse_timestamp(s).map(|ts| ts.date_naive())),
            _ => None,
        }
    }

    /// Convert a JSON value from a remote API.
    ///
    /// ISO-8601 datetime strings become [`Value::Timestamp`], `YYYY-MM-DD`
    /// strings become [`Value::Date`], arrays become lists and objects become
    /// sub-records. Other strings stay text; numeric strings are only coerced
    /// where the caller knows the field is numeric (see [`Value::coerce_number`]).
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::int(i),
                None => Value::float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => {
                if let Some(ts) = parse_iso_timestamp(s) {
                    Value::Timestamp(ts)
                } else if let Some(d) = parse_date(s) {
                    Value::Date(d)
                } else {
                    Value::text(s.clone())
                }
            }
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::Record(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON for write payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Scalar(Scalar::Text(s)) => serde_json::Value::String(s.clone()),
            Value::Scalar(Scalar::Int(i)) => serde_json::Value::from(*i),
            Value::Scalar(Scalar::Float(f)) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Scalar(Scalar::Bool(b)) => serde_json::Value::Bool(*b),
            Value::Timestamp(_) | Value::Date(_) => serde_json::Value::String(self.canonical()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Record(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Numeric text → typed number; everything else unchanged.
    ///
    /// Empty text becomes `Null` so that an absent amount stays absent.
    pub fn coerce_number(self) -> Self {
        match &self {
            Value::Scalar(Scalar::Text(s)) => {
                let t = s.trim();
                if t.is_empty() {
                    Value::Null
                } else if let Ok(i) = t.parse::<i64>() {
                    Value::int(i)
                } else if let Ok(f) = t.parse::<f64>() {
                    Value::float(f)
                } else {
                    self
                }
            }
            _ => self,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(ts: DateTime<FixedOffset>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

/// Parse a timestamp string, honouring the offset embedded in it.
///
/// Accepts RFC 3339 (`2024-03-01T10:00:00+01:00`, `...Z`), the same with a
/// space separator, and offset-less `YYYY-MM-DD HH:MM:SS`, which is read as UTC.
/// Fractional seconds are kept in every form.
pub fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if s.len() < 19 {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts);
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive).fixed_offset())
}

/// Strict ISO-8601 datetime detection for raw API payloads (`T` separator only).
fn parse_iso_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    if s.len() < 19 || s.as_bytes().get(10) != Some(&b'T') {
        return None;
    }
    parse_timestamp(s)
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nullish_values() {
        assert!(Value::Null.is_nullish());
        assert!(Value::text("").is_nullish());
        assert!(Value::text("0").is_nullish());
        assert!(Value::int(0).is_nullish());
        assert!(Value::List(vec![]).is_nullish());
        assert!(!Value::text("1").is_nullish());
        assert!(!Value::text("00").is_nullish());
        assert!(!Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()).is_nullish());
    }

    #[test]
    fn canonical_numbers() {
        assert_eq!(Value::float(300.0).canonical(), "300");
        assert_eq!(Value::float(300.5).canonical(), "300.5");
        assert_eq!(Value::int(-4).canonical(), "-4");
        assert_eq!(Value::bool(true).canonical(), "1");
    }

    #[test]
    fn from_json_types() {
        let v = Value::from_json(&json!({
            "start_at": "2024-01-28T16:00:00Z",
            "day": "2024-01-28",
            "zip": "01234",
            "phones": [{"label": "mobile", "number": "+420"}],
            "price": 12.5,
        }));
        let Value::Record(fields) = v else {
            panic!("expected record");
        };
        assert!(matches!(fields["start_at"], Value::Timestamp(_)));
        assert!(matches!(fields["day"], Value::Date(_)));
        assert_eq!(fields["zip"], Value::text("01234"));
        assert!(matches!(&fields["phones"], Value::List(items) if items.len() == 1));
        assert_eq!(fields["price"], Value::float(12.5));
    }

    #[test]
    fn parse_timestamp_offsets() {
        let a = parse_timestamp("2024-03-01T10:00:00+01:00").unwrap();
        let b = parse_timestamp("2024-03-01T09:00:00+00:00").unwrap();
        let c = parse_timestamp("2024-03-01 09:00:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(parse_timestamp("2024-03-01").is_none());
        assert!(parse_timestamp("not a date at all!!").is_none());
    }

    #[test]
    fn subsecond_timestamps_keep_their_fraction() {
        let ts = parse_timestamp("2024-01-28T16:00:00.500Z").unwrap();
        let text = Value::Timestamp(ts).canonical();
        assert_eq!(text, "2024-01-28T16:00:00.500+00:00");
        assert_eq!(parse_timestamp(&text), Some(ts));
        assert_eq!(parse_timestamp("2024-01-28 16:00:00.500"), Some(ts));

        let whole = parse_timestamp("2024-01-28T16:00:00Z").unwrap();
        assert_eq!(Value::Timestamp(whole).canonical(), "2024-01-28T16:00:00+00:00");
    }

    #[test]
    fn coerce_number_text() {
        assert_eq!(Value::text("42").coerce_number(), Value::int(42));
        assert_eq!(Value::text("42.50").coerce_number(), Value::float(42.5));
        assert_eq!(Value::text("").coerce_number(), Value::Null);
        assert_eq!(Value::text("n/a").coerce_number(), Value::text("n/a"));
    }

    #[test]
    fn as_date_from_timestamp_text() {
        let v = Value::text("2024-01-28T23:30:00+01:00");
        assert_eq!(v.as_date(), NaiveDate::from_ymd_opt(2024, 1, 28));
    }
}
