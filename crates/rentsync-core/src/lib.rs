//! # rentsync core
//!
//! Runtime-free logic shared by the rentsync application: the canonical
//! record model, the three-way reconciliation engine, booking business rules,
//! and the [`Sink`](sink::Sink) abstraction writers target.
//!
//! This crate has no tokio, sqlx, or HTTP dependencies.

pub mod mapping;
pub mod reconcile;
pub mod record;
pub mod rules;
pub mod sink;
pub mod value;

pub use mapping::{FieldMapping, MappingError};
pub use reconcile::{differ, reconcile, ChangeSet, ReconcileOptions};
pub use record::{normalize_id, Record};
pub use value::{Fields, Scalar, Value};
