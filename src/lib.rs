//! # rentsync
//!
//! Synchronizes rental bookings from a property-management API into a CRM,
//! through a staging SQLite database.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  import  ┌──────────────┐  export  ┌──────────────┐
//! │  Source API  │─────────▶│   Staging    │─────────▶│     CRM      │
//! │ (paged REST) │          │   (SQLite)   │          │ (cursor RPC) │
//! └──────────────┘          └──────────────┘          └──────────────┘
//! ```
//!
//! Both flows are the same loop per entity: build the desired records, read
//! the current ones from the target, [`rentsync_core::reconcile`], then apply
//! the change set with [`apply::Writer`] (delete, update, add).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | tracing subscriber setup |
//! | [`session`] | OAuth tokens and their refresh |
//! | [`remote`] | Authenticated HTTP calls with bounded retry |
//! | [`fetch`] | Paginated reads |
//! | [`source`] | Source API resources → staging rows |
//! | [`db`] | Database connection |
//! | [`migrate`] | Staging schema |
//! | [`staging`] | Staging tables as a reconciliation target |
//! | [`crm`] | CRM client and entity targets |
//! | [`deals`] | Staging rows → contacts, products and deals |
//! | [`apply`] | Change-set writer |
//! | [`progress`] | Apply progress reporting |
//! | [`pipeline`] | `import`, `export` and `sync` |
//! | [`stats`] | `rentsync stats` |

pub mod apply;
pub mod config;
pub mod crm;
pub mod db;
pub mod deals;
pub mod fetch;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod remote;
pub mod session;
pub mod source;
pub mod staging;
pub mod stats;
