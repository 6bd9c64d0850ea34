use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Staging tables in dependency order: every table only references tables
/// listed before it.
pub const STAGING_TABLES: &[&str] = &[
    "clients",
    "rentals",
    "bookings",
    "booking_segments",
    "bookings_fees",
    "fee_segments",
];

const SCHEMA: &[(&str, &str)] = &[
    (
        "clients",
        r#"
        CREATE TABLE IF NOT EXISTS clients (
            id INTEGER PRIMARY KEY,
            fullname TEXT,
            firstname TEXT,
            lastname TEXT,
            email TEXT,
            phone TEXT,
            mobile TEXT,
            address1 TEXT,
            address2 TEXT,
            city TEXT,
            zip TEXT,
            state TEXT,
            country_code TEXT,
            company TEXT,
            preferred_locale TEXT,
            notes TEXT,
            vat_number TEXT,
            created_at TEXT,
            updated_at TEXT
        )
        "#,
    ),
    (
        "rentals",
        r#"
        CREATE TABLE IF NOT EXISTS rentals (
            id INTEGER PRIMARY KEY,
            name TEXT,
            headline TEXT,
            address1 TEXT,
            address2 TEXT,
            city TEXT,
            zip TEXT,
            state TEXT,
            country_code TEXT,
            currency TEXT,
            rental_type TEXT,
            bedrooms_count INTEGER,
            bathrooms_count INTEGER,
            sleeps INTEGER,
            sleeps_max INTEGER,
            min_price REAL,
            max_price REAL,
            base_rate REAL,
            damage_deposit REAL,
            checkin_time TEXT,
            checkout_time TEXT,
            created_at TEXT,
            updated_at TEXT,
            published_at TEXT
        )
        "#,
    ),
    (
        "bookings",
        r#"
        CREATE TABLE IF NOT EXISTS bookings (
            id INTEGER PRIMARY KEY,
            client_id INTEGER REFERENCES clients(id),
            rental_id INTEGER REFERENCES rentals(id),
            account_id INTEGER,
            account TEXT,
            source TEXT,
            status TEXT,
            reference TEXT,
            booked INTEGER,
            unavailable INTEGER,
            tentative_expires_at TEXT,
            start_at TEXT,
            end_at TEXT,
            created_at TEXT,
            updated_at TEXT,
            canceled_at TEXT,
            adults INTEGER,
            children INTEGER,
            currency TEXT,
            initial_price REAL,
            final_price REAL,
            paid_amount REAL,
            discount TEXT,
            damage_deposit REAL,
            commission REAL,
            expected_checkin_time TEXT,
            expected_checkout_time TEXT,
            notes TEXT,
            comments TEXT,
            probability_win INTEGER
        )
        "#,
    ),
    (
        "booking_segments",
        r#"
        CREATE TABLE IF NOT EXISTS booking_segments (
            id INTEGER PRIMARY KEY,
            booking_id INTEGER REFERENCES bookings(id),
            segment_index INTEGER NOT NULL,
            start_date TEXT,
            end_date TEXT,
            nights INTEGER,
            final_price REAL,
            paid_amount REAL
        )
        "#,
    ),
    (
        "bookings_fees",
        r#"
        CREATE TABLE IF NOT EXISTS bookings_fees (
            id INTEGER PRIMARY KEY,
            booking_id INTEGER REFERENCES bookings(id),
            fee_id INTEGER,
            name TEXT,
            price REAL,
            times_booked INTEGER,
            required INTEGER,
            included_in_price INTEGER,
            created_at TEXT,
            updated_at TEXT
        )
        "#,
    ),
    (
        "fee_segments",
        r#"
        CREATE TABLE IF NOT EXISTS fee_segments (
            id INTEGER PRIMARY KEY,
            bookings_fee_id INTEGER REFERENCES bookings_fees(id),
            booking_id INTEGER REFERENCES bookings(id),
            segment_index INTEGER NOT NULL,
            name TEXT,
            start_date TEXT,
            end_date TEXT,
            nights INTEGER,
            price REAL
        )
        "#,
    ),
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the staging tables and the run ledger. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    for (_, ddl) in SCHEMA {
        sqlx::query(ddl).execute(pool).await?;
    }

    // One row per entity per run
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            flow TEXT NOT NULL,
            entity TEXT NOT NULL,
            started_at TEXT NOT NULL,
            elapsed_ms INTEGER NOT NULL,
            added INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            stale_kept INTEGER NOT NULL DEFAULT 0,
            unchanged INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_bookings_client_id ON bookings(client_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_bookings_fees_booking_id ON bookings_fees(booking_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_runs_started_at ON sync_runs(started_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
