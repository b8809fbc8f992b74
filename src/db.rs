//! Local SQLite store gateway.
//!
//! Uses rusqlite with WAL mode. One long-lived connection is shared by the
//! import and export tasks behind a mutex; the mutex serializes access at
//! statement granularity, so the two tasks interleave between statements but
//! never inside one. Every call is parameterized; the only interpolated SQL
//! fragments are fixed, trusted table/column names from the entity mappings.

use rusqlite::types::ValueRef;
use rusqlite::{Connection, ToSql};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use crate::error::SyncResult;

/// Shared handle to the local store.
pub struct Db {
    pub conn: Mutex<Connection>,
    pub path: PathBuf,
}

impl Db {
    /// Open the store at `path`, apply pragmas, and bootstrap the schema.
    ///
    /// Creates the parent directory if needed. There is no versioned
    /// migration machinery; the schema is created idempotently at startup.
    pub fn init(path: &Path) -> SyncResult<Db> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| {
                    rusqlite::Error::InvalidPath(PathBuf::from(format!(
                        "{}: {e}",
                        dir.display()
                    )))
                })?;
            }
        }

        info!("Opening store at {}", path.display());
        let conn = open_and_configure(path)?;
        ensure_schema(&conn)?;

        Ok(Db {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// In-memory store with the full schema, for tests.
    pub fn init_in_memory() -> SyncResult<Db> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        ensure_schema(&conn)?;
        Ok(Db {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Run a parameterized query and return each row as a JSON object keyed
    /// by column name, preserving SQLite's stored types.
    pub fn query(&self, sql: &str, params: &[&dyn ToSql]) -> SyncResult<Vec<Value>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(sql)?;
        let col_names: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut obj = serde_json::Map::new();
            for (i, name) in col_names.iter().enumerate() {
                obj.insert(name.clone(), row_value_at(row, i));
            }
            out.push(Value::Object(obj));
        }
        Ok(out)
    }

    /// Run a parameterized command and return the affected-row count.
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> SyncResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(conn.execute(sql, params)?)
    }

    /// True when the query returns at least one row.
    pub fn exists(&self, sql: &str, params: &[&dyn ToSql]) -> SyncResult<bool> {
        Ok(!self.query(sql, params)?.is_empty())
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Create all tables and indexes if they do not exist.
///
/// `orders.order_id` is a PRIMARY KEY so a concurrent duplicate insert
/// surfaces as a constraint conflict, which the importer treats as the
/// "already exists" skip.
fn ensure_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS orders (
            order_id           TEXT PRIMARY KEY,
            location_id        TEXT NOT NULL,
            order_date         TEXT NOT NULL,
            customer_code      TEXT NOT NULL DEFAULT '',
            customer_name      TEXT NOT NULL DEFAULT '',
            doc_status         TEXT NOT NULL DEFAULT '',
            entered_at         TEXT NOT NULL,
            total_amount       REAL NOT NULL DEFAULT 0,
            cash_customer_name TEXT NOT NULL DEFAULT '',
            cash_phone         TEXT NOT NULL DEFAULT '',
            cash_tax_id        TEXT NOT NULL DEFAULT '',
            cash_address       TEXT NOT NULL DEFAULT '',
            payment_method     TEXT NOT NULL DEFAULT '',
            note               TEXT NOT NULL DEFAULT '',
            salesman_code      TEXT NOT NULL DEFAULT '',
            salesman_name      TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS order_lines (
            order_id         TEXT NOT NULL,
            location_id      TEXT NOT NULL,
            item_code        TEXT NOT NULL DEFAULT '',
            item_name        TEXT NOT NULL DEFAULT '',
            quantity         REAL NOT NULL DEFAULT 0,
            unit             TEXT NOT NULL DEFAULT '',
            unit_price       REAL NOT NULL DEFAULT 0,
            discount_percent REAL NOT NULL DEFAULT 0,
            discount_amount  REAL NOT NULL DEFAULT 0,
            net_amount       REAL NOT NULL DEFAULT 0,
            tax_code         TEXT NOT NULL DEFAULT '',
            tax_rate         REAL NOT NULL DEFAULT 0,
            tax_amount       REAL NOT NULL DEFAULT 0,
            gross_amount     REAL NOT NULL DEFAULT 0,
            base_unit        TEXT NOT NULL DEFAULT '',
            entered_at       TEXT NOT NULL DEFAULT '',
            default_pricing  INTEGER NOT NULL DEFAULT 0,
            salesman_code    TEXT NOT NULL DEFAULT '',
            salesman_name    TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_order_lines_order
            ON order_lines (order_id, location_id);

        CREATE TABLE IF NOT EXISTS products (
            item_code          TEXT PRIMARY KEY,
            location_id        TEXT NOT NULL,
            godown             TEXT NOT NULL DEFAULT '',
            long_name          TEXT NOT NULL DEFAULT '',
            category_code      TEXT NOT NULL DEFAULT '',
            category_name      TEXT NOT NULL DEFAULT '',
            unit               TEXT NOT NULL DEFAULT '',
            tax_code           TEXT NOT NULL DEFAULT '',
            tax_rate           REAL NOT NULL DEFAULT 0,
            retail_price       REAL NOT NULL DEFAULT 0,
            wholesale_price    REAL NOT NULL DEFAULT 0,
            current_balance    REAL NOT NULL DEFAULT 0,
            fixed_unit_of_sale INTEGER NOT NULL DEFAULT 0,
            is_active          INTEGER NOT NULL DEFAULT 1,
            is_synced          INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_products_unsynced
            ON products (location_id, is_synced);

        CREATE TABLE IF NOT EXISTS product_prices (
            item_code    TEXT NOT NULL,
            packing_unit TEXT NOT NULL DEFAULT '',
            packing_qty  REAL NOT NULL DEFAULT 0,
            price        REAL NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_product_prices_item
            ON product_prices (item_code);

        CREATE TABLE IF NOT EXISTS customers (
            customer_code   TEXT PRIMARY KEY,
            account_type    TEXT NOT NULL DEFAULT '',
            company_name    TEXT NOT NULL DEFAULT '',
            location_id     TEXT NOT NULL,
            credit_limit    REAL NOT NULL DEFAULT 0,
            current_balance REAL NOT NULL DEFAULT 0,
            account_status  TEXT NOT NULL DEFAULT '',
            salesman_code   TEXT NOT NULL DEFAULT '',
            salesman_name   TEXT NOT NULL DEFAULT '',
            is_synced       INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_customers_unsynced
            ON customers (location_id, is_synced);

        CREATE TABLE IF NOT EXISTS salesmen (
            salesman_code TEXT PRIMARY KEY,
            name          TEXT NOT NULL DEFAULT '',
            location_id   TEXT NOT NULL,
            is_synced     INTEGER NOT NULL DEFAULT 0
        );",
    )
}

/// Extract a column value from a row using SQLite's actual stored type.
/// Uses `get_ref` to avoid i64/f64 coercion issues where REAL values
/// like 100.0 would be returned as integer 100.
pub(crate) fn row_value_at(row: &rusqlite::Row, idx: usize) -> Value {
    match row.get_ref(idx) {
        Ok(ValueRef::Integer(v)) => Value::Number(serde_json::Number::from(v)),
        Ok(ValueRef::Real(v)) => serde_json::json!(v),
        Ok(ValueRef::Text(v)) => Value::String(String::from_utf8_lossy(v).into_owned()),
        Ok(ValueRef::Null) => Value::Null,
        Ok(ValueRef::Blob(_)) => Value::Null,
        Err(_) => Value::Null,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
