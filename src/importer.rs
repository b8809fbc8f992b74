//! Inbound order importer.
//!
//! Pulls pending orders from the remote service, deduplicates against the
//! local store, inserts order headers and line items, and posts a delivery
//! acknowledgment for the batch. Each order is processed independently so a
//! failure on one never blocks the rest of the batch; a transport failure on
//! the pull aborts the whole cycle (the remote re-offers everything pending
//! on the next pull).

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::params;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::error::{SyncError, SyncResult};
use crate::remote::{Remote, RES_ORDERS, RES_ORDER_ACK};

/// Storage format for datetime columns.
const SQL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Counters for one import cycle.
#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub pulled: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Run one pull-and-import cycle.
pub async fn run_import_cycle(
    db: &Db,
    remote: &dyn Remote,
    cfg: &Config,
) -> SyncResult<ImportOutcome> {
    let body = remote.pull(RES_ORDERS).await?;
    let orders = body
        .as_array()
        .ok_or_else(|| SyncError::Protocol("order pull did not return a sequence".into()))?;

    let mut outcome = ImportOutcome {
        pulled: orders.len(),
        ..Default::default()
    };
    let mut ack_batch: Vec<Value> = Vec::new();

    for order in orders {
        let Some(order_id) = order
            .get("OrderId")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            warn!(op = "import_orders", "pulled order lacks an identifier, skipping");
            continue;
        };

        match import_order(db, cfg, order_id, order) {
            Ok(()) => {
                outcome.inserted += 1;
                ack_batch.push(ack_entry(order_id));
            }
            Err(SyncError::Duplicate(_)) => {
                info!(
                    op = "import_orders",
                    order_id,
                    "order already exists, skipping"
                );
                outcome.duplicates += 1;
                ack_batch.push(ack_entry(order_id));
            }
            Err(e) => {
                warn!(
                    op = "import_orders",
                    order_id,
                    error = %e,
                    "order import failed, continuing with batch"
                );
                outcome.failed += 1;
                if cfg.ack_failed_imports {
                    ack_batch.push(ack_entry(order_id));
                }
            }
        }
    }

    if !ack_batch.is_empty() {
        if let Err(e) = remote.push(RES_ORDER_ACK, &Value::Array(ack_batch)).await {
            warn!(op = "acknowledge_orders", error = %e, "order acknowledgment failed");
        }
    }

    if outcome.pulled > 0 {
        info!(
            op = "import_orders",
            pulled = outcome.pulled,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            failed = outcome.failed,
            "import cycle complete"
        );
    }

    Ok(outcome)
}

/// One acknowledgment entry. The status reflects receipt from the remote
/// service, not durable local storage.
fn ack_entry(order_id: &str) -> Value {
    serde_json::json!({
        "status": "success",
        "message": "Data received successfully",
        "dataId": order_id,
    })
}

/// Insert one order header plus its lines, scoped to the configured
/// location. `Duplicate` when the order identifier is already present.
fn import_order(db: &Db, cfg: &Config, order_id: &str, order: &Value) -> SyncResult<()> {
    if db.exists(
        "SELECT 1 FROM orders WHERE order_id = ?1 AND location_id = ?2",
        &[&order_id, &cfg.location_id],
    )? {
        return Err(SyncError::Duplicate(order_id.to_string()));
    }

    let order_date = normalize_order_date(order.get("OrderDate").and_then(Value::as_str))?;
    let entered_at = Utc::now().format(SQL_DATETIME_FORMAT).to_string();

    let insert = db.execute(
        "INSERT INTO orders (order_id, location_id, order_date, customer_code, customer_name, \
         doc_status, entered_at, total_amount, cash_customer_name, cash_phone, cash_tax_id, \
         cash_address, payment_method, note, salesman_code, salesman_name) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        &[
            &order_id,
            &cfg.location_id,
            &order_date,
            &text(order, "CusSupCode"),
            &text(order, "CompanyName"),
            &text(order, "DocStatus"),
            &entered_at,
            &number(order, "TotalAmount"),
            &text(order, "cashCustomerName"),
            &text(order, "cashPhoneNumber"),
            &text(order, "cashPinNo"),
            &text(order, "cashAddress"),
            &text(order, "PaymentMethod"),
            &text(order, "naration"),
            &text(order, "SmCode"),
            &text(order, "SmName"),
        ],
    );

    if let Err(e) = insert {
        // A concurrent insert between the dedup check and here lands on the
        // primary key; treat the conflict as the "already exists" case.
        if is_constraint_violation(&e) {
            return Err(SyncError::Duplicate(order_id.to_string()));
        }
        return Err(e);
    }

    let empty = Vec::new();
    let lines = order
        .get("ordertrn")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    for line in lines {
        insert_order_line(db, cfg, order_id, line)?;
    }

    Ok(())
}

fn insert_order_line(db: &Db, cfg: &Config, order_id: &str, line: &Value) -> SyncResult<()> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.execute(
        "INSERT INTO order_lines (order_id, location_id, item_code, item_name, quantity, unit, \
         unit_price, discount_percent, discount_amount, net_amount, tax_code, tax_rate, \
         tax_amount, gross_amount, base_unit, entered_at, default_pricing, salesman_code, \
         salesman_name) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            order_id,
            cfg.location_id,
            text(line, "ItmCode"),
            text(line, "ItmName"),
            number(line, "Quantity"),
            text(line, "Unit"),
            number(line, "UCPrice"),
            number(line, "DiscPercent"),
            number(line, "DiscAmount"),
            number(line, "ExVat"),
            text(line, "VatCode"),
            number(line, "VatRate"),
            number(line, "VatAmount"),
            number(line, "Amount"),
            text(line, "BaseUnit"),
            text(line, "DateEntered"),
            flag01(line, "defaultPricing"),
            text(line, "SmCode"),
            text(line, "SmName"),
        ],
    )?;
    Ok(())
}

fn is_constraint_violation(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::Store(e)
            if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

// ---------------------------------------------------------------------------
// Payload field helpers
// ---------------------------------------------------------------------------

/// Text field with an empty-string default for missing optionals.
fn text(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

/// Numeric field with a zero default. Numeric strings are accepted.
fn number(v: &Value, key: &str) -> f64 {
    match v.get(key) {
        Some(val) => val
            .as_f64()
            .or_else(|| val.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
            .unwrap_or(0.0),
        None => 0.0,
    }
}

/// 0/1 flag. Accepts booleans, integers, and "true"/"1" style strings.
fn flag01(v: &Value, key: &str) -> i64 {
    match v.get(key) {
        Some(Value::Bool(b)) => i64::from(*b),
        Some(Value::Number(n)) => i64::from(n.as_i64().unwrap_or(0) != 0),
        Some(Value::String(s)) => {
            let lower = s.trim().to_ascii_lowercase();
            i64::from(lower == "true" || lower == "1" || lower == "yes")
        }
        _ => 0,
    }
}

/// Normalise an order date into the storage datetime format.
///
/// Accepts RFC 3339, SQL datetime, T-separated datetime without zone, and a
/// bare date. Anything else fails the order.
fn normalize_order_date(raw: Option<&str>) -> SyncResult<String> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SyncError::Protocol("order has no order date".into()))?;

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.naive_utc().format(SQL_DATETIME_FORMAT).to_string());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, SQL_DATETIME_FORMAT) {
        return Ok(dt.format(SQL_DATETIME_FORMAT).to_string());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(dt.format(SQL_DATETIME_FORMAT).to_string());
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(d
            .and_time(NaiveTime::MIN)
            .format(SQL_DATETIME_FORMAT)
            .to_string());
    }

    Err(SyncError::Protocol(format!("unparseable order date '{raw}'")))
}

// ===========================================================================
// Tests
// ===========================================================================
