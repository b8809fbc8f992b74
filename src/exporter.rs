//! Outbound master-data exporter.
//!
//! Reads unsynced products, customers, and salesmen for the configured
//! location, pushes each batch to the remote service, and flips the local
//! sync flag for exactly the identifiers the remote acknowledges. The three
//! entity types run through one parameterized pipeline driven by a
//! declarative mapping; only the products stage has extra behavior (price
//! tiers nested per row).
//!
//! Stage order is fixed: products first (highest volume, per-row price
//! queries), then customers, then salesmen. A failure in one stage never
//! prevents the later stages from running in the same cycle.

use rusqlite::ToSql;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::error::{SyncError, SyncResult};
use crate::remote::{Remote, RES_CUSTOMERS, RES_PRODUCTS, RES_SALESMEN};

// ---------------------------------------------------------------------------
// Entity mappings
// ---------------------------------------------------------------------------

/// Declarative mapping of one master-data entity onto the wire.
///
/// `select_sql` aliases local columns to the field names the remote expects
/// and takes the location identifier as its single parameter. `table` and
/// `id_column` are trusted fixed names used to build the sync-flag update.
struct EntityMapping {
    name: &'static str,
    resource: &'static str,
    table: &'static str,
    id_column: &'static str,
    /// Field naming the confirmed identifier in each acknowledgment entry.
    ack_id_field: &'static str,
    select_sql: &'static str,
    /// Products carry nested price tiers fetched per row.
    nest_prices: bool,
}

const PRODUCTS: EntityMapping = EntityMapping {
    name: "products",
    resource: RES_PRODUCTS,
    table: "products",
    id_column: "item_code",
    ack_id_field: "productId",
    select_sql: "SELECT item_code AS ItmCode, location_id AS LocationID, godown AS GodownName, \
                 long_name AS LongName, category_code AS CatCode, category_name AS CatName, \
                 unit AS Unit, tax_code AS TaxCode, tax_rate AS TaxRate, \
                 retail_price AS RspIncVat, wholesale_price AS WspIncVat, \
                 current_balance AS CurrBalance, fixed_unit_of_sale AS FixUnitOfSell \
                 FROM products WHERE is_active = 1 AND is_synced = 0 AND location_id = ?1",
    nest_prices: true,
};

const CUSTOMERS: EntityMapping = EntityMapping {
    name: "customers",
    resource: RES_CUSTOMERS,
    table: "customers",
    id_column: "customer_code",
    ack_id_field: "customerId",
    select_sql: "SELECT customer_code AS CusCode, account_type AS AccType, \
                 company_name AS CompanyName, location_id AS LocationID, \
                 credit_limit AS CrLimit, current_balance AS CurrBalance, \
                 account_status AS AccStatus, salesman_code AS SmCode, salesman_name AS SmName \
                 FROM customers WHERE is_synced = 0 AND account_status = 'A' \
                 AND location_id = ?1",
    nest_prices: false,
};

const SALESMEN: EntityMapping = EntityMapping {
    name: "salesmen",
    resource: RES_SALESMEN,
    table: "salesmen",
    id_column: "salesman_code",
    ack_id_field: "salesmanId",
    select_sql: "SELECT salesman_code AS SmCode, name AS SmName, location_id AS LocationID \
                 FROM salesmen WHERE is_synced = 0 AND location_id = ?1",
    nest_prices: false,
};

const PIPELINE: [&EntityMapping; 3] = [&PRODUCTS, &CUSTOMERS, &SALESMEN];

const PRICES_SQL: &str = "SELECT packing_unit AS PackUnit, packing_qty AS PackQty, \
                          price AS Price FROM product_prices WHERE item_code = ?1";

/// Per-stage counters for one export cycle.
#[derive(Debug, Default)]
pub struct ExportOutcome {
    pub pushed: usize,
    pub confirmed: usize,
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// Run one read-push-reconcile cycle across all three entity types.
///
/// Stage failures are logged and swallowed here so the pipeline always
/// reaches every stage; only the summed counters come back.
pub async fn run_export_cycle(
    db: &Db,
    remote: &dyn Remote,
    cfg: &Config,
) -> SyncResult<ExportOutcome> {
    let mut total = ExportOutcome::default();

    for entity in PIPELINE {
        match export_entity(db, remote, cfg, entity).await {
            Ok(outcome) => {
                total.pushed += outcome.pushed;
                total.confirmed += outcome.confirmed;
            }
            Err(e) => {
                warn!(
                    op = "export_master_data",
                    entity = entity.name,
                    error = %e,
                    "export stage failed, continuing with next stage"
                );
            }
        }
    }

    if total.pushed > 0 {
        info!(
            op = "export_master_data",
            pushed = total.pushed,
            confirmed = total.confirmed,
            "export cycle complete"
        );
    }

    Ok(total)
}

/// Push one entity's unsynced rows and apply the acknowledgment.
async fn export_entity(
    db: &Db,
    remote: &dyn Remote,
    cfg: &Config,
    entity: &EntityMapping,
) -> SyncResult<ExportOutcome> {
    let mut rows = db.query(entity.select_sql, &[&cfg.location_id])?;
    if rows.is_empty() {
        debug!(entity = entity.name, "nothing to export");
        return Ok(ExportOutcome::default());
    }

    if entity.nest_prices {
        for row in &mut rows {
            attach_price_tiers(db, row)?;
        }
    }

    let pushed = rows.len();
    let response = remote.push(entity.resource, &Value::Array(rows)).await?;
    let confirmed = apply_acknowledgment(db, cfg, entity, &response)?;

    Ok(ExportOutcome { pushed, confirmed })
}

/// Fetch a product's price tiers and nest them under `"prices"`.
fn attach_price_tiers(db: &Db, row: &mut Value) -> SyncResult<()> {
    let item_code = row
        .get("ItmCode")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let prices = db.query(PRICES_SQL, &[&item_code])?;
    row["prices"] = Value::Array(prices);
    Ok(())
}

/// Flip sync flags for exactly the identifiers the acknowledgment names.
///
/// An acknowledgment without the expected shape is a protocol error and no
/// flags update; never guess which records were confirmed.
fn apply_acknowledgment(
    db: &Db,
    cfg: &Config,
    entity: &EntityMapping,
    response: &Value,
) -> SyncResult<usize> {
    let acks = response
        .get("acknowledgments")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            SyncError::Protocol(format!(
                "{} push response lacks an acknowledgments sequence",
                entity.name
            ))
        })?;

    let ids: Vec<String> = acks
        .iter()
        .filter_map(|a| a.get(entity.ack_id_field))
        .filter_map(id_value)
        .collect();

    if ids.is_empty() {
        info!(entity = entity.name, "acknowledgment confirmed no records");
        return Ok(0);
    }

    // ?1 is the location; identifiers start at ?2.
    let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 2)).collect();
    let sql = format!(
        "UPDATE {} SET is_synced = 1 WHERE location_id = ?1 AND {} IN ({})",
        entity.table,
        entity.id_column,
        placeholders.join(",")
    );

    let mut params: Vec<&dyn ToSql> = Vec::with_capacity(ids.len() + 1);
    params.push(&cfg.location_id);
    for id in &ids {
        params.push(id);
    }

    let updated = db.execute(&sql, &params)?;
    info!(
        entity = entity.name,
        confirmed = ids.len(),
        updated,
        "sync flags applied"
    );
    Ok(updated)
}

/// Acknowledged identifiers may arrive as strings or numbers.
fn id_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemote;
    use rusqlite::params;
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            db_path: ":memory:".into(),
            remote_url: "https://orders.example.com/".into(),
            api_key: "k".into(),
            location_id: "LOC01".into(),
            import_interval: Duration::from_secs(6),
            export_interval: Duration::from_secs(8),
            http_timeout: Duration::from_secs(30),
            display_port: None,
            display_refresh: Duration::from_secs(5),
            ack_failed_imports: true,
        }
    }

    fn seed_product(db: &Db, code: &str, location: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO products (item_code, location_id, long_name, unit, retail_price) \
             VALUES (?1, ?2, ?3, 'PCS', 9.99)",
            params![code, location, format!("Product {code}")],
        )
        .unwrap();
    }

    fn seed_customer(db: &Db, code: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO customers (customer_code, account_type, company_name, location_id, \
             account_status) VALUES (?1, 'AC', ?2, 'LOC01', 'A')",
            params![code, format!("Company {code}")],
        )
        .unwrap();
    }

    fn seed_salesman(db: &Db, code: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO salesmen (salesman_code, name, location_id) VALUES (?1, ?2, 'LOC01')",
            params![code, format!("Salesman {code}")],
        )
        .unwrap();
    }

    fn synced_products(db: &Db) -> Vec<String> {
        db.query(
            "SELECT item_code FROM products WHERE is_synced = 1 ORDER BY item_code",
            &[],
        )
        .unwrap()
        .into_iter()
        .map(|r| r["item_code"].as_str().unwrap().to_string())
        .collect()
    }

    fn ack_response(field: &str, ids: &[&str]) -> Value {
        json!({
            "acknowledgments": ids.iter().map(|id| json!({ field: id })).collect::<Vec<_>>()
        })
    }

    #[tokio::test]
    async fn test_acknowledgment_gates_sync_flags() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        for code in ["P1", "P2", "P3", "P4", "P5"] {
            seed_product(&db, code, "LOC01");
        }

        let remote = MockRemote::new();
        remote.queue_push(RES_PRODUCTS, ack_response("productId", &["P1", "P3", "P5"]));

        let outcome = run_export_cycle(&db, &remote, &cfg).await.unwrap();
        assert_eq!(outcome.pushed, 5);
        assert_eq!(outcome.confirmed, 3);
        assert_eq!(synced_products(&db), vec!["P1", "P3", "P5"]);

        // the two unconfirmed products are re-offered on the next cycle
        remote.queue_push(RES_PRODUCTS, ack_response("productId", &[]));
        run_export_cycle(&db, &remote, &cfg).await.unwrap();
        let second_batch = &remote.pushes_to(RES_PRODUCTS)[1];
        let codes: Vec<&str> = second_batch
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["ItmCode"].as_str().unwrap())
            .collect();
        assert_eq!(codes, vec!["P2", "P4"]);
    }

    #[tokio::test]
    async fn test_malformed_acknowledgment_is_inert() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        seed_product(&db, "P1", "LOC01");

        let remote = MockRemote::new();
        remote.queue_push(RES_PRODUCTS, json!({"ok": true}));

        let outcome = run_export_cycle(&db, &remote, &cfg).await.unwrap();
        assert_eq!(outcome.confirmed, 0);
        assert!(synced_products(&db).is_empty());
    }

    #[tokio::test]
    async fn test_stage_failure_does_not_block_later_stages() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        seed_product(&db, "P1", "LOC01");
        seed_customer(&db, "C1");
        seed_salesman(&db, "S1");

        let remote = MockRemote::new();
        remote.set_unreachable(RES_PRODUCTS);
        remote.queue_push(RES_CUSTOMERS, ack_response("customerId", &["C1"]));
        remote.queue_push(RES_SALESMEN, ack_response("salesmanId", &["S1"]));

        run_export_cycle(&db, &remote, &cfg).await.unwrap();

        assert_eq!(remote.pushes_to(RES_CUSTOMERS).len(), 1);
        assert_eq!(remote.pushes_to(RES_SALESMEN).len(), 1);
        let customer = &db.query(
            "SELECT is_synced FROM customers WHERE customer_code = 'C1'",
            &[],
        )
        .unwrap()[0];
        assert_eq!(customer["is_synced"], 1);
    }

    #[tokio::test]
    async fn test_synced_records_are_not_reoffered() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        seed_product(&db, "P1", "LOC01");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute("UPDATE products SET is_synced = 1", []).unwrap();
        }

        let remote = MockRemote::new();
        let outcome = run_export_cycle(&db, &remote, &cfg).await.unwrap();
        assert_eq!(outcome.pushed, 0);
        assert!(remote.pushes_to(RES_PRODUCTS).is_empty());
    }

    #[tokio::test]
    async fn test_location_scoping() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        seed_product(&db, "P1", "LOC01");
        seed_product(&db, "P9", "LOC99");

        let remote = MockRemote::new();
        // remote (wrongly) confirms the out-of-scope product too
        remote.queue_push(RES_PRODUCTS, ack_response("productId", &["P1", "P9"]));

        run_export_cycle(&db, &remote, &cfg).await.unwrap();

        let batch = &remote.pushes_to(RES_PRODUCTS)[0];
        assert_eq!(batch.as_array().unwrap().len(), 1);
        assert_eq!(batch[0]["ItmCode"], "P1");
        // only the in-scope flag flips
        assert_eq!(synced_products(&db), vec!["P1"]);
    }

    #[tokio::test]
    async fn test_price_tiers_nested_into_product_rows() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        seed_product(&db, "P1", "LOC01");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO product_prices (item_code, packing_unit, packing_qty, price) \
                 VALUES ('P1', 'CTN', 12, 99.0), ('P1', 'PCS', 1, 9.99)",
                [],
            )
            .unwrap();
        }

        let remote = MockRemote::new();
        remote.queue_push(RES_PRODUCTS, ack_response("productId", &["P1"]));

        run_export_cycle(&db, &remote, &cfg).await.unwrap();

        let batch = &remote.pushes_to(RES_PRODUCTS)[0];
        let prices = batch[0]["prices"].as_array().unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0]["PackUnit"], "CTN");
        assert_eq!(prices[0]["Price"], 99.0);
    }

    #[tokio::test]
    async fn test_inactive_products_excluded() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        seed_product(&db, "P1", "LOC01");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute("UPDATE products SET is_active = 0", []).unwrap();
        }

        let remote = MockRemote::new();
        let outcome = run_export_cycle(&db, &remote, &cfg).await.unwrap();
        assert_eq!(outcome.pushed, 0);
    }

    #[tokio::test]
    async fn test_numeric_acknowledgment_ids_accepted() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        seed_salesman(&db, "7");

        let remote = MockRemote::new();
        remote.queue_push(RES_SALESMEN, json!({"acknowledgments": [{"salesmanId": 7}]}));

        let outcome = run_export_cycle(&db, &remote, &cfg).await.unwrap();
        assert_eq!(outcome.confirmed, 1);
    }
}
