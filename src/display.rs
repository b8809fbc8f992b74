//! Display snapshot feed.
//!
//! Serves connected display clients a denormalized view of today's orders
//! over a TCP line protocol: one JSON object per line, re-sent whenever the
//! underlying snapshot changes. Change detection is an md5 digest of the
//! serialized row set, so an unchanged store costs one query per refresh and
//! zero writes to clients.
//!
//! Key design goals, same as the in-store customer display:
//! - **Non-blocking**: a slow client never blocks the sync tasks
//! - **Fail-safe**: write errors drop that client, nothing propagates

use serde_json::Value;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::error::SyncResult;

/// Today's order headers with their line counts, newest first.
const SNAPSHOT_SQL: &str = "SELECT o.order_id AS orderId, o.order_date AS orderDate, \
     o.customer_name AS customerName, o.doc_status AS status, \
     o.payment_method AS paymentMethod, o.total_amount AS total, \
     COUNT(l.order_id) AS lineCount \
     FROM orders o LEFT JOIN order_lines l ON l.order_id = o.order_id \
     WHERE o.location_id = ?1 AND substr(o.order_date, 1, 10) = date('now') \
     GROUP BY o.order_id ORDER BY o.order_date DESC";

/// Connected clients plus the digest of the last broadcast snapshot.
pub struct DisplayHub {
    clients: tokio::sync::Mutex<Vec<TcpStream>>,
    last_digest: std::sync::Mutex<Option<md5::Digest>>,
}

impl DisplayHub {
    pub fn new() -> Self {
        DisplayHub {
            clients: tokio::sync::Mutex::new(Vec::new()),
            last_digest: std::sync::Mutex::new(None),
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Write one line to every client, dropping clients whose socket fails.
    async fn broadcast(&self, line: &str) {
        let mut clients = self.clients.lock().await;
        let mut kept = Vec::with_capacity(clients.len());
        for mut stream in clients.drain(..) {
            match stream.write_all(line.as_bytes()).await {
                Ok(()) => kept.push(stream),
                Err(e) => info!(error = %e, "display client dropped"),
            }
        }
        *clients = kept;
    }
}

impl Default for DisplayHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept display clients until cancelled.
pub async fn serve(hub: Arc<DisplayHub>, listener: TcpListener, cancel: CancellationToken) {
    info!("display feed listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "display client connected");
                    hub.clients.lock().await.push(stream);
                }
                Err(e) => warn!(error = %e, "display accept failed"),
            }
        }
    }

    info!("display feed stopped");
}

/// Re-read the snapshot and broadcast it if it changed since the last
/// refresh. Returns whether a broadcast happened.
pub async fn run_refresh_cycle(db: &Db, cfg: &Config, hub: &DisplayHub) -> SyncResult<bool> {
    let orders = db.query(SNAPSHOT_SQL, &[&cfg.location_id])?;

    let serialized = serde_json::to_string(&orders).unwrap_or_default();
    let digest = md5::compute(serialized.as_bytes());

    let changed = {
        let mut guard = hub.last_digest.lock().unwrap_or_else(|e| e.into_inner());
        if *guard == Some(digest) {
            false
        } else {
            *guard = Some(digest);
            true
        }
    };

    if !changed {
        debug!("snapshot unchanged");
        return Ok(false);
    }

    let message = serde_json::json!({
        "type": "orders_snapshot",
        "orderCount": orders.len(),
        "orders": Value::Array(orders),
    });
    hub.broadcast(&format!("{message}\n")).await;

    Ok(true)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn test_config() -> Config {
        Config {
            db_path: ":memory:".into(),
            remote_url: "https://orders.example.com/".into(),
            api_key: "k".into(),
            location_id: "LOC01".into(),
            import_interval: Duration::from_secs(6),
            export_interval: Duration::from_secs(8),
            http_timeout: Duration::from_secs(30),
            display_port: Some(0),
            display_refresh: Duration::from_secs(5),
            ack_failed_imports: true,
        }
    }

    fn insert_order_today(db: &Db, id: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO orders (order_id, location_id, order_date, customer_name, entered_at, \
             total_amount) \
             VALUES (?1, 'LOC01', datetime('now'), 'Harbour Cafe', datetime('now'), 10.0)",
            params![id],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_broadcasts_only_on_change() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        let hub = DisplayHub::new();

        // first refresh always counts as a change (empty snapshot)
        assert!(run_refresh_cycle(&db, &cfg, &hub).await.unwrap());
        assert!(!run_refresh_cycle(&db, &cfg, &hub).await.unwrap());

        insert_order_today(&db, "ORD-1");
        assert!(run_refresh_cycle(&db, &cfg, &hub).await.unwrap());
        assert!(!run_refresh_cycle(&db, &cfg, &hub).await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_scoped_to_location() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO orders (order_id, location_id, order_date, entered_at) \
                 VALUES ('ORD-X', 'LOC99', datetime('now'), datetime('now'))",
                [],
            )
            .unwrap();
        }

        let rows = db.query(SNAPSHOT_SQL, &[&cfg.location_id]).unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_client_receives_snapshot_line() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        let hub = Arc::new(DisplayHub::new());
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(hub.clone(), listener, cancel.clone()));

        let client = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.client_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        insert_order_today(&db, "ORD-1");
        assert!(run_refresh_cycle(&db, &cfg, &hub).await.unwrap());

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();

        let snapshot: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(snapshot["type"], "orders_snapshot");
        assert_eq!(snapshot["orderCount"], 1);
        assert_eq!(snapshot["orders"][0]["orderId"], "ORD-1");
        assert_eq!(snapshot["orders"][0]["lineCount"], 0);

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_client_is_pruned() {
        let db = Db::init_in_memory().unwrap();
        let cfg = test_config();
        let hub = Arc::new(DisplayHub::new());
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(hub.clone(), listener, cancel.clone()));

        let client = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.client_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        drop(client);

        // early writes may still land in the closed socket's buffer; keep
        // broadcasting fresh snapshots until the reset is observed
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut n = 0;
            while hub.client_count().await > 0 {
                n += 1;
                insert_order_today(&db, &format!("ORD-{n}"));
                run_refresh_cycle(&db, &cfg, &hub).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(hub.client_count().await, 0);

        cancel.cancel();
        server.await.unwrap();
    }
}
