//! Service entry point.
//!
//! Loads the immutable configuration from the environment, opens the shared
//! store connection, and runs the import and export cycles as independent
//! periodic tasks until a termination signal arrives. Failures inside a
//! cycle are logged and never fatal; the only fatal startup errors are
//! missing configuration and an unusable store.

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pos_cloud_bridge::{config::Config, db::Db, display, exporter, importer, remote::HttpRemote, scheduler};

/// Log directory override; everything else comes through [`Config`], but the
/// log writer must exist before configuration errors can be reported.
const ENV_LOG_DIR: &str = "BRIDGE_LOG_DIR";

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pos_cloud_bridge=debug"));

    let log_dir = std::env::var(ENV_LOG_DIR).unwrap_or_else(|_| "logs".to_string());
    std::fs::create_dir_all(&log_dir).ok();

    // Rolling file appender: daily files, append-only, one line per event
    let file_appender = tracing_appender::rolling::daily(&log_dir, "bridge");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // The guard flushes buffered log lines when dropped. The service runs
    // until process exit, so leak it rather than thread it through main.
    std::mem::forget(guard);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    info!("Starting pos-cloud-bridge v{}", env!("CARGO_PKG_VERSION"));

    let cfg = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    let db = Arc::new(Db::init(&cfg.db_path).context("failed to open local store")?);
    let remote = Arc::new(
        HttpRemote::new(&cfg.remote_url, &cfg.api_key, cfg.http_timeout)
            .context("failed to build remote client")?,
    );
    info!(remote_url = %cfg.remote_url, location_id = %cfg.location_id, "bridge configured");

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // Inbound order import
    {
        let db = db.clone();
        let remote = remote.clone();
        let cfg = cfg.clone();
        let cancel = cancel.clone();
        let interval = cfg.import_interval;
        tasks.push(tokio::spawn(async move {
            scheduler::run_periodic("import_orders", interval, cancel, move || {
                let db = db.clone();
                let remote = remote.clone();
                let cfg = cfg.clone();
                async move {
                    importer::run_import_cycle(&db, remote.as_ref(), &cfg)
                        .await
                        .map(|_| ())
                }
            })
            .await;
        }));
    }

    // Outbound master-data export
    {
        let db = db.clone();
        let remote = remote.clone();
        let cfg = cfg.clone();
        let cancel = cancel.clone();
        let interval = cfg.export_interval;
        tasks.push(tokio::spawn(async move {
            scheduler::run_periodic("export_master_data", interval, cancel, move || {
                let db = db.clone();
                let remote = remote.clone();
                let cfg = cfg.clone();
                async move {
                    exporter::run_export_cycle(&db, remote.as_ref(), &cfg)
                        .await
                        .map(|_| ())
                }
            })
            .await;
        }));
    }

    // Optional display snapshot feed
    if let Some(port) = cfg.display_port {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind display port {port}"))?;
        let hub = Arc::new(display::DisplayHub::new());

        tasks.push(tokio::spawn(display::serve(
            hub.clone(),
            listener,
            cancel.clone(),
        )));

        let db = db.clone();
        let cfg2 = cfg.clone();
        let cancel2 = cancel.clone();
        let interval = cfg.display_refresh;
        tasks.push(tokio::spawn(async move {
            scheduler::run_periodic("refresh_display", interval, cancel2, move || {
                let db = db.clone();
                let cfg = cfg2.clone();
                let hub = hub.clone();
                async move {
                    display::run_refresh_cycle(&db, &cfg, &hub)
                        .await
                        .map(|_| ())
                }
            })
            .await;
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to install shutdown signal handler")?;
    info!("shutdown signal received, stopping tasks");

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }

    info!("all tasks stopped, closing store connection");
    drop(db);

    Ok(())
}
