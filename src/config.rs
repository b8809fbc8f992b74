//! Process configuration.
//!
//! Every setting is read once at startup from environment variables and
//! carried in an immutable `Config` that is passed into each component.
//! Nothing reads the environment after startup. A missing or malformed
//! required variable is a fatal startup error naming the variable.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

// Required
const ENV_DB_PATH: &str = "BRIDGE_DB_PATH";
const ENV_REMOTE_URL: &str = "BRIDGE_REMOTE_URL";
const ENV_API_KEY: &str = "BRIDGE_API_KEY";
const ENV_LOCATION_ID: &str = "BRIDGE_LOCATION_ID";

// Optional, with defaults
const ENV_IMPORT_INTERVAL_MS: &str = "BRIDGE_IMPORT_INTERVAL_MS";
const ENV_EXPORT_INTERVAL_MS: &str = "BRIDGE_EXPORT_INTERVAL_MS";
const ENV_HTTP_TIMEOUT_SECS: &str = "BRIDGE_HTTP_TIMEOUT_SECS";
const ENV_DISPLAY_PORT: &str = "BRIDGE_DISPLAY_PORT";
const ENV_DISPLAY_REFRESH_MS: &str = "BRIDGE_DISPLAY_REFRESH_MS";
const ENV_ACK_FAILED_IMPORTS: &str = "BRIDGE_ACK_FAILED_IMPORTS";

const DEFAULT_IMPORT_INTERVAL_MS: u64 = 6_000;
const DEFAULT_EXPORT_INTERVAL_MS: u64 = 8_000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DISPLAY_REFRESH_MS: u64 = 5_000;

/// Immutable runtime configuration, built once at process entry.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the local SQLite store.
    pub db_path: PathBuf,
    /// Base URL of the remote aggregation service (normalised, trailing slash).
    pub remote_url: String,
    /// API key attached to every remote request.
    pub api_key: String,
    /// Location identifier scoping every query and command.
    pub location_id: String,
    /// Cadence of the inbound order import task.
    pub import_interval: Duration,
    /// Cadence of the outbound master-data export task.
    pub export_interval: Duration,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
    /// TCP port of the display snapshot feed; feed disabled when unset.
    pub display_port: Option<u16>,
    /// Cadence of the display snapshot refresh.
    pub display_refresh: Duration,
    /// When true (the default), pulled orders whose local insert failed are
    /// still acknowledged as received. When false, only durably inserted
    /// orders are acknowledged and the remote re-offers the rest.
    pub ack_failed_imports: bool,
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Config, String> {
        Ok(Config {
            db_path: PathBuf::from(required(ENV_DB_PATH)?),
            remote_url: crate::remote::normalize_base_url(&required(ENV_REMOTE_URL)?),
            api_key: required(ENV_API_KEY)?,
            location_id: required(ENV_LOCATION_ID)?,
            import_interval: millis(ENV_IMPORT_INTERVAL_MS, DEFAULT_IMPORT_INTERVAL_MS)?,
            export_interval: millis(ENV_EXPORT_INTERVAL_MS, DEFAULT_EXPORT_INTERVAL_MS)?,
            http_timeout: Duration::from_secs(parse_u64(
                ENV_HTTP_TIMEOUT_SECS,
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
            display_port: optional_port(ENV_DISPLAY_PORT)?,
            display_refresh: millis(ENV_DISPLAY_REFRESH_MS, DEFAULT_DISPLAY_REFRESH_MS)?,
            ack_failed_imports: flag(ENV_ACK_FAILED_IMPORTS, true),
        })
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn required(name: &str) -> Result<String, String> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(format!("missing required environment variable: {name}")),
    }
}

fn parse_u64(name: &str, default: u64) -> Result<u64, String> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid value for {name}: {v:?}")),
        _ => Ok(default),
    }
}

fn millis(name: &str, default: u64) -> Result<Duration, String> {
    Ok(Duration::from_millis(parse_u64(name, default)?))
}

fn optional_port(name: &str) -> Result<Option<u16>, String> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| format!("invalid value for {name}: {v:?}")),
        _ => Ok(None),
    }
}

/// Lenient boolean parsing: "true"/"1"/"yes"/"on" and their negations,
/// anything else falls back to `default`.
fn flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => {
            let lower = v.trim().to_ascii_lowercase();
            match lower.as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            }
        }
        Err(_) => default,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
