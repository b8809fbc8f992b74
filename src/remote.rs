//! Remote aggregation service client.
//!
//! Provides authenticated HTTP communication with the remote service: order
//! pulls, delivery acknowledgments, and master-data pushes. The `Remote`
//! trait is the seam between the sync engine and the wire; the engine only
//! ever sees parsed JSON or a classified `TransportError`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::TransportError;

/// Wire resource names, relative to the configured base URL.
pub const RES_ORDERS: &str = "getData";
pub const RES_ORDER_ACK: &str = "acknowledgeData";
pub const RES_PRODUCTS: &str = "productsData";
pub const RES_CUSTOMERS: &str = "customerData";
pub const RES_SALESMEN: &str = "salesManData";

/// Header carrying the API key on every request.
const API_KEY_HEADER: &str = "api-key";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - ensure exactly one trailing slash, since resource names are appended
///   directly
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    url.push('/');

    url
}

/// Convert an HTTP status code into a log-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 | 403 => "API key rejected by remote service".to_string(),
        404 => "remote endpoint not found".to_string(),
        s if s >= 500 => format!("remote service error (HTTP {s})"),
        s => format!("unexpected response from remote service (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Generic request/response transport to the remote service.
///
/// Implemented over HTTP in production and by a scripted mock in tests.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Fetch the JSON body of `resource`.
    async fn pull(&self, resource: &str) -> Result<Value, TransportError>;

    /// Post `payload` to `resource` and return the parsed response body.
    async fn push(&self, resource: &str, payload: &Value) -> Result<Value, TransportError>;
}

/// HTTP implementation of [`Remote`].
pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpRemote {
    /// Build a client with the configured timeout. `base_url` must already
    /// be normalised (see [`normalize_base_url`]).
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to create HTTP client: {e}")))?;

        Ok(HttpRemote {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url_for(&self, resource: &str) -> String {
        format!("{}{resource}", self.base_url)
    }

    /// Check the status and parse the body. Non-2xx responses become
    /// `TransportError::Other` with whatever detail the body carries.
    async fn read_body(url: &str, resp: reqwest::Response) -> Result<Value, TransportError> {
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let detail = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|json| {
                    json.get("error")
                        .or_else(|| json.get("message"))
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                })
                .unwrap_or_else(|| status_error(status));
            return Err(TransportError::Other(format!(
                "{detail} (HTTP {} from {url})",
                status.as_u16()
            )));
        }

        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| TransportError::Other(format!("invalid JSON from {url}: {e}")))
    }
}

#[async_trait]
impl Remote for HttpRemote {
    async fn pull(&self, resource: &str) -> Result<Value, TransportError> {
        let url = self.url_for(resource);
        debug!(%url, "pull");

        let resp = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| TransportError::classify(&url, &e))?;

        Self::read_body(&url, resp).await
    }

    async fn push(&self, resource: &str, payload: &Value) -> Result<Value, TransportError> {
        let url = self.url_for(resource);
        debug!(%url, "push");

        let resp = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportError::classify(&url, &e))?;

        Self::read_body(&url, resp).await
    }
}

// ===========================================================================
// Test support
// ===========================================================================

/// Scriptable in-memory remote, queue-per-resource.
#[cfg(test)]
pub(crate) struct MockRemote {
    pull_responses: std::sync::Mutex<std::collections::HashMap<String, std::collections::VecDeque<Value>>>,
    push_responses: std::sync::Mutex<std::collections::HashMap<String, std::collections::VecDeque<Value>>>,
    unreachable: std::sync::Mutex<std::collections::HashSet<String>>,
    pushes: std::sync::Mutex<Vec<(String, Value)>>,
}

#[cfg(test)]
impl MockRemote {
    pub fn new() -> Self {
        MockRemote {
            pull_responses: std::sync::Mutex::new(Default::default()),
            push_responses: std::sync::Mutex::new(Default::default()),
            unreachable: std::sync::Mutex::new(Default::default()),
            pushes: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue the next pull response for `resource`.
    pub fn queue_pull(&self, resource: &str, body: Value) {
        self.pull_responses
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .push_back(body);
    }

    /// Queue the next push response for `resource`.
    pub fn queue_push(&self, resource: &str, body: Value) {
        self.push_responses
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .push_back(body);
    }

    /// Make every call to `resource` fail with `HostUnreachable`.
    pub fn set_unreachable(&self, resource: &str) {
        self.unreachable.lock().unwrap().insert(resource.to_string());
    }

    /// Every payload pushed to `resource`, in order.
    pub fn pushes_to(&self, resource: &str) -> Vec<Value> {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == resource)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Remote for MockRemote {
    async fn pull(&self, resource: &str) -> Result<Value, TransportError> {
        if self.unreachable.lock().unwrap().contains(resource) {
            return Err(TransportError::HostUnreachable);
        }
        self.pull_responses
            .lock()
            .unwrap()
            .get_mut(resource)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| {
                TransportError::Other(format!("no scripted pull response for {resource}"))
            })
    }

    async fn push(&self, resource: &str, payload: &Value) -> Result<Value, TransportError> {
        if self.unreachable.lock().unwrap().contains(resource) {
            return Err(TransportError::HostUnreachable);
        }
        self.pushes
            .lock()
            .unwrap()
            .push((resource.to_string(), payload.clone()));
        Ok(self
            .push_responses
            .lock()
            .unwrap()
            .get_mut(resource)
            .and_then(|q| q.pop_front())
            .unwrap_or(Value::Null))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
