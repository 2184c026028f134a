//! Remote sync API client.
//!
//! Provides authenticated HTTP communication with the sync backend:
//! per-item create/update/delete pushes keyed by `clientGeneratedId`,
//! authoritative-state fetches for conflict resolution, and a lightweight
//! connectivity test. Responses are classified into the closed error
//! taxonomy so the engine can decide retry/halt/reconcile per item.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::ApiError;
use crate::storage;
use crate::types::{EntityType, SyncAction};

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the API key on every request.
pub(crate) const API_KEY_HEADER: &str = "X-Sync-API-Key";
/// Header identifying this device to the backend.
const DEVICE_ID_HEADER: &str = "x-device-id";
/// Header carrying the queue row's idempotency key so retried sends of the
/// same operation never create duplicates server-side.
const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote API URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection-string parsing
// ---------------------------------------------------------------------------

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_remote_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_remote_url)
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_device_id_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("did")
                .or_else(|| v.get("deviceId"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a classified, user-friendly error.
fn classify_transport_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout(format!("Connection to {url} timed out"));
    }
    if err.is_connect() {
        return ApiError::Network(format!("Cannot reach sync backend at {url}"));
    }
    if err.is_builder() {
        return ApiError::Unknown(format!("Invalid sync backend URL: {url}"));
    }
    ApiError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Device not authorized".to_string(),
        404 => "Sync endpoint not found".to_string(),
        429 => "Too many requests. Please retry later.".to_string(),
        s if s >= 500 => format!("Sync backend server error (HTTP {s})"),
        s => format!("Unexpected response from sync backend (HTTP {s})"),
    }
}

/// Build the detail string for a non-success response, preserving any
/// validation payload the backend included.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_error(status));
        let details = json.get("details").or_else(|| json.get("errors")).cloned();
        if let Some(details) = details {
            format!("{message} (HTTP {}): {}", status.as_u16(), details)
        } else {
            format!("{message} (HTTP {})", status.as_u16())
        }
    } else if !body_text.trim().is_empty() {
        format!(
            "{} (HTTP {}): {}",
            status_error(status),
            status.as_u16(),
            body_text.trim()
        )
    } else {
        format!("{} (HTTP {})", status_error(status), status.as_u16())
    }
}

/// Classify a non-success, non-conflict response.
fn classify_status(status: StatusCode, body_text: &str) -> ApiError {
    let detail = error_detail(status, body_text);
    match status.as_u16() {
        401 | 403 => ApiError::Auth(detail),
        408 | 504 => ApiError::Timeout(detail),
        429 => ApiError::Network(detail),
        _ => ApiError::Unknown(detail),
    }
}

/// Pull the authoritative server entity out of a 409 body.
fn parse_conflict_body(body_text: &str) -> Option<Value> {
    let json = serde_json::from_str::<Value>(body_text).ok()?;
    json.get("current")
        .or_else(|| json.get("serverState"))
        .or_else(|| json.get("entity"))
        .cloned()
        .filter(|v| v.is_object())
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One remote operation, built from a queue row at send time.
#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub entity_type: EntityType,
    /// The owning entity's `clientGeneratedId`.
    pub entity_id: String,
    pub action: SyncAction,
    /// Entity snapshot to submit; null for deletes.
    pub payload: Value,
    pub idempotency_key: String,
    /// Version the snapshot was based on; the server rejects the write with
    /// a conflict when this no longer matches its current value.
    pub expected_version: Option<i64>,
}

/// Server confirmation of an accepted write.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerAck {
    pub version: i64,
    pub last_modified_at: DateTime<Utc>,
}

fn parse_ack(body: &Value) -> Result<ServerAck, ApiError> {
    let root = body.get("data").unwrap_or(body);
    let version = root
        .get("version")
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::Unknown("Sync response missing version".to_string()))?;
    let last_modified_at = root
        .get("lastModifiedAt")
        .or_else(|| root.get("last_modified_at"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Ok(ServerAck {
        version,
        last_modified_at,
    })
}

fn entity_path(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Order => "orders",
        EntityType::Product => "products",
    }
}

// ---------------------------------------------------------------------------
// Remote API trait
// ---------------------------------------------------------------------------

/// Contract the sync engine drains against. The production implementation is
/// [`RemoteClient`]; tests substitute a scripted fake.
pub trait RemoteApi: Send + Sync + 'static {
    /// Submit one operation. A version mismatch surfaces as
    /// `ApiError::Conflict` carrying the server's current state when the
    /// response included it.
    fn push(&self, op: &SyncOperation) -> impl Future<Output = Result<ServerAck, ApiError>> + Send;

    /// Fetch the authoritative server state for an entity. `Ok(None)` means
    /// the entity does not exist remotely.
    fn fetch_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> impl Future<Output = Result<Option<Value>, ApiError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// reqwest-backed [`RemoteApi`] implementation.
pub struct RemoteClient {
    base_url: String,
    api_key: String,
    device_id: String,
    client: Client,
    compression_threshold: usize,
}

impl RemoteClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        device_id: &str,
        config: &SyncConfig,
    ) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

        let resolved_api_key =
            extract_api_key_from_connection_string(api_key).unwrap_or_else(|| api_key.to_string());

        Ok(Self {
            base_url: normalize_remote_url(base_url),
            api_key: resolved_api_key,
            device_id: device_id.to_string(),
            client,
            compression_threshold: config.compression_threshold,
        })
    }

    /// Construct from credentials in the OS keyring.
    pub fn from_storage(config: &SyncConfig) -> Result<Self, String> {
        let base_url = storage::get_credential(storage::KEY_REMOTE_URL)
            .ok_or("Sync not configured: missing remote URL")?;
        let api_key = storage::get_credential(storage::KEY_API_KEY)
            .ok_or("Sync not configured: missing API key")?;
        let device_id = storage::get_credential(storage::KEY_DEVICE_ID).unwrap_or_default();
        Self::new(&base_url, &api_key, &device_id, config)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Attach auth headers and the JSON body, zstd-compressing bodies above
    /// the configured threshold.
    fn authed_post(
        &self,
        url: &str,
        idempotency_key: &str,
        body: &Value,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let raw = serde_json::to_vec(body)
            .map_err(|e| ApiError::Unknown(format!("serialize sync request: {e}")))?;

        let req = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(DEVICE_ID_HEADER, &self.device_id)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .header("Content-Type", "application/json");

        if raw.len() > self.compression_threshold {
            let compressed = zstd::encode_all(raw.as_slice(), 3)
                .map_err(|e| ApiError::Unknown(format!("compress sync request: {e}")))?;
            debug!(
                raw_bytes = raw.len(),
                compressed_bytes = compressed.len(),
                "Compressing sync payload"
            );
            Ok(req.header("Content-Encoding", "zstd").body(compressed))
        } else {
            Ok(req.body(raw))
        }
    }
}

impl RemoteApi for RemoteClient {
    async fn push(&self, op: &SyncOperation) -> Result<ServerAck, ApiError> {
        let url = format!(
            "{}/api/sync/{}",
            self.base_url,
            entity_path(op.entity_type)
        );

        let body = serde_json::json!({
            "action": op.action,
            "entityId": op.entity_id,
            "expectedVersion": op.expected_version,
            "entity": op.payload,
        });

        let resp = self
            .authed_post(&url, &op.idempotency_key, &body)?
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.base_url, &e))?;

        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if status == StatusCode::CONFLICT {
            return Err(ApiError::Conflict {
                current: parse_conflict_body(&body_text),
            });
        }
        if !status.is_success() {
            return Err(classify_status(status, &body_text));
        }

        let json = serde_json::from_str::<Value>(&body_text)
            .map_err(|e| ApiError::Unknown(format!("Invalid JSON from sync backend: {e}")))?;
        parse_ack(&json)
    }

    async fn fetch_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<Value>, ApiError> {
        let url = format!(
            "{}/api/sync/{}/{}",
            self.base_url,
            entity_path(entity_type),
            entity_id
        );

        let resp = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(DEVICE_ID_HEADER, &self.device_id)
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.base_url, &e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, &body_text));
        }

        let json = serde_json::from_str::<Value>(&body_text)
            .map_err(|e| ApiError::Unknown(format!("Invalid JSON from sync backend: {e}")))?;
        let entity = match json.get("entity") {
            Some(e) => e.clone(),
            None => json,
        };
        Ok(Some(entity))
    }
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Test connectivity to the sync backend with a lightweight health-check.
pub async fn test_connectivity(remote_url: &str, api_key: &str) -> ConnectivityResult {
    let url = normalize_remote_url(remote_url);
    let resolved_api_key =
        extract_api_key_from_connection_string(api_key).unwrap_or_else(|| api_key.to_string());
    let health_url = format!("{url}/api/health");

    let client = match Client::builder().timeout(CONNECTIVITY_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(format!("Failed to create HTTP client: {e}")),
            };
        }
    };

    let start = Instant::now();

    let resp = match client
        .get(&health_url)
        .header(API_KEY_HEADER, resolved_api_key)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(classify_transport_error(&url, &e).to_string()),
            };
        }
    };

    let latency = start.elapsed().as_millis() as u64;
    let status = resp.status();

    if status.is_success() {
        info!(latency_ms = latency, "connectivity test passed");
        ConnectivityResult {
            success: true,
            latency_ms: Some(latency),
            error: None,
        }
    } else {
        ConnectivityResult {
            success: false,
            latency_ms: Some(latency),
            error: Some(status_error(status)),
        }
    }
}
