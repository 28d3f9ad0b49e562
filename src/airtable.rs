//! Record-upsert client for Airtable.
//!
//! Never returns an error to the caller: missing credentials, HTTP failures,
//! and network faults all come back as an `UpsertResult`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::settings::AirtableCredentials;

const AIRTABLE_API_URL: &str = "https://api.airtable.com/v0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UpsertResult {
    Disabled {
        message: String,
    },
    Success {
        record_id: Option<String>,
        message: String,
    },
    Error {
        message: String,
    },
}

impl UpsertResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Disabled { message } | Self::Success { message, .. } | Self::Error { message } => message,
        }
    }
}

#[derive(Clone)]
pub struct RecordStore {
    credentials: Arc<RwLock<Option<AirtableCredentials>>>,
    api_url: String,
    http: reqwest::Client,
}

impl RecordStore {
    pub fn new(credentials: Option<AirtableCredentials>) -> Self {
        Self::with_api_url(credentials, AIRTABLE_API_URL)
    }

    /// Point the client at a different API root (used by tests).
    pub fn with_api_url(credentials: Option<AirtableCredentials>, api_url: &str) -> Self {
        Self {
            credentials: Arc::new(RwLock::new(credentials)),
            api_url: api_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn configure(&self, credentials: AirtableCredentials) {
        *self.credentials.write().await = Some(credentials);
        tracing::info!("[airtable] credentials configured");
    }

    pub async fn unconfigure(&self) {
        *self.credentials.write().await = None;
        tracing::info!("[airtable] credentials cleared");
    }

    pub async fn upsert(&self, mut payload: serde_json::Map<String, serde_json::Value>) -> UpsertResult {
        let Some(creds) = self.credentials.read().await.clone() else {
            return UpsertResult::Disabled {
                message: "Airtable is not configured. Set AIRTABLE_API_KEY, AIRTABLE_BASE_ID and AIRTABLE_TABLE_NAME to enable it.".to_string(),
            };
        };

        payload
            .entry("timestamp")
            .or_insert_with(|| serde_json::Value::String(chrono::Utc::now().to_rfc3339()));

        let url = format!("{}/{}/{}", self.api_url, creds.base_id, creds.table_name);
        let body = serde_json::json!({ "fields": payload, "typecast": true });

        let response = match self
            .http
            .post(&url)
            .bearer_auth(&creds.api_key)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("[airtable] network error: {}", e);
                return UpsertResult::Error {
                    message: "Network error: Could not reach Airtable API".to_string(),
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!("[airtable] API error: {} - {}", status, text);
            return UpsertResult::Error {
                message: format!(
                    "Airtable API returned {}: {}",
                    status.as_u16(),
                    text.chars().take(200).collect::<String>()
                ),
            };
        }

        match response.json::<serde_json::Value>().await {
            Ok(json) => {
                let record_id = json.get("id").and_then(|v| v.as_str()).map(str::to_string);
                tracing::info!("[airtable] record created: {:?}", record_id);
                UpsertResult::Success {
                    record_id,
                    message: "Record successfully added to Airtable".to_string(),
                }
            }
            Err(e) => UpsertResult::Error {
                message: format!("Unexpected response from Airtable: {e}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn creds() -> AirtableCredentials {
        AirtableCredentials {
            api_key: "key".to_string(),
            base_id: "app1".to_string(),
            table_name: "Log".to_string(),
        }
    }

    async fn spawn_fake_airtable(hits: Arc<AtomicUsize>, fail: bool) -> String {
        let app = Router::new().route(
            "/app1/Log",
            post(move |Json(body): Json<serde_json::Value>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(body["typecast"], true);
                    assert!(body["fields"]["timestamp"].is_string());
                    if fail {
                        (axum::http::StatusCode::UNPROCESSABLE_ENTITY, Json(serde_json::json!({"error": "bad"})))
                    } else {
                        (axum::http::StatusCode::OK, Json(serde_json::json!({"id": "rec123"})))
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn payload() -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("item".to_string(), serde_json::json!("jacket"));
        map
    }

    #[tokio::test]
    async fn test_disabled_without_network() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_fake_airtable(hits.clone(), false).await;
        let store = RecordStore::with_api_url(None, &url);
        let result = store.upsert(payload()).await;
        assert!(matches!(result, UpsertResult::Disabled { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_configure_then_unconfigure_toggles() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_fake_airtable(hits.clone(), false).await;
        let store = RecordStore::with_api_url(None, &url);

        store.configure(creds()).await;
        let first = store.upsert(payload()).await;
        assert_eq!(
            first,
            UpsertResult::Success {
                record_id: Some("rec123".to_string()),
                message: "Record successfully added to Airtable".to_string(),
            }
        );

        store.unconfigure().await;
        let second = store.upsert(payload()).await;
        assert!(matches!(second, UpsertResult::Disabled { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_2xx_is_friendly_error() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_fake_airtable(hits, true).await;
        let store = RecordStore::with_api_url(Some(creds()), &url);
        let result = store.upsert(payload()).await;
        assert!(result.message().starts_with("Airtable API returned 422"));
    }

    #[tokio::test]
    async fn test_unreachable_is_network_error() {
        let store = RecordStore::with_api_url(Some(creds()), "http://127.0.0.1:9");
        let result = store.upsert(payload()).await;
        assert_eq!(result.message(), "Network error: Could not reach Airtable API");
    }
}
