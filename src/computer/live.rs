use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use reqwest::StatusCode;
use std::time::Duration;

use super::{ActionBudget, ActionError, ActionLogEntry, ActionResult, ComputerAction};

const BRIDGE_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the LIVE computer bridge.
pub struct LiveBridge {
    base_url: String,
    budget: ActionBudget,
    http: reqwest::Client,
}

impl LiveBridge {
    pub fn new(base_url: String, max_actions: u32) -> Self {
        tracing::info!("[computer] LIVE bridge at {}", base_url);
        Self {
            base_url,
            budget: ActionBudget::new(max_actions),
            http: reqwest::Client::new(),
        }
    }

    pub async fn execute(&mut self, action: &ComputerAction) -> Result<ActionResult, ActionError> {
        let count = self.budget.consume()?;
        let description = action.describe();
        tracing::info!("[computer] LIVE action #{}: {}", count, description);

        let response = self
            .http
            .post(format!("{}/action", self.base_url))
            .json(action)
            .timeout(BRIDGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        match response.status() {
            StatusCode::NOT_IMPLEMENTED => {
                tracing::warn!("[computer] LIVE bridge returned 501 Not Implemented");
                return Err(ActionError::NotImplemented);
            }
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(ActionError::Bridge(format!(
                    "Bridge returned {}: {}",
                    status.as_u16(),
                    body.chars().take(200).collect::<String>()
                )));
            }
            _ => {}
        }

        let state: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ActionError::Bridge(format!("Invalid bridge response: {e}")))?;

        let screenshot = self.screenshot().await?;

        Ok(ActionResult {
            screenshot,
            log: ActionLogEntry {
                action_type: action.kind().to_string(),
                timestamp: Utc::now(),
                payload: serde_json::json!({ "action": action, "count": count, "state": state }),
            },
            description,
            state,
        })
    }

    async fn screenshot(&self) -> Result<String, ActionError> {
        let response = self
            .http
            .get(format!("{}/screenshot", self.base_url))
            .timeout(BRIDGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ActionError::Bridge(format!("Failed to read screenshot: {e}")))?;
        Ok(BASE64.encode(bytes))
    }

    fn transport_error(&self, e: &reqwest::Error) -> ActionError {
        if e.is_connect() || e.is_timeout() {
            tracing::error!("[computer] cannot reach LIVE bridge at {}: {}", self.base_url, e);
            ActionError::Bridge(format!(
                "Cannot connect to LIVE bridge. Ensure bridge is running at {}",
                self.base_url
            ))
        } else {
            ActionError::Bridge(e.to_string())
        }
    }
}
