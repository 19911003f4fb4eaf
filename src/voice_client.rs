use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::circuit_breaker::{create_provider_circuit_breaker, guarded, ProviderBreaker};
use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// E.164.
    pub to_number: String,
    pub script_id: String,
    pub metadata: BTreeMap<String, String>,
}

/// Outbound calling seam. Returns the provider call reference as soon as the
/// call is queued; completion arrives later by webhook.
#[async_trait]
pub trait VoiceProvider: Send + Sync {
    async fn place_call(&self, request: &CallRequest) -> Result<String, AppError>;
}

/// Client for a Vapi-style voice API (`POST /call`).
#[derive(Clone)]
pub struct HttpVoiceProvider {
    client: Client,
    base_url: String,
    api_key: String,
    phone_number_id: String,
    breaker: ProviderBreaker,
}

impl HttpVoiceProvider {
    pub fn new(base_url: String, api_key: String, phone_number_id: String) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create voice client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            phone_number_id,
            breaker: create_provider_circuit_breaker(),
        })
    }
}

#[async_trait]
impl VoiceProvider for HttpVoiceProvider {
    async fn place_call(&self, request: &CallRequest) -> Result<String, AppError> {
        let url = format!("{}/call", self.base_url);
        tracing::info!(
            "Placing call to {} with assistant {}",
            request.to_number,
            request.script_id
        );

        let body = json!({
            "assistantId": request.script_id,
            "phoneNumberId": self.phone_number_id,
            "customer": { "number": request.to_number },
            "metadata": request.metadata,
        });

        guarded(&self.breaker, "voice provider", async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| AppError::ExternalApiError(format!("Call request failed: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(AppError::ExternalApiError(format!(
                    "Voice provider returned {}: {}",
                    status, error_text
                )));
            }

            let data: serde_json::Value = response.json().await.map_err(|e| {
                AppError::ExternalApiError(format!("Failed to parse call response: {}", e))
            })?;

            data.get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    AppError::ExternalApiError("Call response missing 'id' field".to_string())
                })
        })
        .await
    }
}
