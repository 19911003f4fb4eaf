use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::circuit_breaker::{create_provider_circuit_breaker, guarded, ProviderBreaker};
use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailReceipt {
    pub accepted: bool,
    pub provider_ref: Option<String>,
    pub detail: Option<String>,
}

/// Transactional email delivery seam.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<EmailReceipt, AppError>;
}

/// Client for a Resend-style JSON email API (`POST /emails`, Bearer auth).
#[derive(Clone)]
pub struct HttpEmailProvider {
    client: Client,
    base_url: String,
    api_key: String,
    breaker: ProviderBreaker,
}

impl HttpEmailProvider {
    /// Creates a new `HttpEmailProvider`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Root of the provider API, e.g. `https://api.resend.com`.
    /// * `api_key` - Bearer token; never logged.
    pub fn new(base_url: String, api_key: String) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create email client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            breaker: create_provider_circuit_breaker(),
        })
    }
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    async fn send(&self, email: &OutboundEmail) -> Result<EmailReceipt, AppError> {
        let url = format!("{}/emails", self.base_url);
        tracing::debug!("Sending email to {} via {}", email.to, url);

        let body = json!({
            "from": email.from,
            "to": [email.to],
            "subject": email.subject,
            "html": email.html,
            "text": email.text,
        });

        guarded(&self.breaker, "email provider", async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| AppError::ExternalApiError(format!("Email request failed: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(AppError::ExternalApiError(format!(
                    "Email provider returned {}: {}",
                    status, error_text
                )));
            }

            let data: serde_json::Value = response.json().await.map_err(|e| {
                AppError::ExternalApiError(format!("Failed to parse email response: {}", e))
            })?;

            let provider_ref = data.get("id").and_then(|v| v.as_str()).map(str::to_string);
            if provider_ref.is_none() {
                tracing::warn!("Email provider response without id: {:?}", data);
            }
            Ok(EmailReceipt {
                accepted: true,
                provider_ref,
                detail: None,
            })
        })
        .await
    }
}
