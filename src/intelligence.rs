//! Lead insights: scoring and inbound classification.
//!
//! [`LeadInsights`] is the single capability the engine talks to. Two
//! implementations exist and one is chosen at startup by [`select_insights`]:
//! [`RuleBasedInsights`] (weighted sum + keyword lists) and
//! [`ModelBackedInsights`], which consults a [`TextIntelligence`] collaborator
//! and degrades to the rules on any error or timeout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{create_provider_circuit_breaker, guarded, ProviderBreaker};
use crate::classification::{acknowledgement_reply, classify_by_keywords};
use crate::errors::AppError;
use crate::models::{
    CanonicalEmail, Classification, InsightSource, Lead, Sentiment, TicketCategory,
    TicketPriority,
};
use crate::scoring::{clamp_score, score_lead, status_for_score, LeadScore, ScoringWeights};

/// Attributes sent to the model when scoring. Never includes contact details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadFeatures {
    pub has_company: bool,
    pub has_phone: bool,
    pub industry: Option<String>,
    pub source: String,
    pub days_since_contact: Option<i64>,
}

impl LeadFeatures {
    pub fn from_lead(lead: &Lead, now: DateTime<Utc>) -> Self {
        Self {
            has_company: lead.company.as_deref().map_or(false, |c| !c.trim().is_empty()),
            has_phone: lead.phone.as_deref().map_or(false, |p| !p.trim().is_empty()),
            industry: lead.industry.clone(),
            source: lead.source.to_string(),
            days_since_contact: lead.last_contact_at.map(|t| (now - t).num_days()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelScore {
    pub score: i64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelClassification {
    pub category: TicketCategory,
    pub sentiment: Sentiment,
    pub priority: TicketPriority,
}

/// Optional language-model collaborator.
#[async_trait]
pub trait TextIntelligence: Send + Sync {
    async fn score(&self, features: &LeadFeatures) -> Result<ModelScore, AppError>;
    async fn classify(&self, subject: &str, body: &str) -> Result<ModelClassification, AppError>;
    async fn generate_reply(
        &self,
        email: &CanonicalEmail,
        classification: &ModelClassification,
    ) -> Result<String, AppError>;
}

/// OpenAI-compatible chat-completions client asking for JSON object output.
#[derive(Clone)]
pub struct HttpTextIntelligence {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    breaker: ProviderBreaker,
}

impl HttpTextIntelligence {
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create intelligence client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            breaker: create_provider_circuit_breaker(),
        })
    }

    async fn complete(&self, system: &str, user: String, json_output: bool) -> Result<String, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ]
        });
        if json_output {
            body["response_format"] = json!({ "type": "json_object" });
        }

        guarded(&self.breaker, "intelligence", async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    AppError::ExternalApiError(format!("Intelligence request failed: {}", e))
                })?;

            if !response.status().is_success() {
                let status = response.status();
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(AppError::ExternalApiError(format!(
                    "Intelligence API returned {}: {}",
                    status, error_text
                )));
            }

            let data: serde_json::Value = response.json().await.map_err(|e| {
                AppError::ExternalApiError(format!(
                    "Failed to parse intelligence response: {}",
                    e
                ))
            })?;

            data.pointer("/choices/0/message/content")
                .and_then(|c| c.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    AppError::ExternalApiError(
                        "Intelligence response missing message content".to_string(),
                    )
                })
        })
        .await
    }
}

#[async_trait]
impl TextIntelligence for HttpTextIntelligence {
    async fn score(&self, features: &LeadFeatures) -> Result<ModelScore, AppError> {
        let content = self
            .complete(
                "You score real-estate investment leads from 0 to 100. \
                 Respond with JSON {\"score\": integer, \"reasoning\": string}.",
                serde_json::to_string(features)?,
                true,
            )
            .await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn classify(&self, subject: &str, body: &str) -> Result<ModelClassification, AppError> {
        let content = self
            .complete(
                "Classify this support email. Respond with JSON {\"category\": one of \
                 investment_inquiry|property_question|technical_support|general_support|\
                 partnership|complaint|feature_request, \"sentiment\": one of \
                 positive|neutral|negative|urgent, \"priority\": one of low|medium|high|urgent}.",
                format!("Subject: {}\n\n{}", subject, body),
                true,
            )
            .await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn generate_reply(
        &self,
        email: &CanonicalEmail,
        classification: &ModelClassification,
    ) -> Result<String, AppError> {
        let reply = self
            .complete(
                "Write a short, friendly plain-text reply acknowledging this support email. \
                 Never promise investment returns.",
                format!(
                    "Category: {}\nPriority: {}\nFrom: {}\nSubject: {}\n\n{}",
                    classification.category,
                    classification.priority,
                    email.from_name.as_deref().unwrap_or(&email.from),
                    email.subject,
                    email.body
                ),
                false,
            )
            .await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(AppError::ExternalApiError(
                "Intelligence returned an empty reply".to_string(),
            ));
        }
        Ok(reply.to_string())
    }
}

/// The one capability the engine uses for scoring and classification. Both
/// operations are total: they never fail and never block the pipeline.
#[async_trait]
pub trait LeadInsights: Send + Sync {
    fn name(&self) -> &'static str;
    async fn score(&self, lead: &Lead, now: DateTime<Utc>) -> LeadScore;
    async fn classify(&self, email: &CanonicalEmail) -> Classification;
}

pub struct RuleBasedInsights {
    weights: ScoringWeights,
}

impl RuleBasedInsights {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }
}

#[async_trait]
impl LeadInsights for RuleBasedInsights {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn score(&self, lead: &Lead, now: DateTime<Utc>) -> LeadScore {
        score_lead(lead, &self.weights, now)
    }

    async fn classify(&self, email: &CanonicalEmail) -> Classification {
        classify_by_keywords(email)
    }
}

pub struct ModelBackedInsights {
    model: Arc<dyn TextIntelligence>,
    weights: ScoringWeights,
    timeout: Duration,
}

impl ModelBackedInsights {
    pub fn new(model: Arc<dyn TextIntelligence>, weights: ScoringWeights, timeout: Duration) -> Self {
        Self {
            model,
            weights,
            timeout,
        }
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> Option<T>
    where
        F: std::future::Future<Output = Result<T, AppError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::warn!("Model {} failed, using rules: {}", what, e);
                None
            }
            Err(_) => {
                tracing::warn!("Model {} timed out after {:?}, using rules", what, self.timeout);
                None
            }
        }
    }
}

#[async_trait]
impl LeadInsights for ModelBackedInsights {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn score(&self, lead: &Lead, now: DateTime<Utc>) -> LeadScore {
        let features = LeadFeatures::from_lead(lead, now);
        match self.bounded("scoring", self.model.score(&features)).await {
            Some(model_score) => {
                let score = clamp_score(model_score.score);
                LeadScore {
                    score,
                    status: status_for_score(score, &self.weights),
                    reasoning: Some(model_score.reasoning).filter(|r| !r.is_empty()),
                }
            }
            None => score_lead(lead, &self.weights, now),
        }
    }

    async fn classify(&self, email: &CanonicalEmail) -> Classification {
        let Some(model_class) = self
            .bounded("classification", self.model.classify(&email.subject, &email.body))
            .await
        else {
            return classify_by_keywords(email);
        };

        let suggested_reply = match self
            .bounded("reply", self.model.generate_reply(email, &model_class))
            .await
        {
            Some(reply) => reply,
            None => acknowledgement_reply(
                email.from_name.as_deref(),
                model_class.category,
                model_class.priority,
            ),
        };

        Classification {
            category: model_class.category,
            sentiment: model_class.sentiment,
            priority: model_class.priority,
            suggested_reply,
            source: InsightSource::Model,
        }
    }
}

/// Picks the insights implementation once at startup.
pub fn select_insights(
    model: Option<Arc<dyn TextIntelligence>>,
    weights: ScoringWeights,
    timeout: Duration,
) -> Arc<dyn LeadInsights> {
    match model {
        Some(model) => {
            tracing::info!("Lead insights: model-backed with rule fallback");
            Arc::new(ModelBackedInsights::new(model, weights, timeout))
        }
        None => {
            tracing::info!("Lead insights: rule-based");
            Arc::new(RuleBasedInsights::new(weights))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LeadSource;
    use chrono::TimeZone;

    struct Failing;

    #[async_trait]
    impl TextIntelligence for Failing {
        async fn score(&self, _: &LeadFeatures) -> Result<ModelScore, AppError> {
            Err(AppError::ExternalApiError("down".to_string()))
        }
        async fn classify(&self, _: &str, _: &str) -> Result<ModelClassification, AppError> {
            Err(AppError::ExternalApiError("down".to_string()))
        }
        async fn generate_reply(
            &self,
            _: &CanonicalEmail,
            _: &ModelClassification,
        ) -> Result<String, AppError> {
            Err(AppError::ExternalApiError("down".to_string()))
        }
    }

    struct Slow;

    #[async_trait]
    impl TextIntelligence for Slow {
        async fn score(&self, _: &LeadFeatures) -> Result<ModelScore, AppError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ModelScore {
                score: 99,
                reasoning: String::new(),
            })
        }
        async fn classify(&self, _: &str, _: &str) -> Result<ModelClassification, AppError> {
            Ok(ModelClassification {
                category: TicketCategory::Partnership,
                sentiment: Sentiment::Positive,
                priority: TicketPriority::Low,
            })
        }
        async fn generate_reply(
            &self,
            _: &CanonicalEmail,
            _: &ModelClassification,
        ) -> Result<String, AppError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn email() -> CanonicalEmail {
        CanonicalEmail {
            from: "jane@example.com".to_string(),
            from_name: Some("Jane".to_string()),
            to: vec!["support@acme.io".to_string()],
            subject: "URGENT".to_string(),
            body: "I cannot log in".to_string(),
            timestamp: now(),
        }
    }

    #[tokio::test]
    async fn failing_model_degrades_to_rules() {
        let insights = select_insights(
            Some(Arc::new(Failing)),
            ScoringWeights::default(),
            Duration::from_millis(200),
        );
        assert_eq!(insights.name(), "model");

        let lead = Lead::new("a@b.com", "A", LeadSource::Referral, now()).with_company("Acme");
        let scored = insights.score(&lead, now()).await;
        assert_eq!(scored.score, 85);

        let class = insights.classify(&email()).await;
        assert_eq!(class.source, InsightSource::Rules);
        assert_eq!(class.priority, TicketPriority::Urgent);
        assert!(!class.suggested_reply.is_empty());
    }

    #[tokio::test]
    async fn slow_model_times_out_per_call() {
        let insights = ModelBackedInsights::new(
            Arc::new(Slow),
            ScoringWeights::default(),
            Duration::from_millis(50),
        );
        let lead = Lead::new("a@b.com", "A", LeadSource::Website, now());
        assert_eq!(insights.score(&lead, now()).await.score, 50);

        let class = insights.classify(&email()).await;
        assert_eq!(class.source, InsightSource::Model);
        assert_eq!(class.category, TicketCategory::Partnership);
        assert!(class.suggested_reply.starts_with("Hi Jane,"));
    }

    #[tokio::test]
    async fn no_model_selects_rules() {
        let insights = select_insights(None, ScoringWeights::default(), Duration::from_secs(1));
        assert_eq!(insights.name(), "rules");
    }
}
