/// Integration tests with mocked external APIs
/// Exercises the email, voice and language-model clients against wiremock
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use outreach_engine::email_client::{EmailProvider, HttpEmailProvider, OutboundEmail};
use outreach_engine::intelligence::{
    select_insights, HttpTextIntelligence, LeadFeatures, LeadInsights, TextIntelligence,
};
use outreach_engine::models::{
    CanonicalEmail, InsightSource, Lead, LeadSource, LeadStatus, TicketCategory, TicketPriority,
};
use outreach_engine::scoring::ScoringWeights;
use outreach_engine::voice_client::{CallRequest, HttpVoiceProvider, VoiceProvider};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sample_email() -> OutboundEmail {
    OutboundEmail {
        to: "ann@example.com".to_string(),
        from: "Acme Invest <hello@acme-invest.com>".to_string(),
        subject: "Hello".to_string(),
        html: "<p>Hi</p>".to_string(),
        text: "Hi".to_string(),
    }
}

fn chat_reply(content: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    })
}

#[tokio::test]
async fn test_email_provider_posts_with_bearer_auth() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/emails"))
        .and(header("authorization", "Bearer re_test"))
        .and(body_partial_json(serde_json::json!({
            "to": ["ann@example.com"],
            "subject": "Hello"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "em_123" })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = HttpEmailProvider::new(mock_server.uri(), "re_test".to_string()).unwrap();
    let receipt = provider.send(&sample_email()).await.unwrap();

    assert!(receipt.accepted);
    assert_eq!(receipt.provider_ref.as_deref(), Some("em_123"));
}

#[tokio::test]
async fn test_email_provider_error_status_is_external_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/emails"))
        .respond_with(ResponseTemplate::new(422).set_body_string("invalid recipient"))
        .mount(&mock_server)
        .await;

    let provider = HttpEmailProvider::new(mock_server.uri(), "re_test".to_string()).unwrap();
    let err = provider.send(&sample_email()).await.unwrap_err();

    assert!(err.to_string().contains("invalid recipient"));
}

#[tokio::test]
async fn test_voice_provider_returns_call_reference() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/call"))
        .and(header("authorization", "Bearer vapi_test"))
        .and(body_partial_json(serde_json::json!({
            "assistantId": "demo-booking",
            "phoneNumberId": "pn_1",
            "customer": { "number": "+16502530000" }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": "call_abc" })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = HttpVoiceProvider::new(
        mock_server.uri(),
        "vapi_test".to_string(),
        "pn_1".to_string(),
    )
    .unwrap();
    let call_ref = provider
        .place_call(&CallRequest {
            to_number: "+16502530000".to_string(),
            script_id: "demo-booking".to_string(),
            metadata: BTreeMap::new(),
        })
        .await
        .unwrap();

    assert_eq!(call_ref, "call_abc");
}

#[tokio::test]
async fn test_voice_response_without_id_is_an_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/call"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "queued" })))
        .mount(&mock_server)
        .await;

    let provider =
        HttpVoiceProvider::new(mock_server.uri(), "k".to_string(), "pn_1".to_string()).unwrap();
    let result = provider
        .place_call(&CallRequest {
            to_number: "+16502530000".to_string(),
            script_id: "investment-intro".to_string(),
            metadata: BTreeMap::new(),
        })
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_model_scores_and_classifies_via_chat_completions() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(serde_json::json!({
            "response_format": { "type": "json_object" }
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_reply(r#"{"score": 91, "reasoning": "strong fit"}"#)),
        )
        .mount(&mock_server)
        .await;

    let model = HttpTextIntelligence::new(
        mock_server.uri(),
        "sk_test".to_string(),
        "gpt-4o-mini".to_string(),
    )
    .unwrap();
    let now = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap();
    let lead = Lead::new("ann@example.com", "Ann Lee", LeadSource::Website, now);

    let score = model.score(&LeadFeatures::from_lead(&lead, now)).await.unwrap();
    assert_eq!(score.score, 91);
    assert_eq!(score.reasoning, "strong fit");

    let insights = select_insights(
        Some(Arc::new(model) as Arc<dyn TextIntelligence>),
        ScoringWeights::default(),
        Duration::from_secs(5),
    );
    let scored = insights.score(&lead, now).await;
    assert_eq!(scored.score, 91);
    assert_eq!(scored.status, LeadStatus::Hot);
}

#[tokio::test]
async fn test_model_outage_falls_back_to_rules() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&mock_server)
        .await;

    let model = HttpTextIntelligence::new(
        mock_server.uri(),
        "sk_test".to_string(),
        "gpt-4o-mini".to_string(),
    )
    .unwrap();
    let insights = select_insights(
        Some(Arc::new(model) as Arc<dyn TextIntelligence>),
        ScoringWeights::default(),
        Duration::from_secs(5),
    );

    let now = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap();
    let email = CanonicalEmail {
        from: "jane@example.com".to_string(),
        from_name: Some("Jane".to_string()),
        to: vec!["support@acme-invest.com".to_string()],
        subject: "Refund".to_string(),
        body: "I want a refund, this is unacceptable.".to_string(),
        timestamp: now,
    };
    let classification = insights.classify(&email).await;
    assert_eq!(classification.source, InsightSource::Rules);
    assert_eq!(classification.category, TicketCategory::Complaint);
    assert_eq!(classification.priority, TicketPriority::High);
    assert!(!classification.suggested_reply.is_empty());

    let lead = Lead::new("ann@example.com", "Ann Lee", LeadSource::Website, now);
    let scored = insights.score(&lead, now).await;
    assert_eq!(scored.score, 50);
    assert_eq!(scored.status, LeadStatus::Cold);
}
