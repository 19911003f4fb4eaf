use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::errors::AppError;
use crate::handlers::AppState;
use crate::inbound::{InboundOutcome, InboundProvider, InboundRejection};
use crate::webhook_models::{CallCompletedPayload, EmailEventPayload, WebhookAck};

/// Validate webhook secret from X-Webhook-Token header
pub(crate) fn validate_webhook_secret(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    // No secret configured: check disabled (warned at startup)
    let Some(ref expected_secret) = state.webhook_secret else {
        return Ok(());
    };

    let token = headers
        .get("X-Webhook-Token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Webhook-Token header".to_string()))?;

    if !constant_time_compare(token, expected_secret) {
        tracing::warn!("Invalid webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }

    Ok(())
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Inbound parse hooks post either JSON or an urlencoded form; both become a
/// JSON object for the normalizer.
fn decode_body(headers: &HeaderMap, body: &Bytes) -> Result<Value, AppError> {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        let fields: Map<String, Value> = url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect();
        return Ok(Value::Object(fields));
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON payload: {}", e)))
}

/// POST /api/v1/webhooks/inbound-email/:provider
///
/// Opens a support ticket for mail sent to a configured inbox and replies to
/// the sender. Mail for other addresses is acknowledged and dropped so the
/// provider does not retry it.
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/inbound-email/{provider}",
    params(("provider" = String, Path, description = "sendgrid, mailgun or postmark")),
    responses(
        (status = 200, body = WebhookAck),
        (status = 400, description = "Unknown provider or unusable payload"),
        (status = 401, description = "Missing or invalid X-Webhook-Token")
    )
)]
pub async fn inbound_email(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    validate_webhook_secret(&state, &headers)?;

    let provider: InboundProvider = provider
        .parse()
        .map_err(|e: InboundRejection| AppError::BadRequest(e.to_string()))?;
    let raw = decode_body(&headers, &body)?;
    tracing::info!("Received inbound email webhook from {:?}", provider);

    let ack = match state.engine.inbound().process(&raw, provider, state.now()).await? {
        InboundOutcome::Processed { ticket, reply } => WebhookAck {
            accepted: true,
            ticket_id: Some(ticket.id),
            detail: (!reply.success).then(|| {
                format!(
                    "auto-reply not sent: {}",
                    reply.error.unwrap_or_else(|| "unknown error".to_string())
                )
            }),
        },
        InboundOutcome::Duplicate => WebhookAck {
            accepted: true,
            ticket_id: None,
            detail: Some("duplicate".to_string()),
        },
        InboundOutcome::Rejected(rejection @ InboundRejection::NotAddressedToInbox(_)) => {
            WebhookAck {
                accepted: false,
                ticket_id: None,
                detail: Some(rejection.to_string()),
            }
        }
        InboundOutcome::Rejected(rejection) => {
            return Err(AppError::BadRequest(rejection.to_string()));
        }
    };
    Ok((StatusCode::OK, Json(ack)))
}

/// POST /api/v1/webhooks/call-completed
///
/// Maps the provider's end-of-call status to an outcome for the lead the
/// call was placed for.
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/call-completed",
    request_body = CallCompletedPayload,
    responses(
        (status = 200, body = WebhookAck),
        (status = 401, description = "Missing or invalid X-Webhook-Token")
    )
)]
pub async fn call_completed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CallCompletedPayload>,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    validate_webhook_secret(&state, &headers)?;
    tracing::info!(
        "Call {} completed with status {}",
        payload.call_ref,
        payload.provider_status
    );

    let result = state
        .engine
        .tracker()
        .record_call_completion(
            &payload.call_ref,
            payload.duration_seconds,
            &payload.provider_status,
            payload.disposition.as_deref(),
            state.now(),
        )
        .await;

    match result {
        Ok(attempt) => Ok((
            StatusCode::OK,
            Json(WebhookAck {
                accepted: true,
                ticket_id: None,
                detail: Some(format!("outcome {}", attempt.outcome)),
            }),
        )),
        // Replays and calls placed elsewhere: acknowledge so the provider stops retrying.
        Err(AppError::NotFound(msg)) => {
            tracing::warn!("Call completion ignored: {}", msg);
            Ok((
                StatusCode::OK,
                Json(WebhookAck {
                    accepted: false,
                    ticket_id: None,
                    detail: Some(msg),
                }),
            ))
        }
        Err(e) => Err(e),
    }
}

/// POST /api/v1/webhooks/email-events
///
/// Records delivery and engagement events, single or batched.
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/email-events",
    request_body = EmailEventPayload,
    responses(
        (status = 200, body = WebhookAck),
        (status = 401, description = "Missing or invalid X-Webhook-Token")
    )
)]
pub async fn email_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<EmailEventPayload>,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    validate_webhook_secret(&state, &headers)?;

    let events = payload.into_events();
    let total = events.len();
    let now = state.now();
    let mut recorded = 0;
    for item in events {
        let provider_ref = item.provider_ref.clone();
        match state.engine.record_email_event(item, now).await {
            Ok(_) => recorded += 1,
            // Continue with the rest of the batch
            Err(e) => tracing::error!("Failed to record email event {}: {}", provider_ref, e),
        }
    }
    tracing::info!("Email events: {} received, {} recorded", total, recorded);

    Ok((
        StatusCode::OK,
        Json(WebhookAck {
            accepted: recorded == total,
            ticket_id: None,
            detail: Some(format!("{} of {} events recorded", recorded, total)),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_compare_matches_only_equal_strings() {
        assert!(constant_time_compare("s3cret", "s3cret"));
        assert!(!constant_time_compare("s3cret", "s3cres"));
        assert!(!constant_time_compare("s3cret", "s3cret-longer"));
    }

    #[test]
    fn form_bodies_become_json_objects() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "application/x-www-form-urlencoded".parse().unwrap(),
        );
        let body = Bytes::from_static(b"sender=jane%40example.com&subject=Hello+there");
        let value = decode_body(&headers, &body).unwrap();
        assert_eq!(value["sender"], "jane@example.com");
        assert_eq!(value["subject"], "Hello there");

        let json = Bytes::from_static(br#"{"from":"a@b.com"}"#);
        assert_eq!(decode_body(&HeaderMap::new(), &json).unwrap()["from"], "a@b.com");
        assert!(decode_body(&HeaderMap::new(), &Bytes::from_static(b"not json")).is_err());
    }
}
