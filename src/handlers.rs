use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::api_docs::ApiDoc;
use crate::engine::{ConsentInput, NewLead, OutreachEngine};
use crate::errors::AppError;
use crate::models::{
    CampaignType, Channel, ConsentRecord, ConsentScope, ContactAttempt, Lead, Outcome,
    SupportTicket, TicketStatus,
};
use crate::outcomes::OutcomeInput;
use crate::scheduler::{Cadence, CadenceReport, Scheduler};
use crate::webhook_handler;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<OutreachEngine>,
    /// Also the source of "now" for request handling.
    pub scheduler: Arc<Scheduler>,
    /// Expected `X-Webhook-Token`; `None` disables the check.
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn now(&self) -> DateTime<Utc> {
        self.scheduler.clock().now()
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IntakeResponse {
    pub lead: Lead,
    /// False when a lead with the same email already existed.
    pub created: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LeadDetail {
    pub lead: Lead,
    pub latest_attempt: Option<ContactAttempt>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OutcomeRequest {
    pub channel: Channel,
    pub outcome: Outcome,
    #[serde(default)]
    pub campaign: Option<CampaignType>,
    #[serde(default)]
    pub duration_seconds: Option<i32>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentRequest {
    pub email: String,
    #[serde(default)]
    pub email_marketing: bool,
    #[serde(default)]
    pub sms_marketing: bool,
    #[serde(default)]
    pub call_marketing: bool,
    pub source: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UnsubscribeRequest {
    pub email: String,
    /// Defaults to `all`.
    #[serde(default)]
    pub scope: Option<ConsentScope>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TicketStatusRequest {
    pub status: TicketStatus,
}

/// Health check endpoint.
#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")))]
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "outreach-engine",
            "version": env!("CARGO_PKG_VERSION"),
            "insights": state.engine.insights_name(),
        })),
    )
}

/// POST /api/v1/leads
///
/// Creates a lead, or returns the existing one when the email is already known.
#[utoipa::path(
    post,
    path = "/api/v1/leads",
    request_body = NewLead,
    responses(
        (status = 201, description = "Lead created", body = IntakeResponse),
        (status = 200, description = "Lead already existed", body = IntakeResponse),
        (status = 400, description = "Invalid email")
    )
)]
pub async fn create_lead(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewLead>,
) -> Result<(StatusCode, Json<IntakeResponse>), AppError> {
    tracing::info!("POST /leads - {}", input.email);
    let (lead, created) = state.engine.intake_lead(input, state.now()).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(IntakeResponse { lead, created })))
}

/// GET /api/v1/leads/:id
#[utoipa::path(
    get,
    path = "/api/v1/leads/{id}",
    params(("id" = Uuid, Path, description = "Lead id")),
    responses(
        (status = 200, body = LeadDetail),
        (status = 404, description = "Unknown lead")
    )
)]
pub async fn get_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<LeadDetail>, AppError> {
    let repo = state.engine.repo();
    let lead = repo
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", id)))?;
    let latest_attempt = repo.latest_attempt(id).await?;
    Ok(Json(LeadDetail {
        lead,
        latest_attempt,
    }))
}

/// POST /api/v1/leads/:id/outcomes
///
/// Records a contact outcome reported by staff.
#[utoipa::path(
    post,
    path = "/api/v1/leads/{id}/outcomes",
    params(("id" = Uuid, Path, description = "Lead id")),
    request_body = OutcomeRequest,
    responses(
        (status = 201, body = ContactAttempt),
        (status = 404, description = "Unknown lead")
    )
)]
pub async fn record_outcome(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<OutcomeRequest>,
) -> Result<(StatusCode, Json<ContactAttempt>), AppError> {
    tracing::info!("POST /leads/{}/outcomes - {} {}", id, request.channel, request.outcome);
    let attempt = state
        .engine
        .tracker()
        .record(
            OutcomeInput {
                lead_id: id,
                channel: request.channel,
                outcome: request.outcome,
                campaign: request.campaign,
                duration_seconds: request.duration_seconds,
                notes: request.notes,
                provider_ref: None,
            },
            state.now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(attempt)))
}

fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

/// POST /api/v1/consents
///
/// Records an opt-in, replacing any record on file for the address.
#[utoipa::path(
    post,
    path = "/api/v1/consents",
    request_body = ConsentRequest,
    responses(
        (status = 201, body = ConsentRecord),
        (status = 400, description = "Invalid email or missing source")
    )
)]
pub async fn record_consent(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<ConsentRequest>,
) -> Result<(StatusCode, Json<ConsentRecord>), AppError> {
    let input = ConsentInput {
        email: request.email,
        email_marketing: request.email_marketing,
        sms_marketing: request.sms_marketing,
        call_marketing: request.call_marketing,
        source: request.source,
        ip_address: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    let record = state.engine.record_consent(input, state.now()).await?;
    tracing::info!("Consent recorded for {} via {}", record.email, record.source);
    Ok((StatusCode::CREATED, Json(record)))
}

/// POST /api/v1/unsubscribe
#[utoipa::path(
    post,
    path = "/api/v1/unsubscribe",
    request_body = UnsubscribeRequest,
    responses((status = 200, body = ConsentRecord), (status = 400, description = "Invalid email"))
)]
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UnsubscribeRequest>,
) -> Result<Json<ConsentRecord>, AppError> {
    let scope = request.scope.unwrap_or(ConsentScope::All);
    let record = state
        .engine
        .handle_unsubscribe(&request.email, scope, state.now())
        .await?;
    Ok(Json(record))
}

/// GET /api/v1/unsubscribe?email=..&scope=..
///
/// Target of the link in every outbound email footer.
#[utoipa::path(
    get,
    path = "/api/v1/unsubscribe",
    params(
        ("email" = String, Query, description = "Address to unsubscribe"),
        ("scope" = Option<ConsentScope>, Query, description = "Defaults to all")
    ),
    responses((status = 200, description = "Confirmation page"))
)]
pub async fn unsubscribe_link(
    State(state): State<Arc<AppState>>,
    Query(request): Query<UnsubscribeRequest>,
) -> Result<Html<String>, AppError> {
    let scope = request.scope.unwrap_or(ConsentScope::All);
    let record = state
        .engine
        .handle_unsubscribe(&request.email, scope, state.now())
        .await?;
    Ok(Html(format!(
        "<!DOCTYPE html><html><body><p>{} has been unsubscribed ({}).</p></body></html>",
        crate::templates::escape_html(&record.email),
        scope
    )))
}

/// POST /api/v1/tickets/:id/status
#[utoipa::path(
    post,
    path = "/api/v1/tickets/{id}/status",
    params(("id" = Uuid, Path, description = "Ticket id")),
    request_body = TicketStatusRequest,
    responses(
        (status = 200, body = SupportTicket),
        (status = 404, description = "Unknown ticket"),
        (status = 409, description = "Transition not allowed")
    )
)]
pub async fn update_ticket_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<TicketStatusRequest>,
) -> Result<Json<SupportTicket>, AppError> {
    let ticket = state
        .engine
        .update_ticket_status(id, request.status, state.now())
        .await?;
    Ok(Json(ticket))
}

/// POST /api/v1/cadences/:cadence/run
///
/// Runs a cadence now. Returns 409 with a skipped report when it is already running.
#[utoipa::path(
    post,
    path = "/api/v1/cadences/{cadence}/run",
    params(("cadence" = Cadence, Path, description = "daily_morning, daily_afternoon or weekly")),
    responses(
        (status = 200, body = CadenceReport),
        (status = 409, description = "Cadence already running", body = CadenceReport),
        (status = 401, description = "Missing or invalid X-Webhook-Token")
    )
)]
pub async fn run_cadence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(cadence): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    webhook_handler::validate_webhook_secret(&state, &headers)?;
    let cadence: Cadence = cadence.parse().map_err(AppError::BadRequest)?;
    tracing::info!("Manual trigger of cadence {}", cadence);

    let report = state.scheduler.run(cadence).await;
    let status = if report.skipped {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

/// Builds the full router. `rate_limited` adds the per-IP governor, which
/// needs the peer address from `into_make_service_with_connect_info`.
pub fn router(state: Arc<AppState>, rate_limited: bool) -> anyhow::Result<Router> {
    let api = Router::new()
        .route("/api/v1/leads", post(create_lead))
        .route("/api/v1/leads/:id", get(get_lead))
        .route("/api/v1/leads/:id/outcomes", post(record_outcome))
        .route("/api/v1/consents", post(record_consent))
        .route("/api/v1/unsubscribe", get(unsubscribe_link).post(unsubscribe))
        .route("/api/v1/tickets/:id/status", post(update_ticket_status))
        .route("/api/v1/cadences/:cadence/run", post(run_cadence))
        .route(
            "/api/v1/webhooks/inbound-email/:provider",
            post(webhook_handler::inbound_email),
        )
        .route(
            "/api/v1/webhooks/call-completed",
            post(webhook_handler::call_completed),
        )
        .route(
            "/api/v1/webhooks/email-events",
            post(webhook_handler::email_events),
        )
        // Request size limit: 5MB max payload
        .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024));

    let protected = if rate_limited {
        // 10 req/sec per IP, burst of 20
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(10)
                .burst_size(20)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
        );
        api.layer(ServiceBuilder::new().layer(GovernorLayer {
            config: governor_conf,
        }))
    } else {
        api
    };

    // Health and docs bypass rate limiting
    Ok(Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("203.0.113.7"));
        assert_eq!(
            client_ip(&HeaderMap::new(), Some(peer)).as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }
}
