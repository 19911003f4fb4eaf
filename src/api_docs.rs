use utoipa::OpenApi;

use crate::engine::NewLead;
use crate::handlers::{
    ConsentRequest, IntakeResponse, LeadDetail, OutcomeRequest, TicketStatusRequest,
    UnsubscribeRequest,
};
use crate::models::{
    CampaignType, Channel, ConsentRecord, ConsentScope, ContactAttempt, EmailEventKind, Lead,
    LeadSource, LeadStatus, Outcome, Sentiment, SupportTicket, TicketCategory, TicketPriority,
    TicketStatus,
};
use crate::scheduler::{Cadence, CadenceReport, StepReport};
use crate::webhook_models::{CallCompletedPayload, EmailEventItem, EmailEventPayload, WebhookAck};

/// OpenAPI document served at `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    info(title = "Outreach Engine API", description = "Lead intake, consent and provider webhooks"),
    paths(
        crate::handlers::health,
        crate::handlers::create_lead,
        crate::handlers::get_lead,
        crate::handlers::record_outcome,
        crate::handlers::record_consent,
        crate::handlers::unsubscribe,
        crate::handlers::unsubscribe_link,
        crate::handlers::update_ticket_status,
        crate::handlers::run_cadence,
        crate::webhook_handler::inbound_email,
        crate::webhook_handler::call_completed,
        crate::webhook_handler::email_events,
    ),
    components(schemas(
        NewLead,
        IntakeResponse,
        LeadDetail,
        OutcomeRequest,
        ConsentRequest,
        UnsubscribeRequest,
        TicketStatusRequest,
        Lead,
        LeadSource,
        LeadStatus,
        ContactAttempt,
        Channel,
        Outcome,
        CampaignType,
        ConsentRecord,
        ConsentScope,
        SupportTicket,
        TicketStatus,
        TicketPriority,
        TicketCategory,
        Sentiment,
        Cadence,
        CadenceReport,
        StepReport,
        CallCompletedPayload,
        EmailEventItem,
        EmailEventPayload,
        EmailEventKind,
        WebhookAck,
    ))
)]
pub struct ApiDoc;
