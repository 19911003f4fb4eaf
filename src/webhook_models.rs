use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::models::EmailEventKind;

/// SendGrid Inbound Parse, posted as JSON.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct SendGridInbound {
    /// `"Jane Doe <jane@example.com>"`
    pub from: Option<String>,
    /// Comma-separated recipient list.
    pub to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
}

/// Mailgun inbound route payload.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct MailgunInbound {
    pub sender: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    pub recipient: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(rename = "body-plain", default)]
    pub body_plain: Option<String>,
    #[serde(rename = "stripped-text", default)]
    pub stripped_text: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct PostmarkAddress {
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
}

/// Postmark inbound webhook payload.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct PostmarkInbound {
    #[serde(rename = "FromFull")]
    pub from_full: Option<PostmarkAddress>,
    #[serde(rename = "From", default)]
    pub from: Option<String>,
    #[serde(rename = "ToFull", default)]
    pub to_full: Vec<PostmarkAddress>,
    #[serde(rename = "Subject", default)]
    pub subject: Option<String>,
    #[serde(rename = "TextBody", default)]
    pub text_body: Option<String>,
    #[serde(rename = "HtmlBody", default)]
    pub html_body: Option<String>,
    /// RFC 2822 date.
    #[serde(rename = "Date", default)]
    pub date: Option<String>,
}

/// Call-completion notification from the voice provider.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct CallCompletedPayload {
    #[serde(alias = "callId", alias = "call_id")]
    pub call_ref: String,
    #[serde(default, alias = "durationSeconds")]
    pub duration_seconds: Option<i32>,
    /// e.g. `completed`, `no-answer`, `busy`, `voicemail`, `failed`
    #[serde(alias = "status", alias = "endedReason")]
    pub provider_status: String,
    /// Outcome chosen by call analysis, when the provider offers one.
    #[serde(default)]
    pub disposition: Option<String>,
}

/// Email delivery/engagement event.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct EmailEventItem {
    #[serde(alias = "email_id", alias = "message_id")]
    pub provider_ref: String,
    #[serde(alias = "type", alias = "event")]
    pub kind: EmailEventKind,
    #[serde(default, alias = "email", alias = "to")]
    pub recipient: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Providers post either a single event or a batch.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(untagged)]
pub enum EmailEventPayload {
    Single(EmailEventItem),
    Batch(Vec<EmailEventItem>),
}

impl EmailEventPayload {
    /// Convert to a vec of events for uniform processing
    pub fn into_events(self) -> Vec<EmailEventItem> {
        match self {
            EmailEventPayload::Single(event) => vec![event],
            EmailEventPayload::Batch(events) => events,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WebhookAck {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<uuid::Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
