//! Inbound-email webhook processing.
//!
//! Each provider posts its own shape; [`normalize`] turns it into a
//! [`CanonicalEmail`] using the explicit [`InboundProvider`] tag from the
//! route. [`InboundProcessor::process`] then filters by inbox, suppresses
//! replays, classifies, opens a ticket and sends the acknowledgement.

use chrono::{DateTime, TimeZone, Utc};
use moka::future::Cache;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::classification::acknowledgement_reply;
use crate::compliance::MessageKind;
use crate::dispatch::{DispatchResult, EmailDispatcher, EmailPayload};
use crate::errors::{AppError, ResultExt};
use crate::intelligence::LeadInsights;
use crate::models::{CanonicalEmail, Lead, LeadSource, SupportTicket};
use crate::repository::LeadRepository;
use crate::templates::render_auto_reply;
use crate::validation::{bare_address, display_name, is_valid_email};
use crate::webhook_models::{MailgunInbound, PostmarkInbound, SendGridInbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundProvider {
    SendGrid,
    Mailgun,
    Postmark,
}

impl FromStr for InboundProvider {
    type Err = InboundRejection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sendgrid" => Ok(InboundProvider::SendGrid),
            "mailgun" => Ok(InboundProvider::Mailgun),
            "postmark" => Ok(InboundProvider::Postmark),
            other => Err(InboundRejection::UnknownProvider(other.to_string())),
        }
    }
}

/// Why an inbound payload produced no ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRejection {
    UnknownProvider(String),
    Malformed(String),
    MissingSender,
    MissingBody,
    NotAddressedToInbox(Vec<String>),
}

impl fmt::Display for InboundRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundRejection::UnknownProvider(p) => write!(f, "unknown inbound provider '{}'", p),
            InboundRejection::Malformed(e) => write!(f, "malformed payload: {}", e),
            InboundRejection::MissingSender => write!(f, "payload has no valid sender"),
            InboundRejection::MissingBody => write!(f, "payload has no body"),
            InboundRejection::NotAddressedToInbox(to) => {
                write!(f, "not addressed to a configured inbox ({})", to.join(", "))
            }
        }
    }
}

fn strip_html(html: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static SPACE: OnceLock<Regex> = OnceLock::new();
    let tags = TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex is valid"));
    let space = SPACE.get_or_init(|| Regex::new(r"[ \t]+").expect("space regex is valid"));
    let text = tags.replace_all(html, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    space.replace_all(&text, " ").trim().to_string()
}

fn address_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(bare_address)
        .filter(|a| !a.is_empty())
        .collect()
}

fn first_text(candidates: &[Option<&String>]) -> Option<String> {
    candidates
        .iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn unix_seconds(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

fn parse<T: serde::de::DeserializeOwned>(raw: &Value) -> Result<T, InboundRejection> {
    serde_json::from_value(raw.clone()).map_err(|e| InboundRejection::Malformed(e.to_string()))
}

/// Maps a provider payload onto the canonical shape. `received_at` is used
/// when the payload carries no usable timestamp.
pub fn normalize(
    raw: &Value,
    provider: InboundProvider,
    received_at: DateTime<Utc>,
) -> Result<CanonicalEmail, InboundRejection> {
    normalize_stamped(raw, provider, received_at).map(|(email, _)| email)
}

/// Like [`normalize`], also returning the timestamp the provider sent, if any.
fn normalize_stamped(
    raw: &Value,
    provider: InboundProvider,
    received_at: DateTime<Utc>,
) -> Result<(CanonicalEmail, Option<DateTime<Utc>>), InboundRejection> {
    let (from_header, from_addr, to, subject, body, timestamp) = match provider {
        InboundProvider::SendGrid => {
            let p: SendGridInbound = parse(raw)?;
            let body = first_text(&[p.text.as_ref()])
                .or_else(|| p.html.as_deref().map(strip_html).filter(|b| !b.is_empty()));
            (
                p.from.clone(),
                p.from.as_deref().map(bare_address),
                address_list(p.to.as_deref()),
                p.subject,
                body,
                None,
            )
        }
        InboundProvider::Mailgun => {
            let p: MailgunInbound = parse(raw)?;
            let header = p.from.clone().or_else(|| p.sender.clone());
            let addr = p
                .sender
                .as_deref()
                .or(p.from.as_deref())
                .map(bare_address);
            (
                header,
                addr,
                address_list(p.recipient.as_deref()),
                p.subject,
                first_text(&[p.stripped_text.as_ref(), p.body_plain.as_ref()]),
                p.timestamp.as_ref().and_then(unix_seconds),
            )
        }
        InboundProvider::Postmark => {
            let p: PostmarkInbound = parse(raw)?;
            let (header, addr) = match &p.from_full {
                Some(full) => (
                    Some(match &full.name {
                        Some(name) if !name.trim().is_empty() => {
                            format!("{} <{}>", name.trim(), full.email)
                        }
                        _ => full.email.clone(),
                    }),
                    Some(bare_address(&full.email)),
                ),
                None => (p.from.clone(), p.from.as_deref().map(bare_address)),
            };
            let body = first_text(&[p.text_body.as_ref()]).or_else(|| {
                p.html_body
                    .as_deref()
                    .map(strip_html)
                    .filter(|b| !b.is_empty())
            });
            let timestamp = p
                .date
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                .map(|d| d.with_timezone(&Utc));
            (
                header,
                addr,
                p.to_full.iter().map(|a| bare_address(&a.email)).collect(),
                p.subject,
                body,
                timestamp,
            )
        }
    };

    let from = from_addr
        .filter(|a| is_valid_email(a))
        .ok_or(InboundRejection::MissingSender)?;
    let body = body.ok_or(InboundRejection::MissingBody)?;

    let email = CanonicalEmail {
        from,
        from_name: from_header.as_deref().and_then(display_name),
        to,
        subject: subject.map(|s| s.trim().to_string()).unwrap_or_default(),
        body,
        timestamp: timestamp.unwrap_or(received_at),
    };
    Ok((email, timestamp))
}

/// True when any recipient is one of our inboxes (case-insensitive).
pub fn is_addressed_to(email: &CanonicalEmail, inboxes: &[String]) -> bool {
    email
        .to
        .iter()
        .any(|to| inboxes.iter().any(|inbox| inbox.eq_ignore_ascii_case(to)))
}

/// Replay key over the fields that identify one message. Only a timestamp the
/// provider sent takes part; receipt time differs between retries.
pub fn dedup_key(email: &CanonicalEmail, sent_at: Option<DateTime<Utc>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.from.as_bytes());
    hasher.update([0u8]);
    hasher.update(email.to.join(",").as_bytes());
    hasher.update([0u8]);
    hasher.update(email.subject.as_bytes());
    hasher.update([0u8]);
    hasher.update(email.body.as_bytes());
    if let Some(sent_at) = sent_at {
        hasher.update([0u8]);
        hasher.update(sent_at.to_rfc3339().as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub enum InboundOutcome {
    Processed {
        ticket: SupportTicket,
        reply: DispatchResult,
    },
    Duplicate,
    Rejected(InboundRejection),
}

pub struct InboundProcessor {
    repo: Arc<dyn LeadRepository>,
    insights: Arc<dyn LeadInsights>,
    email: Arc<EmailDispatcher>,
    inboxes: Vec<String>,
    seen: Cache<String, ()>,
}

impl InboundProcessor {
    pub fn new(
        repo: Arc<dyn LeadRepository>,
        insights: Arc<dyn LeadInsights>,
        email: Arc<EmailDispatcher>,
        inboxes: Vec<String>,
        dedup_window: Duration,
    ) -> Self {
        Self {
            repo,
            insights,
            email,
            inboxes: inboxes.into_iter().map(|i| i.trim().to_lowercase()).collect(),
            seen: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(dedup_window)
                .build(),
        }
    }

    pub async fn process(
        &self,
        raw: &Value,
        provider: InboundProvider,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome, AppError> {
        let (email, sent_at) = match normalize_stamped(raw, provider, now) {
            Ok(stamped) => stamped,
            Err(rejection) => {
                tracing::warn!("Inbound {:?} payload rejected: {}", provider, rejection);
                return Ok(InboundOutcome::Rejected(rejection));
            }
        };
        if !is_addressed_to(&email, &self.inboxes) {
            let rejection = InboundRejection::NotAddressedToInbox(email.to.clone());
            tracing::warn!("Inbound email from {} rejected: {}", email.from, rejection);
            return Ok(InboundOutcome::Rejected(rejection));
        }

        let key = dedup_key(&email, sent_at);
        let entry = self.seen.entry(key.clone()).or_insert(()).await;
        if !entry.is_fresh() {
            tracing::info!("Duplicate inbound email from {} ignored", email.from);
            return Ok(InboundOutcome::Duplicate);
        }

        match self.open_ticket_and_reply(&email, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Let the provider's retry through.
                self.seen.invalidate(&key).await;
                Err(e)
            }
        }
    }

    async fn open_ticket_and_reply(
        &self,
        email: &CanonicalEmail,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome, AppError> {
        let classification = self.insights.classify(email).await;
        tracing::info!(
            "Inbound email from {} classified {} / {} / {} ({:?})",
            email.from,
            classification.category,
            classification.priority,
            classification.sentiment,
            classification.source
        );

        let lead = self.ensure_lead(email, now).await?;

        let ticket = SupportTicket::open(email, &classification);
        self.repo
            .upsert_ticket(&ticket)
            .await
            .context("Failed to store support ticket")?;

        let lead_id = lead.as_ref().map(|l| l.id);
        let mut reply = self
            .send_reply(lead_id, email, &classification.suggested_reply, &ticket, now)
            .await;
        if reply.blocked {
            let fallback = acknowledgement_reply(
                email.from_name.as_deref(),
                classification.category,
                classification.priority,
            );
            if fallback != classification.suggested_reply {
                tracing::warn!(
                    "Auto-reply for ticket {} blocked; sending the standard acknowledgement",
                    ticket.id
                );
                reply = self.send_reply(lead_id, email, &fallback, &ticket, now).await;
            }
        }
        if !reply.success {
            tracing::warn!(
                "Auto-reply for ticket {} not sent: {}",
                ticket.id,
                reply.error.as_deref().unwrap_or("unknown error")
            );
        }

        Ok(InboundOutcome::Processed { ticket, reply })
    }

    async fn send_reply(
        &self,
        lead_id: Option<uuid::Uuid>,
        email: &CanonicalEmail,
        body: &str,
        ticket: &SupportTicket,
        now: DateTime<Utc>,
    ) -> DispatchResult {
        let rendered = render_auto_reply(self.email.templates(), email, body, ticket);
        self.email
            .send(
                lead_id,
                &EmailPayload {
                    kind: MessageKind::Transactional,
                    campaign: None,
                    recipient: email.from.clone(),
                    rendered,
                },
                now,
            )
            .await
    }

    /// Senders we have never seen become leads with source `inbound_email`.
    async fn ensure_lead(&self, email: &CanonicalEmail, now: DateTime<Utc>) -> Result<Option<Lead>, AppError> {
        if let Some(existing) = self.repo.find_by_email(&email.from).await? {
            return Ok(Some(existing));
        }
        let name = email
            .from_name
            .clone()
            .unwrap_or_else(|| email.from.split('@').next().unwrap_or_default().to_string());
        let lead = Lead::new(&email.from, &name, LeadSource::InboundEmail, now);
        match self.repo.upsert(&lead).await {
            Ok(()) => {
                tracing::info!("Created lead {} from inbound email", lead.id);
                Ok(Some(lead))
            }
            Err(AppError::Conflict(_)) => self.repo.find_by_email(&email.from).await,
            Err(e) => Err(e),
        }
    }
}
