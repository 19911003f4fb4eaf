//! Channel dispatchers.
//!
//! Both dispatchers follow the same sequence: build the outbound payload, run
//! the compliance gate, record every violation, stop on a critical one, wait
//! for the pacing window, then call the provider exactly once. Provider
//! failures come back as an unsuccessful [`DispatchResult`]; retrying is the
//! outcome tracker's business, not ours.

use chrono::{DateTime, Utc};
use phonenumber::country::Id as CountryId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::compliance::{is_blocking, to_record, ComplianceGate, GateContext, MessageKind, OutboundPayload, Violation};
use crate::email_client::{EmailProvider, OutboundEmail};
use crate::errors::AppError;
use crate::models::{CallPlacement, CampaignType, Channel, Lead};
use crate::repository::LeadRepository;
use crate::templates::{call_script, render_campaign, RenderedEmail, TemplateContext};
use crate::validation::normalize_phone;
use crate::voice_client::{CallRequest, VoiceProvider};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchResult {
    pub success: bool,
    pub provider_ref: Option<String>,
    pub error: Option<String>,
    pub violations: Vec<Violation>,
    /// True when a critical violation stopped the send before the provider.
    pub blocked: bool,
}

impl DispatchResult {
    fn failed(error: impl Into<String>, violations: Vec<Violation>) -> Self {
        Self {
            error: Some(error.into()),
            violations,
            ..Self::default()
        }
    }

    fn blocked(violations: Vec<Violation>) -> Self {
        let ids: Vec<&str> = violations
            .iter()
            .filter(|v| v.severity == crate::models::Severity::Critical)
            .map(|v| v.rule_id.as_str())
            .collect();
        Self {
            error: Some(format!("blocked by compliance: {}", ids.join(", "))),
            blocked: true,
            violations,
            ..Self::default()
        }
    }
}

/// A rendered email plus what the gate needs to know about it.
#[derive(Debug, Clone)]
pub struct EmailPayload {
    pub kind: MessageKind,
    pub campaign: Option<CampaignType>,
    pub recipient: String,
    pub rendered: RenderedEmail,
}

/// Enforces a minimum gap between consecutive provider calls.
pub struct Pacer {
    min_delay: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Runs the gate against the stored consent for `consent_email` and appends
/// every violation to the audit log.
async fn screen(
    repo: &dyn LeadRepository,
    gate: &ComplianceGate,
    payload: &OutboundPayload,
    consent_email: &str,
    lead_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<Vec<Violation>, AppError> {
    let consent = repo.get_consent(consent_email).await?;
    let violations = gate.validate(
        payload,
        &GateContext {
            consent: consent.as_ref(),
            now,
        },
    );

    for violation in &violations {
        tracing::warn!(
            "Compliance {} ({}) for {} on {}: {}",
            violation.rule_id,
            violation.severity,
            payload.recipient,
            payload.channel,
            violation.message
        );
        if let Err(e) = repo
            .append_violation(&to_record(violation, payload, lead_id, now))
            .await
        {
            tracing::error!("Failed to record violation {}: {}", violation.rule_id, e);
        }
    }
    Ok(violations)
}

pub struct EmailDispatcher {
    provider: Arc<dyn EmailProvider>,
    repo: Arc<dyn LeadRepository>,
    gate: Arc<ComplianceGate>,
    templates: TemplateContext,
    from: String,
    internal_recipient: String,
    pacer: Pacer,
}

impl EmailDispatcher {
    pub fn new(
        provider: Arc<dyn EmailProvider>,
        repo: Arc<dyn LeadRepository>,
        gate: Arc<ComplianceGate>,
        templates: TemplateContext,
        from: String,
        internal_recipient: String,
        min_delay: Duration,
    ) -> Self {
        Self {
            provider,
            repo,
            gate,
            templates,
            from,
            internal_recipient,
            pacer: Pacer::new(min_delay),
        }
    }

    pub fn templates(&self) -> &TemplateContext {
        &self.templates
    }

    /// Gate, pace (marketing only) and send one email.
    pub async fn send(
        &self,
        lead_id: Option<Uuid>,
        payload: &EmailPayload,
        now: DateTime<Utc>,
    ) -> DispatchResult {
        let outbound = OutboundPayload {
            channel: Channel::Email,
            kind: payload.kind,
            recipient: payload.recipient.clone(),
            subject: Some(payload.rendered.subject.clone()),
            body: payload.rendered.html.clone(),
            alt_body: Some(payload.rendered.text.clone()),
            campaign: payload.campaign,
        };

        let violations = match screen(
            self.repo.as_ref(),
            &self.gate,
            &outbound,
            &payload.recipient,
            lead_id,
            now,
        )
        .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Consent lookup failed for {}: {}", payload.recipient, e);
                return DispatchResult::failed(format!("consent lookup failed: {}", e), vec![]);
            }
        };
        if is_blocking(&violations) {
            return DispatchResult::blocked(violations);
        }

        if payload.kind == MessageKind::Marketing {
            self.pacer.wait().await;
        }

        let email = OutboundEmail {
            to: payload.recipient.clone(),
            from: self.from.clone(),
            subject: payload.rendered.subject.clone(),
            html: payload.rendered.html.clone(),
            text: payload.rendered.text.clone(),
        };
        match self.provider.send(&email).await {
            Ok(receipt) if receipt.accepted => {
                tracing::info!("Email sent to {} ({:?})", payload.recipient, receipt.provider_ref);
                DispatchResult {
                    success: true,
                    provider_ref: receipt.provider_ref,
                    error: None,
                    violations,
                    blocked: false,
                }
            }
            Ok(receipt) => DispatchResult::failed(
                receipt
                    .detail
                    .unwrap_or_else(|| "email not accepted by provider".to_string()),
                violations,
            ),
            Err(e) => {
                tracing::warn!("Email to {} failed: {}", payload.recipient, e);
                DispatchResult::failed(e.to_string(), violations)
            }
        }
    }

    /// Renders and sends the campaign template chosen for `lead`.
    pub async fn send_campaign(
        &self,
        lead: &Lead,
        campaign: CampaignType,
        now: DateTime<Utc>,
    ) -> DispatchResult {
        let payload = EmailPayload {
            kind: MessageKind::Marketing,
            campaign: Some(campaign),
            recipient: lead.email.clone(),
            rendered: render_campaign(&self.templates, campaign, lead),
        };
        self.send(Some(lead.id), &payload, now).await
    }

    /// Staff notice (weekly report, escalation) to the internal recipient.
    pub async fn send_internal(&self, rendered: RenderedEmail, now: DateTime<Utc>) -> DispatchResult {
        let payload = EmailPayload {
            kind: MessageKind::Internal,
            campaign: None,
            recipient: self.internal_recipient.clone(),
            rendered,
        };
        self.send(None, &payload, now).await
    }
}

pub struct VoiceDispatcher {
    provider: Arc<dyn VoiceProvider>,
    repo: Arc<dyn LeadRepository>,
    gate: Arc<ComplianceGate>,
    company_name: String,
    region: CountryId,
    pacer: Pacer,
}

impl VoiceDispatcher {
    pub fn new(
        provider: Arc<dyn VoiceProvider>,
        repo: Arc<dyn LeadRepository>,
        gate: Arc<ComplianceGate>,
        company_name: String,
        region: CountryId,
        min_delay: Duration,
    ) -> Self {
        Self {
            provider,
            repo,
            gate,
            company_name,
            region,
            pacer: Pacer::new(min_delay),
        }
    }

    /// Places a scripted call and records the call reference for the
    /// completion webhook. Does not wait for the call to finish.
    pub async fn place_call(
        &self,
        lead: &Lead,
        campaign: CampaignType,
        now: DateTime<Utc>,
    ) -> DispatchResult {
        let Some(raw_phone) = lead.phone.as_deref().filter(|p| !p.trim().is_empty()) else {
            return DispatchResult::failed("lead has no phone number", vec![]);
        };
        // An unparsable number still goes to the gate so the rejection is audited.
        let number = normalize_phone(raw_phone, self.region).unwrap_or_else(|reason| {
            tracing::debug!("Phone {} for lead {} rejected: {}", raw_phone, lead.id, reason);
            raw_phone.to_string()
        });

        let script = call_script(campaign, lead, &self.company_name);
        let outbound = OutboundPayload {
            channel: Channel::Voice,
            kind: MessageKind::Marketing,
            recipient: number.clone(),
            subject: None,
            body: script.spoken_text(),
            alt_body: None,
            campaign: Some(campaign),
        };

        let violations = match screen(
            self.repo.as_ref(),
            &self.gate,
            &outbound,
            &lead.email,
            Some(lead.id),
            now,
        )
        .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Consent lookup failed for lead {}: {}", lead.id, e);
                return DispatchResult::failed(format!("consent lookup failed: {}", e), vec![]);
            }
        };
        if is_blocking(&violations) {
            return DispatchResult::blocked(violations);
        }

        self.pacer.wait().await;

        let mut metadata = BTreeMap::new();
        metadata.insert("lead_id".to_string(), lead.id.to_string());
        metadata.insert("campaign".to_string(), campaign.to_string());
        let request = CallRequest {
            to_number: number,
            script_id: script.script_id,
            metadata,
        };

        match self.provider.place_call(&request).await {
            Ok(call_ref) => {
                let placement = CallPlacement {
                    call_ref: call_ref.clone(),
                    lead_id: lead.id,
                    campaign,
                    placed_at: now,
                };
                if let Err(e) = self.repo.record_call_placement(&placement).await {
                    tracing::error!("Failed to record call placement {}: {}", call_ref, e);
                }
                tracing::info!("Call {} placed for lead {}", call_ref, lead.id);
                DispatchResult {
                    success: true,
                    provider_ref: Some(call_ref),
                    error: None,
                    violations,
                    blocked: false,
                }
            }
            Err(e) => {
                tracing::warn!("Call to lead {} failed: {}", lead.id, e);
                DispatchResult::failed(e.to_string(), violations)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_calls() {
        let pacer = Pacer::new(Duration::from_millis(500));
        let start = Instant::now();
        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn first_wait_is_immediate() {
        let pacer = Pacer::new(Duration::from_secs(5));
        let start = Instant::now();
        pacer.wait().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }
}
