//! Outreach engine: the operations the scheduler, the HTTP handlers and the
//! CLI drive.
//!
//! Every batch operation is per-item failure tolerant: an item that fails is
//! logged, counted and left eligible for the next run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::classification::priority_by_keywords;
use crate::compliance::{apply_unsubscribe, ComplianceGate};
use crate::config::EngineSettings;
use crate::dispatch::{DispatchResult, EmailDispatcher, VoiceDispatcher};
use crate::email_client::EmailProvider;
use crate::errors::{AppError, ResultExt};
use crate::inbound::InboundProcessor;
use crate::intelligence::LeadInsights;
use crate::lead_locks::LeadLocks;
use crate::models::{
    CampaignType, Channel, ConsentRecord, ConsentScope, EmailEvent, EmailEventKind, Lead,
    LeadFilter, LeadSource, LeadStatus, Outcome, Severity, SupportTicket, TicketFilter,
    TicketPriority, TicketStatus, WeeklyReport,
};
use crate::outcomes::{OutcomeInput, OutcomeTracker};
use crate::reporting::{aggregate_weekly, previous_week_start};
use crate::repository::LeadRepository;
use crate::retention::{run_retention, RetentionSummary};
use crate::scoring::apply_score;
use crate::templates::{render_escalation, render_weekly_report, TemplateContext};
use crate::validation::{is_valid_email, normalize_phone};
use crate::voice_client::VoiceProvider;
use crate::webhook_models::EmailEventItem;

/// Lead intake request.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct NewLead {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub source: Option<LeadSource>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Opt-in captured from a form or import.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ConsentInput {
    pub email: String,
    #[serde(default)]
    pub email_marketing: bool,
    #[serde(default)]
    pub sms_marketing: bool,
    #[serde(default)]
    pub call_marketing: bool,
    pub source: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct ScoringSummary {
    pub scored: u64,
    pub failed: u64,
    /// Leads that crossed into warm or hot in this pass.
    pub became_engaged: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct BatchSummary {
    pub attempted: u64,
    pub sent: u64,
    pub blocked: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct TicketReview {
    pub reviewed: u64,
    pub reprioritized: u64,
    pub escalated: u64,
    pub closed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct DeliveryMetrics {
    pub sent: u64,
    pub failed: u64,
    pub delivered: u64,
    pub opened: u64,
    pub bounced: u64,
    pub complained: u64,
    pub bounce_rate: f64,
    pub alert: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct WeeklyOutcome {
    pub report: WeeklyReport,
    /// False when the report for this week had already been dispatched.
    pub dispatched_now: bool,
}

pub struct OutreachEngine {
    repo: Arc<dyn LeadRepository>,
    insights: Arc<dyn LeadInsights>,
    email: Arc<EmailDispatcher>,
    voice: Option<Arc<VoiceDispatcher>>,
    tracker: Arc<OutcomeTracker>,
    inbound: Arc<InboundProcessor>,
    locks: LeadLocks,
    settings: EngineSettings,
}

impl OutreachEngine {
    /// Wires the components. Without a voice provider, call steps are skipped.
    pub fn new(
        repo: Arc<dyn LeadRepository>,
        insights: Arc<dyn LeadInsights>,
        email_provider: Arc<dyn EmailProvider>,
        voice_provider: Option<Arc<dyn VoiceProvider>>,
        settings: EngineSettings,
    ) -> Self {
        let locks = LeadLocks::default();
        let gate = Arc::new(ComplianceGate::new(settings.compliance.clone()));
        let templates = TemplateContext::new(&settings.company_name, &settings.public_base_url);

        let email = Arc::new(EmailDispatcher::new(
            email_provider,
            repo.clone(),
            gate.clone(),
            templates,
            settings.email_from.clone(),
            settings.report_recipient.clone(),
            settings.send_delay,
        ));
        let voice = voice_provider.map(|provider| {
            Arc::new(VoiceDispatcher::new(
                provider,
                repo.clone(),
                gate.clone(),
                settings.company_name.clone(),
                settings.phone_region,
                settings.call_delay,
            ))
        });
        let tracker = Arc::new(OutcomeTracker::new(
            repo.clone(),
            locks.clone(),
            settings.follow_up.clone(),
        ));
        let inbound = Arc::new(InboundProcessor::new(
            repo.clone(),
            insights.clone(),
            email.clone(),
            settings.inbound_addresses.clone(),
            settings.inbound_dedup_window,
        ));

        Self {
            repo,
            insights,
            email,
            voice,
            tracker,
            inbound,
            locks,
            settings,
        }
    }

    pub fn repo(&self) -> &Arc<dyn LeadRepository> {
        &self.repo
    }

    pub fn tracker(&self) -> &OutcomeTracker {
        &self.tracker
    }

    pub fn inbound(&self) -> &InboundProcessor {
        &self.inbound
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn insights_name(&self) -> &'static str {
        self.insights.name()
    }

    // ============ Leads ============

    /// Creates a lead, or returns the existing one for the same email with `false`.
    pub async fn intake_lead(&self, input: NewLead, now: DateTime<Utc>) -> Result<(Lead, bool), AppError> {
        let email = input.email.trim().to_lowercase();
        if !is_valid_email(&email) {
            return Err(AppError::BadRequest(format!("Invalid email: {}", input.email)));
        }
        if let Some(existing) = self.repo.find_by_email(&email).await? {
            tracing::debug!("Lead intake for {} matched existing lead {}", email, existing.id);
            return Ok((existing, false));
        }

        let name = input
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
        let mut lead = Lead::new(&email, &name, input.source.unwrap_or(LeadSource::Manual), now);

        if let Some(raw) = input.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            lead.phone = Some(match normalize_phone(raw, self.settings.phone_region) {
                Ok(e164) => e164,
                Err(reason) => {
                    tracing::warn!("Keeping unparsable phone for {}: {}", email, reason);
                    raw.to_string()
                }
            });
        }
        lead.company = input.company.filter(|c| !c.trim().is_empty());
        lead.industry = input.industry.filter(|i| !i.trim().is_empty());
        lead.notes = input.notes;

        match self.repo.upsert(&lead).await {
            Ok(()) => {
                tracing::info!("Lead {} created from {}", lead.id, lead.source);
                Ok((lead, true))
            }
            Err(AppError::Conflict(_)) => {
                let existing = self
                    .repo
                    .find_by_email(&email)
                    .await?
                    .ok_or_else(|| AppError::InternalError(format!("lead {} vanished", email)))?;
                Ok((existing, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Scores every lead that is new or has never been scored.
    pub async fn score_pending(&self, now: DateTime<Utc>) -> Result<ScoringSummary, AppError> {
        let candidates: Vec<Lead> = self
            .repo
            .list(&LeadFilter::default())
            .await?
            .into_iter()
            .filter(|l| l.status == LeadStatus::New || l.scored_at.is_none())
            .collect();

        let mut summary = ScoringSummary::default();
        for snapshot in candidates {
            // The insight call may be slow; only the write happens under the lock.
            let score = self.insights.score(&snapshot, now).await;

            let _guard = self.locks.acquire(snapshot.id).await;
            let result = async {
                let Some(mut lead) = self.repo.get(snapshot.id).await? else {
                    return Ok(None);
                };
                let crossed = apply_score(&mut lead, &score, now);
                self.repo.upsert(&lead).await?;
                Ok::<_, AppError>(Some((lead, crossed)))
            }
            .await;

            match result {
                Ok(Some((lead, crossed))) => {
                    summary.scored += 1;
                    tracing::debug!("Lead {} scored {} ({})", lead.id, lead.score, lead.status);
                    if crossed {
                        summary.became_engaged.push(lead.id);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!("Failed to score lead {}: {}", snapshot.id, e);
                }
            }
        }
        tracing::info!(
            "Scored {} leads ({} newly engaged, {} failed)",
            summary.scored,
            summary.became_engaged.len(),
            summary.failed
        );
        Ok(summary)
    }

    async fn record_dispatch(&self, lead: &Lead, channel: Channel, campaign: CampaignType, result: &DispatchResult, now: DateTime<Utc>) {
        let outcome = if result.success {
            Outcome::Connected
        } else {
            Outcome::Disconnected
        };
        let input = OutcomeInput {
            lead_id: lead.id,
            channel,
            outcome,
            campaign: Some(campaign),
            duration_seconds: None,
            notes: result.error.clone(),
            provider_ref: result.provider_ref.clone(),
        };
        if let Err(e) = self.tracker.record(input, now).await {
            tracing::error!("Failed to record {} attempt for lead {}: {}", channel, lead.id, e);
        }
    }

    async fn tally_email(&self, lead: &Lead, summary: &mut BatchSummary, now: DateTime<Utc>) {
        let campaign = CampaignType::for_lead(lead, &self.settings.partnership_industries);
        summary.attempted += 1;
        let result = self.email.send_campaign(lead, campaign, now).await;
        if result.blocked {
            summary.blocked += 1;
            return;
        }
        if result.success {
            summary.sent += 1;
        } else {
            summary.failed += 1;
        }
        self.record_dispatch(lead, Channel::Email, campaign, &result, now).await;
    }

    /// Leads whose campaign email was blocked by a critical violation after
    /// their consent last changed. They wait for a consent change.
    async fn campaign_holds(&self, now: DateTime<Utc>) -> Result<HashSet<Uuid>, AppError> {
        let since = now - self.settings.retention.violation_retention;
        let violations = self.repo.list_violations(since).await?;
        let consent_changed: HashMap<String, DateTime<Utc>> = self
            .repo
            .list_consents()
            .await?
            .into_iter()
            .map(|c| (c.email, c.updated_at))
            .collect();

        Ok(violations
            .into_iter()
            .filter(|v| v.channel == Channel::Email && v.severity == Severity::Critical)
            .filter(|v| v.payload.get("kind").and_then(|k| k.as_str()) == Some("marketing"))
            .filter(|v| {
                consent_changed
                    .get(&v.recipient)
                    .map_or(true, |changed| v.detected_at > *changed)
            })
            .filter_map(|v| v.lead_id)
            .collect())
    }

    /// Emails warm/hot leads that have never been contacted, best score first.
    /// Blocked sends do not use up the batch.
    pub async fn run_email_campaign(&self, now: DateTime<Utc>) -> Result<BatchSummary, AppError> {
        let held = self.campaign_holds(now).await?;
        let mut eligible: Vec<Lead> = self
            .repo
            .list(&LeadFilter::with_statuses(&[LeadStatus::Warm, LeadStatus::Hot]))
            .await?
            .into_iter()
            .filter(|l| l.last_contact_at.is_none() && !held.contains(&l.id))
            .collect();
        eligible.sort_by(|a, b| b.score.cmp(&a.score).then(a.created_at.cmp(&b.created_at)));

        let limit = self.settings.campaign_batch_limit as u64;
        let mut summary = BatchSummary::default();
        for lead in &eligible {
            if summary.sent + summary.failed >= limit {
                break;
            }
            self.tally_email(lead, &mut summary, now).await;
        }
        tracing::info!(
            "Email campaign: {} attempted, {} sent, {} blocked, {} failed",
            summary.attempted,
            summary.sent,
            summary.blocked,
            summary.failed
        );
        Ok(summary)
    }

    /// Top-N hot leads with a phone, no contact yet and no call in flight.
    pub async fn call_targets(&self, now: DateTime<Utc>) -> Result<Vec<Lead>, AppError> {
        let hot = self
            .repo
            .list(&LeadFilter {
                statuses: vec![LeadStatus::Hot],
                with_phone_only: true,
                ..LeadFilter::default()
            })
            .await?;
        let mut targets = Vec::new();
        for lead in hot.into_iter().filter(|l| l.last_contact_at.is_none()) {
            if !self
                .repo
                .has_pending_call(lead.id, now - self.settings.pending_call_window)
                .await?
            {
                targets.push(lead);
            }
        }
        targets.sort_by(|a, b| b.score.cmp(&a.score).then(a.created_at.cmp(&b.created_at)));
        targets.truncate(self.settings.top_hot_calls);
        Ok(targets)
    }

    async fn tally_call(&self, voice: &VoiceDispatcher, lead: &Lead, summary: &mut BatchSummary, now: DateTime<Utc>) {
        let campaign = CampaignType::for_lead(lead, &self.settings.partnership_industries);
        summary.attempted += 1;
        let result = voice.place_call(lead, campaign, now).await;
        if result.blocked {
            summary.blocked += 1;
        } else if result.success {
            // Outcome arrives with the completion webhook.
            summary.sent += 1;
        } else {
            summary.failed += 1;
            self.record_dispatch(lead, Channel::Voice, campaign, &result, now).await;
        }
    }

    /// Places calls to `targets` in order, paced by the voice dispatcher.
    pub async fn place_calls(&self, targets: &[Lead], now: DateTime<Utc>) -> Result<BatchSummary, AppError> {
        let mut summary = BatchSummary::default();
        let Some(voice) = self.voice.as_deref() else {
            summary.skipped = targets.len() as u64;
            if !targets.is_empty() {
                tracing::warn!("Voice provider not configured; skipping {} calls", targets.len());
            }
            return Ok(summary);
        };
        for lead in targets {
            self.tally_call(voice, lead, &mut summary, now).await;
        }
        tracing::info!(
            "Calls: {} attempted, {} placed, {} blocked, {} failed",
            summary.attempted,
            summary.sent,
            summary.blocked,
            summary.failed
        );
        Ok(summary)
    }

    /// Follows up leads whose scheduled follow-up is due, and hot leads left
    /// without any attempt for longer than the stale window. A disconnected or
    /// not-interested attempt ends follow-up.
    pub async fn run_follow_ups(&self, now: DateTime<Utc>) -> Result<BatchSummary, AppError> {
        let leads = self.repo.list(&LeadFilter::default()).await?;
        let mut summary = BatchSummary::default();

        for lead in leads.iter().filter(|l| l.status != LeadStatus::NotInterested) {
            if summary.attempted >= self.settings.follow_up_batch_limit as u64 {
                break;
            }
            let latest = match self.repo.latest_attempt(lead.id).await {
                Ok(latest) => latest,
                Err(e) => {
                    tracing::error!("Failed to load attempts for lead {}: {}", lead.id, e);
                    summary.skipped += 1;
                    continue;
                }
            };
            let finished = latest.as_ref().map_or(false, |a| {
                matches!(a.outcome, Outcome::Disconnected | Outcome::NotInterested)
            });
            if finished {
                continue;
            }
            let due = latest
                .as_ref()
                .and_then(|a| a.follow_up_at)
                .map_or(false, |at| at <= now);
            // Hot leads nobody has reached yet.
            let stale_hot = latest.is_none()
                && lead.score >= self.settings.weights.hot_threshold
                && now - lead.last_activity() > self.settings.stale_hot_after;
            if !due && !stale_hot {
                continue;
            }
            let in_flight = self
                .repo
                .has_pending_call(lead.id, now - self.settings.pending_call_window)
                .await
                .unwrap_or(false);
            if in_flight {
                summary.skipped += 1;
                continue;
            }

            tracing::debug!(
                "Following up lead {} ({})",
                lead.id,
                if due { "due" } else { "stale hot" }
            );
            match self.voice.as_deref() {
                Some(voice) if lead.phone.is_some() => {
                    self.tally_call(voice, lead, &mut summary, now).await
                }
                _ => self.tally_email(lead, &mut summary, now).await,
            }
        }
        tracing::info!(
            "Follow-ups: {} attempted, {} sent, {} blocked, {} failed",
            summary.attempted,
            summary.sent,
            summary.blocked,
            summary.failed
        );
        Ok(summary)
    }

    // ============ Consent ============

    /// Applies an unsubscribe. Repeating it changes nothing.
    pub async fn handle_unsubscribe(
        &self,
        email: &str,
        scope: ConsentScope,
        now: DateTime<Utc>,
    ) -> Result<ConsentRecord, AppError> {
        let email = email.trim().to_lowercase();
        if !is_valid_email(&email) {
            return Err(AppError::BadRequest(format!("Invalid email: {}", email)));
        }
        let existing = self.repo.get_consent(&email).await?;
        let (record, changed) = apply_unsubscribe(existing, &email, scope, now);
        if changed {
            self.repo
                .upsert_consent(&record)
                .await
                .context("Failed to store unsubscribe")?;
            tracing::info!("Unsubscribed {} from {}", email, scope);
        }
        Ok(record)
    }

    /// Stores a fresh opt-in, replacing whatever was on file.
    pub async fn record_consent(&self, input: ConsentInput, now: DateTime<Utc>) -> Result<ConsentRecord, AppError> {
        let email = input.email.trim().to_lowercase();
        if !is_valid_email(&email) {
            return Err(AppError::BadRequest(format!("Invalid email: {}", input.email)));
        }
        if input.source.trim().is_empty() {
            return Err(AppError::BadRequest("Consent source is required".to_string()));
        }
        let record = ConsentRecord {
            email,
            email_marketing: input.email_marketing,
            sms_marketing: input.sms_marketing,
            call_marketing: input.call_marketing,
            opted_in_at: now,
            source: input.source.trim().to_string(),
            ip_address: input.ip_address,
            user_agent: input.user_agent,
            updated_at: now,
        };
        self.repo
            .upsert_consent(&record)
            .await
            .context("Failed to store consent")?;
        Ok(record)
    }

    // ============ Email engagement ============

    pub async fn record_email_event(&self, item: EmailEventItem, now: DateTime<Utc>) -> Result<EmailEvent, AppError> {
        let event = EmailEvent {
            id: Uuid::new_v4(),
            provider_ref: item.provider_ref,
            kind: item.kind,
            recipient: item.recipient.map(|r| r.trim().to_lowercase()),
            occurred_at: item.occurred_at.unwrap_or(now),
        };
        self.repo.record_email_event(&event).await?;

        if event.kind == EmailEventKind::Complained {
            match event.recipient.as_deref() {
                Some(recipient) => {
                    self.handle_unsubscribe(recipient, ConsentScope::Email, now).await?;
                }
                None => tracing::warn!(
                    "Complaint for {} has no recipient; cannot unsubscribe",
                    event.provider_ref
                ),
            }
        }
        Ok(event)
    }

    /// Send and engagement counts for the last 24 hours.
    pub async fn delivery_metrics(&self, now: DateTime<Utc>) -> Result<DeliveryMetrics, AppError> {
        let since = now - chrono::Duration::hours(24);
        let mut metrics = DeliveryMetrics::default();

        for attempt in self.repo.list_contact_attempts(since).await? {
            if attempt.channel != Channel::Email {
                continue;
            }
            if attempt.outcome == Outcome::Disconnected {
                metrics.failed += 1;
            } else {
                metrics.sent += 1;
            }
        }
        for event in self.repo.list_email_events(since).await? {
            match event.kind {
                EmailEventKind::Delivered => metrics.delivered += 1,
                EmailEventKind::Opened => metrics.opened += 1,
                EmailEventKind::Clicked => {}
                EmailEventKind::Bounced => metrics.bounced += 1,
                EmailEventKind::Complained => metrics.complained += 1,
            }
        }

        let denominator = metrics.sent.max(metrics.delivered + metrics.bounced);
        if denominator > 0 {
            metrics.bounce_rate = metrics.bounced as f64 / denominator as f64;
        }
        metrics.alert = metrics.bounce_rate > self.settings.bounce_rate_alert;
        if metrics.alert {
            tracing::warn!(
                "Bounce rate {:.1}% over the last 24h exceeds {:.1}%",
                metrics.bounce_rate * 100.0,
                self.settings.bounce_rate_alert * 100.0
            );
        }
        Ok(metrics)
    }

    // ============ Tickets ============

    async fn unresolved_tickets(&self) -> Result<Vec<SupportTicket>, AppError> {
        self.repo
            .list_tickets(&TicketFilter::with_statuses(&[
                TicketStatus::Open,
                TicketStatus::InProgress,
            ]))
            .await
    }

    /// Raises (never lowers) ticket priority from keyword rules.
    pub async fn reprioritize_tickets(&self, now: DateTime<Utc>) -> Result<TicketReview, AppError> {
        let mut review = TicketReview::default();
        for mut ticket in self.unresolved_tickets().await? {
            review.reviewed += 1;
            let keyword_priority = priority_by_keywords(&format!("{}\n{}", ticket.subject, ticket.body));
            if keyword_priority > ticket.priority {
                tracing::debug!(
                    "Ticket {} priority {} -> {}",
                    ticket.id,
                    ticket.priority,
                    keyword_priority
                );
                ticket.priority = keyword_priority;
                ticket.updated_at = now;
                match self.repo.upsert_ticket(&ticket).await {
                    Ok(()) => review.reprioritized += 1,
                    Err(e) => tracing::error!("Failed to update ticket {}: {}", ticket.id, e),
                }
            }
        }
        Ok(review)
    }

    /// Escalates tickets unresolved past the threshold, once per ticket, and
    /// notifies the internal recipient.
    pub async fn escalate_stale_tickets(&self, now: DateTime<Utc>) -> Result<TicketReview, AppError> {
        let mut review = TicketReview::default();
        for mut ticket in self.unresolved_tickets().await? {
            review.reviewed += 1;
            if ticket.escalated_at.is_some()
                || now - ticket.created_at <= self.settings.ticket_escalation_after
            {
                continue;
            }
            ticket.priority = TicketPriority::Urgent;
            if ticket.status == TicketStatus::Open {
                ticket
                    .advance(TicketStatus::InProgress, now)
                    .map_err(AppError::Conflict)?;
            }
            ticket.escalated_at = Some(now);
            ticket.updated_at = now;
            if let Err(e) = self.repo.upsert_ticket(&ticket).await {
                tracing::error!("Failed to escalate ticket {}: {}", ticket.id, e);
                continue;
            }
            review.escalated += 1;
            tracing::warn!("Ticket {} escalated after {}h", ticket.id, (now - ticket.created_at).num_hours());

            let notice = render_escalation(self.email.templates(), &ticket);
            let sent = self.email.send_internal(notice, now).await;
            if !sent.success {
                tracing::error!(
                    "Escalation notice for ticket {} not sent: {}",
                    ticket.id,
                    sent.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Ok(review)
    }

    /// Closes every resolved ticket.
    pub async fn auto_close_resolved(&self, now: DateTime<Utc>) -> Result<TicketReview, AppError> {
        let mut review = TicketReview::default();
        for mut ticket in self
            .repo
            .list_tickets(&TicketFilter::with_statuses(&[TicketStatus::Resolved]))
            .await?
        {
            review.reviewed += 1;
            if ticket.advance(TicketStatus::Closed, now).map_err(AppError::Conflict)? {
                match self.repo.upsert_ticket(&ticket).await {
                    Ok(()) => review.closed += 1,
                    Err(e) => tracing::error!("Failed to close ticket {}: {}", ticket.id, e),
                }
            }
        }
        Ok(review)
    }

    /// Moves a ticket forward on behalf of staff.
    pub async fn update_ticket_status(
        &self,
        ticket_id: Uuid,
        to: TicketStatus,
        now: DateTime<Utc>,
    ) -> Result<SupportTicket, AppError> {
        let mut ticket = self
            .repo
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Ticket {} not found", ticket_id)))?;
        if ticket.advance(to, now).map_err(AppError::Conflict)? {
            self.repo.upsert_ticket(&ticket).await?;
        }
        Ok(ticket)
    }

    // ============ Weekly ============

    /// Builds (or rebuilds) the report for the last complete week and
    /// dispatches it unless that already happened.
    pub async fn weekly_report(&self, now: DateTime<Utc>) -> Result<WeeklyOutcome, AppError> {
        let week_start = previous_week_start(now);
        let existing = self.repo.get_report(week_start).await?;
        if let Some(report) = existing.as_ref().filter(|r| r.dispatched_at.is_some()) {
            tracing::info!("Weekly report for {} already dispatched", week_start);
            return Ok(WeeklyOutcome {
                report: report.clone(),
                dispatched_now: false,
            });
        }

        let counts = aggregate_weekly(self.repo.as_ref(), week_start)
            .await
            .context("Failed to aggregate weekly counts")?;
        let mut report = WeeklyReport {
            week_start,
            counts,
            generated_at: existing.map(|r| r.generated_at).unwrap_or(now),
            dispatched_at: None,
        };
        self.repo.save_report(&report).await?;

        let rendered = render_weekly_report(self.email.templates(), &report);
        let sent = self.email.send_internal(rendered, now).await;
        if !sent.success {
            return Err(AppError::ExternalApiError(format!(
                "weekly report not dispatched: {}",
                sent.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        report.dispatched_at = Some(now);
        self.repo.save_report(&report).await?;
        tracing::info!("Weekly report for {} dispatched", week_start);
        Ok(WeeklyOutcome {
            report,
            dispatched_now: true,
        })
    }

    pub async fn run_retention(&self, now: DateTime<Utc>) -> Result<RetentionSummary, AppError> {
        run_retention(self.repo.as_ref(), &self.locks, &self.settings.retention, now).await
    }
}
