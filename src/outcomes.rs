//! Outcome tracker: records contact attempts and derives follow-up timing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::lead_locks::LeadLocks;
use crate::models::{CampaignType, Channel, ContactAttempt, LeadStatus, Outcome};
use crate::repository::LeadRepository;

/// Follow-up delay per outcome. `None` means the outcome is terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUpPolicy {
    pub connected: Option<Duration>,
    pub voicemail: Option<Duration>,
    pub no_answer: Option<Duration>,
    pub busy: Option<Duration>,
    pub disconnected: Option<Duration>,
    pub interested: Option<Duration>,
    pub not_interested: Option<Duration>,
    pub callback_requested: Option<Duration>,
}

impl Default for FollowUpPolicy {
    fn default() -> Self {
        Self {
            connected: Some(Duration::days(7)),
            voicemail: Some(Duration::days(3)),
            no_answer: Some(Duration::days(1)),
            busy: Some(Duration::days(1)),
            disconnected: None,
            interested: Some(Duration::days(3)),
            not_interested: None,
            callback_requested: Some(Duration::days(7)),
        }
    }
}

impl FollowUpPolicy {
    pub fn delay_for(&self, outcome: Outcome) -> Option<Duration> {
        match outcome {
            Outcome::Connected => self.connected,
            Outcome::Voicemail => self.voicemail,
            Outcome::NoAnswer => self.no_answer,
            Outcome::Busy => self.busy,
            Outcome::Disconnected => self.disconnected,
            Outcome::Interested => self.interested,
            Outcome::NotInterested => self.not_interested,
            Outcome::CallbackRequested => self.callback_requested,
        }
    }
}

/// Same table for both channels today; the channel is part of the signature
/// so per-channel delays can be introduced without touching callers.
pub fn follow_up_at(
    policy: &FollowUpPolicy,
    _channel: Channel,
    outcome: Outcome,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    policy.delay_for(outcome).map(|delay| now + delay)
}

pub fn status_for_outcome(outcome: Outcome) -> LeadStatus {
    match outcome {
        Outcome::Interested | Outcome::CallbackRequested => LeadStatus::Warm,
        Outcome::NotInterested => LeadStatus::NotInterested,
        _ => LeadStatus::Contacted,
    }
}

/// Maps a voice provider's end state to an outcome. An explicit disposition
/// from call analysis wins over the raw status.
pub fn outcome_from_provider_status(
    status: &str,
    duration_seconds: Option<i32>,
    disposition: Option<&str>,
) -> Outcome {
    if let Some(outcome) = disposition.and_then(|d| d.trim().to_lowercase().parse::<Outcome>().ok()) {
        return outcome;
    }
    match status.trim().to_lowercase().replace('_', "-").as_str() {
        "voicemail" | "machine-detected" | "machine" => Outcome::Voicemail,
        "no-answer" | "customer-did-not-answer" | "unanswered" => Outcome::NoAnswer,
        "busy" | "customer-busy" => Outcome::Busy,
        "completed" | "ended" | "customer-ended-call" | "assistant-ended-call" => {
            if duration_seconds.unwrap_or(0) > 0 {
                Outcome::Connected
            } else {
                Outcome::NoAnswer
            }
        }
        _ => Outcome::Disconnected,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeInput {
    pub lead_id: Uuid,
    pub channel: Channel,
    pub outcome: Outcome,
    pub campaign: Option<CampaignType>,
    pub duration_seconds: Option<i32>,
    pub notes: Option<String>,
    pub provider_ref: Option<String>,
}

pub struct OutcomeTracker {
    repo: Arc<dyn LeadRepository>,
    locks: LeadLocks,
    policy: FollowUpPolicy,
}

impl OutcomeTracker {
    pub fn new(repo: Arc<dyn LeadRepository>, locks: LeadLocks, policy: FollowUpPolicy) -> Self {
        Self {
            repo,
            locks,
            policy,
        }
    }

    pub fn policy(&self) -> &FollowUpPolicy {
        &self.policy
    }

    /// Appends the attempt and moves the lead's status and last-contact time,
    /// under the lead's lock.
    pub async fn record(
        &self,
        input: OutcomeInput,
        now: DateTime<Utc>,
    ) -> Result<ContactAttempt, AppError> {
        let _guard = self.locks.acquire(input.lead_id).await;

        let mut lead = self
            .repo
            .get(input.lead_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", input.lead_id)))?;

        let attempt = ContactAttempt {
            id: Uuid::new_v4(),
            lead_id: lead.id,
            channel: input.channel,
            outcome: input.outcome,
            campaign: input.campaign,
            duration_seconds: input.duration_seconds,
            notes: input.notes,
            provider_ref: input.provider_ref,
            attempted_at: now,
            follow_up_at: follow_up_at(&self.policy, input.channel, input.outcome, now),
        };
        self.repo
            .append_contact_attempt(&attempt)
            .await
            .context("Failed to append contact attempt")?;

        lead.status = status_for_outcome(input.outcome);
        lead.last_contact_at = Some(now);
        lead.updated_at = now;
        self.repo
            .upsert(&lead)
            .await
            .context("Failed to update lead after contact attempt")?;

        tracing::info!(
            "Lead {} {} outcome {} -> status {}, follow-up {:?}",
            lead.id,
            attempt.channel,
            attempt.outcome,
            lead.status,
            attempt.follow_up_at
        );
        Ok(attempt)
    }

    /// Resolves a completed call back to its lead and records the outcome. If
    /// recording fails the placement is put back, so a provider retry still
    /// resolves.
    pub async fn record_call_completion(
        &self,
        call_ref: &str,
        duration_seconds: Option<i32>,
        provider_status: &str,
        disposition: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ContactAttempt, AppError> {
        let placement = self
            .repo
            .take_call_placement(call_ref)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Unknown call reference {}", call_ref)))?;

        let outcome = outcome_from_provider_status(provider_status, duration_seconds, disposition);
        let recorded = self
            .record(
                OutcomeInput {
                    lead_id: placement.lead_id,
                    channel: Channel::Voice,
                    outcome,
                    campaign: Some(placement.campaign),
                    duration_seconds,
                    notes: Some(format!("provider status: {}", provider_status)),
                    provider_ref: Some(call_ref.to_string()),
                },
                now,
            )
            .await;
        if recorded.is_err() {
            if let Err(e) = self.repo.record_call_placement(&placement).await {
                tracing::error!("Failed to restore call placement {}: {}", call_ref, e);
            }
        }
        recorded
    }
}
