//! Retention cleanup and archival, run by the weekly cadence.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::errors::{AppError, ResultExt};
use crate::lead_locks::LeadLocks;
use crate::models::{LeadFilter, LeadStatus, TicketFilter, TicketStatus};
use crate::repository::LeadRepository;

/// Violations are an audit log and are never pruned younger than this.
pub const MIN_VIOLATION_RETENTION_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    /// Consent records with no activity for this long are purged.
    pub consent_max_idle: Duration,
    pub violation_retention: Duration,
    /// Cold / not-interested leads idle this long are archived.
    pub lead_stale_after: Duration,
    /// Closed tickets are archived this long after closing.
    pub ticket_archive_after: Duration,
}

impl RetentionPolicy {
    pub fn new(
        consent_max_idle: Duration,
        violation_retention: Duration,
        lead_stale_after: Duration,
        ticket_archive_after: Duration,
    ) -> Self {
        let floor = Duration::days(MIN_VIOLATION_RETENTION_DAYS);
        if violation_retention < floor {
            tracing::warn!(
                "Violation retention of {} days raised to the {}-day minimum",
                violation_retention.num_days(),
                MIN_VIOLATION_RETENTION_DAYS
            );
        }
        Self {
            consent_max_idle,
            violation_retention: violation_retention.max(floor),
            lead_stale_after,
            ticket_archive_after,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(
            Duration::days(1095),
            Duration::days(400),
            Duration::days(180),
            Duration::days(90),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionSummary {
    pub consents_purged: u64,
    pub violations_pruned: u64,
    pub leads_archived: u64,
    pub tickets_archived: u64,
}

pub async fn run_retention(
    repo: &dyn LeadRepository,
    locks: &LeadLocks,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<RetentionSummary, AppError> {
    let mut summary = RetentionSummary::default();

    // Consent: activity is the latest of the record's own timestamps and the
    // matching lead's last contact.
    let leads = repo.list(&LeadFilter::all()).await?;
    let last_contact: HashMap<&str, DateTime<Utc>> = leads
        .iter()
        .filter_map(|l| l.last_contact_at.map(|t| (l.email.as_str(), t)))
        .collect();
    for consent in repo.list_consents().await? {
        let mut last_activity = consent.updated_at.max(consent.opted_in_at);
        if let Some(contact) = last_contact.get(consent.email.as_str()) {
            last_activity = last_activity.max(*contact);
        }
        if now - last_activity > policy.consent_max_idle && repo.delete_consent(&consent.email).await? {
            tracing::info!("Purged idle consent record for {}", consent.email);
            summary.consents_purged += 1;
        }
    }

    summary.violations_pruned = repo
        .prune_violations(now - policy.violation_retention)
        .await
        .context("Failed to prune compliance violations")?;

    let stale = repo
        .list(&LeadFilter::with_statuses(&[LeadStatus::Cold, LeadStatus::NotInterested]))
        .await?;
    for candidate in stale {
        if now - candidate.last_activity() <= policy.lead_stale_after {
            continue;
        }
        let _guard = locks.acquire(candidate.id).await;
        // Re-read under the lock; a webhook may have just touched it.
        let Some(mut lead) = repo.get(candidate.id).await? else {
            continue;
        };
        let still_stale = !lead.is_archived()
            && matches!(lead.status, LeadStatus::Cold | LeadStatus::NotInterested)
            && now - lead.last_activity() > policy.lead_stale_after;
        if still_stale {
            lead.archived_at = Some(now);
            lead.updated_at = now;
            repo.upsert(&lead).await?;
            summary.leads_archived += 1;
        }
    }

    for mut ticket in repo
        .list_tickets(&TicketFilter::with_statuses(&[TicketStatus::Closed]))
        .await?
    {
        let closed_long_ago = ticket
            .closed_at
            .map_or(false, |closed| now - closed > policy.ticket_archive_after);
        if closed_long_ago {
            ticket.archived_at = Some(now);
            ticket.updated_at = now;
            repo.upsert_ticket(&ticket).await?;
            summary.tickets_archived += 1;
        }
    }

    tracing::info!(
        "Retention: {} consents purged, {} violations pruned, {} leads archived, {} tickets archived",
        summary.consents_purged,
        summary.violations_pruned,
        summary.leads_archived,
        summary.tickets_archived
    );
    Ok(summary)
}
