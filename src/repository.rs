//! Lead Store seam.
//!
//! The engine reads snapshots through [`LeadRepository`] and writes results back
//! one lead at a time (score, status, last contact) or append-only (contact
//! attempts, violations, tickets). `PgLeadRepository` in `db_storage` is the
//! production backend; [`InMemoryLeadRepository`] backs tests and the
//! `STORE=memory` development mode.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    CallPlacement, ComplianceViolation, ConsentRecord, ContactAttempt, EmailEvent, Lead,
    LeadFilter, SupportTicket, TicketFilter, WeeklyReport,
};

/// Storage abstraction for every entity the engine touches.
#[async_trait]
pub trait LeadRepository: Send + Sync {
    // -- leads --
    async fn get(&self, id: Uuid) -> Result<Option<Lead>, AppError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<Lead>, AppError>;
    async fn list(&self, filter: &LeadFilter) -> Result<Vec<Lead>, AppError>;
    async fn upsert(&self, lead: &Lead) -> Result<(), AppError>;

    // -- contact attempts (append-only) --
    async fn append_contact_attempt(&self, attempt: &ContactAttempt) -> Result<(), AppError>;
    async fn list_contact_attempts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ContactAttempt>, AppError>;
    async fn latest_attempt(&self, lead_id: Uuid) -> Result<Option<ContactAttempt>, AppError>;

    // -- compliance audit (append-only, pruned by retention) --
    async fn append_violation(&self, violation: &ComplianceViolation) -> Result<(), AppError>;
    async fn list_violations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ComplianceViolation>, AppError>;
    async fn prune_violations(&self, before: DateTime<Utc>) -> Result<u64, AppError>;

    // -- consent --
    async fn get_consent(&self, email: &str) -> Result<Option<ConsentRecord>, AppError>;
    /// Replaces any existing record for the same email.
    async fn upsert_consent(&self, consent: &ConsentRecord) -> Result<(), AppError>;
    async fn list_consents(&self) -> Result<Vec<ConsentRecord>, AppError>;
    async fn delete_consent(&self, email: &str) -> Result<bool, AppError>;

    // -- tickets --
    async fn upsert_ticket(&self, ticket: &SupportTicket) -> Result<(), AppError>;
    async fn get_ticket(&self, id: Uuid) -> Result<Option<SupportTicket>, AppError>;
    async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<SupportTicket>, AppError>;

    // -- call correlation --
    async fn record_call_placement(&self, placement: &CallPlacement) -> Result<(), AppError>;
    /// Removes and returns the placement so a completion is consumed once.
    async fn take_call_placement(&self, call_ref: &str)
        -> Result<Option<CallPlacement>, AppError>;
    /// Whether a call to this lead placed after `placed_after` is still
    /// awaiting its completion webhook.
    async fn has_pending_call(
        &self,
        lead_id: Uuid,
        placed_after: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    // -- email engagement --
    async fn record_email_event(&self, event: &EmailEvent) -> Result<(), AppError>;
    async fn list_email_events(&self, since: DateTime<Utc>) -> Result<Vec<EmailEvent>, AppError>;

    // -- weekly reports --
    async fn get_report(&self, week_start: NaiveDate) -> Result<Option<WeeklyReport>, AppError>;
    async fn save_report(&self, report: &WeeklyReport) -> Result<(), AppError>;
}

#[derive(Default)]
struct Tables {
    leads: HashMap<Uuid, Lead>,
    attempts: Vec<ContactAttempt>,
    violations: Vec<ComplianceViolation>,
    consents: HashMap<String, ConsentRecord>,
    tickets: HashMap<Uuid, SupportTicket>,
    placements: HashMap<String, CallPlacement>,
    email_events: Vec<EmailEvent>,
    reports: HashMap<NaiveDate, WeeklyReport>,
}

/// Process-local repository. Enforces the same uniqueness rules as the SQL schema.
#[derive(Default)]
pub struct InMemoryLeadRepository {
    tables: RwLock<Tables>,
}

impl InMemoryLeadRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contact_attempts_for(&self, lead_id: Uuid) -> Vec<ContactAttempt> {
        let tables = self.tables.read().await;
        tables
            .attempts
            .iter()
            .filter(|a| a.lead_id == lead_id)
            .cloned()
            .collect()
    }

    pub async fn violation_count(&self) -> usize {
        self.tables.read().await.violations.len()
    }
}

#[async_trait]
impl LeadRepository for InMemoryLeadRepository {
    async fn get(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        Ok(self.tables.read().await.leads.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Lead>, AppError> {
        let email = email.trim().to_lowercase();
        let tables = self.tables.read().await;
        Ok(tables.leads.values().find(|l| l.email == email).cloned())
    }

    async fn list(&self, filter: &LeadFilter) -> Result<Vec<Lead>, AppError> {
        let tables = self.tables.read().await;
        let mut leads: Vec<Lead> = tables
            .leads
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        leads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            leads.truncate(limit);
        }
        Ok(leads)
    }

    async fn upsert(&self, lead: &Lead) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        if tables
            .leads
            .values()
            .any(|existing| existing.email == lead.email && existing.id != lead.id)
        {
            return Err(AppError::Conflict(format!(
                "a lead with email {} already exists",
                lead.email
            )));
        }
        tables.leads.insert(lead.id, lead.clone());
        Ok(())
    }

    async fn append_contact_attempt(&self, attempt: &ContactAttempt) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        if !tables.leads.contains_key(&attempt.lead_id) {
            return Err(AppError::NotFound(format!("lead {}", attempt.lead_id)));
        }
        tables.attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_contact_attempts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ContactAttempt>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .iter()
            .filter(|a| a.attempted_at >= since)
            .cloned()
            .collect())
    }

    async fn latest_attempt(&self, lead_id: Uuid) -> Result<Option<ContactAttempt>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .iter()
            .filter(|a| a.lead_id == lead_id)
            .max_by_key(|a| a.attempted_at)
            .cloned())
    }

    async fn append_violation(&self, violation: &ComplianceViolation) -> Result<(), AppError> {
        self.tables.write().await.violations.push(violation.clone());
        Ok(())
    }

    async fn list_violations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ComplianceViolation>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .violations
            .iter()
            .filter(|v| v.detected_at >= since)
            .cloned()
            .collect())
    }

    async fn prune_violations(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut tables = self.tables.write().await;
        let original = tables.violations.len();
        tables.violations.retain(|v| v.detected_at >= before);
        Ok((original - tables.violations.len()) as u64)
    }

    async fn get_consent(&self, email: &str) -> Result<Option<ConsentRecord>, AppError> {
        let email = email.trim().to_lowercase();
        Ok(self.tables.read().await.consents.get(&email).cloned())
    }

    async fn upsert_consent(&self, consent: &ConsentRecord) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        tables
            .consents
            .insert(consent.email.trim().to_lowercase(), consent.clone());
        Ok(())
    }

    async fn list_consents(&self) -> Result<Vec<ConsentRecord>, AppError> {
        Ok(self.tables.read().await.consents.values().cloned().collect())
    }

    async fn delete_consent(&self, email: &str) -> Result<bool, AppError> {
        let email = email.trim().to_lowercase();
        Ok(self.tables.write().await.consents.remove(&email).is_some())
    }

    async fn upsert_ticket(&self, ticket: &SupportTicket) -> Result<(), AppError> {
        self.tables
            .write()
            .await
            .tickets
            .insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<SupportTicket>, AppError> {
        Ok(self.tables.read().await.tickets.get(&id).cloned())
    }

    async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<SupportTicket>, AppError> {
        let tables = self.tables.read().await;
        let mut tickets: Vec<SupportTicket> = tables
            .tickets
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tickets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tickets)
    }

    async fn record_call_placement(&self, placement: &CallPlacement) -> Result<(), AppError> {
        self.tables
            .write()
            .await
            .placements
            .insert(placement.call_ref.clone(), placement.clone());
        Ok(())
    }

    async fn take_call_placement(
        &self,
        call_ref: &str,
    ) -> Result<Option<CallPlacement>, AppError> {
        Ok(self.tables.write().await.placements.remove(call_ref))
    }

    async fn has_pending_call(
        &self,
        lead_id: Uuid,
        placed_after: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .placements
            .values()
            .any(|p| p.lead_id == lead_id && p.placed_at > placed_after))
    }

    async fn record_email_event(&self, event: &EmailEvent) -> Result<(), AppError> {
        self.tables.write().await.email_events.push(event.clone());
        Ok(())
    }

    async fn list_email_events(&self, since: DateTime<Utc>) -> Result<Vec<EmailEvent>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .email_events
            .iter()
            .filter(|e| e.occurred_at >= since)
            .cloned()
            .collect())
    }

    async fn get_report(&self, week_start: NaiveDate) -> Result<Option<WeeklyReport>, AppError> {
        Ok(self.tables.read().await.reports.get(&week_start).cloned())
    }

    async fn save_report(&self, report: &WeeklyReport) -> Result<(), AppError> {
        self.tables
            .write()
            .await
            .reports
            .insert(report.week_start, report.clone());
        Ok(())
    }
}
