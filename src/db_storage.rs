use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    CallPlacement, ComplianceViolation, ConsentRecord, ContactAttempt, EmailEvent, Lead,
    LeadFilter, ReportCounts, SupportTicket, TicketFilter, WeeklyReport,
};
use crate::repository::LeadRepository;

/// Postgres-backed lead store. Enum columns are stored as their snake_case text.
pub struct PgLeadRepository {
    pool: PgPool,
}

impl PgLeadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn column<T: FromStr<Err = String>>(table: &str, value: &str) -> Result<T, AppError> {
    value
        .parse()
        .map_err(|e| AppError::InternalError(format!("corrupt {} row: {}", table, e)))
}

/// Unique-key violations become `Conflict`; everything else stays a database error.
fn write_error(e: sqlx::Error, what: &str) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict(format!("{} already exists", what))
        }
        _ => AppError::DatabaseError(e),
    }
}

const LEAD_COLUMNS: &str = "id, email, phone, name, company, industry, source, status, score, \
     scored_at, last_contact_at, notes, created_at, updated_at, archived_at";

#[derive(FromRow)]
struct LeadRow {
    id: Uuid,
    email: String,
    phone: Option<String>,
    name: String,
    company: Option<String>,
    industry: Option<String>,
    source: String,
    status: String,
    score: i32,
    scored_at: Option<DateTime<Utc>>,
    last_contact_at: Option<DateTime<Utc>>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    archived_at: Option<DateTime<Utc>>,
}

impl TryFrom<LeadRow> for Lead {
    type Error = AppError;

    fn try_from(row: LeadRow) -> Result<Self, Self::Error> {
        Ok(Lead {
            id: row.id,
            email: row.email,
            phone: row.phone,
            name: row.name,
            company: row.company,
            industry: row.industry,
            source: column("leads", &row.source)?,
            status: column("leads", &row.status)?,
            score: row.score,
            scored_at: row.scored_at,
            last_contact_at: row.last_contact_at,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
            archived_at: row.archived_at,
        })
    }
}

const ATTEMPT_COLUMNS: &str = "id, lead_id, channel, outcome, campaign, duration_seconds, notes, \
     provider_ref, attempted_at, follow_up_at";

#[derive(FromRow)]
struct AttemptRow {
    id: Uuid,
    lead_id: Uuid,
    channel: String,
    outcome: String,
    campaign: Option<String>,
    duration_seconds: Option<i32>,
    notes: Option<String>,
    provider_ref: Option<String>,
    attempted_at: DateTime<Utc>,
    follow_up_at: Option<DateTime<Utc>>,
}

impl TryFrom<AttemptRow> for ContactAttempt {
    type Error = AppError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(ContactAttempt {
            id: row.id,
            lead_id: row.lead_id,
            channel: column("contact_attempts", &row.channel)?,
            outcome: column("contact_attempts", &row.outcome)?,
            campaign: row
                .campaign
                .as_deref()
                .map(|c| column("contact_attempts", c))
                .transpose()?,
            duration_seconds: row.duration_seconds,
            notes: row.notes,
            provider_ref: row.provider_ref,
            attempted_at: row.attempted_at,
            follow_up_at: row.follow_up_at,
        })
    }
}

#[derive(FromRow)]
struct ViolationRow {
    id: Uuid,
    rule_id: String,
    severity: String,
    channel: String,
    lead_id: Option<Uuid>,
    recipient: String,
    message: String,
    payload: serde_json::Value,
    detected_at: DateTime<Utc>,
}

impl TryFrom<ViolationRow> for ComplianceViolation {
    type Error = AppError;

    fn try_from(row: ViolationRow) -> Result<Self, Self::Error> {
        Ok(ComplianceViolation {
            id: row.id,
            rule_id: row.rule_id,
            severity: column("compliance_violations", &row.severity)?,
            channel: column("compliance_violations", &row.channel)?,
            lead_id: row.lead_id,
            recipient: row.recipient,
            message: row.message,
            payload: row.payload,
            detected_at: row.detected_at,
        })
    }
}

#[derive(FromRow)]
struct ConsentRow {
    email: String,
    email_marketing: bool,
    sms_marketing: bool,
    call_marketing: bool,
    opted_in_at: DateTime<Utc>,
    source: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    updated_at: DateTime<Utc>,
}

impl From<ConsentRow> for ConsentRecord {
    fn from(row: ConsentRow) -> Self {
        ConsentRecord {
            email: row.email,
            email_marketing: row.email_marketing,
            sms_marketing: row.sms_marketing,
            call_marketing: row.call_marketing,
            opted_in_at: row.opted_in_at,
            source: row.source,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            updated_at: row.updated_at,
        }
    }
}

const TICKET_COLUMNS: &str = "id, email, subject, body, status, priority, category, sentiment, \
     created_at, updated_at, resolved_at, closed_at, escalated_at, archived_at";

#[derive(FromRow)]
struct TicketRow {
    id: Uuid,
    email: String,
    subject: String,
    body: String,
    status: String,
    priority: String,
    category: String,
    sentiment: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    escalated_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
}

impl TryFrom<TicketRow> for SupportTicket {
    type Error = AppError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        Ok(SupportTicket {
            id: row.id,
            email: row.email,
            subject: row.subject,
            body: row.body,
            status: column("support_tickets", &row.status)?,
            priority: column("support_tickets", &row.priority)?,
            category: column("support_tickets", &row.category)?,
            sentiment: column("support_tickets", &row.sentiment)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            resolved_at: row.resolved_at,
            closed_at: row.closed_at,
            escalated_at: row.escalated_at,
            archived_at: row.archived_at,
        })
    }
}

#[derive(FromRow)]
struct EmailEventRow {
    id: Uuid,
    provider_ref: String,
    kind: String,
    recipient: Option<String>,
    occurred_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct ReportRow {
    week_start: NaiveDate,
    counts: sqlx::types::Json<ReportCounts>,
    generated_at: DateTime<Utc>,
    dispatched_at: Option<DateTime<Utc>>,
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, AppError>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl LeadRepository for PgLeadRepository {
    async fn get(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        let row = sqlx::query_as::<_, LeadRow>(&format!(
            "SELECT {} FROM leads WHERE id = $1",
            LEAD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Lead::try_from).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Lead>, AppError> {
        let row = sqlx::query_as::<_, LeadRow>(&format!(
            "SELECT {} FROM leads WHERE email = $1",
            LEAD_COLUMNS
        ))
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Lead::try_from).transpose()
    }

    async fn list(&self, filter: &LeadFilter) -> Result<Vec<Lead>, AppError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM leads WHERE TRUE", LEAD_COLUMNS));
        if !filter.include_archived {
            qb.push(" AND archived_at IS NULL");
        }
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter.statuses.iter().map(|s| s.to_string()).collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if filter.unscored_only {
            qb.push(" AND scored_at IS NULL");
        }
        if filter.with_phone_only {
            qb.push(" AND phone IS NOT NULL AND phone <> ''");
        }
        qb.push(" ORDER BY created_at, id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build_query_as::<LeadRow>().fetch_all(&self.pool).await?;
        convert_all(rows)
    }

    async fn upsert(&self, lead: &Lead) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO leads (
                id, email, phone, name, company, industry, source, status, score,
                scored_at, last_contact_at, notes, created_at, updated_at, archived_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE
            SET email = EXCLUDED.email,
                phone = EXCLUDED.phone,
                name = EXCLUDED.name,
                company = EXCLUDED.company,
                industry = EXCLUDED.industry,
                source = EXCLUDED.source,
                status = EXCLUDED.status,
                score = EXCLUDED.score,
                scored_at = EXCLUDED.scored_at,
                last_contact_at = EXCLUDED.last_contact_at,
                notes = EXCLUDED.notes,
                updated_at = EXCLUDED.updated_at,
                archived_at = EXCLUDED.archived_at
            "#,
        )
        .bind(lead.id)
        .bind(&lead.email)
        .bind(&lead.phone)
        .bind(&lead.name)
        .bind(&lead.company)
        .bind(&lead.industry)
        .bind(lead.source.as_str())
        .bind(lead.status.as_str())
        .bind(lead.score)
        .bind(lead.scored_at)
        .bind(lead.last_contact_at)
        .bind(&lead.notes)
        .bind(lead.created_at)
        .bind(lead.updated_at)
        .bind(lead.archived_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, &format!("a lead with email {}", lead.email)))?;
        Ok(())
    }

    async fn append_contact_attempt(&self, attempt: &ContactAttempt) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO contact_attempts (
                id, lead_id, channel, outcome, campaign, duration_seconds, notes,
                provider_ref, attempted_at, follow_up_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.lead_id)
        .bind(attempt.channel.as_str())
        .bind(attempt.outcome.as_str())
        .bind(attempt.campaign.map(|c| c.as_str()))
        .bind(attempt.duration_seconds)
        .bind(&attempt.notes)
        .bind(&attempt.provider_ref)
        .bind(attempt.attempted_at)
        .bind(attempt.follow_up_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                AppError::NotFound(format!("lead {}", attempt.lead_id))
            }
            _ => AppError::DatabaseError(e),
        })?;
        Ok(())
    }

    async fn list_contact_attempts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ContactAttempt>, AppError> {
        let rows = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {} FROM contact_attempts WHERE attempted_at >= $1 ORDER BY attempted_at",
            ATTEMPT_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn latest_attempt(&self, lead_id: Uuid) -> Result<Option<ContactAttempt>, AppError> {
        let row = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {} FROM contact_attempts WHERE lead_id = $1 ORDER BY attempted_at DESC LIMIT 1",
            ATTEMPT_COLUMNS
        ))
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ContactAttempt::try_from).transpose()
    }

    async fn append_violation(&self, violation: &ComplianceViolation) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO compliance_violations (
                id, rule_id, severity, channel, lead_id, recipient, message, payload, detected_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(violation.id)
        .bind(&violation.rule_id)
        .bind(violation.severity.as_str())
        .bind(violation.channel.as_str())
        .bind(violation.lead_id)
        .bind(&violation.recipient)
        .bind(&violation.message)
        .bind(&violation.payload)
        .bind(violation.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_violations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ComplianceViolation>, AppError> {
        let rows = sqlx::query_as::<_, ViolationRow>(
            r#"
            SELECT id, rule_id, severity, channel, lead_id, recipient, message, payload, detected_at
            FROM compliance_violations
            WHERE detected_at >= $1
            ORDER BY detected_at
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn prune_violations(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM compliance_violations WHERE detected_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_consent(&self, email: &str) -> Result<Option<ConsentRecord>, AppError> {
        let row = sqlx::query_as::<_, ConsentRow>(
            r#"
            SELECT email, email_marketing, sms_marketing, call_marketing, opted_in_at,
                   source, ip_address, user_agent, updated_at
            FROM consent_records
            WHERE email = $1
            "#,
        )
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ConsentRecord::from))
    }

    async fn upsert_consent(&self, consent: &ConsentRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO consent_records (
                email, email_marketing, sms_marketing, call_marketing, opted_in_at,
                source, ip_address, user_agent, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (email) DO UPDATE
            SET email_marketing = EXCLUDED.email_marketing,
                sms_marketing = EXCLUDED.sms_marketing,
                call_marketing = EXCLUDED.call_marketing,
                opted_in_at = EXCLUDED.opted_in_at,
                source = EXCLUDED.source,
                ip_address = EXCLUDED.ip_address,
                user_agent = EXCLUDED.user_agent,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(consent.email.trim().to_lowercase())
        .bind(consent.email_marketing)
        .bind(consent.sms_marketing)
        .bind(consent.call_marketing)
        .bind(consent.opted_in_at)
        .bind(&consent.source)
        .bind(&consent.ip_address)
        .bind(&consent.user_agent)
        .bind(consent.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_consents(&self) -> Result<Vec<ConsentRecord>, AppError> {
        let rows = sqlx::query_as::<_, ConsentRow>(
            r#"
            SELECT email, email_marketing, sms_marketing, call_marketing, opted_in_at,
                   source, ip_address, user_agent, updated_at
            FROM consent_records
            ORDER BY email
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ConsentRecord::from).collect())
    }

    async fn delete_consent(&self, email: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM consent_records WHERE email = $1")
            .bind(email.trim().to_lowercase())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_ticket(&self, ticket: &SupportTicket) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO support_tickets (
                id, email, subject, body, status, priority, category, sentiment,
                created_at, updated_at, resolved_at, closed_at, escalated_at, archived_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                priority = EXCLUDED.priority,
                category = EXCLUDED.category,
                sentiment = EXCLUDED.sentiment,
                updated_at = EXCLUDED.updated_at,
                resolved_at = EXCLUDED.resolved_at,
                closed_at = EXCLUDED.closed_at,
                escalated_at = EXCLUDED.escalated_at,
                archived_at = EXCLUDED.archived_at
            "#,
        )
        .bind(ticket.id)
        .bind(&ticket.email)
        .bind(&ticket.subject)
        .bind(&ticket.body)
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(ticket.category.as_str())
        .bind(ticket.sentiment.as_str())
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .bind(ticket.resolved_at)
        .bind(ticket.closed_at)
        .bind(ticket.escalated_at)
        .bind(ticket.archived_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<SupportTicket>, AppError> {
        let row = sqlx::query_as::<_, TicketRow>(&format!(
            "SELECT {} FROM support_tickets WHERE id = $1",
            TICKET_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SupportTicket::try_from).transpose()
    }

    async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<SupportTicket>, AppError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM support_tickets WHERE TRUE",
            TICKET_COLUMNS
        ));
        if !filter.include_archived {
            qb.push(" AND archived_at IS NULL");
        }
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter.statuses.iter().map(|s| s.to_string()).collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        qb.push(" ORDER BY created_at, id");

        let rows = qb.build_query_as::<TicketRow>().fetch_all(&self.pool).await?;
        convert_all(rows)
    }

    async fn record_call_placement(&self, placement: &CallPlacement) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO call_placements (call_ref, lead_id, campaign, placed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (call_ref) DO NOTHING
            "#,
        )
        .bind(&placement.call_ref)
        .bind(placement.lead_id)
        .bind(placement.campaign.as_str())
        .bind(placement.placed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_call_placement(
        &self,
        call_ref: &str,
    ) -> Result<Option<CallPlacement>, AppError> {
        let row = sqlx::query_as::<_, (String, Uuid, String, DateTime<Utc>)>(
            "DELETE FROM call_placements WHERE call_ref = $1 RETURNING call_ref, lead_id, campaign, placed_at",
        )
        .bind(call_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(call_ref, lead_id, campaign, placed_at)| {
            Ok(CallPlacement {
                call_ref,
                lead_id,
                campaign: column("call_placements", &campaign)?,
                placed_at,
            })
        })
        .transpose()
    }

    async fn has_pending_call(
        &self,
        lead_id: Uuid,
        placed_after: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM call_placements WHERE lead_id = $1 AND placed_at > $2)",
        )
        .bind(lead_id)
        .bind(placed_after)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record_email_event(&self, event: &EmailEvent) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO email_events (id, provider_ref, kind, recipient, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id)
        .bind(&event.provider_ref)
        .bind(event.kind.as_str())
        .bind(&event.recipient)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_email_events(&self, since: DateTime<Utc>) -> Result<Vec<EmailEvent>, AppError> {
        let rows = sqlx::query_as::<_, EmailEventRow>(
            r#"
            SELECT id, provider_ref, kind, recipient, occurred_at
            FROM email_events
            WHERE occurred_at >= $1
            ORDER BY occurred_at
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(EmailEvent {
                    id: row.id,
                    provider_ref: row.provider_ref,
                    kind: column("email_events", &row.kind)?,
                    recipient: row.recipient,
                    occurred_at: row.occurred_at,
                })
            })
            .collect()
    }

    async fn get_report(&self, week_start: NaiveDate) -> Result<Option<WeeklyReport>, AppError> {
        let row = sqlx::query_as::<_, ReportRow>(
            "SELECT week_start, counts, generated_at, dispatched_at FROM weekly_reports WHERE week_start = $1",
        )
        .bind(week_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| WeeklyReport {
            week_start: r.week_start,
            counts: r.counts.0,
            generated_at: r.generated_at,
            dispatched_at: r.dispatched_at,
        }))
    }

    async fn save_report(&self, report: &WeeklyReport) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO weekly_reports (week_start, counts, generated_at, dispatched_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (week_start) DO UPDATE
            SET counts = EXCLUDED.counts,
                generated_at = EXCLUDED.generated_at,
                dispatched_at = EXCLUDED.dispatched_at
            "#,
        )
        .bind(report.week_start)
        .bind(sqlx::types::Json(&report.counts))
        .bind(report.generated_at)
        .bind(report.dispatched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
