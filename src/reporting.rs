//! Weekly aggregates.
//!
//! [`build_counts`] is a pure function of stored rows, so recomputing the same
//! week gives the same numbers.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use std::collections::BTreeMap;

use crate::errors::AppError;
use crate::models::{
    Channel, ContactAttempt, EmailEvent, EmailEventKind, Lead, LeadFilter, Outcome, ReportCounts,
    SupportTicket, TicketFilter,
};
use crate::repository::LeadRepository;

/// Monday of the ISO week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Monday of the last complete week before `now`.
pub fn previous_week_start(now: DateTime<Utc>) -> NaiveDate {
    week_start(now.date_naive()) - Duration::days(7)
}

/// `[start, end)` of the week beginning `week_start`, in UTC.
pub fn week_bounds(week_start: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&week_start.and_time(NaiveTime::default()));
    (start, start + Duration::days(7))
}

fn within(t: DateTime<Utc>, bounds: (DateTime<Utc>, DateTime<Utc>)) -> bool {
    t >= bounds.0 && t < bounds.1
}

/// Aggregates for one week. Lead counts cover every lead, archived included;
/// everything else is restricted to the week.
pub fn build_counts(
    week_start: NaiveDate,
    leads: &[Lead],
    attempts: &[ContactAttempt],
    events: &[EmailEvent],
    tickets: &[SupportTicket],
) -> ReportCounts {
    let bounds = week_bounds(week_start);
    let mut counts = ReportCounts::default();

    for lead in leads {
        *counts
            .leads_by_status
            .entry(lead.status.to_string())
            .or_insert(0) += 1;
    }

    let mut call_outcomes: BTreeMap<String, u64> = BTreeMap::new();
    for attempt in attempts.iter().filter(|a| within(a.attempted_at, bounds)) {
        match attempt.channel {
            Channel::Email if attempt.outcome == Outcome::Disconnected => counts.emails_failed += 1,
            Channel::Email => counts.emails_sent += 1,
            Channel::Voice => *call_outcomes.entry(attempt.outcome.to_string()).or_insert(0) += 1,
        }
    }
    counts.call_outcomes = call_outcomes;

    for event in events.iter().filter(|e| within(e.occurred_at, bounds)) {
        match event.kind {
            EmailEventKind::Delivered => counts.emails_delivered += 1,
            EmailEventKind::Opened => counts.emails_opened += 1,
            EmailEventKind::Clicked => counts.emails_clicked += 1,
            EmailEventKind::Bounced => counts.emails_bounced += 1,
            EmailEventKind::Complained => {}
        }
    }

    let mut resolution_hours = Vec::new();
    for ticket in tickets {
        if within(ticket.created_at, bounds) {
            counts.tickets_opened += 1;
        }
        if let Some(resolved) = ticket.resolved_at.filter(|r| within(*r, bounds)) {
            counts.tickets_resolved += 1;
            resolution_hours.push((resolved - ticket.created_at).num_minutes() as f64 / 60.0);
        }
    }
    if !resolution_hours.is_empty() {
        let avg = resolution_hours.iter().sum::<f64>() / resolution_hours.len() as f64;
        counts.avg_resolution_hours = Some((avg * 100.0).round() / 100.0);
    }

    counts
}

/// Loads the week's rows and aggregates them.
pub async fn aggregate_weekly(
    repo: &dyn LeadRepository,
    week_start: NaiveDate,
) -> Result<ReportCounts, AppError> {
    let (start, _) = week_bounds(week_start);
    let leads = repo.list(&LeadFilter::all()).await?;
    let attempts = repo.list_contact_attempts(start).await?;
    let events = repo.list_email_events(start).await?;
    let tickets = repo
        .list_tickets(&TicketFilter {
            include_archived: true,
            ..TicketFilter::default()
        })
        .await?;
    Ok(build_counts(week_start, &leads, &attempts, &events, &tickets))
}
