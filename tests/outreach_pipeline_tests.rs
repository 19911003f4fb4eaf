/// End-to-end tests of the outreach pipeline against the in-memory store
/// with recording providers: scoring, gated campaigns, calls, outcomes,
/// unsubscribe handling and ticket escalation.
mod common;

use chrono::Duration;
use std::sync::atomic::Ordering;

use common::{harness, now, REPORTS};
use outreach_engine::engine::{ConsentInput, NewLead};
use outreach_engine::models::{
    CallPlacement, CampaignType, CanonicalEmail, Channel, Classification, ConsentScope,
    EmailEventKind, InsightSource, Lead, LeadSource, LeadStatus, Outcome, Sentiment, SupportTicket, TicketCategory, TicketPriority,
    TicketStatus,
};
use outreach_engine::outcomes::OutcomeInput;
use outreach_engine::repository::LeadRepository;
use outreach_engine::scheduler::Cadence;
use outreach_engine::webhook_models::EmailEventItem;

const VALID_PHONE: &str = "+16502530000";

fn hot_lead(email: &str, phone: Option<&str>) -> NewLead {
    NewLead {
        email: email.to_string(),
        name: Some("Ann Lee".to_string()),
        phone: phone.map(str::to_string),
        company: Some("Acme".to_string()),
        industry: None,
        source: Some(LeadSource::Referral),
        notes: None,
    }
}

#[tokio::test]
async fn test_intake_and_scoring_marks_complete_referral_hot() {
    let h = harness().build();
    let (lead, created) = h
        .engine
        .intake_lead(hot_lead("A@B.com", Some("+1555")), now())
        .await
        .unwrap();
    assert!(created);
    assert_eq!(lead.email, "a@b.com");
    assert_eq!(lead.status, LeadStatus::New);
    // Unparsable numbers are kept as entered.
    assert_eq!(lead.phone.as_deref(), Some("+1555"));

    let summary = h.engine.score_pending(now()).await.unwrap();
    assert_eq!(summary.scored, 1);
    assert_eq!(summary.became_engaged, vec![lead.id]);

    let scored = h.repo.get(lead.id).await.unwrap().unwrap();
    assert_eq!(scored.score, 100);
    assert_eq!(scored.status, LeadStatus::Hot);
    assert_eq!(scored.scored_at, Some(now()));

    // Second pass has nothing left to score.
    assert_eq!(h.engine.score_pending(now()).await.unwrap().scored, 0);
}

#[tokio::test]
async fn test_duplicate_intake_returns_existing_lead() {
    let h = harness().build();
    let (first, _) = h.engine.intake_lead(hot_lead("a@b.com", None), now()).await.unwrap();
    let (second, created) = h
        .engine
        .intake_lead(hot_lead(" a@B.com ", None), now())
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(first.id, second.id);

    let bad = h
        .engine
        .intake_lead(hot_lead("not-an-email", None), now())
        .await;
    assert!(bad.is_err());
}

#[tokio::test]
async fn test_campaign_without_consent_is_blocked_and_audited() {
    let h = harness().build();
    let (lead, _) = h.engine.intake_lead(hot_lead("a@b.com", None), now()).await.unwrap();
    h.engine.score_pending(now()).await.unwrap();

    let summary = h.engine.run_email_campaign(now()).await.unwrap();
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.sent, 0);
    assert!(h.email.sent().is_empty());

    let violations = h.repo.list_violations(now() - Duration::days(1)).await.unwrap();
    assert!(violations.iter().any(|v| v.rule_id == "email_consent"));

    // Blocked sends leave the lead untouched.
    let after = h.repo.get(lead.id).await.unwrap().unwrap();
    assert_eq!(after.status, LeadStatus::Hot);
    assert!(after.last_contact_at.is_none());
    assert!(h.repo.latest_attempt(lead.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_campaign_with_consent_sends_and_schedules_follow_up() {
    let h = harness().build();
    let (lead, _) = h.engine.intake_lead(hot_lead("a@b.com", None), now()).await.unwrap();
    h.opt_in("a@b.com", false).await;
    h.engine.score_pending(now()).await.unwrap();

    let summary = h.engine.run_email_campaign(now()).await.unwrap();
    assert_eq!(summary.sent, 1);

    let sent = h.email.sent_to("a@b.com");
    assert_eq!(sent.len(), 1);
    assert!(sent[0].html.contains("unsubscribe"));
    assert!(sent[0].text.contains("unsubscribe"));
    assert!(sent[0].text.contains("Acme Invest"));

    let after = h.repo.get(lead.id).await.unwrap().unwrap();
    assert_eq!(after.status, LeadStatus::Contacted);
    assert_eq!(after.last_contact_at, Some(now()));

    let attempt = h.repo.latest_attempt(lead.id).await.unwrap().unwrap();
    assert_eq!(attempt.channel, Channel::Email);
    assert_eq!(attempt.outcome, Outcome::Connected);
    assert_eq!(attempt.provider_ref.as_deref(), Some("em_1"));
    assert_eq!(attempt.follow_up_at, Some(now() + Duration::days(7)));

    // Contacted leads are not emailed again by the campaign.
    assert_eq!(h.engine.run_email_campaign(now()).await.unwrap().attempted, 0);
}

#[tokio::test]
async fn test_provider_failure_records_disconnected_attempt() {
    let h = harness().build();
    let (lead, _) = h.engine.intake_lead(hot_lead("a@b.com", None), now()).await.unwrap();
    h.opt_in("a@b.com", false).await;
    h.engine.score_pending(now()).await.unwrap();
    h.email.fail.store(true, Ordering::SeqCst);

    let summary = h.engine.run_email_campaign(now()).await.unwrap();
    assert_eq!(summary.failed, 1);

    let attempt = h.repo.latest_attempt(lead.id).await.unwrap().unwrap();
    assert_eq!(attempt.outcome, Outcome::Disconnected);
    assert_eq!(attempt.follow_up_at, None);
}

#[tokio::test]
async fn test_morning_cadence_emails_and_calls_hot_lead() {
    let h = harness().build();
    let (lead, _) = h
        .engine
        .intake_lead(hot_lead("a@b.com", Some(VALID_PHONE)), now())
        .await
        .unwrap();
    h.opt_in("a@b.com", true).await;

    let report = h.scheduler.run(Cadence::DailyMorning).await;
    assert!(!report.skipped);
    assert!(report.all_ok(), "{:?}", report.steps);
    let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "score_leads",
            "email_campaign",
            "hot_lead_calls",
            "ticket_reprioritization",
            "ticket_escalation"
        ]
    );

    assert_eq!(h.email.sent_to("a@b.com").len(), 1);
    let calls = h.voice.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].to_number, VALID_PHONE);
    assert_eq!(calls[0].metadata["lead_id"], lead.id.to_string());

    // Provider reports voicemail for the placed call.
    let attempt = h
        .engine
        .tracker()
        .record_call_completion("call_1", Some(0), "voicemail", None, now())
        .await
        .unwrap();
    assert_eq!(attempt.outcome, Outcome::Voicemail);
    assert_eq!(attempt.follow_up_at, Some(now() + Duration::days(3)));
    let after = h.repo.get(lead.id).await.unwrap().unwrap();
    assert_eq!(after.status, LeadStatus::Contacted);

    // The completion is consumed once.
    assert!(h
        .engine
        .tracker()
        .record_call_completion("call_1", Some(0), "voicemail", None, now())
        .await
        .is_err());

    // A rerun has nothing left to do.
    let rerun = h.scheduler.run(Cadence::DailyMorning).await;
    assert!(rerun.all_ok());
    assert_eq!(h.email.sent().len(), 1);
    assert_eq!(h.voice.calls().len(), 1);
}

#[tokio::test]
async fn test_calls_need_call_consent() {
    let h = harness().build();
    h.engine
        .intake_lead(hot_lead("a@b.com", Some(VALID_PHONE)), now())
        .await
        .unwrap();
    h.opt_in("a@b.com", false).await;
    h.engine.score_pending(now()).await.unwrap();

    let targets = h.engine.call_targets(now()).await.unwrap();
    assert_eq!(targets.len(), 1);
    let summary = h.engine.place_calls(&targets, now()).await.unwrap();
    assert_eq!(summary.blocked, 1);
    assert!(h.voice.calls().is_empty());

    let violations = h.repo.list_violations(now() - Duration::days(1)).await.unwrap();
    assert!(violations.iter().any(|v| v.rule_id == "call_consent"));
}

#[tokio::test]
async fn test_placed_call_holds_off_repeat_calls() {
    let h = harness().build();
    h.engine
        .intake_lead(hot_lead("a@b.com", Some(VALID_PHONE)), now())
        .await
        .unwrap();
    h.opt_in("a@b.com", true).await;
    h.engine.score_pending(now()).await.unwrap();

    let targets = h.engine.call_targets(now()).await.unwrap();
    assert_eq!(h.engine.place_calls(&targets, now()).await.unwrap().sent, 1);
    assert!(h.engine.call_targets(now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_follow_up_runs_when_due() {
    let h = harness().build();
    let (lead, _) = h.engine.intake_lead(hot_lead("a@b.com", None), now()).await.unwrap();
    h.opt_in("a@b.com", false).await;
    h.engine
        .tracker()
        .record(
            OutcomeInput {
                lead_id: lead.id,
                channel: Channel::Email,
                outcome: Outcome::NoAnswer,
                campaign: None,
                duration_seconds: None,
                notes: None,
                provider_ref: None,
            },
            now(),
        )
        .await
        .unwrap();

    // Not due yet.
    let early = h.engine.run_follow_ups(now() + Duration::hours(12)).await.unwrap();
    assert_eq!(early.attempted, 0);

    let due = h.engine.run_follow_ups(now() + Duration::days(1)).await.unwrap();
    assert_eq!(due.attempted, 1);
    assert_eq!(due.sent, 1);
    assert_eq!(h.email.sent_to("a@b.com").len(), 1);
}

#[tokio::test]
async fn test_blocked_lead_does_not_hold_campaign_slots() {
    let h = harness().settings(|s| s.campaign_batch_limit = 1).build();
    let (blocked, _) = h
        .engine
        .intake_lead(hot_lead("blocked@b.com", None), now())
        .await
        .unwrap();
    let warm = NewLead {
        source: Some(LeadSource::Website),
        ..hot_lead("ok@b.com", None)
    };
    h.engine.intake_lead(warm, now()).await.unwrap();
    h.opt_in("ok@b.com", false).await;
    h.engine.score_pending(now()).await.unwrap();

    let first = h.engine.run_email_campaign(now()).await.unwrap();
    assert_eq!(first.blocked, 1);
    assert_eq!(first.sent, 1);
    assert_eq!(h.email.sent_to("ok@b.com").len(), 1);
    let logged = h.repo.violation_count().await;

    // The blocked lead waits for a consent change instead of retrying daily.
    let next_day = h.engine.run_email_campaign(now() + Duration::days(1)).await.unwrap();
    assert_eq!(next_day.attempted, 0);
    assert_eq!(h.repo.violation_count().await, logged);

    h.engine
        .record_consent(
            ConsentInput {
                email: "blocked@b.com".to_string(),
                email_marketing: true,
                sms_marketing: false,
                call_marketing: false,
                source: "web_form".to_string(),
                ip_address: None,
                user_agent: None,
            },
            now() + Duration::days(1) + Duration::hours(2),
        )
        .await
        .unwrap();
    let after_opt_in = h.engine.run_email_campaign(now() + Duration::days(2)).await.unwrap();
    assert_eq!(after_opt_in.sent, 1);
    assert_eq!(h.email.sent_to("blocked@b.com").len(), 1);
    assert_eq!(
        h.repo.get(blocked.id).await.unwrap().unwrap().status,
        LeadStatus::Contacted
    );
}

#[tokio::test]
async fn test_disconnected_hot_lead_is_not_followed_up() {
    let h = harness().build();
    let (lead, _) = h
        .engine
        .intake_lead(hot_lead("a@b.com", Some(VALID_PHONE)), now())
        .await
        .unwrap();
    h.opt_in("a@b.com", true).await;
    h.engine.score_pending(now()).await.unwrap();
    h.engine
        .tracker()
        .record(
            OutcomeInput {
                lead_id: lead.id,
                channel: Channel::Voice,
                outcome: Outcome::Disconnected,
                campaign: Some(CampaignType::Demo),
                duration_seconds: None,
                notes: None,
                provider_ref: None,
            },
            now(),
        )
        .await
        .unwrap();

    for day in 1..=3 {
        let summary = h
            .engine
            .run_follow_ups(now() + Duration::days(day))
            .await
            .unwrap();
        assert_eq!(summary.attempted, 0, "day {}", day);
    }
    assert!(h.voice.calls().is_empty());
    assert!(h.email.sent().is_empty());
}

#[tokio::test]
async fn test_stale_hot_lead_without_attempts_is_followed_up() {
    let h = harness().build();
    h.engine.intake_lead(hot_lead("a@b.com", None), now()).await.unwrap();
    h.opt_in("a@b.com", false).await;
    h.engine.score_pending(now()).await.unwrap();

    let early = h.engine.run_follow_ups(now() + Duration::hours(12)).await.unwrap();
    assert_eq!(early.attempted, 0);
    let stale = h.engine.run_follow_ups(now() + Duration::hours(25)).await.unwrap();
    assert_eq!(stale.sent, 1);
    assert_eq!(h.email.sent_to("a@b.com").len(), 1);
}

#[tokio::test]
async fn test_call_completion_for_missing_lead_can_be_retried() {
    let h = harness().build();
    let lead = Lead::new("late@b.com", "Late Lead", LeadSource::Import, now());
    h.repo
        .record_call_placement(&CallPlacement {
            call_ref: "call_77".to_string(),
            lead_id: lead.id,
            campaign: CampaignType::Demo,
            placed_at: now(),
        })
        .await
        .unwrap();

    let tracker = h.engine.tracker();
    assert!(tracker
        .record_call_completion("call_77", Some(120), "completed", None, now())
        .await
        .is_err());

    // The placement survives the failure, so the provider's retry resolves.
    h.repo.upsert(&lead).await.unwrap();
    let attempt = tracker
        .record_call_completion("call_77", Some(120), "completed", None, now())
        .await
        .unwrap();
    assert_eq!(attempt.lead_id, lead.id);
    assert_eq!(attempt.outcome, Outcome::Connected);
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let h = harness().build();
    h.opt_in("a@b.com", true).await;

    let first = h
        .engine
        .handle_unsubscribe("A@B.com", ConsentScope::All, now())
        .await
        .unwrap();
    let second = h
        .engine
        .handle_unsubscribe("a@b.com", ConsentScope::All, now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert!(!second.email_marketing && !second.sms_marketing && !second.call_marketing);
    assert_eq!(h.repo.get_consent("a@b.com").await.unwrap(), Some(first));
}

#[tokio::test]
async fn test_unsubscribe_without_record_stores_opt_out() {
    let h = harness().build();
    let record = h
        .engine
        .handle_unsubscribe("new@b.com", ConsentScope::Email, now())
        .await
        .unwrap();
    assert!(!record.email_marketing);
    assert_eq!(record.source, "unsubscribe");
    assert!(h.repo.get_consent("new@b.com").await.unwrap().is_some());
}

#[tokio::test]
async fn test_complaint_event_unsubscribes_recipient() {
    let h = harness().build();
    h.opt_in("a@b.com", true).await;

    h.engine
        .record_email_event(
            EmailEventItem {
                provider_ref: "em_9".to_string(),
                kind: EmailEventKind::Complained,
                recipient: Some("A@b.com".to_string()),
                occurred_at: None,
            },
            now(),
        )
        .await
        .unwrap();

    let consent = h.repo.get_consent("a@b.com").await.unwrap().unwrap();
    assert!(!consent.email_marketing);
    // Only the email channel is withdrawn.
    assert!(consent.call_marketing);

    let metrics = h.engine.delivery_metrics(now()).await.unwrap();
    assert_eq!(metrics.complained, 1);
}

fn stale_ticket(hours_old: i64) -> SupportTicket {
    let email = CanonicalEmail {
        from: "investor@example.com".to_string(),
        from_name: None,
        to: vec![common::INBOX.to_string()],
        subject: "Question about distributions".to_string(),
        body: "When are distributions paid?".to_string(),
        timestamp: now() - Duration::hours(hours_old),
    };
    let classification = Classification {
        category: TicketCategory::InvestmentInquiry,
        sentiment: Sentiment::Neutral,
        priority: TicketPriority::Medium,
        suggested_reply: String::new(),
        source: InsightSource::Rules,
    };
    SupportTicket::open(&email, &classification)
}

#[tokio::test]
async fn test_stale_ticket_escalates_once() {
    let h = harness().build();
    let stale = stale_ticket(72);
    let fresh = stale_ticket(2);
    h.repo.upsert_ticket(&stale).await.unwrap();
    h.repo.upsert_ticket(&fresh).await.unwrap();

    let review = h.engine.escalate_stale_tickets(now()).await.unwrap();
    assert_eq!(review.reviewed, 2);
    assert_eq!(review.escalated, 1);

    let escalated = h.repo.get_ticket(stale.id).await.unwrap().unwrap();
    assert_eq!(escalated.priority, TicketPriority::Urgent);
    assert_eq!(escalated.status, TicketStatus::InProgress);
    assert_eq!(escalated.escalated_at, Some(now()));
    assert_eq!(h.email.sent_to(REPORTS).len(), 1);

    let again = h
        .engine
        .escalate_stale_tickets(now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(again.escalated, 0);
    assert_eq!(h.email.sent_to(REPORTS).len(), 1);

    let untouched = h.repo.get_ticket(fresh.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, TicketStatus::Open);
}

#[tokio::test]
async fn test_resolved_tickets_auto_close_and_never_reopen() {
    let h = harness().build();
    let ticket = stale_ticket(5);
    h.repo.upsert_ticket(&ticket).await.unwrap();

    h.engine
        .update_ticket_status(ticket.id, TicketStatus::Resolved, now())
        .await
        .unwrap();
    let review = h.engine.auto_close_resolved(now()).await.unwrap();
    assert_eq!(review.closed, 1);

    let closed = h.repo.get_ticket(ticket.id).await.unwrap().unwrap();
    assert_eq!(closed.status, TicketStatus::Closed);
    assert!(closed.closed_at.is_some());

    assert!(h
        .engine
        .update_ticket_status(ticket.id, TicketStatus::Open, now())
        .await
        .is_err());
}

#[tokio::test]
async fn test_reprioritization_only_raises_priority() {
    let h = harness().build();
    let mut urgent = stale_ticket(1);
    urgent.body = "Please call me back ASAP, this is urgent.".to_string();
    let mut already_high = stale_ticket(1);
    already_high.priority = TicketPriority::High;
    h.repo.upsert_ticket(&urgent).await.unwrap();
    h.repo.upsert_ticket(&already_high).await.unwrap();

    let review = h.engine.reprioritize_tickets(now()).await.unwrap();
    assert_eq!(review.reviewed, 2);
    assert_eq!(review.reprioritized, 1);
    assert_eq!(
        h.repo.get_ticket(urgent.id).await.unwrap().unwrap().priority,
        TicketPriority::Urgent
    );
    // Keyword rules would say medium; high is kept.
    assert_eq!(
        h.repo.get_ticket(already_high.id).await.unwrap().unwrap().priority,
        TicketPriority::High
    );
}
