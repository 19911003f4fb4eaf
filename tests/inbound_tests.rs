/// Inbound support mail: inbox filtering, ticket creation with a model that
/// is down, and duplicate suppression.
mod common;

use chrono::Duration;
use serde_json::json;
use std::sync::atomic::Ordering;

use common::{harness, now, INBOX};
use outreach_engine::inbound::{InboundOutcome, InboundProvider, InboundRejection};
use outreach_engine::models::{
    LeadSource, TicketCategory, TicketFilter, TicketPriority, TicketStatus,
};
use outreach_engine::repository::LeadRepository;

fn sendgrid(to: &str, subject: &str, text: &str) -> serde_json::Value {
    json!({
        "from": "Jane Doe <jane@example.com>",
        "to": to,
        "subject": subject,
        "text": text
    })
}

#[tokio::test]
async fn test_mail_for_other_addresses_is_rejected() {
    let h = harness().build();
    let raw = sendgrid("random@other.com", "Hello", "Is anyone there?");

    let outcome = h
        .engine
        .inbound()
        .process(&raw, InboundProvider::SendGrid, now())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        InboundOutcome::Rejected(InboundRejection::NotAddressedToInbox(_))
    ));
    assert!(h
        .repo
        .list_tickets(&TicketFilter::default())
        .await
        .unwrap()
        .is_empty());
    assert!(h.email.sent().is_empty());
}

#[tokio::test]
async fn test_ticket_opens_with_keyword_fallback_when_model_is_down() {
    let h = harness().failing_model().build();
    let raw = sendgrid(
        &INBOX.to_uppercase(),
        "Account problem",
        "URGENT: I cannot log in to my account and need help immediately.",
    );

    let outcome = h
        .engine
        .inbound()
        .process(&raw, InboundProvider::SendGrid, now())
        .await
        .unwrap();
    let InboundOutcome::Processed { ticket, reply } = outcome else {
        panic!("expected a ticket");
    };
    assert!(h.model.calls.load(Ordering::SeqCst) > 0);

    assert_eq!(ticket.priority, TicketPriority::Urgent);
    assert_eq!(ticket.category, TicketCategory::TechnicalSupport);
    assert_eq!(ticket.status, TicketStatus::Open);
    assert_eq!(ticket.email, "jane@example.com");

    assert!(reply.success, "{:?}", reply.error);
    let replies = h.email.sent_to("jane@example.com");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].subject, "Re: Account problem");
    assert!(replies[0].text.contains("unsubscribe"));

    let stored = h.repo.get_ticket(ticket.id).await.unwrap();
    assert_eq!(stored, Some(ticket));

    // The sender becomes a lead.
    let lead = h.repo.find_by_email("jane@example.com").await.unwrap().unwrap();
    assert_eq!(lead.source, LeadSource::InboundEmail);
    assert_eq!(lead.name, "Jane Doe");
}

#[tokio::test]
async fn test_duplicate_delivery_opens_one_ticket() {
    let h = harness().build();
    let raw = sendgrid(INBOX, "Distributions", "When are distributions paid?");
    let inbound = h.engine.inbound();

    let first = inbound.process(&raw, InboundProvider::SendGrid, now()).await.unwrap();
    assert!(matches!(first, InboundOutcome::Processed { .. }));
    // Provider retry half a minute later; the payload carries no timestamp.
    let second = inbound
        .process(&raw, InboundProvider::SendGrid, now() + Duration::seconds(30))
        .await
        .unwrap();
    assert!(matches!(second, InboundOutcome::Duplicate));

    assert_eq!(
        h.repo.list_tickets(&TicketFilter::default()).await.unwrap().len(),
        1
    );
    assert_eq!(h.email.sent().len(), 1);
}

#[tokio::test]
async fn test_rule_based_classification_without_model() {
    let h = harness().build();
    assert_eq!(h.engine.insights_name(), "rules");
    let raw = sendgrid(INBOX, "Refund", "This is unacceptable, I want a refund.");

    let outcome = h
        .engine
        .inbound()
        .process(&raw, InboundProvider::SendGrid, now())
        .await
        .unwrap();
    let InboundOutcome::Processed { ticket, .. } = outcome else {
        panic!("expected a ticket");
    };
    assert_eq!(ticket.category, TicketCategory::Complaint);
    assert_eq!(ticket.priority, TicketPriority::High);
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_payload_without_sender_is_rejected() {
    let h = harness().build();
    let raw = json!({ "to": INBOX, "subject": "Hi", "text": "Body" });
    let outcome = h
        .engine
        .inbound()
        .process(&raw, InboundProvider::SendGrid, now())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        InboundOutcome::Rejected(InboundRejection::MissingSender)
    ));
}

#[tokio::test]
async fn test_blocked_model_reply_falls_back_to_acknowledgement() {
    let h = harness()
        .model_reply("Hi Jane, our fund offers guaranteed returns of 12% a year.")
        .build();
    let raw = sendgrid(INBOX, "Investing", "How do I invest with you?");

    let outcome = h
        .engine
        .inbound()
        .process(&raw, InboundProvider::SendGrid, now())
        .await
        .unwrap();
    let InboundOutcome::Processed { ticket, reply } = outcome else {
        panic!("expected a ticket");
    };
    assert_eq!(ticket.category, TicketCategory::InvestmentInquiry);
    assert!(reply.success, "{:?}", reply.error);

    let replies = h.email.sent_to("jane@example.com");
    assert_eq!(replies.len(), 1);
    assert!(replies[0]
        .text
        .contains("Thank you for contacting us about your investment question"));
    assert!(!replies[0].text.to_lowercase().contains("guaranteed"));

    let violations = h
        .repo
        .list_violations(now() - Duration::days(1))
        .await
        .unwrap();
    assert!(violations.iter().any(|v| v.rule_id == "no_guaranteed_returns"));
}
