/// Cadence runs: weekly report idempotence and single-flight triggers.
mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use common::{harness, now, settings, REPORTS};
use outreach_engine::email_client::{EmailProvider, EmailReceipt, OutboundEmail};
use outreach_engine::engine::{NewLead, OutreachEngine};
use outreach_engine::errors::AppError;
use outreach_engine::intelligence::select_insights;
use outreach_engine::repository::InMemoryLeadRepository;
use outreach_engine::scheduler::{Cadence, FixedClock, Scheduler};

#[tokio::test]
async fn test_weekly_report_dispatches_once() {
    let h = harness().build();
    h.engine
        .intake_lead(
            NewLead {
                email: "a@b.com".to_string(),
                name: None,
                phone: None,
                company: None,
                industry: None,
                source: None,
                notes: None,
            },
            now() - chrono::Duration::days(7),
        )
        .await
        .unwrap();

    let first = h.engine.weekly_report(now()).await.unwrap();
    assert!(first.dispatched_now);
    assert_eq!(first.report.dispatched_at, Some(now()));

    let second = h
        .engine
        .weekly_report(now() + chrono::Duration::hours(3))
        .await
        .unwrap();
    assert!(!second.dispatched_now);
    assert_eq!(second.report.counts, first.report.counts);
    assert_eq!(second.report.week_start, first.report.week_start);

    let reports = h.email.sent_to(REPORTS);
    assert_eq!(reports.len(), 1);
}

#[tokio::test]
async fn test_weekly_cadence_rerun_sends_nothing_new() {
    let h = harness().build();

    let first = h.scheduler.run(Cadence::Weekly).await;
    assert!(first.all_ok(), "{:?}", first.steps);
    assert_eq!(first.steps[0].name, "weekly_report");
    assert_eq!(first.steps[0].detail["dispatched_now"], true);

    let second = h.scheduler.run(Cadence::Weekly).await;
    assert!(second.all_ok());
    assert_eq!(second.steps[0].detail["dispatched_now"], false);
    assert_eq!(h.email.sent_to(REPORTS).len(), 1);
}

#[tokio::test]
async fn test_weekly_report_send_failure_is_retried_next_run() {
    let h = harness().build();
    h.email
        .fail
        .store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(h.engine.weekly_report(now()).await.is_err());

    h.email
        .fail
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let retry = h.engine.weekly_report(now()).await.unwrap();
    assert!(retry.dispatched_now);
}

/// Email provider that parks every send until released.
struct GatedEmail {
    entered: Notify,
    release: Semaphore,
}

#[async_trait]
impl EmailProvider for GatedEmail {
    async fn send(&self, _: &OutboundEmail) -> Result<EmailReceipt, AppError> {
        self.entered.notify_one();
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|e| AppError::InternalError(e.to_string()))?;
        permit.forget();
        Ok(EmailReceipt {
            accepted: true,
            provider_ref: Some("em_gated".to_string()),
            detail: None,
        })
    }
}

#[tokio::test]
async fn test_overlapping_trigger_is_skipped() {
    let settings = settings();
    let gated = Arc::new(GatedEmail {
        entered: Notify::new(),
        release: Semaphore::new(0),
    });
    let engine = Arc::new(OutreachEngine::new(
        Arc::new(InMemoryLeadRepository::new()),
        select_insights(None, settings.weights.clone(), Duration::from_secs(1)),
        gated.clone(),
        None,
        settings,
    ));
    let scheduler = Arc::new(Scheduler::new(engine, Arc::new(FixedClock::new(now()))));

    let running = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run(Cadence::Weekly).await }
    });
    // Wait until the first run is inside the report send.
    gated.entered.notified().await;

    let overlapping = scheduler.run(Cadence::Weekly).await;
    assert!(overlapping.skipped);
    assert!(overlapping.steps.is_empty());

    // Other cadences are independent.
    let afternoon = scheduler.run(Cadence::DailyAfternoon).await;
    assert!(!afternoon.skipped);

    gated.release.add_permits(1);
    let finished = running.await.unwrap();
    assert!(!finished.skipped);
    assert!(finished.all_ok(), "{:?}", finished.steps);
}

#[tokio::test]
async fn test_failed_step_does_not_stop_the_cadence() {
    let h = harness().build();
    h.email
        .fail
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let report = h.scheduler.run(Cadence::Weekly).await;
    assert!(!report.skipped);
    assert!(!report.all_ok());
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[0].name, "weekly_report");
    assert!(!report.steps[0].ok);
    assert_eq!(report.steps[1].name, "retention");
    assert!(report.steps[1].ok, "{:?}", report.steps[1].detail);

    // The next trigger picks the report up again.
    h.email
        .fail
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let rerun = h.scheduler.run(Cadence::Weekly).await;
    assert!(rerun.all_ok(), "{:?}", rerun.steps);
    assert_eq!(rerun.steps[0].detail["dispatched_now"], true);
    assert_eq!(h.email.sent_to(REPORTS).len(), 1);
}
