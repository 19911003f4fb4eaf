#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outreach_engine::config::EngineSettings;
use outreach_engine::email_client::{EmailProvider, EmailReceipt, OutboundEmail};
use outreach_engine::engine::OutreachEngine;
use outreach_engine::errors::AppError;
use outreach_engine::intelligence::{
    select_insights, LeadFeatures, ModelClassification, ModelScore, TextIntelligence,
};
use outreach_engine::models::{
    CanonicalEmail, ConsentRecord, Sentiment, TicketCategory, TicketPriority,
};
use outreach_engine::repository::{InMemoryLeadRepository, LeadRepository};
use outreach_engine::scheduler::{FixedClock, Scheduler};
use outreach_engine::voice_client::{CallRequest, VoiceProvider};

/// Wednesday 2026-03-04 09:00 UTC.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap()
}

pub const INBOX: &str = "support@acme-invest.com";
pub const REPORTS: &str = "team@acme-invest.com";

#[derive(Default)]
pub struct RecordingEmail {
    pub sent: Mutex<Vec<OutboundEmail>>,
    pub fail: AtomicBool,
}

impl RecordingEmail {
    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<OutboundEmail> {
        self.sent().into_iter().filter(|e| e.to == address).collect()
    }
}

#[async_trait]
impl EmailProvider for RecordingEmail {
    async fn send(&self, email: &OutboundEmail) -> Result<EmailReceipt, AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::ExternalApiError("provider down".to_string()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(email.clone());
        Ok(EmailReceipt {
            accepted: true,
            provider_ref: Some(format!("em_{}", sent.len())),
            detail: None,
        })
    }
}

#[derive(Default)]
pub struct RecordingVoice {
    pub calls: Mutex<Vec<CallRequest>>,
    pub fail: AtomicBool,
}

impl RecordingVoice {
    pub fn calls(&self) -> Vec<CallRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoiceProvider for RecordingVoice {
    async fn place_call(&self, request: &CallRequest) -> Result<String, AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::ExternalApiError("voice provider down".to_string()));
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push(request.clone());
        Ok(format!("call_{}", calls.len()))
    }
}

/// Language model that is always unavailable.
#[derive(Default)]
pub struct FailingModel {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TextIntelligence for FailingModel {
    async fn score(&self, _: &LeadFeatures) -> Result<ModelScore, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::ExternalApiError("model unavailable".to_string()))
    }

    async fn classify(&self, _: &str, _: &str) -> Result<ModelClassification, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::ExternalApiError("model unavailable".to_string()))
    }

    async fn generate_reply(
        &self,
        _: &CanonicalEmail,
        _: &ModelClassification,
    ) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::ExternalApiError("model unavailable".to_string()))
    }
}

/// Language model that classifies every email as an investment inquiry and
/// answers with a fixed reply.
pub struct ScriptedModel {
    pub reply: String,
}

#[async_trait]
impl TextIntelligence for ScriptedModel {
    async fn score(&self, _: &LeadFeatures) -> Result<ModelScore, AppError> {
        Ok(ModelScore {
            score: 50,
            reasoning: String::new(),
        })
    }

    async fn classify(&self, _: &str, _: &str) -> Result<ModelClassification, AppError> {
        Ok(ModelClassification {
            category: TicketCategory::InvestmentInquiry,
            sentiment: Sentiment::Neutral,
            priority: TicketPriority::Medium,
        })
    }

    async fn generate_reply(
        &self,
        _: &CanonicalEmail,
        _: &ModelClassification,
    ) -> Result<String, AppError> {
        Ok(self.reply.clone())
    }
}

pub fn settings() -> EngineSettings {
    let mut settings = EngineSettings {
        company_name: "Acme Invest".to_string(),
        public_base_url: "https://acme-invest.com".to_string(),
        email_from: "Acme Invest <hello@acme-invest.com>".to_string(),
        report_recipient: REPORTS.to_string(),
        inbound_addresses: vec![INBOX.to_string()],
        send_delay: Duration::ZERO,
        call_delay: Duration::ZERO,
        ..EngineSettings::default()
    };
    settings.compliance.sender_identification = "Acme Invest".to_string();
    settings
}

pub struct Harness {
    pub repo: Arc<InMemoryLeadRepository>,
    pub email: Arc<RecordingEmail>,
    pub voice: Arc<RecordingVoice>,
    pub model: Arc<FailingModel>,
    pub engine: Arc<OutreachEngine>,
    pub clock: Arc<FixedClock>,
    pub scheduler: Arc<Scheduler>,
}

pub struct HarnessBuilder {
    settings: EngineSettings,
    with_model: bool,
    model_reply: Option<String>,
}

impl HarnessBuilder {
    pub fn settings(mut self, f: impl FnOnce(&mut EngineSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    /// Wire in a language model that always fails.
    pub fn failing_model(mut self) -> Self {
        self.with_model = true;
        self
    }

    /// Wire in a working language model that always suggests `reply`.
    pub fn model_reply(mut self, reply: &str) -> Self {
        self.model_reply = Some(reply.to_string());
        self
    }

    pub fn build(self) -> Harness {
        let repo = Arc::new(InMemoryLeadRepository::new());
        let email = Arc::new(RecordingEmail::default());
        let voice = Arc::new(RecordingVoice::default());
        let model = Arc::new(FailingModel::default());
        let text_model: Option<Arc<dyn TextIntelligence>> = match self.model_reply {
            Some(reply) => Some(Arc::new(ScriptedModel { reply })),
            None => self
                .with_model
                .then(|| model.clone() as Arc<dyn TextIntelligence>),
        };
        let insights = select_insights(
            text_model,
            self.settings.weights.clone(),
            Duration::from_secs(1),
        );
        let engine = Arc::new(OutreachEngine::new(
            repo.clone(),
            insights,
            email.clone(),
            Some(voice.clone() as Arc<dyn VoiceProvider>),
            self.settings,
        ));
        let clock = Arc::new(FixedClock::new(now()));
        let scheduler = Arc::new(Scheduler::new(engine.clone(), clock.clone()));
        Harness {
            repo,
            email,
            voice,
            model,
            engine,
            clock,
            scheduler,
        }
    }
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        settings: settings(),
        with_model: false,
        model_reply: None,
    }
}

impl Harness {
    pub async fn opt_in(&self, email: &str, calls: bool) {
        let record = ConsentRecord {
            email: email.to_string(),
            email_marketing: true,
            sms_marketing: false,
            call_marketing: calls,
            opted_in_at: now() - chrono::Duration::days(10),
            source: "web_form".to_string(),
            ip_address: None,
            user_agent: None,
            updated_at: now() - chrono::Duration::days(10),
        };
        self.repo.upsert_consent(&record).await.unwrap();
    }
}
