//! Compliance gate for outbound communication.
//!
//! Every email and call passes through [`ComplianceGate::validate`] before the
//! provider is contacted. Rules are registered in a list; each decides whether
//! it applies to a payload and returns at most one [`Violation`]. Only
//! `critical` violations block dispatch. The gate never mutates the payload.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::models::{
    CampaignType, Channel, ComplianceViolation, ConsentRecord, ConsentScope, Severity,
};
use crate::validation::{is_e164, is_valid_email};

/// Marketing messages need consent; transactional ones (support replies) do
/// not; internal notices go to staff only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Marketing,
    Transactional,
    Internal,
}

/// What is about to be sent. Email bodies carry both the HTML and the text part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub channel: Channel,
    pub kind: MessageKind,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub alt_body: Option<String>,
    pub campaign: Option<CampaignType>,
}

impl OutboundPayload {
    fn bodies(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.body.as_str()).chain(self.alt_body.as_deref())
    }

    fn full_text(&self) -> String {
        let mut text = self.subject.clone().unwrap_or_default();
        for body in self.bodies() {
            text.push('\n');
            text.push_str(body);
        }
        text.to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
}

impl Violation {
    fn new(rule_id: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            severity,
            message: message.into(),
        }
    }
}

/// Read-only facts a rule may consult.
#[derive(Debug, Clone)]
pub struct GateContext<'a> {
    pub consent: Option<&'a ConsentRecord>,
    pub now: DateTime<Utc>,
}

/// Tunables for the built-in rules.
#[derive(Debug, Clone)]
pub struct CompliancePolicy {
    pub consent_max_age: Duration,
    pub consent_expiry_warning: Duration,
    /// Lower-cased deny-list for guaranteed-return phrasing.
    pub prohibited_phrases: Vec<String>,
    /// Any one of these marks investment content as carrying a risk disclosure.
    pub disclosure_markers: Vec<String>,
    /// Company name every marketing email must identify itself with.
    pub sender_identification: String,
}

impl CompliancePolicy {
    pub fn new(sender_identification: &str) -> Self {
        Self {
            sender_identification: sender_identification.trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_prohibited_phrases(mut self, phrases: &[&str]) -> Self {
        self.prohibited_phrases = phrases
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }
}

impl Default for CompliancePolicy {
    fn default() -> Self {
        Self {
            consent_max_age: Duration::days(730),
            consent_expiry_warning: Duration::days(30),
            prohibited_phrases: [
                "guaranteed return",
                "guaranteed returns",
                "guaranteed profit",
                "guaranteed income",
                "guaranteed yield",
                "risk-free",
                "risk free",
                "no risk",
                "can't lose",
                "cannot lose",
                "100% safe",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            disclosure_markers: vec![
                "not an offer".to_string(),
                "involves risk".to_string(),
                "capital at risk".to_string(),
            ],
            sender_identification: "Outreach".to_string(),
        }
    }
}

/// One entry of the rule registry.
pub trait ComplianceRule: Send + Sync {
    fn id(&self) -> &'static str;
    fn applies_to(&self, payload: &OutboundPayload) -> bool;
    fn check(&self, payload: &OutboundPayload, ctx: &GateContext<'_>) -> Option<Violation>;
}

/// Unsubscribe link or mailto anywhere in the text.
pub fn has_unsubscribe_mechanism(text: &str) -> bool {
    static UNSUB: OnceLock<Regex> = OnceLock::new();
    UNSUB
        .get_or_init(|| {
            Regex::new(r#"(?i)(https?://[^\s"'<>]*unsubscribe[^\s"'<>]*|mailto:[^\s"'<>]*unsubscribe[^\s"'<>]*)"#)
                .expect("unsubscribe regex is valid")
        })
        .is_match(text)
}

struct ConsentRule {
    id: &'static str,
    channel: Channel,
    max_age: Duration,
}

impl ComplianceRule for ConsentRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn applies_to(&self, payload: &OutboundPayload) -> bool {
        payload.channel == self.channel && payload.kind == MessageKind::Marketing
    }

    fn check(&self, payload: &OutboundPayload, ctx: &GateContext<'_>) -> Option<Violation> {
        let message = match ctx.consent {
            None => format!("no consent on file for {}", payload.recipient),
            Some(consent) if !consent.allows(self.channel) => {
                format!("{} has not opted in to {} marketing", payload.recipient, self.channel)
            }
            Some(consent) if consent.is_expired(ctx.now, self.max_age) => format!(
                "consent for {} expired (opted in {})",
                payload.recipient,
                consent.opted_in_at.date_naive()
            ),
            Some(_) => return None,
        };
        Some(Violation::new(self.id, Severity::Critical, message))
    }
}

struct UnsubscribeLinkRule;

impl ComplianceRule for UnsubscribeLinkRule {
    fn id(&self) -> &'static str {
        "unsubscribe_link"
    }

    fn applies_to(&self, payload: &OutboundPayload) -> bool {
        payload.channel == Channel::Email && payload.kind != MessageKind::Internal
    }

    fn check(&self, payload: &OutboundPayload, _ctx: &GateContext<'_>) -> Option<Violation> {
        if payload.bodies().all(has_unsubscribe_mechanism) {
            None
        } else {
            Some(Violation::new(
                self.id(),
                Severity::Critical,
                "email body has no unsubscribe link or mailto",
            ))
        }
    }
}

struct ProhibitedPhrasesRule {
    phrases: Vec<String>,
}

impl ComplianceRule for ProhibitedPhrasesRule {
    fn id(&self) -> &'static str {
        "no_guaranteed_returns"
    }

    fn applies_to(&self, _payload: &OutboundPayload) -> bool {
        true
    }

    fn check(&self, payload: &OutboundPayload, _ctx: &GateContext<'_>) -> Option<Violation> {
        let text = payload.full_text();
        let hits: Vec<&str> = self
            .phrases
            .iter()
            .filter(|p| text.contains(p.as_str()))
            .map(String::as_str)
            .collect();
        if hits.is_empty() {
            None
        } else {
            Some(Violation::new(
                self.id(),
                Severity::Critical,
                format!("prohibited phrasing: {}", hits.join(", ")),
            ))
        }
    }
}

struct RiskDisclosureRule {
    markers: Vec<String>,
}

impl ComplianceRule for RiskDisclosureRule {
    fn id(&self) -> &'static str {
        "risk_disclosure"
    }

    fn applies_to(&self, payload: &OutboundPayload) -> bool {
        payload.channel == Channel::Email
            && payload.kind == MessageKind::Marketing
            && matches!(
                payload.campaign,
                Some(CampaignType::Investment) | Some(CampaignType::Demo)
            )
    }

    fn check(&self, payload: &OutboundPayload, _ctx: &GateContext<'_>) -> Option<Violation> {
        let text = payload.full_text();
        if self.markers.iter().any(|m| text.contains(m.as_str())) {
            None
        } else {
            Some(Violation::new(
                self.id(),
                Severity::Error,
                "investment content without a risk disclosure",
            ))
        }
    }
}

struct SenderIdentificationRule {
    sender: String,
}

impl ComplianceRule for SenderIdentificationRule {
    fn id(&self) -> &'static str {
        "sender_identification"
    }

    fn applies_to(&self, payload: &OutboundPayload) -> bool {
        payload.channel == Channel::Email && payload.kind == MessageKind::Marketing
    }

    fn check(&self, payload: &OutboundPayload, _ctx: &GateContext<'_>) -> Option<Violation> {
        if payload.full_text().contains(&self.sender.to_lowercase()) {
            None
        } else {
            Some(Violation::new(
                self.id(),
                Severity::Warning,
                format!("sender '{}' is not identified in the message", self.sender),
            ))
        }
    }
}

struct ConsentExpiringRule {
    max_age: Duration,
    warning: Duration,
}

impl ComplianceRule for ConsentExpiringRule {
    fn id(&self) -> &'static str {
        "consent_expiring"
    }

    fn applies_to(&self, payload: &OutboundPayload) -> bool {
        payload.kind == MessageKind::Marketing
    }

    fn check(&self, payload: &OutboundPayload, ctx: &GateContext<'_>) -> Option<Violation> {
        let consent = ctx.consent?;
        if !consent.allows(payload.channel) || consent.is_expired(ctx.now, self.max_age) {
            return None;
        }
        let expires_at = consent.opted_in_at + self.max_age;
        if expires_at - ctx.now <= self.warning {
            Some(Violation::new(
                self.id(),
                Severity::Warning,
                format!("consent for {} expires {}", payload.recipient, expires_at.date_naive()),
            ))
        } else {
            None
        }
    }
}

struct ValidRecipientRule;

impl ComplianceRule for ValidRecipientRule {
    fn id(&self) -> &'static str {
        "valid_recipient"
    }

    fn applies_to(&self, _payload: &OutboundPayload) -> bool {
        true
    }

    fn check(&self, payload: &OutboundPayload, _ctx: &GateContext<'_>) -> Option<Violation> {
        let valid = match payload.channel {
            Channel::Email => is_valid_email(&payload.recipient),
            Channel::Voice => is_e164(&payload.recipient),
        };
        if valid {
            None
        } else {
            Some(Violation::new(
                self.id(),
                Severity::Critical,
                format!("invalid {} recipient '{}'", payload.channel, payload.recipient),
            ))
        }
    }
}

pub struct ComplianceGate {
    rules: Vec<Box<dyn ComplianceRule>>,
    policy: CompliancePolicy,
}

impl ComplianceGate {
    /// Gate with the built-in rule set.
    pub fn new(policy: CompliancePolicy) -> Self {
        let rules: Vec<Box<dyn ComplianceRule>> = vec![
            Box::new(ValidRecipientRule),
            Box::new(ConsentRule {
                id: "email_consent",
                channel: Channel::Email,
                max_age: policy.consent_max_age,
            }),
            Box::new(ConsentRule {
                id: "call_consent",
                channel: Channel::Voice,
                max_age: policy.consent_max_age,
            }),
            Box::new(UnsubscribeLinkRule),
            Box::new(ProhibitedPhrasesRule {
                phrases: policy.prohibited_phrases.clone(),
            }),
            Box::new(RiskDisclosureRule {
                markers: policy.disclosure_markers.clone(),
            }),
            Box::new(SenderIdentificationRule {
                sender: policy.sender_identification.clone(),
            }),
            Box::new(ConsentExpiringRule {
                max_age: policy.consent_max_age,
                warning: policy.consent_expiry_warning,
            }),
        ];
        Self { rules, policy }
    }

    pub fn with_rule(mut self, rule: Box<dyn ComplianceRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn policy(&self) -> &CompliancePolicy {
        &self.policy
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    pub fn validate(&self, payload: &OutboundPayload, ctx: &GateContext<'_>) -> Vec<Violation> {
        self.rules
            .iter()
            .filter(|rule| rule.applies_to(payload))
            .filter_map(|rule| rule.check(payload, ctx))
            .collect()
    }
}

pub fn is_blocking(violations: &[Violation]) -> bool {
    violations.iter().any(|v| v.severity == Severity::Critical)
}

/// Audit record for one violation, with a snapshot of the payload it was raised on.
pub fn to_record(
    violation: &Violation,
    payload: &OutboundPayload,
    lead_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> ComplianceViolation {
    ComplianceViolation {
        id: Uuid::new_v4(),
        rule_id: violation.rule_id.clone(),
        severity: violation.severity,
        channel: payload.channel,
        lead_id,
        recipient: payload.recipient.clone(),
        message: violation.message.clone(),
        payload: serde_json::to_value(payload).unwrap_or_default(),
        detected_at: now,
    }
}

/// Applies an unsubscribe request. Returns the resulting record and whether
/// anything changed; a repeated request leaves the record untouched.
pub fn apply_unsubscribe(
    existing: Option<ConsentRecord>,
    email: &str,
    scope: ConsentScope,
    now: DateTime<Utc>,
) -> (ConsentRecord, bool) {
    let email = email.trim().to_lowercase();
    let Some(mut record) = existing else {
        let record = ConsentRecord {
            email,
            email_marketing: false,
            sms_marketing: false,
            call_marketing: false,
            opted_in_at: now,
            source: "unsubscribe".to_string(),
            ip_address: None,
            user_agent: None,
            updated_at: now,
        };
        return (record, true);
    };

    let before = (record.email_marketing, record.sms_marketing, record.call_marketing);
    match scope {
        ConsentScope::Email => record.email_marketing = false,
        ConsentScope::Sms => record.sms_marketing = false,
        ConsentScope::Call => record.call_marketing = false,
        ConsentScope::All => {
            record.email_marketing = false;
            record.sms_marketing = false;
            record.call_marketing = false;
        }
    }
    let changed = before != (record.email_marketing, record.sms_marketing, record.call_marketing);
    if changed {
        record.updated_at = now;
    }
    (record, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn consent(opted_in_days_ago: i64) -> ConsentRecord {
        ConsentRecord {
            email: "a@b.com".to_string(),
            email_marketing: true,
            sms_marketing: false,
            call_marketing: true,
            opted_in_at: now() - Duration::days(opted_in_days_ago),
            source: "website".to_string(),
            ip_address: None,
            user_agent: None,
            updated_at: now(),
        }
    }

    fn marketing(body: &str) -> OutboundPayload {
        OutboundPayload {
            channel: Channel::Email,
            kind: MessageKind::Marketing,
            recipient: "a@b.com".to_string(),
            subject: Some("Hello from Acme".to_string()),
            body: body.to_string(),
            alt_body: None,
            campaign: Some(CampaignType::Partnership),
        }
    }

    fn rule_ids(violations: &[Violation]) -> Vec<&str> {
        violations.iter().map(|v| v.rule_id.as_str()).collect()
    }

    #[test]
    fn clean_marketing_email_passes() {
        let gate = ComplianceGate::new(CompliancePolicy::new("Acme"));
        let c = consent(10);
        let ctx = GateContext {
            consent: Some(&c),
            now: now(),
        };
        let payload = marketing("Hi. https://acme.io/unsubscribe?token=x");
        assert!(gate.validate(&payload, &ctx).is_empty());
    }

    #[test]
    fn missing_consent_and_unsubscribe_block() {
        let gate = ComplianceGate::new(CompliancePolicy::new("Acme"));
        let ctx = GateContext {
            consent: None,
            now: now(),
        };
        let violations = gate.validate(&marketing("Hi there"), &ctx);
        assert!(is_blocking(&violations));
        let ids = rule_ids(&violations);
        assert!(ids.contains(&"email_consent"));
        assert!(ids.contains(&"unsubscribe_link"));
    }

    #[test]
    fn expired_consent_blocks_and_near_expiry_warns() {
        let gate = ComplianceGate::new(CompliancePolicy::new("Acme"));
        let payload = marketing("mailto:unsubscribe@acme.io");

        let stale = consent(731);
        let v = gate.validate(
            &payload,
            &GateContext {
                consent: Some(&stale),
                now: now(),
            },
        );
        assert_eq!(rule_ids(&v), vec!["email_consent"]);

        let aging = consent(710);
        let v = gate.validate(
            &payload,
            &GateContext {
                consent: Some(&aging),
                now: now(),
            },
        );
        assert_eq!(rule_ids(&v), vec!["consent_expiring"]);
        assert!(!is_blocking(&v));
    }

    #[test]
    fn guaranteed_returns_block_even_transactional_mail() {
        let gate = ComplianceGate::new(CompliancePolicy::new("Acme"));
        let mut payload = marketing("Enjoy Guaranteed Returns! https://acme.io/unsubscribe");
        payload.kind = MessageKind::Transactional;
        let v = gate.validate(
            &payload,
            &GateContext {
                consent: None,
                now: now(),
            },
        );
        assert_eq!(rule_ids(&v), vec!["no_guaranteed_returns"]);
    }

    #[test]
    fn investment_email_without_disclosure_is_an_error_not_a_block() {
        let gate = ComplianceGate::new(CompliancePolicy::new("Acme"));
        let c = consent(1);
        let mut payload = marketing("https://acme.io/unsubscribe");
        payload.campaign = Some(CampaignType::Investment);
        let v = gate.validate(
            &payload,
            &GateContext {
                consent: Some(&c),
                now: now(),
            },
        );
        assert_eq!(rule_ids(&v), vec!["risk_disclosure"]);
        assert_eq!(v[0].severity, Severity::Error);
        assert!(!is_blocking(&v));
    }

    #[test]
    fn calls_need_call_consent_and_e164_numbers() {
        let gate = ComplianceGate::new(CompliancePolicy::new("Acme"));
        let mut c = consent(1);
        c.call_marketing = false;
        let payload = OutboundPayload {
            channel: Channel::Voice,
            kind: MessageKind::Marketing,
            recipient: "555-1234".to_string(),
            subject: None,
            body: "Hi, this is Acme".to_string(),
            alt_body: None,
            campaign: Some(CampaignType::Investment),
        };
        let v = gate.validate(
            &payload,
            &GateContext {
                consent: Some(&c),
                now: now(),
            },
        );
        assert_eq!(rule_ids(&v), vec!["valid_recipient", "call_consent"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let (first, changed) = apply_unsubscribe(Some(consent(1)), "A@B.com", ConsentScope::All, now());
        assert!(changed);
        assert!(first.all_revoked());

        let later = now() + Duration::hours(1);
        let (second, changed) = apply_unsubscribe(Some(first.clone()), "a@b.com", ConsentScope::All, later);
        assert!(!changed);
        assert_eq!(second, first);
    }

    #[test]
    fn unsubscribe_without_record_creates_revoked_record() {
        let (record, changed) = apply_unsubscribe(None, "x@y.com", ConsentScope::Email, now());
        assert!(changed);
        assert!(record.all_revoked());
        assert_eq!(record.source, "unsubscribe");
    }

    #[test]
    fn detects_unsubscribe_mechanisms() {
        assert!(has_unsubscribe_mechanism("<a href=\"https://x.io/unsubscribe?t=1\">"));
        assert!(has_unsubscribe_mechanism("mailto:ir@x.io?subject=Unsubscribe"));
        assert!(!has_unsubscribe_mechanism("reply STOP to unsubscribe"));
    }
}
