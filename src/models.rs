use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// Implements `as_str`, `Display`, `FromStr` and an `ALL` table for a
/// unit-only enum whose wire and column form is a snake_case string.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

// ============ Leads ============

/// Engagement bucket of a lead.
///
/// `Hot`, `Warm` and `Cold` are owned by the scoring engine; `Contacted` and
/// `NotInterested` are only ever set by the outcome tracker. `New` is the
/// intake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Warm,
    Hot,
    Cold,
    NotInterested,
}

string_enum!(LeadStatus {
    New => "new",
    Contacted => "contacted",
    Warm => "warm",
    Hot => "hot",
    Cold => "cold",
    NotInterested => "not_interested",
});

impl LeadStatus {
    /// Whether a scoring pass may overwrite this status.
    pub fn is_scoring_owned(&self) -> bool {
        matches!(
            self,
            LeadStatus::New | LeadStatus::Cold | LeadStatus::Warm | LeadStatus::Hot
        )
    }

    pub fn is_engaged(&self) -> bool {
        matches!(self, LeadStatus::Warm | LeadStatus::Hot)
    }
}

/// How the lead reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LeadSource {
    Manual,
    Import,
    Referral,
    Website,
    InboundEmail,
    Event,
    Other,
}

string_enum!(LeadSource {
    Manual => "manual",
    Import => "import",
    Referral => "referral",
    Website => "website",
    InboundEmail => "inbound_email",
    Event => "event",
    Other => "other",
});

/// A prospective investor or property sponsor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Lead {
    pub id: Uuid,
    /// Lower-cased; the dedup key.
    pub email: String,
    pub phone: Option<String>,
    pub name: String,
    pub company: Option<String>,
    pub industry: Option<String>,
    pub source: LeadSource,
    pub status: LeadStatus,
    /// Always within 0..=100.
    pub score: i32,
    pub scored_at: Option<DateTime<Utc>>,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Lead {
    pub fn new(email: &str, name: &str, source: LeadSource, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.trim().to_lowercase(),
            phone: None,
            name: name.trim().to_string(),
            company: None,
            industry: None,
            source,
            status: LeadStatus::New,
            score: 0,
            scored_at: None,
            last_contact_at: None,
            notes: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    pub fn with_company(mut self, company: &str) -> Self {
        self.company = Some(company.to_string());
        self
    }

    pub fn with_phone(mut self, phone: &str) -> Self {
        self.phone = Some(phone.to_string());
        self
    }

    pub fn with_industry(mut self, industry: &str) -> Self {
        self.industry = Some(industry.to_string());
        self
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// First name for salutations, falling back to the full name.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }

    /// Most recent activity used for staleness checks.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_contact_at.unwrap_or(self.created_at).max(self.created_at)
    }
}

/// Query filter for listing leads. Empty `statuses` means "any status".
#[derive(Debug, Clone, Default)]
pub struct LeadFilter {
    pub statuses: Vec<LeadStatus>,
    pub unscored_only: bool,
    pub include_archived: bool,
    pub with_phone_only: bool,
    pub limit: Option<usize>,
}

impl LeadFilter {
    pub fn with_statuses(statuses: &[LeadStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            include_archived: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, lead: &Lead) -> bool {
        if !self.include_archived && lead.is_archived() {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&lead.status) {
            return false;
        }
        if self.unscored_only && lead.scored_at.is_some() {
            return false;
        }
        if self.with_phone_only && lead.phone.as_deref().map_or(true, str::is_empty) {
            return false;
        }
        true
    }
}

// ============ Consent ============

/// Channels a consent record covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConsentScope {
    Email,
    Sms,
    Call,
    All,
}

string_enum!(ConsentScope {
    Email => "email",
    Sms => "sms",
    Call => "call",
    All => "all",
});

/// Per-channel opt-in state for one email address.
///
/// A new opt-in replaces the whole record; flags are never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConsentRecord {
    pub email: String,
    pub email_marketing: bool,
    pub sms_marketing: bool,
    pub call_marketing: bool,
    pub opted_in_at: DateTime<Utc>,
    pub source: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConsentRecord {
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.opted_in_at > max_age
    }

    pub fn allows(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.email_marketing,
            Channel::Voice => self.call_marketing,
        }
    }

    pub fn all_revoked(&self) -> bool {
        !self.email_marketing && !self.sms_marketing && !self.call_marketing
    }
}

// ============ Contact attempts ============

/// Outreach channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Voice,
}

string_enum!(Channel {
    Email => "email",
    Voice => "voice",
});

/// Result of one contact attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Connected,
    Voicemail,
    NoAnswer,
    Busy,
    Disconnected,
    Interested,
    NotInterested,
    CallbackRequested,
}

string_enum!(Outcome {
    Connected => "connected",
    Voicemail => "voicemail",
    NoAnswer => "no_answer",
    Busy => "busy",
    Disconnected => "disconnected",
    Interested => "interested",
    NotInterested => "not_interested",
    CallbackRequested => "callback_requested",
});

/// Campaign flavour; selects both the email template and the call persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    Investment,
    Partnership,
    Demo,
}

string_enum!(CampaignType {
    Investment => "investment",
    Partnership => "partnership",
    Demo => "demo",
});

impl CampaignType {
    /// Sponsors (industry on the partnership list) get the partnership pitch,
    /// hot investors a demo invitation, everyone else the investment pitch.
    pub fn for_lead(lead: &Lead, partnership_industries: &[String]) -> Self {
        let industry = lead
            .industry
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        if !industry.is_empty()
            && partnership_industries
                .iter()
                .any(|candidate| industry.contains(candidate.as_str()))
        {
            return CampaignType::Partnership;
        }
        if lead.status == LeadStatus::Hot || lead.score >= 80 {
            CampaignType::Demo
        } else {
            CampaignType::Investment
        }
    }
}

/// Immutable record of one outreach action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ContactAttempt {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub channel: Channel,
    pub outcome: Outcome,
    pub campaign: Option<CampaignType>,
    pub duration_seconds: Option<i32>,
    pub notes: Option<String>,
    pub provider_ref: Option<String>,
    pub attempted_at: DateTime<Utc>,
    /// Derived from (channel, outcome); absent for terminal outcomes.
    pub follow_up_at: Option<DateTime<Utc>>,
}

/// Correlates a placed call with its lead until the completion webhook arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPlacement {
    pub call_ref: String,
    pub lead_id: Uuid,
    pub campaign: CampaignType,
    pub placed_at: DateTime<Utc>,
}

// ============ Email engagement ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventKind {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
}

string_enum!(EmailEventKind {
    Delivered => "delivered",
    Opened => "opened",
    Clicked => "clicked",
    Bounced => "bounced",
    Complained => "complained",
});

/// Delivery/engagement event reported by the email provider for one send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EmailEvent {
    pub id: Uuid,
    pub provider_ref: String,
    pub kind: EmailEventKind,
    pub recipient: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

// ============ Support tickets ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

string_enum!(TicketStatus {
    Open => "open",
    InProgress => "in_progress",
    Resolved => "resolved",
    Closed => "closed",
});

impl TicketStatus {
    fn rank(&self) -> u8 {
        match self {
            TicketStatus::Open => 0,
            TicketStatus::InProgress => 1,
            TicketStatus::Resolved => 2,
            TicketStatus::Closed => 3,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, TicketStatus::Open | TicketStatus::InProgress)
    }
}

/// Ordered low < medium < high < urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Urgent,
}

string_enum!(TicketPriority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Urgent => "urgent",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TicketCategory {
    InvestmentInquiry,
    PropertyQuestion,
    TechnicalSupport,
    GeneralSupport,
    Partnership,
    Complaint,
    FeatureRequest,
}

string_enum!(TicketCategory {
    InvestmentInquiry => "investment_inquiry",
    PropertyQuestion => "property_question",
    TechnicalSupport => "technical_support",
    GeneralSupport => "general_support",
    Partnership => "partnership",
    Complaint => "complaint",
    FeatureRequest => "feature_request",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Urgent,
}

string_enum!(Sentiment {
    Positive => "positive",
    Neutral => "neutral",
    Negative => "negative",
    Urgent => "urgent",
});

/// Inbound inquiry received by webhook or form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SupportTicket {
    pub id: Uuid,
    pub email: String,
    pub subject: String,
    pub body: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub category: TicketCategory,
    pub sentiment: Sentiment,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl SupportTicket {
    pub fn open(email: &CanonicalEmail, classification: &Classification) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.from.clone(),
            subject: email.subject.clone(),
            body: email.body.clone(),
            status: TicketStatus::Open,
            priority: classification.priority,
            category: classification.category,
            sentiment: classification.sentiment,
            created_at: email.timestamp,
            updated_at: email.timestamp,
            resolved_at: None,
            closed_at: None,
            escalated_at: None,
            archived_at: None,
        }
    }

    /// Moves the ticket forward. Status never moves backward from the engine;
    /// a same-state transition is a no-op.
    pub fn advance(&mut self, to: TicketStatus, now: DateTime<Utc>) -> Result<bool, String> {
        if to == self.status {
            return Ok(false);
        }
        if to.rank() < self.status.rank() {
            return Err(format!(
                "ticket {} cannot move from {} back to {}",
                self.id, self.status, to
            ));
        }
        self.status = to;
        self.updated_at = now;
        match to {
            TicketStatus::Resolved => self.resolved_at = Some(now),
            TicketStatus::Closed => {
                self.closed_at = Some(now);
                self.resolved_at.get_or_insert(now);
            }
            _ => {}
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub statuses: Vec<TicketStatus>,
    pub include_archived: bool,
}

impl TicketFilter {
    pub fn with_statuses(statuses: &[TicketStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            include_archived: false,
        }
    }

    pub fn matches(&self, ticket: &SupportTicket) -> bool {
        (self.include_archived || ticket.archived_at.is_none())
            && (self.statuses.is_empty() || self.statuses.contains(&ticket.status))
    }
}

// ============ Compliance ============

/// Ordered warning < error < critical; only critical blocks dispatch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

string_enum!(Severity {
    Warning => "warning",
    Error => "error",
    Critical => "critical",
});

/// Append-only audit record of a failed compliance check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ComplianceViolation {
    pub id: Uuid,
    pub rule_id: String,
    pub severity: Severity,
    pub channel: Channel,
    pub lead_id: Option<Uuid>,
    pub recipient: String,
    pub message: String,
    /// Snapshot of the rejected payload.
    pub payload: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

// ============ Inbound email ============

/// Provider-independent shape of an inbound email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CanonicalEmail {
    pub from: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Which capability produced an insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum InsightSource {
    Model,
    Rules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Classification {
    pub category: TicketCategory,
    pub sentiment: Sentiment,
    pub priority: TicketPriority,
    pub suggested_reply: String,
    pub source: InsightSource,
}

// ============ Reporting ============

/// Aggregates for one reporting week. Pure function of stored data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ReportCounts {
    pub leads_by_status: BTreeMap<String, u64>,
    pub emails_sent: u64,
    pub emails_failed: u64,
    pub emails_delivered: u64,
    pub emails_opened: u64,
    pub emails_clicked: u64,
    pub emails_bounced: u64,
    pub call_outcomes: BTreeMap<String, u64>,
    pub tickets_opened: u64,
    pub tickets_resolved: u64,
    pub avg_resolution_hours: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WeeklyReport {
    /// Monday of the reported week.
    pub week_start: NaiveDate,
    pub counts: ReportCounts,
    pub generated_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}
