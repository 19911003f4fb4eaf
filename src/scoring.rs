//! Deterministic lead scoring.
//!
//! The weighted sum here is the fallback every higher-fidelity scorer degrades
//! to, so it must stay total and side-effect free.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Lead, LeadSource, LeadStatus};

/// Weights and thresholds for the weighted-sum scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub base: i32,
    pub company: i32,
    pub phone: i32,
    /// Added once per allow-listed industry term the lead matches.
    pub industry_match: i32,
    pub industry_cap: i32,
    pub referral: i32,
    pub recent_contact: i32,
    pub recent_contact_days: i64,
    pub hot_threshold: i32,
    pub warm_threshold: i32,
    /// Lower-case industry terms considered a high fit.
    pub high_fit_industries: Vec<String>,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            base: 50,
            company: 20,
            phone: 15,
            industry_match: 10,
            industry_cap: 20,
            referral: 15,
            recent_contact: 20,
            recent_contact_days: 14,
            hot_threshold: 80,
            warm_threshold: 60,
            high_fit_industries: [
                "real estate",
                "property",
                "finance",
                "fintech",
                "investment",
                "private equity",
                "wealth management",
                "construction",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Score plus the status bucket it maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadScore {
    pub score: i32,
    pub status: LeadStatus,
    pub reasoning: Option<String>,
}

pub fn clamp_score(raw: i64) -> i32 {
    raw.clamp(0, 100) as i32
}

/// ≥ hot threshold → hot, ≥ warm threshold → warm, else cold.
pub fn status_for_score(score: i32, weights: &ScoringWeights) -> LeadStatus {
    if score >= weights.hot_threshold {
        LeadStatus::Hot
    } else if score >= weights.warm_threshold {
        LeadStatus::Warm
    } else {
        LeadStatus::Cold
    }
}

/// Number of distinct allow-listed industries mentioned by the lead's industry field.
fn industry_matches(industry: Option<&str>, weights: &ScoringWeights) -> i32 {
    let Some(industry) = industry else {
        return 0;
    };
    let industry = industry.to_lowercase();
    weights
        .high_fit_industries
        .iter()
        .filter(|term| industry.contains(term.as_str()))
        .count() as i32
}

fn has_text(value: Option<&str>) -> bool {
    value.map_or(false, |v| !v.trim().is_empty())
}

/// Weighted-sum score for a lead snapshot. Same snapshot and `now` give the same result.
pub fn score_lead(lead: &Lead, weights: &ScoringWeights, now: DateTime<Utc>) -> LeadScore {
    let mut score = i64::from(weights.base);
    let mut reasons = vec![format!("base {}", weights.base)];

    if has_text(lead.company.as_deref()) {
        score += i64::from(weights.company);
        reasons.push(format!("company +{}", weights.company));
    }
    if has_text(lead.phone.as_deref()) {
        score += i64::from(weights.phone);
        reasons.push(format!("phone +{}", weights.phone));
    }

    let industry_bonus = (industry_matches(lead.industry.as_deref(), weights)
        * weights.industry_match)
        .min(weights.industry_cap);
    if industry_bonus > 0 {
        score += i64::from(industry_bonus);
        reasons.push(format!("industry +{}", industry_bonus));
    }

    if lead.source == LeadSource::Referral {
        score += i64::from(weights.referral);
        reasons.push(format!("referral +{}", weights.referral));
    }

    if let Some(last_contact) = lead.last_contact_at {
        let age = now - last_contact;
        if age >= chrono::Duration::zero()
            && age <= chrono::Duration::days(weights.recent_contact_days)
        {
            score += i64::from(weights.recent_contact);
            reasons.push(format!("recent contact +{}", weights.recent_contact));
        }
    }

    let score = clamp_score(score);
    LeadScore {
        score,
        status: status_for_score(score, weights),
        reasoning: Some(reasons.join(", ")),
    }
}

/// Writes a score into the lead. Status is only replaced while the lead is in a
/// scoring-owned state; contacted/not-interested leads keep theirs.
///
/// Returns true when the lead crossed from a non-engaged state into warm/hot.
pub fn apply_score(lead: &mut Lead, score: &LeadScore, now: DateTime<Utc>) -> bool {
    let before = lead.status;
    lead.score = clamp_score(i64::from(score.score));
    lead.scored_at = Some(now);
    lead.updated_at = now;
    if before.is_scoring_owned() {
        lead.status = score.status;
    }
    !before.is_engaged() && lead.status.is_engaged()
}
