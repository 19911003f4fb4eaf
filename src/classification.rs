//! Keyword classification of inbound email.
//!
//! Used whenever the language-model collaborator is absent or fails, and by the
//! morning ticket review. Always produces a complete [`Classification`].

use crate::models::{
    CanonicalEmail, Classification, InsightSource, Sentiment, TicketCategory, TicketPriority,
};

const URGENT_TERMS: &[&str] = &[
    "urgent",
    "emergency",
    "asap",
    "immediately",
    "right away",
    "critical",
];

const HIGH_TERMS: &[&str] = &[
    "complaint",
    "refund",
    "legal",
    "lawyer",
    "fraud",
    "unauthorized",
    "cannot access",
    "can't access",
    "locked out",
    "not working",
    "broken",
];

const LOW_TERMS: &[&str] = &[
    "feature request",
    "suggestion",
    "newsletter",
    "just wondering",
    "no rush",
    "whenever",
];

/// Checked in order; the first category with a hit wins.
const CATEGORY_TERMS: &[(TicketCategory, &[&str])] = &[
    (
        TicketCategory::Complaint,
        &[
            "complaint",
            "unhappy",
            "disappointed",
            "terrible",
            "unacceptable",
            "refund",
        ],
    ),
    (
        TicketCategory::TechnicalSupport,
        &[
            "login",
            "log in",
            "password",
            "error",
            "bug",
            "crash",
            "not working",
            "website",
            "wallet",
            "two-factor",
        ],
    ),
    (
        TicketCategory::Partnership,
        &[
            "partnership",
            "partner",
            "sponsor",
            "collaborate",
            "syndicate",
            "joint venture",
        ],
    ),
    (
        TicketCategory::FeatureRequest,
        &[
            "feature",
            "would be great if",
            "suggestion",
            "could you add",
            "roadmap",
        ],
    ),
    (
        TicketCategory::InvestmentInquiry,
        &[
            "invest",
            "returns",
            "yield",
            "token",
            "portfolio",
            "minimum investment",
            "dividend",
        ],
    ),
    (
        TicketCategory::PropertyQuestion,
        &[
            "property",
            "listing",
            "tenant",
            "rent",
            "building",
            "apartment",
            "occupancy",
        ],
    ),
];

const NEGATIVE_TERMS: &[&str] = &[
    "unhappy",
    "disappointed",
    "angry",
    "frustrated",
    "terrible",
    "worst",
    "unacceptable",
    "complaint",
];

const POSITIVE_TERMS: &[&str] = &[
    "thank",
    "great",
    "excited",
    "love",
    "interested",
    "appreciate",
    "looking forward",
];

fn contains_any(haystack: &str, terms: &[&str]) -> bool {
    terms.iter().any(|term| haystack.contains(term))
}

/// Priority from keyword scan: urgent terms win, then high, then low, else medium.
pub fn priority_by_keywords(text: &str) -> TicketPriority {
    let text = text.to_lowercase();
    if contains_any(&text, URGENT_TERMS) {
        TicketPriority::Urgent
    } else if contains_any(&text, HIGH_TERMS) {
        TicketPriority::High
    } else if contains_any(&text, LOW_TERMS) {
        TicketPriority::Low
    } else {
        TicketPriority::Medium
    }
}

pub fn category_by_keywords(text: &str) -> TicketCategory {
    let text = text.to_lowercase();
    CATEGORY_TERMS
        .iter()
        .find(|(_, terms)| contains_any(&text, terms))
        .map(|(category, _)| *category)
        .unwrap_or(TicketCategory::GeneralSupport)
}

pub fn sentiment_by_keywords(text: &str, priority: TicketPriority) -> Sentiment {
    if priority == TicketPriority::Urgent {
        return Sentiment::Urgent;
    }
    let text = text.to_lowercase();
    if contains_any(&text, NEGATIVE_TERMS) {
        Sentiment::Negative
    } else if contains_any(&text, POSITIVE_TERMS) {
        Sentiment::Positive
    } else {
        Sentiment::Neutral
    }
}

/// Generic acknowledgement used whenever no model-written reply is available.
pub fn acknowledgement_reply(
    name: Option<&str>,
    category: TicketCategory,
    priority: TicketPriority,
) -> String {
    let greeting = match name {
        Some(name) if !name.trim().is_empty() => format!("Hi {},", name.trim()),
        _ => "Hello,".to_string(),
    };
    let topic = match category {
        TicketCategory::InvestmentInquiry => "your investment question",
        TicketCategory::PropertyQuestion => "your question about one of our properties",
        TicketCategory::TechnicalSupport => "the technical issue you reported",
        TicketCategory::GeneralSupport => "your message",
        TicketCategory::Partnership => "your partnership inquiry",
        TicketCategory::Complaint => "your feedback",
        TicketCategory::FeatureRequest => "your suggestion",
    };
    let timing = match priority {
        TicketPriority::Urgent => "a member of our team will reach out within a few hours.",
        TicketPriority::High => "a member of our team will get back to you within one business day.",
        _ => "a member of our team will get back to you within two business days.",
    };
    format!(
        "{}\n\nThank you for contacting us about {}. We have opened a support ticket and {}\n\nBest regards,\nInvestor Relations",
        greeting, topic, timing
    )
}

/// Full keyword classification of an inbound email.
pub fn classify_by_keywords(email: &CanonicalEmail) -> Classification {
    let text = format!("{}\n{}", email.subject, email.body);
    let priority = priority_by_keywords(&text);
    let category = category_by_keywords(&text);
    let sentiment = sentiment_by_keywords(&text, priority);
    Classification {
        category,
        sentiment,
        priority,
        suggested_reply: acknowledgement_reply(email.from_name.as_deref(), category, priority),
        source: InsightSource::Rules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn email(subject: &str, body: &str) -> CanonicalEmail {
        CanonicalEmail {
            from: "jane@example.com".to_string(),
            from_name: Some("Jane".to_string()),
            to: vec!["support@acme.io".to_string()],
            subject: subject.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn urgent_keywords_set_urgent_priority_and_sentiment() {
        let c = classify_by_keywords(&email("URGENT", "I cannot log in to my wallet"));
        assert_eq!(c.priority, TicketPriority::Urgent);
        assert_eq!(c.sentiment, Sentiment::Urgent);
        assert_eq!(c.category, TicketCategory::TechnicalSupport);
        assert_eq!(c.source, InsightSource::Rules);
    }

    #[test]
    fn investment_questions_are_medium_priority() {
        let c = classify_by_keywords(&email(
            "Minimum investment",
            "What is the minimum investment for the Austin token offering?",
        ));
        assert_eq!(c.category, TicketCategory::InvestmentInquiry);
        assert_eq!(c.priority, TicketPriority::Medium);
    }

    #[test]
    fn complaints_win_over_other_categories() {
        let c = classify_by_keywords(&email(
            "Refund",
            "I am disappointed with the property update and want a refund",
        ));
        assert_eq!(c.category, TicketCategory::Complaint);
        assert_eq!(c.priority, TicketPriority::High);
        assert_eq!(c.sentiment, Sentiment::Negative);
    }

    #[test]
    fn unknown_text_is_general_support() {
        let c = classify_by_keywords(&email("Hello", "Quick note"));
        assert_eq!(c.category, TicketCategory::GeneralSupport);
        assert_eq!(c.priority, TicketPriority::Medium);
        assert_eq!(c.sentiment, Sentiment::Neutral);
        assert!(c.suggested_reply.starts_with("Hi Jane,"));
    }
}
