//! Fixed email templates and call scripts.
//!
//! Every template renders an HTML part and a plain-text part from the same
//! paragraphs. Outward-facing mail always ends with the sender identification
//! line and an unsubscribe link; investment-facing mail adds the risk
//! disclosure.

use url::Url;

use crate::models::{CampaignType, CanonicalEmail, Lead, SupportTicket, WeeklyReport};

pub const RISK_DISCLOSURE: &str = "Investing involves risk, including possible loss of principal. \
This message is not an offer to sell or a solicitation to buy any security.";

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub company_name: String,
    pub public_base_url: String,
}

impl TemplateContext {
    pub fn new(company_name: &str, public_base_url: &str) -> Self {
        Self {
            company_name: company_name.to_string(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// One-click unsubscribe URL for `email`, with the address query-encoded.
pub fn unsubscribe_link(ctx: &TemplateContext, email: &str) -> String {
    let base = format!("{}/api/v1/unsubscribe", ctx.public_base_url);
    match Url::parse_with_params(&base, &[("email", email), ("scope", "email")]) {
        Ok(url) => url.to_string(),
        Err(e) => {
            tracing::warn!("Invalid public base URL '{}': {}", ctx.public_base_url, e);
            format!("{}?email={}&scope=email", base, email)
        }
    }
}

struct Footer {
    disclosure: bool,
    unsubscribe: Option<String>,
}

fn compose(ctx: &TemplateContext, subject: String, paragraphs: &[String], footer: Footer) -> RenderedEmail {
    let mut html = String::from("<div style=\"font-family:Arial,sans-serif;line-height:1.5\">");
    for p in paragraphs {
        html.push_str("<p>");
        html.push_str(&escape_html(p).replace('\n', "<br>"));
        html.push_str("</p>");
    }
    let mut text = paragraphs.join("\n\n");

    html.push_str("<hr><p style=\"font-size:12px;color:#666\">");
    html.push_str(&escape_html(&ctx.company_name));
    text.push_str("\n\n--\n");
    text.push_str(&ctx.company_name);

    if footer.disclosure {
        html.push_str("<br>");
        html.push_str(&escape_html(RISK_DISCLOSURE));
        text.push('\n');
        text.push_str(RISK_DISCLOSURE);
    }
    if let Some(link) = footer.unsubscribe {
        html.push_str(&format!(
            "<br><a href=\"{}\">Unsubscribe</a>",
            escape_html(&link)
        ));
        text.push_str(&format!("\nUnsubscribe: {}", link));
    }
    html.push_str("</p></div>");

    RenderedEmail {
        subject,
        html,
        text,
    }
}

/// Marketing email for one of the three campaign types.
pub fn render_campaign(ctx: &TemplateContext, campaign: CampaignType, lead: &Lead) -> RenderedEmail {
    let first = lead.first_name();
    let company = &ctx.company_name;
    let (subject, paragraphs) = match campaign {
        CampaignType::Investment => (
            format!("{}, fractional real estate with {}", first, company),
            vec![
                format!("Hi {},", first),
                format!(
                    "{} lets investors own tokenized shares of income-producing properties, \
                     starting from small minimums and with monthly distribution reports.",
                    company
                ),
                "If you'd like to see the current offerings, reply to this email and we'll \
                 send over the details."
                    .to_string(),
            ],
        ),
        CampaignType::Partnership => (
            format!(
                "Tokenizing {} properties with {}",
                lead.company.as_deref().unwrap_or("your"),
                company
            ),
            vec![
                format!("Hi {},", first),
                format!(
                    "We work with sponsors and developers to bring properties on-chain and open \
                     them to a wider investor base. Given your work in {}, we think there's a fit.",
                    lead.industry.as_deref().unwrap_or("real estate")
                ),
                "Would you be open to a 20-minute call next week?".to_string(),
            ],
        ),
        CampaignType::Demo => (
            format!("{}, your private walkthrough of {}", first, company),
            vec![
                format!("Hi {},", first),
                format!(
                    "You've shown strong interest in {}. We'd like to give you a live walkthrough \
                     of the platform and the properties currently open for investment.",
                    company
                ),
                "Pick any time that suits you by replying to this email.".to_string(),
            ],
        ),
    };

    compose(
        ctx,
        subject,
        &paragraphs,
        Footer {
            disclosure: campaign != CampaignType::Partnership,
            unsubscribe: Some(unsubscribe_link(ctx, &lead.email)),
        },
    )
}

/// Support auto-reply. Transactional, but still carries the unsubscribe link.
pub fn render_auto_reply(
    ctx: &TemplateContext,
    inbound: &CanonicalEmail,
    reply: &str,
    ticket: &SupportTicket,
) -> RenderedEmail {
    let subject = if inbound.subject.trim().is_empty() {
        format!("We received your message [#{}]", short_id(ticket))
    } else if inbound.subject.to_lowercase().starts_with("re:") {
        inbound.subject.clone()
    } else {
        format!("Re: {}", inbound.subject)
    };
    let paragraphs = vec![
        reply.trim().to_string(),
        format!("Ticket reference: {}", short_id(ticket)),
    ];
    compose(
        ctx,
        subject,
        &paragraphs,
        Footer {
            disclosure: false,
            unsubscribe: Some(unsubscribe_link(ctx, &inbound.from)),
        },
    )
}

pub fn render_weekly_report(ctx: &TemplateContext, report: &WeeklyReport) -> RenderedEmail {
    let c = &report.counts;
    let leads = c
        .leads_by_status
        .iter()
        .map(|(status, n)| format!("  {}: {}", status, n))
        .collect::<Vec<_>>()
        .join("\n");
    let calls = if c.call_outcomes.is_empty() {
        "  none".to_string()
    } else {
        c.call_outcomes
            .iter()
            .map(|(outcome, n)| format!("  {}: {}", outcome, n))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let latency = c
        .avg_resolution_hours
        .map(|h| format!("{:.1}h", h))
        .unwrap_or_else(|| "n/a".to_string());

    let paragraphs = vec![
        format!("Outreach summary for the week of {}.", report.week_start),
        format!("Leads by status:\n{}", leads),
        format!(
            "Email: {} sent, {} failed, {} delivered, {} opened, {} clicked, {} bounced",
            c.emails_sent,
            c.emails_failed,
            c.emails_delivered,
            c.emails_opened,
            c.emails_clicked,
            c.emails_bounced
        ),
        format!("Call outcomes:\n{}", calls),
        format!(
            "Tickets: {} opened, {} resolved, average resolution {}",
            c.tickets_opened, c.tickets_resolved, latency
        ),
    ];
    compose(
        ctx,
        format!("Weekly outreach report: week of {}", report.week_start),
        &paragraphs,
        Footer {
            disclosure: false,
            unsubscribe: None,
        },
    )
}

pub fn render_escalation(ctx: &TemplateContext, ticket: &SupportTicket) -> RenderedEmail {
    let paragraphs = vec![
        format!(
            "Ticket {} from {} has been unresolved since {} and was escalated to urgent.",
            ticket.id,
            ticket.email,
            ticket.created_at.format("%Y-%m-%d %H:%M UTC")
        ),
        format!(
            "Category: {}\nSentiment: {}\nStatus: {}",
            ticket.category, ticket.sentiment, ticket.status
        ),
        format!("Subject: {}", ticket.subject),
        ticket.body.clone(),
    ];
    compose(
        ctx,
        format!("[Escalated] {}", ticket.subject),
        &paragraphs,
        Footer {
            disclosure: false,
            unsubscribe: None,
        },
    )
}

fn short_id(ticket: &SupportTicket) -> String {
    ticket.id.simple().to_string()[..8].to_uppercase()
}

/// Voice assistant configuration for one campaign type.
#[derive(Debug, Clone, PartialEq)]
pub struct CallScript {
    /// Provider-side assistant id the call is placed with.
    pub script_id: String,
    pub persona: String,
    pub opening: String,
    pub talking_points: Vec<String>,
}

impl CallScript {
    /// Everything the assistant may say, for the compliance gate.
    pub fn spoken_text(&self) -> String {
        let mut text = self.opening.clone();
        for point in &self.talking_points {
            text.push('\n');
            text.push_str(point);
        }
        text
    }
}

pub fn call_script(campaign: CampaignType, lead: &Lead, company_name: &str) -> CallScript {
    let first = lead.first_name();
    match campaign {
        CampaignType::Investment => CallScript {
            script_id: "investment-intro".to_string(),
            persona: "Investor relations associate".to_string(),
            opening: format!(
                "Hi {}, this is the investor relations team at {}. Do you have two minutes?",
                first, company_name
            ),
            talking_points: vec![
                "Explain fractional ownership of income-producing properties.".to_string(),
                "Mention that all investments carry risk and past performance is not indicative."
                    .to_string(),
                "Offer to email the current offering documents.".to_string(),
            ],
        },
        CampaignType::Partnership => CallScript {
            script_id: "partnership-intro".to_string(),
            persona: "Partnerships lead".to_string(),
            opening: format!(
                "Hi {}, I'm calling from {} about tokenizing properties with {}.",
                first,
                company_name,
                lead.company.as_deref().unwrap_or("your team")
            ),
            talking_points: vec![
                "Ask about their current capital-raising process.".to_string(),
                "Describe the sponsor onboarding steps.".to_string(),
                "Propose a follow-up meeting with the partnerships team.".to_string(),
            ],
        },
        CampaignType::Demo => CallScript {
            script_id: "demo-booking".to_string(),
            persona: "Senior investment advisor".to_string(),
            opening: format!(
                "Hi {}, thanks for your interest in {}. I'd love to book you a live walkthrough.",
                first, company_name
            ),
            talking_points: vec![
                "Confirm their areas of interest.".to_string(),
                "Book a demo slot.".to_string(),
                "Remind them that investing involves risk.".to_string(),
            ],
        },
    }
}
