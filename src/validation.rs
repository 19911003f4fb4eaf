//! Contact-address validation shared by intake, the compliance gate and the
//! voice dispatcher.

use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use std::sync::OnceLock;

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    // RFC 5322 simplified: local@domain.tld
    EMAIL.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    })
}

/// Validate email address
///
/// Checks for:
/// - Minimum length and presence of `@` and `.`
/// - Placeholder patterns typed into lead forms (repeated digits)
/// - Valid local part and domain structure
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    let fake_patterns = ["999999", "111111", "000000", "123456789"];
    for pattern in &fake_patterns {
        if email.contains(pattern) {
            tracing::warn!(
                "Invalid email detected (placeholder pattern '{}'): {}",
                pattern,
                email
            );
            return false;
        }
    }

    if !email_regex().is_match(email) {
        tracing::debug!("Invalid email format: {}", email);
        return false;
    }

    true
}

/// Extracts the bare address from `"Jane Doe <jane@x.com>"` style headers and
/// lower-cases it. Returns the trimmed input when there are no angle brackets.
pub fn bare_address(raw: &str) -> String {
    static ANGLE: OnceLock<Regex> = OnceLock::new();
    let angle = ANGLE.get_or_init(|| Regex::new(r"<([^>]+)>").expect("angle regex is valid"));

    let address = angle
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw);
    address.trim().trim_matches('"').to_lowercase()
}

/// Display name portion of an address header, if present.
pub fn display_name(raw: &str) -> Option<String> {
    let (name, _) = raw.split_once('<')?;
    let name = name.trim().trim_matches('"').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Maps an ISO 3166 alpha-2 code from configuration to a numbering region.
pub fn region_from_code(code: &str) -> Option<CountryId> {
    let region = match code.trim().to_uppercase().as_str() {
        "US" => CountryId::US,
        "CA" => CountryId::CA,
        "GB" => CountryId::GB,
        "BR" => CountryId::BR,
        "PT" => CountryId::PT,
        "DE" => CountryId::DE,
        "FR" => CountryId::FR,
        "ES" => CountryId::ES,
        "AE" => CountryId::AE,
        "SG" => CountryId::SG,
        "AU" => CountryId::AU,
        _ => return None,
    };
    Some(region)
}

/// Validate and normalize a phone number for outbound dialing.
///
/// Numbers without a country prefix are parsed against `region`. Returns the
/// E.164 form (`+16502530000`) or a short reason.
pub fn normalize_phone(raw: &str, region: CountryId) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().filter(|c| c.is_ascii_digit()).count() < 7 {
        return Err("Phone too short".to_string());
    }

    match phonenumber::parse(Some(region), trimmed) {
        Ok(number) => {
            if phonenumber::is_valid(&number) {
                let formatted = number.format().mode(Mode::E164).to_string();
                tracing::debug!("Valid phone: {} -> {}", raw, formatted);
                Ok(formatted)
            } else {
                Err("Invalid phone number".to_string())
            }
        }
        Err(e) => Err(format!("Parse error: {:?}", e)),
    }
}

/// True for strings already in E.164 shape (`+` followed by 8-15 digits).
pub fn is_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}
