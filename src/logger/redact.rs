//! Masking of sensitive `key = value` pairs in SQL text

use regex::Regex;
use std::sync::OnceLock;

/// Placeholder substituted for every redacted value
pub const REDACTED: &str = "[REDACTED]";

// Keyword groups whose assigned values are masked. Matching is
// case-insensitive and also hits compound names (`user_password`).
const SENSITIVE_KEYS: &[&str] = &[
    "password|passwd|pwd",
    "token|secret|api_key|apikey",
    "credit_card|card_number|cc_number",
    "ssn|social_security",
    "pin|otp",
];

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SENSITIVE_KEYS
            .iter()
            .map(|keys| {
                Regex::new(&format!(
                    r#"(?i)({keys})\s*=\s*(?:'[^']*'|"[^"]*"|[^'"\s,;)]+)"#
                ))
                .expect("redaction pattern is valid")
            })
            .collect()
    })
}

/// Replace the values of sensitive assignments with [`REDACTED`].
///
/// The field name is kept (`password=[REDACTED]`); runs of adjacent
/// placeholders collapse into one.
pub fn redact_sql(sql: &str) -> String {
    let mut out = sql.to_string();
    for pattern in patterns() {
        if pattern.is_match(&out) {
            out = pattern
                .replace_all(&out, format!("${{1}}={}", REDACTED).as_str())
                .into_owned();
        }
    }

    let doubled = format!("{} {}", REDACTED, REDACTED);
    while out.contains(&doubled) {
        out = out.replace(&doubled, REDACTED);
    }
    out
}
