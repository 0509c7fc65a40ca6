//! Scrubbing of credentials from error text before it reaches logs,
//! metric labels or record metadata.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

pub const REDACTED: &str = "[REDACTED]";

/// Longest sanitized message, in characters
pub const MAX_MESSAGE_CHARS: usize = 240;

static JWT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}")
        .expect("jwt regex is valid")
});

static AUTH_SCHEME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bearer|basic)\s+[A-Za-z0-9._~+/=-]{6,}")
        .expect("auth scheme regex is valid")
});

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(password|passwd|secret|api[_-]?key|apikey|access[_-]?token|auth[_-]?token|token)(["']?\s*[=:]\s*["']?)[^\s&,;"']+"#,
    )
    .expect("key/value regex is valid")
});

static LONG_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9_+/=-]{24,}").expect("long run regex is valid"));

/// Replace token-like substrings with [`REDACTED`] and bound the length.
pub fn sanitize(message: &str) -> String {
    let out = JWT.replace_all(message, REDACTED);
    let out = AUTH_SCHEME.replace_all(&out, |caps: &Captures| format!("{} {}", &caps[1], REDACTED));
    let out = KEY_VALUE.replace_all(&out, |caps: &Captures| {
        format!("{}{}{}", &caps[1], &caps[2], REDACTED)
    });
    let out = LONG_RUN.replace_all(&out, |caps: &Captures| {
        let run = &caps[0];
        let has_digit = run.chars().any(|c| c.is_ascii_digit());
        let has_upper = run.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = run.chars().any(|c| c.is_ascii_lowercase());
        // Mixed-class runs look like keys; plain words and hex-free ids do not
        if (has_digit && (has_upper || has_lower)) || (has_upper && has_lower) {
            REDACTED.to_string()
        } else {
            run.to_string()
        }
    });

    truncate(&out, MAX_MESSAGE_CHARS)
}

fn truncate(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}
