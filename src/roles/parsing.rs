//! Reading role replies
//!
//! Models wrap code in markdown fences and pad verdicts with prose. The
//! orchestrator only needs marker tokens and bare code, extracted here.

/// Marker the input and output gates use to refuse
pub const UNSAFE_MARKER: &str = "UNSAFE";
/// Marker the critic uses to send code back
pub const REJECT_MARKER: &str = "REJECT";
/// Marker the SQL checker uses to accept a query unchanged
pub const VALID_MARKER: &str = "VALID";

/// Strip a surrounding markdown fence
///
/// With a fence anywhere in the text, the body of the first fenced block is
/// returned (prose before or after is discarded). Without one, the trimmed
/// text is returned as is.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };

    // Skip the info string (```python, ```sql)
    let after_open = &trimmed[open + 3..];
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(after_open.len());
    let body = &after_open[body_start..];

    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    body.trim().to_string()
}

/// Input gate verdict: `UNSAFE` anywhere, any case
pub fn is_unsafe_input(verdict: &str) -> bool {
    verdict.to_uppercase().contains(UNSAFE_MARKER)
}

/// Output gate reply: refuses only when it opens with `UNSAFE`
pub fn is_unsafe_output(reply: &str) -> bool {
    reply.trim_start().to_uppercase().starts_with(UNSAFE_MARKER)
}

/// Critic verdict: `REJECT` anywhere
pub fn is_rejection(verdict: &str) -> bool {
    verdict.contains(REJECT_MARKER)
}

/// What the SQL checker said about a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlCheck {
    Valid,
    Corrected(String),
}

pub fn parse_sql_check(reply: &str) -> SqlCheck {
    let cleaned = strip_code_fences(reply);
    let head = cleaned.trim_end_matches(['.', '!']).trim();

    if head.eq_ignore_ascii_case(VALID_MARKER) || cleaned.is_empty() {
        SqlCheck::Valid
    } else {
        SqlCheck::Corrected(cleaned)
    }
}
