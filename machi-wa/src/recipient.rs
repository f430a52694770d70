//! Recipient address validation and normalisation.
//!
//! The platform routes direct messages to `<digits>@c.us` and groups to
//! `<id>@g.us`. Callers may pass either a bare phone number (`15550001111`,
//! `+1 555 000 1111`) or a fully suffixed address; both end up in the
//! suffixed form. Normalisation is idempotent.

use crate::error::{SessionError, SessionResult};

/// Routing suffix for direct chats.
pub const DEFAULT_SUFFIX: &str = "c.us";

/// Routing suffix for group chats.
pub const GROUP_SUFFIX: &str = "g.us";

/// Longest identifier accepted before the `@`.
const MAX_ID_LEN: usize = 64;

/// Digit count bounds for a pairing phone number (E.164 allows at most 15).
const PHONE_DIGITS: std::ops::RangeInclusive<usize> = 7..=15;

/// Normalise `input` into `<id>@<suffix>`.
///
/// Bare identifiers may contain digits plus the usual phone punctuation
/// (`+`, spaces, `-`, parentheses), which is stripped. Suffixed identifiers
/// must use `suffix` or the group suffix and may contain digits and `-`.
///
/// # Errors
///
/// Returns [`SessionError::InvalidRecipientFormat`] when the input is empty,
/// carries an unknown suffix, or contains characters that cannot appear in
/// a platform identifier.
pub fn normalize_recipient(input: &str, suffix: &str) -> SessionResult<String> {
    let trimmed = input.trim();
    let invalid = || SessionError::InvalidRecipientFormat(input.to_string());

    if let Some((id, domain)) = trimmed.split_once('@') {
        if domain != suffix && domain != GROUP_SUFFIX {
            return Err(invalid());
        }
        if !is_valid_id(id, |c| c.is_ascii_digit() || c == '-') {
            return Err(invalid());
        }
        return Ok(format!("{id}@{domain}"));
    }

    let digits: String = trimmed
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-' | '(' | ')'))
        .collect();
    if !is_valid_id(&digits, |c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    Ok(format!("{digits}@{suffix}"))
}

/// Parse the phone number a pairing code is requested for.
///
/// Accepts international numbers with optional `+`, spaces, `-` and
/// parentheses and returns the bare digits.
///
/// # Errors
///
/// Returns [`SessionError::InvalidPhoneNumber`] when anything else is present
/// or the digit count is outside what a phone number can have.
pub fn pairing_phone(input: &str) -> SessionResult<String> {
    let digits: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-' | '(' | ')'))
        .collect();
    if digits.chars().all(|c| c.is_ascii_digit()) && PHONE_DIGITS.contains(&digits.len()) {
        Ok(digits)
    } else {
        Err(SessionError::InvalidPhoneNumber(input.to_string()))
    }
}

fn is_valid_id(id: &str, allowed: impl Fn(char) -> bool) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.chars().all(allowed)
        && id.chars().any(|c| c.is_ascii_digit())
}
