//! Small shared helpers: clocks, ids, and filesystem locations.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the per-user directory holding configuration and credentials.
const APP_DIR: &str = ".machi-wa";

/// Current wall-clock time in Unix milliseconds.
#[must_use]
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Generate a random identifier with the given prefix.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

/// The user's home directory, or the current directory when unknown.
#[must_use]
pub fn home_dir() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Default data directory (`~/.machi-wa`).
#[must_use]
pub fn default_data_dir() -> PathBuf {
    home_dir().join(APP_DIR)
}

/// Directory name used for the empty token.
const EMPTY_TOKEN: &str = "_";

/// Encode a session token as a single, reversible path component.
///
/// ASCII alphanumerics and `+ - . @` pass through, so phone numbers keep
/// their shape. Every other byte, `_` included, becomes `_XX` (upper-case
/// hex), as does a leading `.`. Distinct tokens never share a name.
#[must_use]
pub fn encode_token(token: &str) -> String {
    if token.is_empty() {
        return EMPTY_TOKEN.to_string();
    }

    let mut out = String::with_capacity(token.len());
    for (i, b) in token.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric()
            || matches!(b, b'+' | b'-' | b'@')
            || (b == b'.' && i > 0);
        if keep {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "_{b:02X}");
        }
    }
    out
}

/// Inverse of [`encode_token`].
///
/// Returns `None` for names [`encode_token`] would never produce.
#[must_use]
pub fn decode_token(name: &str) -> Option<String> {
    if name == EMPTY_TOKEN {
        return Some(String::new());
    }

    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = bytes.get(i + 1..i + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    let token = String::from_utf8(out).ok()?;
    (encode_token(&token) == name).then_some(token)
}
