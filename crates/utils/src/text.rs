/// Placeholder written in place of every redacted secret.
pub const REDACTED: &str = "[REDACTED]";

/// Replace every literal occurrence of `secret` in `text` with [`REDACTED`].
///
/// An empty secret would match between every character, so it leaves the
/// text untouched.
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, REDACTED)
}

/// Truncate `s` to at most `max_bytes`, backing off to the nearest char boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Return the last `max_bytes` of `s`, moving forward to the nearest char boundary.
pub fn tail_from_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
