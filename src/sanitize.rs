// src/sanitize.rs (C7 MessageSanitizer)
//
// Strips HTML (not escape) and control characters from plaintext surfaces.
// Ciphertext bodies (E2EE DMs/groups) never pass through here — they are
// opaque base64 blobs. Grounded on `utils/message_sanitizer.py`'s
// bleach-with-empty-tag-allowlist approach, translated to `ammonia`'s
// equivalent empty tag set.

use ammonia::Builder;

/// Strips HTML tags and disallowed control characters, trims surrounding
/// whitespace, and rejects (returns `None`) if nothing printable survives.
pub fn sanitize_message(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let stripped = Builder::default().tags(std::collections::HashSet::new()).clean(trimmed).to_string();

    let cleaned: String = stripped
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect();

    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_not_escapes() {
        let out = sanitize_message("<b>hello</b> <script>alert(1)</script>world").unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn removes_control_characters_but_keeps_newlines() {
        let out = sanitize_message("line one\nline two\u{0007}").unwrap();
        assert_eq!(out, "line one\nline two");
    }

    #[test]
    fn empty_after_sanitize_is_rejected() {
        assert!(sanitize_message("   ").is_none());
        assert!(sanitize_message("<script>alert(1)</script>").is_none());
    }
}
