//! Record sanitization and wire encoding.
//!
//! Free-text fields can carry user secrets (API tokens pasted into cells or
//! echoed into tracebacks), so they are scrubbed before anything leaves the
//! process. All string fields then get their double quotes normalized to
//! single quotes for the downstream line-delimited consumer, and the record
//! is encoded as one compact JSON object in schema key order.

use super::record::EventRecord;

/// Prefix that introduces an API token.
const TOKEN_MARKER: &str = "hf_";

/// Number of token characters following the marker.
const TOKEN_BODY_LEN: usize = 38;

/// Replacement for a redacted token.
const REDACTION: &str = "<HF_API_KEY>";

/// Replaces every API token in `text` with the redaction placeholder.
///
/// A token is the 3-character marker plus the 38 characters that follow
/// it; a token truncated by the end of the string is redacted to
/// the end. Offsets are computed per character, so tokens embedded in
/// non-ASCII output (progress bars and the like) cannot split a code point.
///
/// # Examples
///
/// ```
/// use cellwatch::collector::redact_secrets;
///
/// let token = "hf_abcdefghijklmnopqrstuvwxyz0123456789AB";
/// assert_eq!(redact_secrets(token), "<HF_API_KEY>");
/// ```
pub fn redact_secrets(text: &str) -> String {
    let mut out = text.to_string();
    while let Some(start) = out.find(TOKEN_MARKER) {
        let body_start = start + TOKEN_MARKER.len();
        let end = char_offset(&out, body_start, TOKEN_BODY_LEN);
        out.replace_range(start..end, REDACTION);
    }
    out
}

/// Byte offset of the position `nchars` characters past `from`, clamped to
/// the end of the string. `from` must lie on a char boundary.
fn char_offset(s: &str, from: usize, nchars: usize) -> usize {
    s[from..]
        .char_indices()
        .nth(nchars)
        .map(|(i, _)| from + i)
        .unwrap_or(s.len())
}

/// Scrubs an outgoing event in place: token redaction on the free-text
/// fields, then quote normalization on every string field.
pub fn sanitize_event(event: &mut EventRecord) {
    for field in [
        &mut event.error_trace,
        &mut event.cell_output,
        &mut event.code_executed,
    ] {
        if field.contains(TOKEN_MARKER) {
            *field = redact_secrets(field);
        }
    }

    event.visit_strings_mut(|field| {
        if field.contains('"') {
            *field = field.replace('"', "'");
        }
    });
}

/// Encodes an event as compact JSON bytes, ready for submission.
pub fn encode_event(event: &EventRecord) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 3-char marker + 38-char body.
    const TOKEN: &str = "hf_abcdefghijklmnopqrstuvwxyz0123456789AB";

    #[test]
    fn full_token_is_fully_replaced() {
        assert_eq!(redact_secrets(TOKEN), REDACTION);
    }

    #[test]
    fn two_tokens_are_both_redacted() {
        let text = format!("export A={TOKEN}\nexport B={TOKEN}\n");
        assert_eq!(
            redact_secrets(&text),
            format!("export A={REDACTION}\nexport B={REDACTION}\n")
        );
    }

    #[test]
    fn truncated_trailing_token_is_redacted_to_end() {
        let text = format!("token: {}", &TOKEN[..10]);
        assert_eq!(redact_secrets(&text), format!("token: {REDACTION}"));
    }

    #[test]
    fn token_surrounded_by_multibyte_output_does_not_split_code_points() {
        let text = format!("██ {TOKEN} ██");
        assert_eq!(redact_secrets(&text), format!("██ {REDACTION} ██"));
    }

    #[test]
    fn text_without_marker_is_untouched() {
        let text = "print(1)\nHF_TOKEN is unset";
        assert_eq!(redact_secrets(text), text);
    }

    #[test]
    fn sanitize_redacts_free_text_and_normalizes_quotes() {
        let mut event = EventRecord::default();
        event.code_executed = format!("login(\"{TOKEN}\")");
        event.cell_output = "said \"hi\"".to_string();
        event.error_trace = format!("KeyError: \"{TOKEN}\"");
        event.notebook_name = "my \"notebook\"".to_string();

        sanitize_event(&mut event);

        assert_eq!(event.code_executed, format!("login('{REDACTION}')"));
        assert_eq!(event.cell_output, "said 'hi'");
        assert_eq!(event.error_trace, format!("KeyError: '{REDACTION}'"));
        // Non-free-text string fields only get quote normalization.
        assert_eq!(event.notebook_name, "my 'notebook'");
    }

    #[test]
    fn encoded_event_is_compact_json() {
        let event = EventRecord::default();
        let bytes = encode_event(&event).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("{\"event_time\":\"\""));
        assert!(!text.contains(": "));
    }
}
