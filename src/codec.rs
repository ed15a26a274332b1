//! Self-describing byte-string codec and URL-component escaping.
//!
//! Opaque bytes travel as `u` + URL-safe base64 without padding; the prefix
//! names the method so additional encodings can be introduced later without
//! breaking existing strings. URL components (actor ids, bucket keys) are
//! escaped by substituting `:` and `/` before percent-encoding, so they can
//! be embedded in object URLs and HTTP path segments and recovered
//! byte-identically.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use std::fmt;

/// Prefix byte naming the base64url encoding method.
const METHOD_BASE64URL: char = 'u';

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    Empty,
    UnknownMethod(char),
    InvalidBase64(String),
    InvalidEscape(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Empty => write!(f, "empty encoded string"),
            CodecError::UnknownMethod(c) => write!(f, "unknown encoding method: {c:?}"),
            CodecError::InvalidBase64(msg) => write!(f, "invalid base64: {msg}"),
            CodecError::InvalidEscape(msg) => write!(f, "invalid escape: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode arbitrary bytes as a self-describing string.
pub fn encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(1 + (bytes.len() * 4).div_ceil(3));
    out.push(METHOD_BASE64URL);
    out.push_str(&URL_SAFE_NO_PAD.encode(bytes));
    out
}

/// Decode a string produced by [`encode_bytes`].
pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, CodecError> {
    let mut chars = encoded.chars();
    match chars.next() {
        None => Err(CodecError::Empty),
        Some(METHOD_BASE64URL) => URL_SAFE_NO_PAD
            .decode(chars.as_str())
            .map_err(|e| CodecError::InvalidBase64(e.to_string())),
        Some(other) => Err(CodecError::UnknownMethod(other)),
    }
}

/// Characters that survive percent-encoding untouched. `!` and `~` are
/// deliberately absent even though URLs allow them bare: they are the
/// substitution targets for `:` and `/`, so literal occurrences must be
/// percent-encoded or decoding could not tell the two apart.
fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'*' | b'\'' | b'(' | b')')
}

/// Escape a URL component so it can sit inside an object URL or an HTTP
/// path segment: `:` becomes `!`, `/` becomes `~`, and every other byte
/// outside the unreserved set (including literal `!`, `~`, and `%`) is
/// percent-encoded. Any component round-trips byte-identically through
/// [`unescape_component`].
pub fn escape_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for b in component.bytes() {
        match b {
            b':' => out.push('!'),
            b'/' => out.push('~'),
            _ if is_unreserved(b) => out.push(b as char),
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
    out
}

/// Invert [`escape_component`]: bare `!` and `~` restore `:` and `/`,
/// percent escapes restore the bytes they encode. A percent-encoded `%21`
/// or `%7E` therefore decodes to a literal `!` or `~` and is never
/// mistaken for a substitution.
pub fn unescape_component(escaped: &str) -> Result<String, CodecError> {
    let bytes = escaped.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'!' => {
                decoded.push(b':');
                i += 1;
            }
            b'~' => {
                decoded.push(b'/');
                i += 1;
            }
            b'%' => {
                if i + 3 > bytes.len() {
                    return Err(CodecError::InvalidEscape("truncated percent escape".into()));
                }
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .map_err(|_| CodecError::InvalidEscape("non-ascii escape".into()))?;
                let value = u8::from_str_radix(hex, 16)
                    .map_err(|_| CodecError::InvalidEscape(format!("bad hex digits: {hex}")))?;
                decoded.push(value);
                i += 3;
            }
            other => {
                decoded.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(decoded)
        .map_err(|_| CodecError::InvalidEscape("escapes decode to invalid utf-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_with_method_prefix() {
        let encoded = encode_bytes(b"hello");
        assert!(encoded.starts_with('u'));
        assert_eq!(decode_bytes(&encoded).unwrap(), b"hello");
    }

    #[test]
    fn decodes_empty_payload() {
        assert_eq!(decode_bytes("u").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rejects_missing_prefix() {
        assert_eq!(decode_bytes("").unwrap_err(), CodecError::Empty);
        assert_eq!(
            decode_bytes("zAAAA").unwrap_err(),
            CodecError::UnknownMethod('z')
        );
    }

    #[test]
    fn rejects_invalid_base64_body() {
        assert!(matches!(
            decode_bytes("u!!!").unwrap_err(),
            CodecError::InvalidBase64(_)
        ));
    }

    #[test]
    fn escapes_did_style_actors() {
        let actor = "did:web:a.test";
        let escaped = escape_component(actor);
        assert_eq!(escaped, "did!web!a.test");
        assert_eq!(unescape_component(&escaped).unwrap(), actor);
    }

    #[test]
    fn literal_substitution_targets_are_percent_encoded() {
        // A literal `!` or `~` must not collide with a substituted `:`
        // or `/`.
        assert_eq!(escape_component("a!b"), "a%21b");
        assert_eq!(escape_component("x~y"), "x%7Ey");
        assert_eq!(unescape_component("a%21b").unwrap(), "a!b");
        assert_eq!(unescape_component("a!b").unwrap(), "a:b");

        for component in ["a!b", "x~y", "did:web:bang!actor", "mix!~:/%", "!~", "%21"] {
            let escaped = escape_component(component);
            assert_eq!(
                unescape_component(&escaped).unwrap(),
                component,
                "{component:?} failed to round-trip via {escaped:?}"
            );
        }
    }

    #[test]
    fn round_trips_reserved_characters() {
        let component = "did:web:a.test/profile?x=1#frag %";
        let escaped = escape_component(component);
        assert!(!escaped.contains(':'));
        assert!(!escaped.contains('/'));
        assert!(!escaped.contains('?'));
        assert!(!escaped.contains('#'));
        assert!(!escaped.contains(' '));
        assert_eq!(unescape_component(&escaped).unwrap(), component);
    }

    #[test]
    fn rejects_truncated_escape() {
        assert!(unescape_component("abc%2").is_err());
        assert!(unescape_component("abc%zz").is_err());
    }
}
