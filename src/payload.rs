//! Payload framing
//!
//! A payload is any UTF-8 string. Payloads may carry headers: the encoded
//! form is `<MARKER><json-object>\n<body>`, where the marker is a
//! NUL-delimited tag no sane user payload begins with and the JSON encoder
//! never emits a raw newline, so the first newline terminates the header.
//! Payloads without the marker round-trip unchanged. The format is fixed;
//! changing it breaks payloads already sitting in lists.

use std::collections::HashMap;

use crate::error::QueueError;

/// Parsed payload headers
pub type HeaderMap = HashMap<String, String>;

const HEADER_MARKER: &str = "\u{0}hdr\u{0}";

/// Encode a payload body with headers attached.
///
/// Returns an error when the header map fails to serialize, which for a
/// string-to-string map only happens on pathological inputs.
pub fn with_headers(body: &str, headers: &HeaderMap) -> Result<String, QueueError> {
    let json = serde_json::to_string(headers)
        .map_err(|e| QueueError::InvalidPayload(format!("header encoding failed: {}", e)))?;
    Ok(format!("{}{}\n{}", HEADER_MARKER, json, body))
}

/// Split a raw payload into its optional headers and clear body.
///
/// A payload that starts with the marker but carries a malformed header
/// section is treated as header-less rather than dropped; at-least-once
/// delivery favors handing the consumer something over losing it.
pub fn decode(raw: &str) -> (Option<HeaderMap>, String) {
    let Some(rest) = raw.strip_prefix(HEADER_MARKER) else {
        return (None, raw.to_string());
    };
    let Some((json, body)) = rest.split_once('\n') else {
        return (None, raw.to_string());
    };
    match serde_json::from_str::<HeaderMap>(json) {
        Ok(headers) => (Some(headers), body.to_string()),
        Err(_) => (None, raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_payload_roundtrips() {
        let (headers, body) = decode("hello world");
        assert!(headers.is_none());
        assert_eq!(body, "hello world");
    }

    #[test]
    fn test_headers_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.insert("trace-id".to_string(), "abc123".to_string());
        headers.insert("retries".to_string(), "2".to_string());

        let encoded = with_headers("body text", &headers).unwrap();
        let (decoded, body) = decode(&encoded);
        assert_eq!(decoded.unwrap(), headers);
        assert_eq!(body, "body text");
    }

    #[test]
    fn test_body_with_newlines_survives() {
        let headers = HeaderMap::new();
        let encoded = with_headers("line1\nline2\n", &headers).unwrap();
        let (_, body) = decode(&encoded);
        assert_eq!(body, "line1\nline2\n");
    }

    #[test]
    fn test_malformed_header_falls_back_to_raw() {
        let raw = format!("{}not-json\nbody", super::HEADER_MARKER);
        let (headers, body) = decode(&raw);
        assert!(headers.is_none());
        assert_eq!(body, raw);
    }

    #[test]
    fn test_empty_body() {
        let mut headers = HeaderMap::new();
        headers.insert("k".to_string(), "v".to_string());
        let encoded = with_headers("", &headers).unwrap();
        let (decoded, body) = decode(&encoded);
        assert_eq!(decoded.unwrap().get("k").unwrap(), "v");
        assert_eq!(body, "");
    }
}
