//! Wire envelope schema for the generation stream.
//!
//! One envelope per logical server message, carried on a `data: ` line of
//! the chunked response body. Field names are camelCase on the wire.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Event kind of a wire envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeType {
    SectionStarted,
    SectionContent,
    SectionCompleted,
    SectionError,
    GenerationComplete,
    Error,
}

/// One parsed unit of the wire protocol.
///
/// Everything except `type` is optional on the wire; the dispatcher decides
/// which fields a given kind actually requires and degrades gracefully when
/// they are missing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Wire id of the affected section; present for section-scoped kinds.
    #[serde(default)]
    pub section: Option<String>,
    /// Incremental content delta (may be empty).
    #[serde(default)]
    pub content: Option<String>,
    /// Authoritative snapshot superseding accumulated content.
    #[serde(default)]
    pub full_content: Option<String>,
    /// Failure reason for `sectionError` / `error`.
    #[serde(default)]
    pub error: Option<String>,
    /// Final per-section contents; only on `generationComplete`.
    #[serde(default)]
    pub sections: Option<HashMap<String, String>>,
    /// Producer-side emission time. Advisory only; never used for ordering.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn parse(json: &str) -> Result<Envelope, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Builds the error envelope the transport reader synthesizes when the
    /// stream ends without a terminal envelope having been seen.
    pub fn synthetic_error(message: &str) -> Envelope {
        Envelope {
            kind: EnvelopeType::Error,
            section: None,
            content: None,
            full_content: None,
            error: Some(message.to_string()),
            sections: None,
            timestamp: None,
        }
    }

    /// `generationComplete` and `error` are the only kinds that end the
    /// pipeline.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EnvelopeType::GenerationComplete | EnvelopeType::Error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_section_content_envelope() {
        let envelope = Envelope::parse(
            r#"{"type": "sectionContent", "section": "education", "content": "[{\"deg", "timestamp": "2026-08-29T10:15:00Z"}"#,
        )
        .unwrap();
        assert_eq!(envelope.kind, EnvelopeType::SectionContent);
        assert_eq!(envelope.section.as_deref(), Some("education"));
        assert_eq!(envelope.content.as_deref(), Some("[{\"deg"));
        assert!(envelope.full_content.is_none());
        assert!(envelope.timestamp.is_some());
        assert!(!envelope.is_terminal());
    }

    #[test]
    fn test_parse_full_content_snapshot() {
        let envelope = Envelope::parse(
            r#"{"type": "sectionContent", "section": "profile", "content": "", "fullContent": "{\"name\": \"Ada\"}"}"#,
        )
        .unwrap();
        assert_eq!(envelope.full_content.as_deref(), Some("{\"name\": \"Ada\"}"));
    }

    #[test]
    fn test_parse_generation_complete_with_sections_map() {
        let envelope = Envelope::parse(
            r#"{"type": "generationComplete", "sections": {"hardSkill": "[\"Rust\"]"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.kind, EnvelopeType::GenerationComplete);
        assert!(envelope.is_terminal());
        let sections = envelope.sections.unwrap();
        assert_eq!(sections.get("hardSkill").map(String::as_str), Some("[\"Rust\"]"));
    }

    #[test]
    fn test_parse_unknown_type_is_an_error() {
        assert!(Envelope::parse(r#"{"type": "heartbeat"}"#).is_err());
    }

    #[test]
    fn test_parse_missing_type_is_an_error() {
        assert!(Envelope::parse(r#"{"section": "profile"}"#).is_err());
    }

    #[test]
    fn test_synthetic_error_is_terminal() {
        let envelope = Envelope::synthetic_error("stream ended unexpectedly");
        assert_eq!(envelope.kind, EnvelopeType::Error);
        assert!(envelope.is_terminal());
        assert_eq!(envelope.error.as_deref(), Some("stream ended unexpectedly"));
    }
}
