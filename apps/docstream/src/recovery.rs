//! Three-tier recovery of JSON fragments captured mid-stream.
//!
//! Section content arrives as text cut at arbitrary token boundaries, often
//! wrapped in markdown fences by the model. Recovery is a pure function of
//! the raw text, the expected shape, and whether the section has been marked
//! complete; identical inputs always produce identical results.
//!
//! Tier order, first success wins:
//! 1. sanitize + native parse,
//! 2. truncated-array completion (only while the section is still
//!    streaming; a best-effort preview, never the final answer),
//! 3. general repair (only once the section is complete, as the last resort
//!    before declaring the section failed).

use serde_json::Value;
use thiserror::Error;

use crate::section::SectionShape;

/// Upper bound on how much offending content a diagnostic may carry.
const DIAGNOSTIC_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("section produced no content")]
    Empty,

    #[error("content did not recover to a JSON {expected}: {preview}")]
    Unrecoverable { expected: &'static str, preview: String },
}

/// Outcome of a single recovery tier.
enum TierOutcome {
    Done(Value),
    Retry,
}

/// Recovers a structured value from raw section content.
///
/// While the section is still streaming (`is_complete == false`) the
/// truncation heuristic may drop a half-written trailing element to produce
/// a preview. Once the section is complete the heuristic is skipped so a
/// genuinely malformed final payload surfaces as an error instead of a
/// silently shortened result.
pub fn recover(
    raw: &str,
    shape: SectionShape,
    is_complete: bool,
) -> Result<Value, RecoveryError> {
    let text = sanitize(raw);
    if text.is_empty() {
        return Err(RecoveryError::Empty);
    }

    if let TierOutcome::Done(value) = parse_native(text, shape) {
        return Ok(value);
    }

    let fallback = if is_complete {
        repair(text, shape)
    } else {
        complete_truncated_array(text, shape)
    };
    if let TierOutcome::Done(value) = fallback {
        return Ok(value);
    }

    Err(RecoveryError::Unrecoverable {
        expected: match shape {
            SectionShape::Array => "array",
            SectionShape::Object => "object",
        },
        preview: bounded_preview(text),
    })
}

/// Strips a leading BOM and markdown code fences (```json ... ``` or
/// ``` ... ```), then trims.
fn sanitize(raw: &str) -> &str {
    let text = raw.trim_start_matches('\u{feff}').trim();
    let inner = if let Some(stripped) = text.strip_prefix("```json") {
        stripped
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
    } else {
        return text;
    };
    let inner = inner.trim_start();
    inner.strip_suffix("```").map(str::trim).unwrap_or(inner)
}

/// Tier 1: direct parse, accepted only when it yields the expected shape.
fn parse_native(text: &str, shape: SectionShape) -> TierOutcome {
    match serde_json::from_str::<Value>(text) {
        Ok(value) if shape.matches(&value) => TierOutcome::Done(value),
        _ => TierOutcome::Retry,
    }
}

/// Tier 2: recovers the common "N fully-formed elements plus one element
/// still being written" truncation shape of a streamed array.
///
/// The text is cut back to the end of its last fully-formed top-level
/// element (tracked with a string- and escape-aware scan), a dangling comma
/// is dropped, and the array is closed. Accepted only if the result parses.
fn complete_truncated_array(text: &str, shape: SectionShape) -> TierOutcome {
    if !text.starts_with('[') || text.ends_with(']') {
        return TierOutcome::Retry;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    // Byte offset just past the last complete top-level element.
    let mut last_complete = 1usize;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                if depth == 1 {
                    last_complete = i + 1;
                }
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 1 {
                    last_complete = i + 1;
                }
            }
            // A comma at the top level marks the end of a bare scalar
            // element (number, true, false, null).
            ',' if depth == 1 => last_complete = i,
            _ => {}
        }
    }

    let mut candidate = text[..last_complete]
        .trim_end()
        .trim_end_matches(',')
        .trim_end()
        .to_string();
    candidate.push(']');

    match serde_json::from_str::<Value>(&candidate) {
        Ok(value) if shape.matches(&value) => TierOutcome::Done(value),
        _ => TierOutcome::Retry,
    }
}

/// Tier 3: generic repair pass over a payload the service claims is final.
/// Quotes bare object keys, closes an unterminated string, drops trailing
/// commas, and balances brackets and braces; accepted only if the result
/// parses to the expected shape.
fn repair(text: &str, shape: SectionShape) -> TierOutcome {
    let repaired = quote_bare_keys(text);
    let repaired = close_open_string(repaired);
    let repaired = strip_trailing_commas(&repaired);
    let repaired = balance_delimiters(&repaired);

    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) if shape.matches(&value) => TierOutcome::Done(value),
        _ => TierOutcome::Retry,
    }
}

/// Wraps unquoted object keys in double quotes (`{name: 1}` -> `{"name": 1}`).
fn quote_bare_keys(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    let mut prev_significant = '\0';
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                prev_significant = '"';
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        // A key can only appear directly after '{' or ','.
        if (c.is_alphabetic() || c == '_') && matches!(prev_significant, '{' | ',') {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && chars[j] == ':' {
                out.push('"');
                out.push_str(&ident);
                out.push('"');
            } else {
                out.push_str(&ident);
            }
            prev_significant = 'k';
            continue;
        }
        out.push(c);
        if !c.is_whitespace() {
            prev_significant = c;
        }
        i += 1;
    }
    out
}

/// Closes a string literal left unterminated by a mid-token cut.
fn close_open_string(text: String) -> String {
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        }
    }
    if in_string {
        let mut out = text;
        out.push('"');
        out
    } else {
        text
    }
}

/// Drops commas that directly precede a closing bracket or brace.
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if c == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Appends the closers still owed at the end of the text, innermost first.
fn balance_delimiters(text: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ']' | '}' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = text.trim_end().trim_end_matches(',').to_string();
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Char-boundary-safe bounded prefix for diagnostics.
fn bounded_preview(text: &str) -> String {
    if text.chars().count() <= DIAGNOSTIC_PREVIEW_CHARS {
        return text.to_string();
    }
    let prefix: String = text.chars().take(DIAGNOSTIC_PREVIEW_CHARS).collect();
    format!("{prefix}...")
}
