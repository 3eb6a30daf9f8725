//! Final document assembly from accumulated section state.
//!
//! Runs once, at pipeline end. Every section is treated as complete at this
//! point, so recovery uses the native-parse and repair tiers only; a section
//! that still fails becomes a `Failed` entry rather than aborting its
//! siblings.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::dispatch::SectionStore;
use crate::recovery;
use crate::section::SectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentStatus {
    Complete,
    Partial,
    Failed,
}

/// Outcome of one section in the final document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SectionResult {
    Recovered { value: Value },
    Failed { error: String },
}

impl SectionResult {
    pub fn value(&self) -> Option<&Value> {
        match self {
            SectionResult::Recovered { value } => Some(value),
            SectionResult::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SectionResult::Failed { .. })
    }
}

/// The aggregate output of one generation. Built once, immutable after.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub sections: BTreeMap<SectionId, SectionResult>,
    pub status: DocumentStatus,
}

/// Assembles the final document from the section store.
///
/// Sections that never produced content (and never errored) are absent from
/// the result. `pipeline_failed` caps the status at `failed` while still
/// exposing every recovered section, so callers can render partial results
/// after a pipeline-level error.
pub fn assemble(store: &SectionStore, pipeline_failed: bool) -> Document {
    let mut sections = BTreeMap::new();
    let mut recovered = 0usize;
    let mut failed = 0usize;

    for (&id, state) in store.states() {
        if state.content.trim().is_empty() && state.error.is_none() {
            continue;
        }
        if let Some(error) = &state.error {
            sections.insert(
                id,
                SectionResult::Failed {
                    error: error.clone(),
                },
            );
            failed += 1;
            continue;
        }
        match recovery::recover(&state.content, id.shape(), true) {
            Ok(value) => {
                sections.insert(id, SectionResult::Recovered { value });
                recovered += 1;
            }
            Err(e) => {
                warn!(section = %id.as_wire(), error = %e, "section failed recovery at aggregation");
                sections.insert(
                    id,
                    SectionResult::Failed {
                        error: e.to_string(),
                    },
                );
                failed += 1;
            }
        }
    }

    let status = if pipeline_failed {
        DocumentStatus::Failed
    } else if failed == 0 && recovered > 0 {
        DocumentStatus::Complete
    } else if recovered > 0 {
        DocumentStatus::Partial
    } else {
        DocumentStatus::Failed
    };

    Document { sections, status }
}
