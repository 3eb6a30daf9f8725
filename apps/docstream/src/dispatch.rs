//! Event dispatcher: classifies wire envelopes and applies them to the
//! per-section store.
//!
//! The store is only ever mutated from the single dispatch loop, so no
//! locking is involved; ordering within a section follows arrival order.

use std::collections::BTreeMap;

use tracing::debug;

use crate::envelope::{Envelope, EnvelopeType};
use crate::section::{SectionEvent, SectionId, SectionState};

/// In-memory record of one state machine per known section.
///
/// Entries for the full section vocabulary are created empty when the
/// pipeline starts; envelopes for unknown sections never create new ones.
#[derive(Debug, Clone)]
pub struct SectionStore {
    sections: BTreeMap<SectionId, SectionState>,
}

impl Default for SectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionStore {
    pub fn new() -> Self {
        SectionStore {
            sections: SectionId::ALL
                .into_iter()
                .map(|id| (id, SectionState::default()))
                .collect(),
        }
    }

    pub fn states(&self) -> &BTreeMap<SectionId, SectionState> {
        &self.sections
    }

    fn apply(&mut self, id: SectionId, event: SectionEvent) {
        let state = self.sections.entry(id).or_default();
        *state = state.apply(&event);
    }
}

/// What the dispatch loop should do after one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Keep reading.
    Continue,
    /// `generationComplete` observed; run aggregation and exit.
    Complete,
    /// Pipeline-level error (explicit envelope or synthesized at stream
    /// end). Sections still streaming keep their partial content.
    Failed(String),
}

/// Routes one envelope to the store or to pipeline-level handling.
pub fn dispatch(store: &mut SectionStore, envelope: &Envelope) -> DispatchOutcome {
    match envelope.kind {
        EnvelopeType::SectionStarted => {
            if let Some(id) = section_id(envelope) {
                store.apply(id, SectionEvent::Started);
            }
            DispatchOutcome::Continue
        }
        EnvelopeType::SectionContent => {
            if let Some(id) = section_id(envelope) {
                store.apply(
                    id,
                    SectionEvent::Content {
                        delta: envelope.content.clone(),
                        full: envelope.full_content.clone(),
                    },
                );
            }
            DispatchOutcome::Continue
        }
        EnvelopeType::SectionCompleted => {
            if let Some(id) = section_id(envelope) {
                store.apply(
                    id,
                    SectionEvent::Completed {
                        final_content: envelope.content.clone(),
                    },
                );
            }
            DispatchOutcome::Continue
        }
        EnvelopeType::SectionError => {
            if let Some(id) = section_id(envelope) {
                store.apply(
                    id,
                    SectionEvent::Errored {
                        message: envelope
                            .error
                            .clone()
                            .unwrap_or_else(|| "section generation failed".to_string()),
                    },
                );
            }
            DispatchOutcome::Continue
        }
        EnvelopeType::GenerationComplete => {
            // The terminal envelope may carry authoritative final contents.
            if let Some(finals) = &envelope.sections {
                for (wire, content) in finals {
                    match SectionId::from_wire(wire) {
                        Some(id) => store.apply(
                            id,
                            SectionEvent::Completed {
                                final_content: Some(content.clone()),
                            },
                        ),
                        None => debug!(section = %wire, "ignoring unknown section in final map"),
                    }
                }
            }
            DispatchOutcome::Complete
        }
        EnvelopeType::Error => DispatchOutcome::Failed(
            envelope
                .error
                .clone()
                .unwrap_or_else(|| "generation failed".to_string()),
        ),
    }
}

fn section_id(envelope: &Envelope) -> Option<SectionId> {
    match envelope.section.as_deref() {
        Some(wire) => {
            let id = SectionId::from_wire(wire);
            if id.is_none() {
                debug!(section = %wire, "ignoring envelope for unknown section");
            }
            id
        }
        None => {
            debug!(kind = ?envelope.kind, "section-scoped envelope without section id");
            None
        }
    }
}
