//! Section identity and per-section streaming state.
//!
//! Every generation tracks a fixed, pre-declared set of sections. State is
//! advanced by a pure transition function so the machine is testable without
//! any transport or dispatch machinery attached.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::recovery;

/// A named, independently-tracked subcomponent of the generated document.
/// Wire ids are camelCase (`workExperience`, `hardSkill`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SectionId {
    Profile,
    Education,
    WorkExperience,
    Certification,
    Project,
    HardSkill,
    SoftSkill,
}

impl SectionId {
    /// The full section vocabulary, in document order.
    pub const ALL: [SectionId; 7] = [
        SectionId::Profile,
        SectionId::Education,
        SectionId::WorkExperience,
        SectionId::Certification,
        SectionId::Project,
        SectionId::HardSkill,
        SectionId::SoftSkill,
    ];

    /// Resolves a wire id. Unknown ids yield `None`; the caller decides
    /// whether to log and ignore.
    pub fn from_wire(wire: &str) -> Option<SectionId> {
        match wire {
            "profile" => Some(SectionId::Profile),
            "education" => Some(SectionId::Education),
            "workExperience" => Some(SectionId::WorkExperience),
            "certification" => Some(SectionId::Certification),
            "project" => Some(SectionId::Project),
            "hardSkill" => Some(SectionId::HardSkill),
            "softSkill" => Some(SectionId::SoftSkill),
            _ => None,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            SectionId::Profile => "profile",
            SectionId::Education => "education",
            SectionId::WorkExperience => "workExperience",
            SectionId::Certification => "certification",
            SectionId::Project => "project",
            SectionId::HardSkill => "hardSkill",
            SectionId::SoftSkill => "softSkill",
        }
    }

    /// Expected payload shape for this section: the profile streams as a
    /// single object, every other section as an array of entries.
    pub fn shape(self) -> SectionShape {
        match self {
            SectionId::Profile => SectionShape::Object,
            _ => SectionShape::Array,
        }
    }
}

/// JSON shape a section's payload must materialize into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionShape {
    Array,
    Object,
}

impl SectionShape {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            SectionShape::Array => value.is_array(),
            SectionShape::Object => value.is_object(),
        }
    }
}

/// A section-scoped event, decoded from a wire envelope by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum SectionEvent {
    Started,
    Content {
        delta: Option<String>,
        full: Option<String>,
    },
    Completed {
        final_content: Option<String>,
    },
    Errored {
        message: String,
    },
}

/// Accumulated state of one section.
///
/// `is_streaming` and `is_complete` are never both true; at rest both are
/// false. Once `error` is set, `is_streaming` is false. A fresh `Started`
/// event resets everything (the service may regenerate a section).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SectionState {
    pub content: String,
    pub is_streaming: bool,
    pub is_complete: bool,
    pub error: Option<String>,
}

impl SectionState {
    /// Pure transition function. Returns the successor state; never mutates.
    pub fn apply(&self, event: &SectionEvent) -> SectionState {
        match event {
            SectionEvent::Started => SectionState {
                content: String::new(),
                is_streaming: true,
                is_complete: false,
                error: None,
            },
            // A content event for a section not currently streaming still
            // applies; the section is moved to streaming defensively.
            SectionEvent::Content { delta, full } => {
                let content = match full {
                    Some(snapshot) => snapshot.clone(),
                    None => {
                        let mut accumulated = self.content.clone();
                        if let Some(delta) = delta {
                            accumulated.push_str(delta);
                        }
                        accumulated
                    }
                };
                SectionState {
                    content,
                    is_streaming: true,
                    is_complete: false,
                    error: None,
                }
            }
            // Valid from Idle as well as Streaming: single-shot sections
            // complete without a streaming phase.
            SectionEvent::Completed { final_content } => SectionState {
                content: final_content
                    .clone()
                    .unwrap_or_else(|| self.content.clone()),
                is_streaming: false,
                is_complete: true,
                error: None,
            },
            SectionEvent::Errored { message } => SectionState {
                content: self.content.clone(),
                is_streaming: false,
                is_complete: false,
                error: Some(message.clone()),
            },
        }
    }

    /// Best-effort structured view of the accumulated content. Mid-stream
    /// this runs the truncation heuristic; once complete it runs the full
    /// recovery path. `None` while nothing parseable has arrived yet.
    pub fn materialize(&self, shape: SectionShape) -> Option<Value> {
        recovery::recover(&self.content, shape, self.is_complete).ok()
    }
}
