//! docstream: client pipeline for the streaming document-generation service.
//!
//! The service answers a generation request with a chunked body of
//! `data: <json>` envelopes describing per-section progress; the payload of
//! a content envelope is itself JSON that may be cut mid-token. This crate
//! reassembles that stream: framing, per-section state machines, best-effort
//! JSON recovery, aggregation into a final document, and cooperative
//! cancellation.
//!
//! Entry point: [`GenerationPipeline::start`], which returns a
//! [`PipelineHandle`] for observing, cancelling, and awaiting the run.

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod recovery;
pub mod section;
pub mod transport;

pub use aggregate::{Document, DocumentStatus, SectionResult};
pub use config::Config;
pub use errors::PipelineError;
pub use models::{GenerationRequest, UserProfile};
pub use pipeline::{
    CancelHandle, GenerationPipeline, PipelineHandle, PipelineSnapshot, PipelineStatus,
};
pub use section::{SectionId, SectionState};
