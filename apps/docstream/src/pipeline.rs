//! Pipeline owner: starts the ingestion task, exposes observable snapshots,
//! cancellation, and the final document.
//!
//! The whole pipeline runs as one spawned task that suspends only at the
//! stream read; the section store is mutated from that single loop, so no
//! locking is involved. Cancellation is cooperative: it takes effect at the
//! next suspension point, and envelopes already framed keep being applied.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{assemble, Document, DocumentStatus};
use crate::config::Config;
use crate::dispatch::{dispatch, DispatchOutcome, SectionStore};
use crate::envelope::Envelope;
use crate::errors::PipelineError;
use crate::models::GenerationRequest;
use crate::section::{SectionId, SectionState};
use crate::transport::{decode_line, open_stream, ChunkDecoder, LineFramer};

/// Terminal and in-flight status of a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineStatus {
    Streaming,
    Complete,
    Partial,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        self != PipelineStatus::Streaming
    }
}

/// Readable snapshot of the run, refreshed after every processed envelope.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub sections: BTreeMap<SectionId, SectionState>,
    pub status: PipelineStatus,
}

impl PipelineSnapshot {
    fn initial() -> Self {
        PipelineSnapshot {
            sections: SectionStore::new().states().clone(),
            status: PipelineStatus::Streaming,
        }
    }
}

/// Entry point for running generations against the service.
#[derive(Clone)]
pub struct GenerationPipeline {
    client: reqwest::Client,
    config: Config,
}

impl GenerationPipeline {
    pub fn new(config: Config) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .expect("Failed to build HTTP client");
        GenerationPipeline { client, config }
    }

    /// Uses a caller-supplied client (shared pools, custom TLS, tests).
    pub fn with_client(client: reqwest::Client, config: Config) -> Self {
        GenerationPipeline { client, config }
    }

    /// Begins one generation and returns immediately. The returned handle is
    /// the only way to observe, cancel, or await the run.
    pub fn start(&self, request: GenerationRequest) -> PipelineHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (snapshot_tx, snapshot_rx) = watch::channel(PipelineSnapshot::initial());

        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("generation", %request_id);
        let task = tokio::spawn(
            run(
                self.client.clone(),
                self.config.clone(),
                request,
                cancel_rx,
                snapshot_tx,
            )
            .instrument(span),
        );

        PipelineHandle {
            cancel: CancelHandle {
                tx: Arc::new(cancel_tx),
            },
            snapshot_rx,
            task,
        }
    }
}

/// Cheap clonable abort switch, detachable from the handle so a UI can hold
/// it while something else awaits the result.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Idempotent: safe to call repeatedly and after natural completion.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Owner handle for one in-flight generation.
pub struct PipelineHandle {
    cancel: CancelHandle,
    snapshot_rx: watch::Receiver<PipelineSnapshot>,
    task: JoinHandle<Result<Document, PipelineError>>,
}

impl PipelineHandle {
    /// Requests cancellation; takes effect at the next stream suspension
    /// point. Idempotent and a no-op after completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current sections + status.
    pub fn snapshot(&self) -> PipelineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Change notifications, one per processed envelope.
    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Awaits the terminal document. `Err` only for transport-fatal
    /// failures; every other outcome is a `Document` whose status records
    /// what happened.
    pub async fn wait(self) -> Result<Document, PipelineError> {
        self.task.await?
    }
}

enum EndReason {
    Complete,
    Failed(String),
    Cancelled,
}

async fn run(
    client: reqwest::Client,
    config: Config,
    request: GenerationRequest,
    mut cancel_rx: watch::Receiver<bool>,
    snapshot_tx: watch::Sender<PipelineSnapshot>,
) -> Result<Document, PipelineError> {
    let mut store = SectionStore::new();

    let stream = match open_stream(&client, &config, &request).await {
        Ok(stream) => stream,
        Err(e) => {
            publish(&snapshot_tx, &store, PipelineStatus::Failed);
            return Err(e);
        }
    };
    let mut stream = Box::pin(stream);

    let mut decoder = ChunkDecoder::default();
    let mut framer = LineFramer::default();
    let mut saw_envelope = false;

    let reason = 'read: loop {
        tokio::select! {
            // Fires on cancel() and when the last handle is dropped; either
            // way nothing will observe further progress.
            _ = cancel_rx.changed() => {
                info!("cancellation requested");
                break 'read EndReason::Cancelled;
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    for line in framer.push(&decoder.push(&bytes)) {
                        let Some(envelope) = decode_line(&line) else { continue };
                        saw_envelope = true;
                        match dispatch(&mut store, &envelope) {
                            DispatchOutcome::Continue => {
                                publish(&snapshot_tx, &store, PipelineStatus::Streaming);
                            }
                            DispatchOutcome::Complete => break 'read EndReason::Complete,
                            DispatchOutcome::Failed(message) => break 'read EndReason::Failed(message),
                        }
                    }
                }
                Some(Err(e)) if !saw_envelope => {
                    // Network failure before the first envelope is a
                    // transport error, not a degradable one.
                    publish(&snapshot_tx, &store, PipelineStatus::Failed);
                    return Err(PipelineError::Http(e));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "stream read failed mid-generation");
                    break 'read end_of_stream(&mut store, &mut decoder, &mut framer);
                }
                None => break 'read end_of_stream(&mut store, &mut decoder, &mut framer),
            }
        }
    };

    // The reader owns the stream; release the connection before assembling.
    drop(stream);

    let (document, status) = match reason {
        EndReason::Complete => {
            let document = assemble(&store, false);
            let status = match document.status {
                DocumentStatus::Complete => PipelineStatus::Complete,
                DocumentStatus::Partial => PipelineStatus::Partial,
                DocumentStatus::Failed => PipelineStatus::Failed,
            };
            (document, status)
        }
        EndReason::Failed(message) => {
            warn!(error = %message, "generation pipeline failed");
            (assemble(&store, true), PipelineStatus::Failed)
        }
        EndReason::Cancelled => {
            // A cancelled run always yields a partial document, built from
            // whatever section state existed at abort time.
            let mut document = assemble(&store, false);
            document.status = DocumentStatus::Partial;
            (document, PipelineStatus::Cancelled)
        }
    };

    publish(&snapshot_tx, &store, status);
    info!(?status, sections = document.sections.len(), "generation finished");
    Ok(document)
}

/// Drains decoder and framer remainders at end-of-stream, then synthesizes a
/// terminal error envelope if none was seen.
fn end_of_stream(
    store: &mut SectionStore,
    decoder: &mut ChunkDecoder,
    framer: &mut LineFramer,
) -> EndReason {
    let mut tail = framer.push(&decoder.finish());
    if let Some(last) = framer.finish() {
        tail.push(last);
    }
    for line in tail {
        if let Some(envelope) = decode_line(&line) {
            match dispatch(store, &envelope) {
                DispatchOutcome::Continue => {}
                DispatchOutcome::Complete => return EndReason::Complete,
                DispatchOutcome::Failed(message) => return EndReason::Failed(message),
            }
        }
    }
    let synthetic = Envelope::synthetic_error("stream ended unexpectedly");
    match dispatch(store, &synthetic) {
        DispatchOutcome::Failed(message) => EndReason::Failed(message),
        _ => EndReason::Failed("stream ended unexpectedly".to_string()),
    }
}

fn publish(tx: &watch::Sender<PipelineSnapshot>, store: &SectionStore, status: PipelineStatus) {
    let _ = tx.send(PipelineSnapshot {
        sections: store.states().clone(),
        status,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserProfile;
    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use axum::response::Response;
    use axum::routing::post;
    use axum::Router;
    use bytes::Bytes;
    use futures_util::stream;
    use serde_json::json;
    use std::convert::Infallible;

    fn sample_request() -> GenerationRequest {
        GenerationRequest {
            profile: UserProfile {
                full_name: "Ada Lovelace".to_string(),
                email: "ada@example.com".to_string(),
                ..UserProfile::default()
            },
            job_description: "Senior Rust engineer, distributed systems".to_string(),
        }
    }

    /// Frames each payload as one `data: <json>\n\n` unit.
    fn sse(payloads: &[&str]) -> Vec<u8> {
        payloads
            .iter()
            .map(|p| format!("data: {p}\n\n"))
            .collect::<String>()
            .into_bytes()
    }

    /// Serves the given byte chunks from a real chunked HTTP endpoint.
    /// With `hang_after` the body never ends, so cancellation can be tested
    /// against a genuinely pending read.
    async fn serve_chunks(chunks: Vec<Vec<u8>>, hang_after: bool) -> String {
        let app = Router::new().route(
            "/generate",
            post(move || {
                let chunks = chunks.clone();
                async move {
                    let head = stream::iter(
                        chunks
                            .into_iter()
                            .map(|c| Ok::<Bytes, Infallible>(Bytes::from(c)))
                            .collect::<Vec<_>>(),
                    );
                    let body = if hang_after {
                        Body::from_stream(head.chain(stream::pending::<Result<Bytes, Infallible>>()))
                    } else {
                        Body::from_stream(head)
                    };
                    Response::builder()
                        .header(header::CONTENT_TYPE, "text/event-stream")
                        .body(body)
                        .unwrap()
                }
            }),
        );
        spawn_server(app).await
    }

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/generate")
    }

    fn pipeline_for(url: String) -> GenerationPipeline {
        GenerationPipeline::new(Config::new(url))
    }

    #[tokio::test]
    async fn test_end_to_end_stream_produces_complete_document() {
        let chunks = vec![sse(&[
            r#"{"type": "sectionStarted", "section": "profile"}"#,
            r#"{"type": "sectionContent", "section": "profile", "content": "{\"name\": \"Ada\"}"}"#,
            r#"{"type": "sectionCompleted", "section": "profile"}"#,
            r#"{"type": "sectionCompleted", "section": "hardSkill", "content": "[\"Rust\", \"Tokio\"]"}"#,
            r#"{"type": "generationComplete"}"#,
        ])];
        let url = serve_chunks(chunks, false).await;

        let handle = pipeline_for(url).start(sample_request());
        let snapshots = handle.subscribe();
        let document = handle.wait().await.unwrap();

        assert_eq!(document.status, DocumentStatus::Complete);
        assert_eq!(
            document.sections[&SectionId::Profile].value(),
            Some(&json!({"name": "Ada"}))
        );
        assert_eq!(
            document.sections[&SectionId::HardSkill].value(),
            Some(&json!(["Rust", "Tokio"]))
        );
        assert_eq!(snapshots.borrow().status, PipelineStatus::Complete);
    }

    /// Regression test for the legacy framing bug: a line split across two
    /// reads (here also inside a multi-byte character) must be reassembled
    /// and processed exactly once.
    #[tokio::test]
    async fn test_line_split_across_chunks_processed_exactly_once() {
        let mut bytes = sse(&[
            r#"{"type": "sectionCompleted", "section": "hardSkill", "content": "[\"héllo\"]"}"#,
        ]);
        bytes.extend_from_slice(&sse(&[r#"{"type": "generationComplete"}"#]));

        // Split inside the two-byte encoding of "é".
        let split_at = bytes
            .iter()
            .position(|&b| b == 0xC3)
            .expect("fixture must contain a multi-byte character")
            + 1;
        let tail = bytes.split_off(split_at);
        let url = serve_chunks(vec![bytes, tail], false).await;

        let document = pipeline_for(url)
            .start(sample_request())
            .wait()
            .await
            .unwrap();

        assert_eq!(document.status, DocumentStatus::Complete);
        let skills = document.sections[&SectionId::HardSkill].value().unwrap();
        assert_eq!(skills, &json!(["héllo"]));
        assert_eq!(skills.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_end_without_terminal_fails_but_keeps_sections() {
        let chunks = vec![sse(&[
            r#"{"type": "sectionCompleted", "section": "softSkill", "content": "[\"calm\"]"}"#,
        ])];
        let url = serve_chunks(chunks, false).await;

        let handle = pipeline_for(url).start(sample_request());
        let snapshots = handle.subscribe();
        let document = handle.wait().await.unwrap();

        assert_eq!(document.status, DocumentStatus::Failed);
        // Completed sections survive the synthesized end-of-stream error.
        assert_eq!(
            document.sections[&SectionId::SoftSkill].value(),
            Some(&json!(["calm"]))
        );
        assert_eq!(snapshots.borrow().status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_malformed_envelope_lines_are_dropped_not_fatal() {
        let mut bytes = sse(&[r#"{"type": "sectionStarted", "section": "education"}"#]);
        bytes.extend_from_slice(b"data: {garbage!!\n\n: keep-alive\n\n");
        bytes.extend_from_slice(&sse(&[
            r#"{"type": "sectionCompleted", "section": "education", "content": "[{\"degree\": \"BSc\"}]"}"#,
            r#"{"type": "generationComplete"}"#,
        ]));
        let url = serve_chunks(vec![bytes], false).await;

        let document = pipeline_for(url)
            .start(sample_request())
            .wait()
            .await
            .unwrap();

        assert_eq!(document.status, DocumentStatus::Complete);
        assert_eq!(
            document.sections[&SectionId::Education].value(),
            Some(&json!([{"degree": "BSc"}]))
        );
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_transport_error() {
        let app = Router::new().route(
            "/generate",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "provider down") }),
        );
        let url = spawn_server(app).await;

        let handle = pipeline_for(url).start(sample_request());
        let snapshots = handle.subscribe();
        let result = handle.wait().await;

        match result {
            Err(PipelineError::Transport { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "provider down");
            }
            other => panic!("expected transport error, got {other:?}"),
        }
        assert_eq!(snapshots.borrow().status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancellation_is_idempotent_and_yields_partial_document() {
        let chunks = vec![sse(&[
            r#"{"type": "sectionStarted", "section": "hardSkill"}"#,
            r#"{"type": "sectionCompleted", "section": "hardSkill", "content": "[\"Rust\"]"}"#,
        ])];
        let url = serve_chunks(chunks, true).await;

        let handle = pipeline_for(url).start(sample_request());
        let mut snapshots = handle.subscribe();

        // Wait until the section landed, then cancel twice.
        loop {
            snapshots.changed().await.unwrap();
            if snapshots.borrow().sections[&SectionId::HardSkill].is_complete {
                break;
            }
        }
        handle.cancel();
        handle.cancel();

        let document = handle.wait().await.unwrap();
        assert_eq!(document.status, DocumentStatus::Partial);
        assert_eq!(
            document.sections[&SectionId::HardSkill].value(),
            Some(&json!(["Rust"]))
        );
        assert_eq!(snapshots.borrow().status, PipelineStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_a_noop() {
        let chunks = vec![sse(&[
            r#"{"type": "sectionCompleted", "section": "hardSkill", "content": "[\"Rust\"]"}"#,
            r#"{"type": "generationComplete"}"#,
        ])];
        let url = serve_chunks(chunks, false).await;

        let handle = pipeline_for(url).start(sample_request());
        let cancel = handle.cancel_handle();
        let document = handle.wait().await.unwrap();
        assert_eq!(document.status, DocumentStatus::Complete);

        // The run is over; cancelling now must not panic or change anything.
        cancel.cancel();
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_snapshot_updates_while_streaming() {
        let chunks = vec![sse(&[
            r#"{"type": "sectionStarted", "section": "project"}"#,
            r#"{"type": "sectionContent", "section": "project", "content": "[{\"name\": \"docstream\"}"}"#,
        ])];
        let url = serve_chunks(chunks, true).await;

        let handle = pipeline_for(url).start(sample_request());
        let mut snapshots = handle.subscribe();
        loop {
            snapshots.changed().await.unwrap();
            let snapshot = snapshots.borrow().clone();
            if !snapshot.sections[&SectionId::Project].content.is_empty() {
                assert_eq!(snapshot.status, PipelineStatus::Streaming);
                assert!(snapshot.sections[&SectionId::Project].is_streaming);
                break;
            }
        }
        handle.cancel();
        let document = handle.wait().await.unwrap();
        assert_eq!(document.status, DocumentStatus::Partial);
        // The half-written project entry recovers to an empty preview at
        // aggregation only if the repair tier can close it; either way the
        // run terminates cleanly.
        assert_eq!(snapshots.borrow().status, PipelineStatus::Cancelled);
    }
}
