//! Transport reader: owns the HTTP stream, decodes bytes to text, frames
//! lines into envelopes.
//!
//! A chunk boundary may fall anywhere, including inside a multi-byte UTF-8
//! character or in the middle of a line. Both the decoder and the framer
//! carry their remainders forward, so a line split across reads is
//! reassembled and processed exactly once.

use bytes::Bytes;
use futures_util::Stream;
use tracing::debug;

use crate::config::Config;
use crate::envelope::Envelope;
use crate::errors::PipelineError;
use crate::models::GenerationRequest;

/// Marker prefix of envelope-carrying lines.
pub const DATA_PREFIX: &str = "data: ";

/// POSTs the generation request and returns the chunked response body.
///
/// A non-2xx status or a failed connect is a fatal transport error; the
/// caller gets no stream and no partial document.
pub async fn open_stream(
    client: &reqwest::Client,
    config: &Config,
    request: &GenerationRequest,
) -> Result<impl Stream<Item = reqwest::Result<Bytes>>, PipelineError> {
    let mut builder = client.post(&config.generation_url).json(request);
    if let Some(key) = &config.api_key {
        builder = builder.header("x-api-key", key);
    }

    let response = builder.send().await.map_err(PipelineError::Http)?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(PipelineError::Transport {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response.bytes_stream())
}

/// Incremental UTF-8 decoder. Bytes of a character split across chunks are
/// held back until the rest arrives.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    /// Appends a chunk and returns all completely-decodable text.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let out = text.to_string();
                self.pending.clear();
                out
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete trailing character: decode up to it, hold the
                // rest for the next chunk.
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                out
            }
            Err(_) => {
                // Genuinely invalid bytes in the interior; degrade lossily
                // rather than aborting the stream.
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                out
            }
        }
    }

    /// Flushes any held-back bytes at end-of-stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Explicit line-buffering framer: appends each chunk's text, emits every
/// complete line, and retains the trailing partial line for the next chunk.
#[derive(Debug, Default)]
pub struct LineFramer {
    carry: String,
}

impl LineFramer {
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.carry.push_str(text);
        let mut lines = Vec::new();
        while let Some(pos) = self.carry.find('\n') {
            let mut line: String = self.carry.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Flushes the carry as a final line at end-of-stream. A stream that
    /// ends without a trailing newline still delivers its last envelope.
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.carry))
        }
    }
}

/// Decodes one framed line into an envelope.
///
/// Blank lines and lines without the `data: ` prefix are ignored; a line
/// that carries the prefix but is not valid envelope JSON is logged and
/// dropped. Neither case ever aborts the pipeline.
pub fn decode_line(line: &str) -> Option<Envelope> {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        if !line.trim().is_empty() {
            debug!(line, "ignoring line without data prefix");
        }
        return None;
    };
    match Envelope::parse(payload) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            debug!(error = %e, "dropping malformed envelope line");
            None
        }
    }
}
