//! Stream reconstruction: SSE line framing plus incremental decoding of
//! vendor chunks into canonical partial responses.
//!
//! Text is forwarded as soon as it arrives. Tool-call fragments are
//! accumulated per slot and released together on the terminal element.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::GenerationError;
use super::openai_format::{call_id_or_synthesized, parse_tool_arguments, WireUsage};
use super::types::*;

/// Max bytes held for one unterminated line before the stream is aborted
const MAX_LINE_BUFFER: usize = 1_048_576;

/// Line framing of a vendor's event stream
#[derive(Debug, Clone)]
pub struct SseFraming {
    /// Prefix of payload lines; the remainder after it is the JSON chunk
    pub data_prefix: String,
    /// Full trimmed line that marks the end of the stream, if the vendor sends one
    pub done_sentinel: Option<String>,
}

impl SseFraming {
    /// `data: {...}` lines terminated by `data: [DONE]`
    pub fn openai() -> Self {
        Self {
            data_prefix: "data:".to_string(),
            done_sentinel: Some("data: [DONE]".to_string()),
        }
    }

    /// `data: {...}` lines terminated by end of input
    pub fn native() -> Self {
        Self {
            data_prefix: "data:".to_string(),
            done_sentinel: None,
        }
    }
}

/// Result of decoding one payload line
#[derive(Debug, Default)]
pub struct Decoded {
    pub responses: Vec<GenerateResponse>,
    /// The chunk carried a finish reason; nothing further will be emitted
    pub done: bool,
}

/// Vendor-specific decoding of individual stream payloads
pub trait ChunkDecoder: Send {
    /// Decode one payload. Malformed payloads are logged and yield nothing.
    fn decode(&mut self, data: &str) -> Decoded;

    /// Called on the done sentinel or end of input without a finish reason
    fn finish(&mut self) -> Vec<GenerateResponse>;
}

/// Splits raw bytes into lines and feeds payload lines to a decoder.
///
/// Bytes are buffered as `Vec<u8>` so multi-byte UTF-8 characters split
/// across network reads are decoded only once the line is complete.
pub struct SseLineProcessor<D> {
    framing: SseFraming,
    decoder: D,
    buffer: Vec<u8>,
    done: bool,
    vendor: String,
}

impl<D: ChunkDecoder> SseLineProcessor<D> {
    pub fn new(framing: SseFraming, decoder: D, vendor: &str) -> Self {
        Self {
            framing,
            decoder,
            buffer: Vec::new(),
            done: false,
            vendor: vendor.to_string(),
        }
    }

    /// A terminal element has been produced; later input is ignored
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes, returning every response completed by them
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Vec<GenerateResponse>, GenerationError> {
        let mut out = Vec::new();
        if self.done {
            return Ok(out);
        }

        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..pos]).into_owned();
            self.handle_line(&line, &mut out);
            if self.done {
                self.buffer.clear();
                return Ok(out);
            }
        }

        if self.buffer.len() > MAX_LINE_BUFFER {
            return Err(GenerationError::Stream {
                vendor: self.vendor.clone(),
                message: format!("stream line exceeded {} bytes", MAX_LINE_BUFFER),
            });
        }

        Ok(out)
    }

    /// End of input: process a trailing unterminated line, then flush the decoder
    pub fn finish(&mut self) -> Vec<GenerateResponse> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }

        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.handle_line(&line, &mut out);
        }

        if !self.done {
            out.extend(self.decoder.finish());
            self.done = true;
        }
        out
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<GenerateResponse>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if self.framing.done_sentinel.as_deref() == Some(line) {
            out.extend(self.decoder.finish());
            self.done = true;
            return;
        }

        let Some(data) = line.strip_prefix(self.framing.data_prefix.as_str()) else {
            // event:, id:, retry: and comment lines carry nothing we decode
            return;
        };
        let data = data.trim();
        if data.is_empty() {
            return;
        }

        let decoded = self.decoder.decode(data);
        out.extend(decoded.responses);
        if decoded.done {
            self.done = true;
        }
    }
}

/// Drive a byte stream through a line processor, forwarding responses to `tx`.
///
/// Stops on the terminal element, end of input, a read failure (sent as a
/// stream error), cancellation, or when the receiver is dropped. The byte
/// stream is dropped on return, which releases the connection.
pub async fn drive_sse_stream<S, D>(
    byte_stream: S,
    mut processor: SseLineProcessor<D>,
    tx: mpsc::Sender<Result<GenerateResponse, GenerationError>>,
    cancel: CancellationToken,
) where
    S: futures::Stream<Item = Result<Bytes, reqwest::Error>>,
    D: ChunkDecoder,
{
    tokio::pin!(byte_stream);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(vendor = %processor.vendor, "Stream cancelled by caller");
                return;
            }
            next = byte_stream.next() => next,
        };

        let responses = match next {
            Some(Ok(bytes)) => match processor.push_bytes(&bytes) {
                Ok(responses) => responses,
                Err(e) => {
                    warn!(vendor = %processor.vendor, error = %e, "Aborting stream");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            },
            Some(Err(e)) => {
                warn!(vendor = %processor.vendor, error = %e, "Stream read error");
                let _ = tx
                    .send(Err(GenerationError::Stream {
                        vendor: processor.vendor.clone(),
                        message: e.without_url().to_string(),
                    }))
                    .await;
                return;
            }
            None => processor.finish(),
        };

        for response in responses {
            if tx.send(Ok(response)).await.is_err() {
                return; // receiver dropped
            }
        }

        if processor.is_done() {
            return;
        }
    }
}

// --- OpenAI-format delta decoding ---

#[derive(Debug, Deserialize)]
struct DeltaChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<DeltaChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct DeltaChoice {
    #[serde(default)]
    delta: Option<MessageDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Tool call under construction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedToolCall {
    pub id: Option<String>,
    pub kind: Option<String>,
    pub name: String,
    pub arguments: String,
}

/// Tool-call slots keyed by position, with redirects for vendor indices
/// that were moved after a name collision
#[derive(Debug, Default)]
pub struct ToolCallSlots {
    slots: BTreeMap<usize, AccumulatedToolCall>,
    redirects: HashMap<usize, usize>,
}

impl ToolCallSlots {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Merge one fragment. A fragment naming a different function than the
    /// slot it addresses (with no matching id) moves to the next free slot.
    fn merge(&mut self, delta: ToolCallDelta) {
        let vendor_index = delta.index.unwrap_or(0);
        let mut slot = self.redirects.get(&vendor_index).copied().unwrap_or(vendor_index);

        let incoming_name = delta
            .function
            .as_ref()
            .and_then(|f| f.name.as_deref())
            .filter(|n| !n.is_empty());

        if let (Some(existing), Some(name)) = (self.slots.get(&slot), incoming_name) {
            let same_id = match (&existing.id, &delta.id) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
            if !existing.name.is_empty() && existing.name != name && !same_id {
                while self.slots.contains_key(&slot) {
                    slot += 1;
                }
                debug!(vendor_index, slot, function = name, "Reindexed colliding tool call");
                self.redirects.insert(vendor_index, slot);
            }
        }

        let entry = self.slots.entry(slot).or_default();
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            entry.id = Some(id);
        }
        if let Some(kind) = delta.kind {
            entry.kind = Some(kind);
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                if entry.name.is_empty() {
                    entry.name = name;
                } else if entry.name != name {
                    entry.name.push_str(&name);
                }
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }

    /// Insert several complete calls delivered in one final chunk, offset
    /// past the slots already in use
    fn insert_batch(&mut self, deltas: Vec<ToolCallDelta>) {
        let base = self.slots.len();
        for (i, delta) in deltas.into_iter().enumerate() {
            let mut slot = base + i;
            while self.slots.contains_key(&slot) {
                slot += 1;
            }
            let (name, arguments) = match delta.function {
                Some(f) => (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()),
                None => (String::new(), String::new()),
            };
            self.slots.insert(
                slot,
                AccumulatedToolCall {
                    id: Some(call_id_or_synthesized(delta.id.as_deref())),
                    kind: Some(delta.kind.unwrap_or_else(|| "function".to_string())),
                    name,
                    arguments,
                },
            );
        }
    }

    /// Named calls in slot order with parsed arguments. Unnamed slots are dropped.
    pub fn complete(&self, vendor: &str) -> Vec<FunctionCall> {
        self.slots
            .values()
            .filter(|call| !call.name.is_empty())
            .map(|call| FunctionCall {
                id: call_id_or_synthesized(call.id.as_deref()),
                name: call.name.clone(),
                args: parse_tool_arguments(vendor, &call.name, &call.arguments),
            })
            .collect()
    }

    fn has_named(&self) -> bool {
        self.slots.values().any(|c| !c.name.is_empty())
    }
}

/// Decoder for OpenAI-format `chat.completion.chunk` payloads
pub struct OpenAiDeltaDecoder {
    vendor: String,
    model: String,
    text: String,
    slots: ToolCallSlots,
}

impl OpenAiDeltaDecoder {
    pub fn new(vendor: &str, model: &str) -> Self {
        Self {
            vendor: vendor.to_string(),
            model: model.to_string(),
            text: String::new(),
            slots: ToolCallSlots::default(),
        }
    }

    /// Text accumulated so far
    pub fn text(&self) -> &str {
        &self.text
    }

    fn terminal(&self, finish_reason: FinishReason, usage: Option<UsageMetadata>) -> GenerateResponse {
        let parts = self
            .slots
            .complete(&self.vendor)
            .into_iter()
            .map(Part::FunctionCall)
            .collect();
        GenerateResponse::new(parts, Some(finish_reason), usage, &self.model)
    }
}

impl ChunkDecoder for OpenAiDeltaDecoder {
    fn decode(&mut self, data: &str) -> Decoded {
        let chunk: DeltaChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                warn!(vendor = %self.vendor, error = %e, "Skipping malformed stream chunk");
                return Decoded::default();
            }
        };

        if let Some(model) = chunk.model.filter(|m| !m.is_empty()) {
            self.model = model;
        }
        let usage = chunk.usage.as_ref().map(UsageMetadata::from);

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Decoded::default();
        };

        let mut responses = Vec::new();

        if let Some(delta) = choice.delta {
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                self.text.push_str(&text);
                responses.push(GenerateResponse::text_delta(&text, &self.model));
            }

            if let Some(calls) = delta.tool_calls {
                let one_shot =
                    choice.finish_reason.as_deref() == Some("tool_calls") && calls.len() > 1;
                if one_shot {
                    self.slots.insert_batch(calls);
                } else {
                    for call in calls {
                        self.slots.merge(call);
                    }
                }
            }
        }

        match choice.finish_reason {
            Some(reason) => {
                responses.push(self.terminal(FinishReason::from_vendor(&reason), usage));
                Decoded {
                    responses,
                    done: true,
                }
            }
            None => Decoded {
                responses,
                done: false,
            },
        }
    }

    fn finish(&mut self) -> Vec<GenerateResponse> {
        let reason = if self.slots.has_named() {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        vec![self.terminal(reason, None)]
    }
}
