//! Streaming tee: one reader loop over the upstream SSE byte stream feeding
//! two sinks — the client socket (raw bytes, untouched) and the write
//! pipeline (one chunk row per parsed event). The tee also reassembles the
//! response body from the event stream so the request row carries the same
//! fields a buffered response would.
//!
//! Client disconnect cancels the upstream read but never the persistence:
//! accumulated chunks are already enqueued and the row is patched FAILED
//! with a cancellation error.

use std::time::Instant;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use prism_core::types::TokenUsage;
use prism_storage::types::{ChunkRecord, RequestPatch};
use prism_storage::{WriteItem, WritePipeline};

use super::extract_task_invocations;

pub struct StreamTee {
    pipeline: WritePipeline,
    request_id: String,
    started: Instant,

    // SSE framing
    event_buf: String,
    chunk_index: u32,

    // accounting
    first_token_ms: Option<u64>,
    usage: TokenUsage,
    last_output_total: u64,

    // response reassembly
    model: Option<String>,
    stop_reason: Option<String>,
    content_blocks: Vec<serde_json::Value>,
    current_block_type: String,
    text_acc: String,
    tool_use_id: String,
    tool_use_name: String,
    tool_use_input_json: String,
    saw_message_stop: bool,
}

enum StreamEnd {
    Complete,
    ClientGone,
    UpstreamError(String),
}

impl StreamTee {
    pub fn new(pipeline: WritePipeline, request_id: String, started: Instant) -> Self {
        Self {
            pipeline,
            request_id,
            started,
            event_buf: String::new(),
            chunk_index: 0,
            first_token_ms: None,
            usage: TokenUsage::default(),
            last_output_total: 0,
            model: None,
            stop_reason: None,
            content_blocks: Vec::new(),
            current_block_type: String::new(),
            text_acc: String::new(),
            tool_use_id: String::new(),
            tool_use_name: String::new(),
            tool_use_input_json: String::new(),
            saw_message_stop: false,
        }
    }

    /// Reader loop. Consumes the upstream byte stream; completes once the
    /// stream ends, errors, or the client goes away.
    pub async fn run<S, E>(
        mut self,
        mut byte_stream: S,
        client_tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    ) where
        S: futures_util::Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let end = loop {
            match byte_stream.next().await {
                Some(Ok(bytes)) => {
                    if self.first_token_ms.is_none() {
                        self.first_token_ms = Some(self.started.elapsed().as_millis() as u64);
                    }

                    // Sink 1: raw bytes to the client. A send failure means
                    // the client hung up — stop reading upstream.
                    if client_tx.send(Ok(bytes.clone())).await.is_err() {
                        break StreamEnd::ClientGone;
                    }

                    // Sink 2: parsed events to the write pipeline.
                    if let Ok(text) = std::str::from_utf8(&bytes) {
                        self.event_buf.push_str(text);
                        self.drain_complete_events().await;
                    }
                }
                Some(Err(e)) => break StreamEnd::UpstreamError(e.to_string()),
                None => {
                    // Flush a trailing partial event before finalizing.
                    let leftover = std::mem::take(&mut self.event_buf);
                    if !leftover.trim().is_empty() {
                        self.record_event(&leftover).await;
                    }
                    break StreamEnd::Complete;
                }
            }
        };

        self.finalize(end).await;
    }

    /// Split buffered text on the SSE event delimiter and persist every
    /// complete event block, keeping the trailing partial in the buffer.
    async fn drain_complete_events(&mut self) {
        while let Some(pos) = self.event_buf.find("\n\n") {
            let event_block: String = self.event_buf.drain(..pos + 2).collect();
            let event_block = event_block.trim_end();
            if !event_block.is_empty() {
                self.record_event(event_block).await;
            }
        }
    }

    /// Persist one event as a chunk row and fold it into the reassembled
    /// response.
    async fn record_event(&mut self, event_block: &str) {
        let (event_type, data) = parse_sse_event(event_block);
        let token_count = self.apply_event(&event_type, &data);

        let chunk = ChunkRecord {
            request_id: self.request_id.clone(),
            chunk_index: self.chunk_index,
            timestamp: chrono::Utc::now(),
            data: event_block.to_string(),
            token_count,
        };
        self.chunk_index += 1;
        self.pipeline.enqueue(WriteItem::InsertChunk(chunk)).await;
    }

    /// Update reassembly state from one event. Returns the token count
    /// attributed to this chunk: output tokens newly reported by a usage
    /// block, zero otherwise.
    fn apply_event(&mut self, event_type: &str, data: &str) -> u32 {
        match event_type {
            "message_start" => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
                    let message = value.get("message");
                    self.model = message
                        .and_then(|m| m.get("model"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string);
                    if let Some(usage) = message.and_then(|m| m.get("usage")) {
                        if let Ok(parsed) = serde_json::from_value::<TokenUsage>(usage.clone()) {
                            self.usage.merge(&parsed);
                        }
                    }
                }
                0
            }
            "content_block_start" => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
                    if let Some(block) = value.get("content_block") {
                        self.current_block_type = block
                            .get("type")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .to_string();
                        if self.current_block_type == "tool_use" {
                            self.tool_use_id = block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            self.tool_use_name = block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            self.tool_use_input_json.clear();
                        } else {
                            self.text_acc.clear();
                        }
                    }
                }
                0
            }
            "content_block_delta" => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
                    if let Some(delta) = value.get("delta") {
                        match delta.get("type").and_then(|t| t.as_str()) {
                            Some("text_delta") => {
                                if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                                    self.text_acc.push_str(text);
                                }
                            }
                            Some("input_json_delta") => {
                                if let Some(partial) =
                                    delta.get("partial_json").and_then(|p| p.as_str())
                                {
                                    self.tool_use_input_json.push_str(partial);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                0
            }
            "content_block_stop" => {
                self.close_block();
                0
            }
            "message_delta" => {
                let mut attributed = 0;
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
                    if let Some(reason) = value
                        .get("delta")
                        .and_then(|d| d.get("stop_reason"))
                        .and_then(|r| r.as_str())
                    {
                        self.stop_reason = Some(reason.to_string());
                    }
                    if let Some(usage) = value.get("usage") {
                        if let Ok(parsed) = serde_json::from_value::<TokenUsage>(usage.clone()) {
                            self.usage.merge(&parsed);
                            if parsed.output_tokens > self.last_output_total {
                                attributed =
                                    (parsed.output_tokens - self.last_output_total) as u32;
                                self.last_output_total = parsed.output_tokens;
                            }
                        }
                    }
                }
                attributed
            }
            "message_stop" => {
                self.saw_message_stop = true;
                0
            }
            _ => 0,
        }
    }

    /// Close the open content block and append it to the reassembled body.
    fn close_block(&mut self) {
        match self.current_block_type.as_str() {
            "tool_use" => {
                let input: serde_json::Value =
                    serde_json::from_str(&self.tool_use_input_json)
                        .unwrap_or(serde_json::Value::Object(Default::default()));
                self.content_blocks.push(serde_json::json!({
                    "type": "tool_use",
                    "id": std::mem::take(&mut self.tool_use_id),
                    "name": std::mem::take(&mut self.tool_use_name),
                    "input": input,
                }));
                self.tool_use_input_json.clear();
            }
            "text" => {
                self.content_blocks.push(serde_json::json!({
                    "type": "text",
                    "text": std::mem::take(&mut self.text_acc),
                }));
            }
            _ => {}
        }
        self.current_block_type.clear();
    }

    /// Patch the request row with whatever the stream produced. Runs on
    /// every exit path, including client cancellation.
    async fn finalize(mut self, end: StreamEnd) {
        // An unterminated block still carries data worth keeping.
        if !self.current_block_type.is_empty() {
            self.close_block();
        }

        let error = match end {
            StreamEnd::Complete if self.saw_message_stop => None,
            StreamEnd::Complete => {
                Some("upstream_error: stream truncated before message_stop".to_string())
            }
            StreamEnd::ClientGone => Some("client_cancelled".to_string()),
            StreamEnd::UpstreamError(e) => {
                Some(prism_core::redact::redact_secrets(&format!("upstream_error: {e}")))
            }
        };

        let response_body = if self.content_blocks.is_empty() && error.is_some() {
            None
        } else {
            Some(serde_json::json!({
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": self.content_blocks,
                "stop_reason": self.stop_reason,
                "usage": {
                    "input_tokens": self.usage.input_tokens,
                    "output_tokens": self.usage.output_tokens,
                    "cache_creation_input_tokens": self.usage.cache_creation_input_tokens,
                    "cache_read_input_tokens": self.usage.cache_read_input_tokens,
                },
            }))
        };

        let tool_call_count = response_body
            .as_ref()
            .map(prism_core::types::count_tool_calls)
            .unwrap_or(0);
        let task_invocation = response_body.as_ref().and_then(extract_task_invocations);

        if let Some(error) = &error {
            warn!(request_id = %self.request_id, error = %error, "stream finalized with error");
        } else {
            debug!(
                request_id = %self.request_id,
                chunks = self.chunk_index,
                output_tokens = self.usage.output_tokens,
                "stream complete"
            );
        }

        self.pipeline
            .enqueue(WriteItem::PatchRequest(Box::new(RequestPatch {
                request_id: self.request_id.clone(),
                response_body,
                response_status: Some(200),
                input_tokens: Some(self.usage.input_tokens),
                output_tokens: Some(self.usage.output_tokens),
                cache_creation_tokens: Some(self.usage.cache_creation_input_tokens),
                cache_read_tokens: Some(self.usage.cache_read_input_tokens),
                first_token_ms: self.first_token_ms,
                duration_ms: Some(self.started.elapsed().as_millis() as u64),
                error,
                tool_call_count: Some(tool_call_count),
                task_tool_invocation: task_invocation,
            })))
            .await;
    }
}

/// Split one SSE event block into its event type and joined data payload.
fn parse_sse_event(block: &str) -> (String, String) {
    let mut event_type = String::new();
    let mut data_lines: Vec<&str> = Vec::new();
    for line in block.lines() {
        if let Some(ev) = line.strip_prefix("event: ") {
            event_type = ev.trim().to_string();
        } else if let Some(d) = line.strip_prefix("data: ") {
            data_lines.push(d);
        }
    }
    (event_type, data_lines.join("\n"))
}
