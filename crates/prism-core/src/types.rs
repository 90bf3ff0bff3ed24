use serde::{Deserialize, Serialize};

/// How the proxy classifies an inbound call. Stored on the request row and
/// used by token accounting, which only counts `inference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Inference,
    QueryEvaluation,
    Quota,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Inference => "inference",
            RequestType::QueryEvaluation => "query_evaluation",
            RequestType::Quota => "quota",
        }
    }
}

impl std::str::FromStr for RequestType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inference" => Ok(RequestType::Inference),
            "query_evaluation" => Ok(RequestType::QueryEvaluation),
            "quota" => Ok(RequestType::Quota),
            _ => Err(()),
        }
    }
}

/// The slice of the upstream message-completion body the core inspects.
/// Everything else passes through as opaque bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesBody {
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub system: Option<serde_json::Value>,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Message content is either a bare string or an array of typed blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Tagged view of the content-block variants the core needs to inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
    },
    #[serde(rename = "image")]
    Image { source: serde_json::Value },
    #[serde(other)]
    Unknown,
}

impl MessagesBody {
    pub fn parse(bytes: &[u8]) -> crate::error::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            crate::error::PrismError::InvalidRequest(format!("malformed request body: {e}"))
        })
    }

    /// Number of system blocks: a string system prompt counts as one,
    /// an array counts its elements, absent counts zero.
    pub fn system_block_count(&self) -> usize {
        match &self.system {
            None => 0,
            Some(serde_json::Value::String(_)) => 1,
            Some(serde_json::Value::Array(blocks)) => blocks.len(),
            Some(_) => 1,
        }
    }

    /// Concatenated text of the first user message, skipping synthetic
    /// system-reminder parts.
    pub fn first_user_text(&self) -> Option<String> {
        let msg = self.messages.iter().find(|m| m.role == "user")?;
        let text = msg.content.visible_text();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn user_message_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role == "user").count()
    }
}

impl MessageContent {
    /// Text content excluding system-reminder parts.
    pub fn visible_text(&self) -> String {
        match self {
            MessageContent::Text(s) => {
                if is_system_reminder(s) {
                    String::new()
                } else {
                    s.clone()
                }
            }
            MessageContent::Blocks(blocks) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } if !is_system_reminder(text) => {
                            Some(text.as_str())
                        }
                        _ => None,
                    })
                    .collect();
                parts.join("\n")
            }
        }
    }
}

/// Synthetic reminder messages injected by agent harnesses. They carry no
/// conversational content and must not perturb hashing or linking.
pub fn is_system_reminder(text: &str) -> bool {
    text.trim_start().starts_with("<system-reminder>")
}

/// Classify a request body.
///
/// `quota` — exactly one user message whose trimmed, lower-cased text is
/// "quota". `query_evaluation` — zero or one system blocks. `inference` —
/// everything else.
pub fn classify_request(body: &MessagesBody) -> RequestType {
    if body.user_message_count() == 1 {
        if let Some(text) = body.first_user_text() {
            if text.trim().eq_ignore_ascii_case("quota") {
                return RequestType::Quota;
            }
        }
    }
    if body.system_block_count() <= 1 {
        return RequestType::QueryEvaluation;
    }
    RequestType::Inference
}

/// Token counters parsed from an upstream `usage` block. All fields default
/// to zero so partial usage objects (streaming deltas) still parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fold a later usage report (e.g. `message_delta`) into this one,
    /// taking each counter from whichever report delivered it.
    pub fn merge(&mut self, other: &TokenUsage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens = other.cache_creation_input_tokens;
        }
        if other.cache_read_input_tokens > 0 {
            self.cache_read_input_tokens = other.cache_read_input_tokens;
        }
    }
}

/// Count `tool_use` blocks in a stored response body.
pub fn count_tool_calls(response: &serde_json::Value) -> u32 {
    response
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
                .count() as u32
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: &str) -> MessagesBody {
        MessagesBody::parse(json.as_bytes()).expect("valid body")
    }

    #[test]
    fn quota_requires_single_user_message() {
        let b = body(r#"{"model":"m","messages":[{"role":"user","content":"  Quota "}]}"#);
        assert_eq!(classify_request(&b), RequestType::Quota);

        let b = body(
            r#"{"model":"m","messages":[
                {"role":"user","content":"quota"},
                {"role":"assistant","content":"ok"},
                {"role":"user","content":"quota"}]}"#,
        );
        assert_ne!(classify_request(&b), RequestType::Quota);
    }

    #[test]
    fn zero_or_one_system_blocks_is_query_evaluation() {
        let b = body(r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#);
        assert_eq!(classify_request(&b), RequestType::QueryEvaluation);

        let b = body(
            r#"{"model":"m","system":"you are helpful","messages":[{"role":"user","content":"hi"}]}"#,
        );
        assert_eq!(classify_request(&b), RequestType::QueryEvaluation);
    }

    #[test]
    fn multi_block_system_is_inference() {
        let b = body(
            r#"{"model":"m","system":[{"type":"text","text":"a"},{"type":"text","text":"b"}],
                "messages":[{"role":"user","content":"hi"}]}"#,
        );
        assert_eq!(classify_request(&b), RequestType::Inference);
    }

    #[test]
    fn first_user_text_skips_reminders() {
        let b = body(
            r#"{"model":"m","messages":[{"role":"user","content":[
                {"type":"text","text":"<system-reminder>internal</system-reminder>"},
                {"type":"text","text":"do X"}]}]}"#,
        );
        assert_eq!(b.first_user_text().as_deref(), Some("do X"));
    }

    #[test]
    fn tool_calls_counted_from_response_content() {
        let resp = serde_json::json!({
            "content": [
                {"type": "text", "text": "sure"},
                {"type": "tool_use", "id": "t1", "name": "Task", "input": {}},
                {"type": "tool_use", "id": "t2", "name": "Bash", "input": {}},
            ]
        });
        assert_eq!(count_tool_calls(&resp), 2);
    }

    #[test]
    fn usage_merge_prefers_later_nonzero() {
        let mut start = TokenUsage {
            input_tokens: 120,
            ..Default::default()
        };
        let delta = TokenUsage {
            output_tokens: 37,
            ..Default::default()
        };
        start.merge(&delta);
        assert_eq!(start.input_tokens, 120);
        assert_eq!(start.output_tokens, 37);
        assert_eq!(start.total(), 157);
    }

    #[test]
    fn unknown_block_types_do_not_fail_parsing() {
        let b = body(
            r#"{"model":"m","messages":[{"role":"user","content":[
                {"type":"mystery","payload":1},{"type":"text","text":"hi"}]}]}"#,
        );
        assert_eq!(b.first_user_text().as_deref(), Some("hi"));
    }
}
