//! The fixed analysis prompt: renders a conversation transcript and asks
//! the model for a JSON object with a known schema.

use prism_storage::types::BranchMessage;

/// Schema the model is asked to fill. Stored verbatim in `analysis_data`
/// when the reply parses as JSON.
const RESPONSE_SCHEMA: &str = r#"{
  "summary": "2-3 sentence overview of the conversation",
  "keyTopics": ["topic 1", "topic 2"],
  "sentiment": "positive | neutral | negative | mixed",
  "userIntent": "what the user was trying to accomplish",
  "outcomes": ["concrete results achieved"],
  "actionItems": ["outstanding follow-ups"],
  "technicalDetails": {
    "frameworks": ["languages, frameworks, tools discussed"],
    "issues": ["problems encountered"],
    "solutions": ["fixes applied"]
  },
  "conversationQuality": {
    "clarity": "high | medium | low",
    "completeness": "complete | partial | abandoned",
    "effectiveness": "effective | partially effective | ineffective"
  }
}"#;

/// Render the full prompt around a (possibly truncated) transcript.
pub fn render(messages: &[BranchMessage], custom_prompt: Option<&str>) -> String {
    let mut transcript = String::new();
    for msg in messages {
        transcript.push_str(&format!("[{}]: {}\n\n", msg.role, msg.text));
    }

    let focus = match custom_prompt {
        Some(p) => format!("\nAdditional analysis focus requested by the operator:\n{p}\n"),
        None => String::new(),
    };

    format!(
        "Analyze the following AI assistant conversation and respond with a single \
         JSON object matching exactly this schema (no prose before or after):\n\n\
         {RESPONSE_SCHEMA}\n\
         {focus}\n\
         Conversation transcript:\n\n{transcript}"
    )
}

/// Readable rendering of a parsed analysis object for the content column.
/// The dashboard shows this text; the JSON stays queryable alongside it.
pub fn render_readable(data: &serde_json::Value) -> String {
    let mut out = String::new();
    if let Some(summary) = data.get("summary").and_then(|v| v.as_str()) {
        out.push_str("Summary: ");
        out.push_str(summary);
        out.push('\n');
    }
    if let Some(topics) = data.get("keyTopics").and_then(|v| v.as_array()) {
        let names: Vec<&str> = topics.iter().filter_map(|t| t.as_str()).collect();
        if !names.is_empty() {
            out.push_str("Key topics: ");
            out.push_str(&names.join(", "));
            out.push('\n');
        }
    }
    if let Some(intent) = data.get("userIntent").and_then(|v| v.as_str()) {
        out.push_str("User intent: ");
        out.push_str(intent);
        out.push('\n');
    }
    if let Some(outcomes) = data.get("outcomes").and_then(|v| v.as_array()) {
        let items: Vec<&str> = outcomes.iter().filter_map(|o| o.as_str()).collect();
        if !items.is_empty() {
            out.push_str("Outcomes: ");
            out.push_str(&items.join("; "));
            out.push('\n');
        }
    }
    if out.is_empty() {
        out = data.to_string();
    }
    out
}

/// Model replies often wrap JSON in a markdown code fence; unwrap it before
/// parsing.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    else {
        return trimmed;
    };
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_contains_schema_and_transcript() {
        let messages = vec![
            BranchMessage {
                role: "user".to_string(),
                text: "help me fix the build".to_string(),
            },
            BranchMessage {
                role: "assistant".to_string(),
                text: "sure, show me the error".to_string(),
            },
        ];
        let prompt = render(&messages, None);
        assert!(prompt.contains("\"summary\""));
        assert!(prompt.contains("conversationQuality"));
        assert!(prompt.contains("[user]: help me fix the build"));
        assert!(prompt.contains("[assistant]: sure, show me the error"));
    }

    #[test]
    fn custom_prompt_is_embedded() {
        let prompt = render(&[], Some("focus on security issues"));
        assert!(prompt.contains("focus on security issues"));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn readable_rendering_prefers_summary() {
        let data = serde_json::json!({
            "summary": "User debugged a build failure.",
            "keyTopics": ["rust", "ci"],
            "userIntent": "fix the build",
            "outcomes": ["build green"]
        });
        let text = render_readable(&data);
        assert!(text.starts_with("Summary: User debugged a build failure."));
        assert!(text.contains("Key topics: rust, ci"));
        assert!(text.contains("Outcomes: build green"));
    }
}
