//! Content-addressed hashing of message sequences.
//!
//! Conversation lineage is reconstructed purely from message content: a
//! request whose canonical prefix hashes to an earlier request's full hash
//! is its continuation. That only works if the encoding is byte-stable, so
//! the canonicalization rules here are binding:
//!
//! - system-reminder parts are filtered out before hashing
//! - adjacent identical tool_use / tool_result blocks are de-duplicated
//! - text is NFC-normalized, tool blocks serialize with sorted keys,
//!   images hash by their decoded byte content
//! - every field is length-prefixed so no delimiter can collide with content
//! - the system prompt hashes independently of the message sequence

use base64::Engine;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use prism_core::types::{is_system_reminder, ContentBlock, InboundMessage, MessageContent};

/// Hashes derived from one request's message sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHashes {
    /// Hash over the full (normalized) sequence.
    pub current: String,
    /// Hash over the sequence truncated before the last assistant turn —
    /// equal to the previous request's `current`. None for the first turn.
    pub parent: Option<String>,
}

/// Hash a request's message sequence, producing the current hash and the
/// parent hash used for lineage lookup.
pub fn hash_messages(messages: &[InboundMessage]) -> ConversationHashes {
    let current = digest_sequence(messages);

    // The parent sequence is everything before the last assistant message:
    // the previous request ended with that same prefix. A sequence with no
    // assistant turn is a conversation root.
    let parent = messages
        .iter()
        .rposition(|m| m.role == "assistant")
        .map(|idx| digest_sequence(&messages[..idx]));

    ConversationHashes { current, parent }
}

/// Hash the system prompt alone. A system-prompt change therefore never
/// severs message lineage — it only shows up as a different `system_hash`.
pub fn hash_system(system: Option<&serde_json::Value>) -> Option<String> {
    let system = system?;
    let normalized = match system {
        serde_json::Value::String(s) => nfc(s),
        serde_json::Value::Array(blocks) => {
            let parts: Vec<String> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .filter(|t| !is_system_reminder(t))
                .map(nfc)
                .collect();
            if parts.is_empty() {
                return None;
            }
            parts.join("\n")
        }
        _ => return None,
    };
    Some(hex_digest(normalized.as_bytes()))
}

/// Collapse all whitespace runs to single spaces and trim. Used for the
/// Task-prompt equality check in sub-task detection.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn digest_sequence(messages: &[InboundMessage]) -> String {
    let mut hasher = Sha256::new();
    for msg in messages {
        let parts = canonical_parts(&msg.content);
        if parts.is_empty() {
            // Message reduced to nothing (all reminders) — skip entirely so
            // harness-injected noise cannot perturb lineage.
            continue;
        }
        frame(&mut hasher, b"msg");
        frame(&mut hasher, msg.role.as_bytes());
        for part in &parts {
            frame(&mut hasher, part.kind);
            frame(&mut hasher, &part.bytes);
        }
    }
    hex::encode(hasher.finalize())
}

struct CanonicalPart {
    kind: &'static [u8],
    bytes: Vec<u8>,
}

/// Flatten message content into kind-tagged canonical byte parts, applying
/// the filtering and de-duplication rules.
fn canonical_parts(content: &MessageContent) -> Vec<CanonicalPart> {
    let blocks: Vec<&ContentBlock> = match content {
        MessageContent::Text(s) => {
            if is_system_reminder(s) {
                return Vec::new();
            }
            return vec![CanonicalPart {
                kind: b"text",
                bytes: nfc(s).into_bytes(),
            }];
        }
        MessageContent::Blocks(blocks) => blocks.iter().collect(),
    };

    let mut parts = Vec::with_capacity(blocks.len());
    let mut prev_tool_repr: Option<Vec<u8>> = None;

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                if is_system_reminder(text) {
                    continue;
                }
                prev_tool_repr = None;
                parts.push(CanonicalPart {
                    kind: b"text",
                    bytes: nfc(text).into_bytes(),
                });
            }
            ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. } => {
                let repr = canonical_json(block);
                if prev_tool_repr.as_deref() == Some(repr.as_slice()) {
                    continue;
                }
                prev_tool_repr = Some(repr.clone());
                let kind: &'static [u8] = match block {
                    ContentBlock::ToolUse { .. } => b"tool_use",
                    _ => b"tool_result",
                };
                parts.push(CanonicalPart { kind, bytes: repr });
            }
            ContentBlock::Image { source } => {
                prev_tool_repr = None;
                parts.push(CanonicalPart {
                    kind: b"image",
                    bytes: image_digest(source).into_bytes(),
                });
            }
            ContentBlock::Unknown => {
                prev_tool_repr = None;
            }
        }
    }
    parts
}

/// Serialize a tool block to canonical JSON. serde_json maps are BTreeMap
/// backed here (preserve_order is off), so keys come out sorted.
fn canonical_json(block: &ContentBlock) -> Vec<u8> {
    serde_json::to_vec(block).unwrap_or_default()
}

/// Hash an image by its decoded byte content, not the data-URL wrapper.
/// URL-sourced images hash the URL itself.
fn image_digest(source: &serde_json::Value) -> String {
    if let Some(data) = source.get("data").and_then(|d| d.as_str()) {
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(data) {
            return hex_digest(&bytes);
        }
        return hex_digest(data.as_bytes());
    }
    if let Some(url) = source.get("url").and_then(|u| u.as_str()) {
        return hex_digest(url.as_bytes());
    }
    hex_digest(source.to_string().as_bytes())
}

/// Length-prefixed framing: u32 BE length, then the bytes. No delimiter to
/// collide with content.
fn frame(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u32).to_be_bytes());
    hasher.update(bytes);
}

fn nfc(s: &str) -> String {
    s.nfc().collect()
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::types::MessagesBody;

    fn messages(json: &str) -> Vec<InboundMessage> {
        let body: MessagesBody =
            serde_json::from_str(&format!(r#"{{"model":"m","messages":{json}}}"#)).unwrap();
        body.messages
    }

    #[test]
    fn deterministic_across_calls() {
        let msgs = messages(r#"[{"role":"user","content":"hello"}]"#);
        let a = hash_messages(&msgs);
        let b = hash_messages(&msgs);
        assert_eq!(a.current, b.current);
        assert_eq!(a.current.len(), 64);
    }

    #[test]
    fn single_user_turn_has_no_parent() {
        let msgs = messages(r#"[{"role":"user","content":"hello"}]"#);
        assert!(hash_messages(&msgs).parent.is_none());
    }

    #[test]
    fn continuation_parent_equals_previous_current() {
        let first = messages(r#"[{"role":"user","content":"hello"}]"#);
        let second = messages(
            r#"[{"role":"user","content":"hello"},
                {"role":"assistant","content":"hi there"},
                {"role":"user","content":"again"}]"#,
        );
        let h1 = hash_messages(&first);
        let h2 = hash_messages(&second);
        assert_eq!(h2.parent.as_deref(), Some(h1.current.as_str()));
        assert_ne!(h2.current, h1.current);
    }

    #[test]
    fn tool_result_continuation_links_to_tool_use_request() {
        let first = messages(r#"[{"role":"user","content":"run ls"}]"#);
        let second = messages(
            r#"[{"role":"user","content":"run ls"},
                {"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]},
                {"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"file.txt"}]}]"#,
        );
        let h1 = hash_messages(&first);
        let h2 = hash_messages(&second);
        assert_eq!(h2.parent.as_deref(), Some(h1.current.as_str()));
    }

    #[test]
    fn system_reminders_do_not_perturb_hashes() {
        let plain = messages(r#"[{"role":"user","content":"hello"}]"#);
        let noisy = messages(
            r#"[{"role":"user","content":[
                {"type":"text","text":"<system-reminder>injected</system-reminder>"},
                {"type":"text","text":"hello"}]}]"#,
        );
        assert_eq!(hash_messages(&plain).current, hash_messages(&noisy).current);
    }

    #[test]
    fn adjacent_duplicate_tool_results_collapse() {
        let once = messages(
            r#"[{"role":"user","content":[
                {"type":"tool_result","tool_use_id":"t1","content":"out"}]}]"#,
        );
        let twice = messages(
            r#"[{"role":"user","content":[
                {"type":"tool_result","tool_use_id":"t1","content":"out"},
                {"type":"tool_result","tool_use_id":"t1","content":"out"}]}]"#,
        );
        assert_eq!(hash_messages(&once).current, hash_messages(&twice).current);
    }

    #[test]
    fn non_adjacent_duplicates_are_kept() {
        let spaced = messages(
            r#"[{"role":"user","content":[
                {"type":"tool_result","tool_use_id":"t1","content":"out"},
                {"type":"text","text":"and"},
                {"type":"tool_result","tool_use_id":"t1","content":"out"}]}]"#,
        );
        let once = messages(
            r#"[{"role":"user","content":[
                {"type":"tool_result","tool_use_id":"t1","content":"out"},
                {"type":"text","text":"and"}]}]"#,
        );
        assert_ne!(hash_messages(&spaced).current, hash_messages(&once).current);
    }

    #[test]
    fn nfc_equivalent_text_hashes_identically() {
        // "é" precomposed (U+00E9) vs decomposed (e + U+0301).
        let composed = messages(r#"[{"role":"user","content":"café"}]"#);
        let decomposed = messages(r#"[{"role":"user","content":"café"}]"#);
        assert_eq!(
            hash_messages(&composed).current,
            hash_messages(&decomposed).current
        );
    }

    #[test]
    fn image_hash_ignores_wrapper() {
        // Same pixel bytes under different JSON key order must hash equal.
        let a = messages(
            r#"[{"role":"user","content":[
                {"type":"image","source":{"type":"base64","media_type":"image/png","data":"aGVsbG8="}}]}]"#,
        );
        let b = messages(
            r#"[{"role":"user","content":[
                {"type":"image","source":{"data":"aGVsbG8=","media_type":"image/png","type":"base64"}}]}]"#,
        );
        assert_eq!(hash_messages(&a).current, hash_messages(&b).current);
    }

    #[test]
    fn system_hash_independent_of_messages() {
        let sys_a = serde_json::json!("you are helpful");
        let sys_b = serde_json::json!([{"type":"text","text":"you are helpful"}]);
        // String form and single-block form normalize to the same text.
        assert_eq!(hash_system(Some(&sys_a)), hash_system(Some(&sys_b)));
        assert!(hash_system(None).is_none());
    }

    #[test]
    fn whitespace_normalization_for_task_prompts() {
        assert_eq!(normalize_whitespace("  do\n\tX  now "), "do X now");
        assert_eq!(normalize_whitespace("do X now"), "do X now");
    }
}
