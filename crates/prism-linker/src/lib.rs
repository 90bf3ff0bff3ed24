//! Conversation linking: given a new request's content hashes, decide which
//! conversation and branch it belongs to, which request it continues, and
//! whether it is a sub-task spawned by a Task tool call.
//!
//! Linking is best-effort by contract. Any look-back failure degrades to a
//! fresh conversation; it never fails the request.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use prism_core::types::MessagesBody;
use prism_hash::{normalize_whitespace, ConversationHashes};
use prism_storage::RequestStore;

/// How far back a Task tool call can spawn a sub-task.
const SUBTASK_WINDOW_SECS: i64 = 30;
/// Parent-hash look-back horizon.
const PARENT_LOOKBACK_DAYS: i64 = 14;

pub const MAIN_BRANCH: &str = "main";

/// The linker's verdict, stored on the request row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linkage {
    pub conversation_id: String,
    pub branch_id: String,
    pub parent_request_id: Option<String>,
    pub parent_task_request_id: Option<String>,
    pub is_subtask: bool,
    pub message_count: u32,
    /// Cleared for sub-tasks — a spawned task starts its own lineage.
    pub parent_message_hash: Option<String>,
}

impl Linkage {
    fn fresh() -> Self {
        Self {
            conversation_id: Uuid::new_v4().to_string(),
            branch_id: MAIN_BRANCH.to_string(),
            parent_request_id: None,
            parent_task_request_id: None,
            is_subtask: false,
            message_count: 1,
            parent_message_hash: None,
        }
    }
}

pub struct Linker {
    store: Arc<RequestStore>,
}

impl Linker {
    pub fn new(store: Arc<RequestStore>) -> Self {
        Self { store }
    }

    /// Decide conversation, branch, parent, and sub-task linkage for a new
    /// request in `domain` observed at `now`.
    pub fn link(
        &self,
        domain: &str,
        body: &MessagesBody,
        hashes: &ConversationHashes,
        now: DateTime<Utc>,
    ) -> Linkage {
        // Sub-task detection runs first: a request whose opening user message
        // replays a recent Task prompt belongs to the spawning conversation,
        // not to whatever its own hashes would suggest.
        match self.detect_subtask(domain, body, now) {
            Ok(Some(linkage)) => return linkage,
            Ok(None) => {}
            Err(e) => warn!(domain, error = %e, "sub-task look-back failed; continuing"),
        }

        match self.link_by_parent_hash(domain, hashes, now) {
            Ok(Some(linkage)) => return linkage,
            Ok(None) => {}
            Err(e) => warn!(domain, error = %e, "parent look-back failed; starting fresh"),
        }

        let linkage = Linkage {
            parent_message_hash: hashes.parent.clone(),
            ..Linkage::fresh()
        };
        debug!(domain, conversation_id = %linkage.conversation_id, "new conversation");
        linkage
    }

    fn detect_subtask(
        &self,
        domain: &str,
        body: &MessagesBody,
        now: DateTime<Utc>,
    ) -> prism_storage::Result<Option<Linkage>> {
        // Only a conversation opener can be a spawned sub-task.
        if body.user_message_count() != 1 {
            return Ok(None);
        }
        let Some(first_user) = body.first_user_text() else {
            return Ok(None);
        };
        let target = normalize_whitespace(&first_user);
        if target.is_empty() {
            return Ok(None);
        }

        let since = now - chrono::Duration::seconds(SUBTASK_WINDOW_SECS);
        // Candidates come back newest-first; the first prompt match wins.
        let candidates = self.store.task_candidates(domain, since)?;
        for candidate in candidates {
            let matched = candidate
                .task_prompts
                .iter()
                .any(|p| normalize_whitespace(p) == target);
            if !matched {
                continue;
            }

            let k = self.store.count_subtasks(&candidate.request_id)? + 1;
            let conversation_id = candidate
                .conversation_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            debug!(
                domain,
                parent = %candidate.request_id,
                subtask = k,
                "sub-task detected"
            );
            return Ok(Some(Linkage {
                conversation_id,
                branch_id: format!("subtask_{k}"),
                parent_request_id: None,
                parent_task_request_id: Some(candidate.request_id),
                is_subtask: true,
                message_count: 1,
                parent_message_hash: None,
            }));
        }
        Ok(None)
    }

    fn link_by_parent_hash(
        &self,
        domain: &str,
        hashes: &ConversationHashes,
        now: DateTime<Utc>,
    ) -> prism_storage::Result<Option<Linkage>> {
        let Some(parent_hash) = &hashes.parent else {
            return Ok(None);
        };

        let since = now - chrono::Duration::days(PARENT_LOOKBACK_DAYS);
        let Some(parent) = self.store.find_parent(domain, parent_hash, since)? else {
            return Ok(None);
        };

        let conversation_id = parent
            .conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let message_count = parent.message_count.unwrap_or(0) + 1;

        // A parent that already has a continuation makes this a branch.
        let branch_id = if self.store.has_child(&parent.request_id)? {
            format!("branch-{}", now.format("%Y-%m-%d-%H-%M-%S"))
        } else {
            parent
                .branch_id
                .clone()
                .unwrap_or_else(|| MAIN_BRANCH.to_string())
        };

        debug!(
            domain,
            parent = %parent.request_id,
            branch = %branch_id,
            "continuing conversation"
        );
        Ok(Some(Linkage {
            conversation_id,
            branch_id,
            parent_request_id: Some(parent.request_id),
            parent_task_request_id: None,
            is_subtask: false,
            message_count,
            parent_message_hash: Some(parent_hash.clone()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::types::RequestType;
    use prism_storage::requests::{insert_request, patch_request};
    use prism_storage::types::{RequestPatch, RequestRecord};

    /// Open a fresh in-memory database for seeding; wrap it in a store with
    /// `finish` once the fixture rows are in.
    fn seed_conn() -> rusqlite::Connection {
        let conn = prism_storage::open(":memory:").unwrap();
        prism_storage::init_db(&conn).unwrap();
        conn
    }

    fn finish(conn: rusqlite::Connection) -> Arc<RequestStore> {
        Arc::new(RequestStore::new(conn, 5000))
    }

    fn body(json: &str) -> MessagesBody {
        MessagesBody::parse(json.as_bytes()).unwrap()
    }

    fn seed(
        conn: &rusqlite::Connection,
        id: &str,
        linkage: &Linkage,
        current_hash: &str,
        seconds_ago: i64,
        task_prompt: Option<&str>,
    ) {
        insert_request(
            conn,
            &RequestRecord {
                request_id: id.to_string(),
                domain: "t.example".to_string(),
                account_id: "acct".to_string(),
                timestamp: Utc::now() - chrono::Duration::seconds(seconds_ago),
                model: Some("model-1".to_string()),
                request_type: RequestType::Inference,
                request_body: serde_json::json!({}),
                response_streaming: false,
                conversation_id: Some(linkage.conversation_id.clone()),
                branch_id: Some(linkage.branch_id.clone()),
                message_count: Some(linkage.message_count),
                parent_request_id: linkage.parent_request_id.clone(),
                current_message_hash: Some(current_hash.to_string()),
                parent_message_hash: linkage.parent_message_hash.clone(),
                system_hash: None,
                parent_task_request_id: linkage.parent_task_request_id.clone(),
                is_subtask: linkage.is_subtask,
            },
        )
        .unwrap();
        if let Some(prompt) = task_prompt {
            patch_request(
                conn,
                &RequestPatch {
                    request_id: id.to_string(),
                    response_status: Some(200),
                    task_tool_invocation: Some(serde_json::json!([
                        {"type": "tool_use", "name": "Task", "input": {"prompt": prompt}}
                    ])),
                    ..Default::default()
                },
            )
            .unwrap();
        }
    }

    fn hashes(current: &str, parent: Option<&str>) -> ConversationHashes {
        ConversationHashes {
            current: current.to_string(),
            parent: parent.map(str::to_string),
        }
    }

    fn root_linkage(conversation_id: &str) -> Linkage {
        Linkage {
            conversation_id: conversation_id.to_string(),
            branch_id: MAIN_BRANCH.to_string(),
            parent_request_id: None,
            parent_task_request_id: None,
            is_subtask: false,
            message_count: 1,
            parent_message_hash: None,
        }
    }

    #[test]
    fn fresh_conversation_when_no_parent_hash() {
        let store = finish(seed_conn());
        let linker = Linker::new(Arc::clone(&store));

        let b = body(r#"{"model":"m","messages":[{"role":"user","content":"hello"}]}"#);
        let out = linker.link("t.example", &b, &hashes("h1", None), Utc::now());

        assert_eq!(out.branch_id, MAIN_BRANCH);
        assert_eq!(out.message_count, 1);
        assert!(out.parent_request_id.is_none());
        assert!(!out.is_subtask);
    }

    #[test]
    fn continuation_inherits_conversation_and_branch() {
        let conn = seed_conn();
        seed(&conn, "r1", &root_linkage("conv-1"), "h1", 60, None);
        let store = finish(conn);
        let linker = Linker::new(Arc::clone(&store));

        let b = body(r#"{"model":"m","messages":[{"role":"user","content":"again"}]}"#);
        let out = linker.link("t.example", &b, &hashes("h2", Some("h1")), Utc::now());

        assert_eq!(out.conversation_id, "conv-1");
        assert_eq!(out.branch_id, MAIN_BRANCH);
        assert_eq!(out.parent_request_id.as_deref(), Some("r1"));
        assert_eq!(out.message_count, 2);
        assert_eq!(out.parent_message_hash.as_deref(), Some("h1"));
    }

    #[test]
    fn second_claimant_becomes_branch() {
        let conn = seed_conn();
        seed(&conn, "r1", &root_linkage("conv-1"), "h1", 120, None);
        // r2 already continues r1.
        let continuation = Linkage {
            conversation_id: "conv-1".to_string(),
            branch_id: MAIN_BRANCH.to_string(),
            parent_request_id: Some("r1".to_string()),
            parent_task_request_id: None,
            is_subtask: false,
            message_count: 2,
            parent_message_hash: Some("h1".to_string()),
        };
        seed(&conn, "r2", &continuation, "h2", 60, None);

        let store = finish(conn);
        let linker = Linker::new(Arc::clone(&store));
        let b = body(r#"{"model":"m","messages":[{"role":"user","content":"other path"}]}"#);
        let now = Utc::now();
        let out = linker.link("t.example", &b, &hashes("h3", Some("h1")), now);

        assert_eq!(out.conversation_id, "conv-1");
        assert_eq!(out.parent_request_id.as_deref(), Some("r1"));
        assert_eq!(out.message_count, 2);
        assert_eq!(
            out.branch_id,
            format!("branch-{}", now.format("%Y-%m-%d-%H-%M-%S"))
        );
    }

    #[test]
    fn parent_ties_break_by_recency() {
        let conn = seed_conn();
        seed(&conn, "r-old", &root_linkage("conv-old"), "h1", 600, None);
        seed(&conn, "r-new", &root_linkage("conv-new"), "h1", 10, None);

        let store = finish(conn);
        let linker = Linker::new(Arc::clone(&store));
        let b = body(r#"{"model":"m","messages":[{"role":"user","content":"x"}]}"#);
        let out = linker.link("t.example", &b, &hashes("h2", Some("h1")), Utc::now());

        assert_eq!(out.parent_request_id.as_deref(), Some("r-new"));
        assert_eq!(out.conversation_id, "conv-new");
    }

    #[test]
    fn unknown_parent_hash_starts_fresh_but_keeps_hash() {
        let store = finish(seed_conn());
        let linker = Linker::new(Arc::clone(&store));
        let b = body(r#"{"model":"m","messages":[{"role":"user","content":"x"}]}"#);
        let out = linker.link("t.example", &b, &hashes("h2", Some("h-missing")), Utc::now());

        assert_eq!(out.branch_id, MAIN_BRANCH);
        assert!(out.parent_request_id.is_none());
        assert_eq!(out.message_count, 1);
        // The hash is stored as computed even when no parent was found.
        assert_eq!(out.parent_message_hash.as_deref(), Some("h-missing"));
    }

    #[test]
    fn subtask_detected_within_window() {
        let conn = seed_conn();
        seed(&conn, "r1", &root_linkage("conv-1"), "h1", 10, Some("do X"));

        let store = finish(conn);
        let linker = Linker::new(Arc::clone(&store));
        let b = body(r#"{"model":"m","messages":[{"role":"user","content":"do   X"}]}"#);
        let out = linker.link("t.example", &b, &hashes("hs", None), Utc::now());

        assert!(out.is_subtask);
        assert_eq!(out.parent_task_request_id.as_deref(), Some("r1"));
        assert_eq!(out.conversation_id, "conv-1");
        assert_eq!(out.branch_id, "subtask_1");
        assert_eq!(out.message_count, 1);
        assert!(out.parent_message_hash.is_none());
        assert!(out.parent_request_id.is_none());
    }

    #[test]
    fn second_subtask_increments_branch_number() {
        let conn = seed_conn();
        seed(&conn, "r1", &root_linkage("conv-1"), "h1", 10, Some("do X"));
        let first_subtask = Linkage {
            conversation_id: "conv-1".to_string(),
            branch_id: "subtask_1".to_string(),
            parent_request_id: None,
            parent_task_request_id: Some("r1".to_string()),
            is_subtask: true,
            message_count: 1,
            parent_message_hash: None,
        };
        seed(&conn, "r-sub1", &first_subtask, "hs1", 5, None);

        let store = finish(conn);
        let linker = Linker::new(Arc::clone(&store));
        let b = body(r#"{"model":"m","messages":[{"role":"user","content":"do X"}]}"#);
        let out = linker.link("t.example", &b, &hashes("hs2", None), Utc::now());

        assert_eq!(out.branch_id, "subtask_2");
        assert_eq!(out.parent_task_request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn subtask_outside_window_is_ignored() {
        let conn = seed_conn();
        seed(&conn, "r1", &root_linkage("conv-1"), "h1", 60, Some("do X"));

        let store = finish(conn);
        let linker = Linker::new(Arc::clone(&store));
        let b = body(r#"{"model":"m","messages":[{"role":"user","content":"do X"}]}"#);
        let out = linker.link("t.example", &b, &hashes("hs", None), Utc::now());

        assert!(!out.is_subtask);
        assert_ne!(out.conversation_id, "conv-1");
    }

    #[test]
    fn multi_turn_request_is_never_a_subtask() {
        let conn = seed_conn();
        seed(&conn, "r1", &root_linkage("conv-1"), "h1", 5, Some("do X"));

        let store = finish(conn);
        let linker = Linker::new(Arc::clone(&store));
        let b = body(
            r#"{"model":"m","messages":[
                {"role":"user","content":"do X"},
                {"role":"assistant","content":"done"},
                {"role":"user","content":"do X"}]}"#,
        );
        let out = linker.link("t.example", &b, &hashes("h9", Some("h8")), Utc::now());
        assert!(!out.is_subtask);
    }
}
