//! Request read/query side plus the row-level write statements the pipeline
//! writer executes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use prism_core::types::MessageContent;

use crate::error::{Result, StorageError};
use crate::types::{
    BranchMessage, BranchSummary, ChunkRecord, ChunkSummary, ConversationDetail,
    ConversationSummary, ParentRow, RequestDetail, RequestFilter, RequestPatch, RequestRecord,
    RequestSummary, TaskCandidate,
};

pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_SIZE: u32 = 50;

// --- write statements (executed by the pipeline writer) --------------------

pub fn insert_request(conn: &Connection, rec: &RequestRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO api_requests
           (request_id, domain, account_id, timestamp, model, request_type,
            request_body, response_streaming, conversation_id, branch_id,
            message_count, parent_request_id, current_message_hash,
            parent_message_hash, system_hash, parent_task_request_id,
            is_subtask, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
        params![
            rec.request_id,
            rec.domain,
            rec.account_id,
            rec.timestamp.to_rfc3339(),
            rec.model,
            rec.request_type.as_str(),
            rec.request_body.to_string(),
            rec.response_streaming as i32,
            rec.conversation_id,
            rec.branch_id,
            rec.message_count,
            rec.parent_request_id,
            rec.current_message_hash,
            rec.parent_message_hash,
            rec.system_hash,
            rec.parent_task_request_id,
            rec.is_subtask as i32,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn patch_request(conn: &Connection, patch: &RequestPatch) -> Result<()> {
    let total = match (patch.input_tokens, patch.output_tokens) {
        (Some(i), Some(o)) => Some(i + o),
        _ => None,
    };
    conn.execute(
        "UPDATE api_requests SET
            response_body = ?2,
            response_status = ?3,
            input_tokens = ?4,
            output_tokens = ?5,
            total_tokens = ?6,
            cache_creation_tokens = ?7,
            cache_read_tokens = ?8,
            first_token_ms = ?9,
            duration_ms = ?10,
            error = ?11,
            tool_call_count = ?12,
            task_tool_invocation = ?13
         WHERE request_id = ?1",
        params![
            patch.request_id,
            patch.response_body.as_ref().map(|v| v.to_string()),
            patch.response_status,
            patch.input_tokens,
            patch.output_tokens,
            total,
            patch.cache_creation_tokens,
            patch.cache_read_tokens,
            patch.first_token_ms,
            patch.duration_ms,
            patch.error,
            patch.tool_call_count,
            patch.task_tool_invocation.as_ref().map(|v| v.to_string()),
        ],
    )?;
    Ok(())
}

/// INSERT OR IGNORE keeps chunk correlation at-most-once: a replayed chunk
/// for an existing (request_id, chunk_index) is a no-op.
pub fn insert_chunk(conn: &Connection, chunk: &ChunkRecord) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO streaming_chunks
           (request_id, chunk_index, timestamp, data, token_count)
         VALUES (?1,?2,?3,?4,?5)",
        params![
            chunk.request_id,
            chunk.chunk_index,
            chunk.timestamp.to_rfc3339(),
            chunk.data,
            chunk.token_count,
        ],
    )?;
    Ok(())
}

// --- read side --------------------------------------------------------------

/// Thread-safe read access to request rows. Wraps its own connection so
/// dashboard reads and linker look-backs never contend with the writer.
pub struct RequestStore {
    db: Mutex<Connection>,
    slow_threshold: Duration,
}

impl RequestStore {
    pub fn new(conn: Connection, slow_query_threshold_ms: u64) -> Self {
        Self {
            db: Mutex::new(conn),
            slow_threshold: Duration::from_millis(slow_query_threshold_ms),
        }
    }

    /// Run a read under the lock, logging when it exceeds the slow-query
    /// threshold.
    pub(crate) fn timed<T>(&self, query: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let conn = self.db.lock().unwrap();
        let out = f(&conn);
        let elapsed = start.elapsed();
        if elapsed > self.slow_threshold {
            warn!(query, elapsed_ms = elapsed.as_millis() as u64, "slow read query");
        }
        out
    }

    /// Direct connection access for test seeding.
    #[cfg(test)]
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.db.lock().unwrap();
        f(&conn)
    }

    pub fn get(&self, request_id: &str) -> Result<Option<RequestDetail>> {
        self.timed("request_detail", |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {DETAIL_COLUMNS} FROM api_requests WHERE request_id = ?1"),
                    params![request_id],
                    row_to_detail,
                )
                .optional()?;

            let Some(mut detail) = row else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT chunk_index, timestamp, data, token_count
                 FROM streaming_chunks WHERE request_id = ?1 ORDER BY chunk_index",
            )?;
            detail.chunks = stmt
                .query_map(params![request_id], |row| {
                    Ok(ChunkSummary {
                        chunk_index: row.get(0)?,
                        timestamp: row.get(1)?,
                        data: row.get(2)?,
                        token_count: row.get(3)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(Some(detail))
        })
    }

    pub fn list(&self, filter: &RequestFilter) -> Result<Vec<RequestSummary>> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(MAX_PAGE_SIZE);
        let offset = filter.offset.unwrap_or(0);

        self.timed("request_list", |conn| {
            let mut sql = format!(
                "SELECT {SUMMARY_COLUMNS} FROM api_requests WHERE 1=1"
            );
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(domain) = &filter.domain {
                sql.push_str(" AND domain = ?");
                args.push(Box::new(domain.clone()));
            }
            if let Some(model) = &filter.model {
                sql.push_str(" AND model = ?");
                args.push(Box::new(model.clone()));
            }
            if let Some(from) = &filter.from {
                sql.push_str(" AND timestamp >= ?");
                args.push(Box::new(from.clone()));
            }
            if let Some(to) = &filter.to {
                sql.push_str(" AND timestamp <= ?");
                args.push(Box::new(to.clone()));
            }
            sql.push_str(" ORDER BY timestamp DESC, request_id DESC LIMIT ? OFFSET ?");
            args.push(Box::new(limit));
            args.push(Box::new(offset));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                row_to_summary,
            )?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Most recent request in the tenant whose current hash equals `hash`.
    /// The look-back window bounds the scan (14 days per the linker contract).
    pub fn find_parent(
        &self,
        domain: &str,
        hash: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<ParentRow>> {
        self.timed("find_parent", |conn| {
            Ok(conn
                .query_row(
                    "SELECT request_id, conversation_id, branch_id, message_count, system_hash
                     FROM api_requests
                     WHERE domain = ?1 AND current_message_hash = ?2 AND timestamp >= ?3
                     ORDER BY timestamp DESC, request_id DESC
                     LIMIT 1",
                    params![domain, hash, since.to_rfc3339()],
                    |row| {
                        Ok(ParentRow {
                            request_id: row.get(0)?,
                            conversation_id: row.get(1)?,
                            branch_id: row.get(2)?,
                            message_count: row.get(3)?,
                            system_hash: row.get(4)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Whether some request already continues from `parent_request_id` —
    /// a second claimant means the new request is a branch.
    pub fn has_child(&self, parent_request_id: &str) -> Result<bool> {
        self.timed("has_child", |conn| {
            let n: i64 = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM api_requests WHERE parent_request_id = ?1)",
                params![parent_request_id],
                |row| row.get(0),
            )?;
            Ok(n != 0)
        })
    }

    /// Requests in the window whose response carried a Task tool_use block,
    /// newest first. Prompt comparison happens in the caller — whitespace
    /// normalization has no SQL equivalent.
    pub fn task_candidates(
        &self,
        domain: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<TaskCandidate>> {
        self.timed("task_candidates", |conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, conversation_id, timestamp, task_tool_invocation
                 FROM api_requests
                 WHERE domain = ?1 AND timestamp >= ?2 AND task_tool_invocation IS NOT NULL
                 ORDER BY timestamp DESC, request_id DESC",
            )?;
            let rows = stmt.query_map(params![domain, since.to_rfc3339()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows.filter_map(|r| r.ok()) {
                let (request_id, conversation_id, timestamp, invocation_json) = row;
                let prompts = task_prompts(&invocation_json);
                if !prompts.is_empty() {
                    out.push(TaskCandidate {
                        request_id,
                        conversation_id,
                        timestamp,
                        task_prompts: prompts,
                    });
                }
            }
            Ok(out)
        })
    }

    /// Number of sub-tasks already spawned from a parent request; the next
    /// sub-task branch becomes `subtask_{n+1}`.
    pub fn count_subtasks(&self, parent_task_request_id: &str) -> Result<u32> {
        self.timed("count_subtasks", |conn| {
            let n: u32 = conn.query_row(
                "SELECT COUNT(*) FROM api_requests WHERE parent_task_request_id = ?1",
                params![parent_task_request_id],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    pub fn list_conversations(
        &self,
        domain: Option<&str>,
        account_id: Option<&str>,
        exclude_subtasks: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>> {
        let limit = limit.min(MAX_PAGE_SIZE);
        self.timed("conversation_list", |conn| {
            let mut sql = String::from(
                "SELECT conversation_id, domain, account_id,
                        MIN(timestamp), MAX(timestamp), COUNT(*),
                        COUNT(DISTINCT branch_id), COALESCE(SUM(total_tokens), 0), MAX(model)
                 FROM api_requests
                 WHERE conversation_id IS NOT NULL",
            );
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(domain) = domain {
                sql.push_str(" AND domain = ?");
                args.push(Box::new(domain.to_string()));
            }
            if let Some(account) = account_id {
                sql.push_str(" AND account_id = ?");
                args.push(Box::new(account.to_string()));
            }
            if exclude_subtasks {
                sql.push_str(" AND is_subtask = 0");
            }
            sql.push_str(
                " GROUP BY conversation_id ORDER BY MAX(timestamp) DESC LIMIT ? OFFSET ?",
            );
            args.push(Box::new(limit));
            args.push(Box::new(offset));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                |row| {
                    Ok(ConversationSummary {
                        conversation_id: row.get(0)?,
                        domain: row.get(1)?,
                        account_id: row.get(2)?,
                        first_timestamp: row.get(3)?,
                        last_timestamp: row.get(4)?,
                        request_count: row.get(5)?,
                        branch_count: row.get(6)?,
                        total_tokens: row.get::<_, i64>(7)? as u64,
                        latest_model: row.get(8)?,
                    })
                },
            )?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn conversation_detail(&self, conversation_id: &str) -> Result<ConversationDetail> {
        self.timed("conversation_detail", |conn| {
            let mut stmt = conn.prepare(
                "SELECT branch_id, COUNT(*) FROM api_requests
                 WHERE conversation_id = ?1 AND branch_id IS NOT NULL
                 GROUP BY branch_id
                 ORDER BY CASE WHEN branch_id = 'main' THEN 0 ELSE 1 END, branch_id",
            )?;
            let branches: Vec<BranchSummary> = stmt
                .query_map(params![conversation_id], |row| {
                    Ok(BranchSummary {
                        branch_id: row.get(0)?,
                        request_count: row.get(1)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();

            if branches.is_empty() {
                return Err(StorageError::NotFound(format!(
                    "conversation {conversation_id}"
                )));
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT {SUMMARY_COLUMNS} FROM api_requests
                 WHERE conversation_id = ?1 ORDER BY timestamp, request_id"
            ))?;
            let requests: Vec<RequestSummary> = stmt
                .query_map(params![conversation_id], row_to_summary)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(ConversationDetail {
                conversation_id: conversation_id.to_string(),
                branches,
                requests,
            })
        })
    }

    /// Flatten a branch into role-tagged turns for the analysis worker.
    /// The latest request's body already carries the full history; its
    /// response supplies the final assistant turn.
    pub fn branch_messages(
        &self,
        conversation_id: &str,
        branch_id: &str,
    ) -> Result<Vec<BranchMessage>> {
        self.timed("branch_messages", |conn| {
            let row = conn
                .query_row(
                    "SELECT request_body, response_body FROM api_requests
                     WHERE conversation_id = ?1 AND branch_id = ?2
                     ORDER BY timestamp DESC, request_id DESC LIMIT 1",
                    params![conversation_id, branch_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                        ))
                    },
                )
                .optional()?;

            let Some((request_body, response_body)) = row else {
                return Err(StorageError::NotFound(format!(
                    "conversation {conversation_id} branch {branch_id}"
                )));
            };

            let mut messages = Vec::new();
            if let Ok(body) = serde_json::from_str::<prism_core::types::MessagesBody>(&request_body)
            {
                for msg in &body.messages {
                    let text = msg.content.visible_text();
                    if !text.is_empty() {
                        messages.push(BranchMessage {
                            role: msg.role.clone(),
                            text,
                        });
                    }
                }
            }
            if let Some(resp) = response_body {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&resp) {
                    if let Ok(content) = serde_json::from_value::<MessageContent>(
                        value.get("content").cloned().unwrap_or_default(),
                    ) {
                        let text = content.visible_text();
                        if !text.is_empty() {
                            messages.push(BranchMessage {
                                role: "assistant".to_string(),
                                text,
                            });
                        }
                    }
                }
            }
            Ok(messages)
        })
    }
}

/// Pull `input.prompt` out of each Task tool_use block in the stored
/// invocation JSON.
fn task_prompts(invocation_json: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(invocation_json) else {
        return Vec::new();
    };
    let Some(blocks) = value.as_array() else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|b| {
            b.get("input")
                .and_then(|i| i.get("prompt"))
                .and_then(|p| p.as_str())
                .map(str::to_string)
        })
        .collect()
}

const SUMMARY_COLUMNS: &str = "request_id, domain, account_id, timestamp, model, request_type, \
     response_status, response_streaming, input_tokens, output_tokens, total_tokens, \
     duration_ms, error, conversation_id, branch_id, message_count, is_subtask";

const DETAIL_COLUMNS: &str = "request_id, domain, account_id, timestamp, model, request_type, \
     response_status, response_streaming, input_tokens, output_tokens, total_tokens, \
     duration_ms, error, conversation_id, branch_id, message_count, is_subtask, \
     request_body, response_body, first_token_ms, tool_call_count, cache_creation_tokens, \
     cache_read_tokens, parent_request_id, current_message_hash, parent_message_hash, \
     system_hash, parent_task_request_id";

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestSummary> {
    Ok(RequestSummary {
        request_id: row.get(0)?,
        domain: row.get(1)?,
        account_id: row.get(2)?,
        timestamp: row.get(3)?,
        model: row.get(4)?,
        request_type: row.get(5)?,
        response_status: row.get(6)?,
        response_streaming: row.get::<_, i32>(7)? != 0,
        input_tokens: row.get(8)?,
        output_tokens: row.get(9)?,
        total_tokens: row.get(10)?,
        duration_ms: row.get(11)?,
        error: row.get(12)?,
        conversation_id: row.get(13)?,
        branch_id: row.get(14)?,
        message_count: row.get(15)?,
        is_subtask: row.get::<_, i32>(16)? != 0,
    })
}

fn row_to_detail(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestDetail> {
    let summary = row_to_summary(row)?;
    let request_body: String = row.get(17)?;
    let response_body: Option<String> = row.get(18)?;
    Ok(RequestDetail {
        summary,
        request_body: serde_json::from_str(&request_body)
            .unwrap_or(serde_json::Value::Null),
        response_body: response_body
            .and_then(|s| serde_json::from_str(&s).ok()),
        first_token_ms: row.get(19)?,
        tool_call_count: row.get(20)?,
        cache_creation_tokens: row.get(21)?,
        cache_read_tokens: row.get(22)?,
        parent_request_id: row.get(23)?,
        current_message_hash: row.get(24)?,
        parent_message_hash: row.get(25)?,
        system_hash: row.get(26)?,
        parent_task_request_id: row.get(27)?,
        chunks: Vec::new(),
    })
}
