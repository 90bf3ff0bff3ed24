use rusqlite::Connection;

use crate::error::Result;

/// Open a connection with the pragmas every prism connection needs:
/// WAL so the writer never blocks readers, and a busy timeout so
/// concurrent connections queue instead of erroring.
pub fn open(path: &str) -> Result<Connection> {
    let conn = if path == ":memory:" {
        Connection::open_in_memory()?
    } else {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Connection::open(path)?
    };
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}

/// Initialise the full schema. Column names are contractual — operator
/// tooling reads these tables directly. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS api_requests (
            request_id             TEXT    NOT NULL PRIMARY KEY,
            domain                 TEXT    NOT NULL,
            account_id             TEXT    NOT NULL,
            timestamp              TEXT    NOT NULL,
            model                  TEXT,
            request_type           TEXT    NOT NULL,
            request_body           TEXT    NOT NULL,   -- opaque JSON
            response_body          TEXT,               -- opaque JSON, NULL until completion
            response_status        INTEGER,
            response_streaming     INTEGER NOT NULL DEFAULT 0,
            input_tokens           INTEGER,
            output_tokens          INTEGER,
            total_tokens           INTEGER,
            cache_creation_tokens  INTEGER,
            cache_read_tokens      INTEGER,
            first_token_ms         INTEGER,
            duration_ms            INTEGER,
            error                  TEXT,
            tool_call_count        INTEGER,
            conversation_id        TEXT,
            branch_id              TEXT,
            message_count          INTEGER,
            parent_request_id      TEXT,
            current_message_hash   TEXT,
            parent_message_hash    TEXT,
            system_hash            TEXT,
            parent_task_request_id TEXT,
            is_subtask             INTEGER NOT NULL DEFAULT 0,
            task_tool_invocation   TEXT,               -- JSON array of Task tool_use blocks
            created_at             TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_requests_domain_ts
            ON api_requests (domain, timestamp);
        CREATE INDEX IF NOT EXISTS idx_requests_account
            ON api_requests (account_id);
        CREATE INDEX IF NOT EXISTS idx_requests_conversation
            ON api_requests (conversation_id);
        CREATE INDEX IF NOT EXISTS idx_requests_conv_branch
            ON api_requests (conversation_id, branch_id);
        CREATE INDEX IF NOT EXISTS idx_requests_current_hash
            ON api_requests (current_message_hash);
        CREATE INDEX IF NOT EXISTS idx_requests_parent_hash
            ON api_requests (parent_message_hash);
        CREATE INDEX IF NOT EXISTS idx_requests_parent_task
            ON api_requests (parent_task_request_id);
        -- Sub-task look-back: rows that contain Task tool_use blocks are
        -- flagged at insert time so the 30 s window scan stays narrow.
        CREATE INDEX IF NOT EXISTS idx_requests_task_inv
            ON api_requests (domain, timestamp) WHERE task_tool_invocation IS NOT NULL;

        CREATE TABLE IF NOT EXISTS streaming_chunks (
            request_id   TEXT    NOT NULL,
            chunk_index  INTEGER NOT NULL,
            timestamp    TEXT    NOT NULL,
            data         TEXT    NOT NULL,
            token_count  INTEGER NOT NULL DEFAULT 0,
            UNIQUE (request_id, chunk_index)
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_request
            ON streaming_chunks (request_id);

        CREATE TABLE IF NOT EXISTS conversation_analyses (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id    TEXT    NOT NULL,
            branch_id          TEXT    NOT NULL DEFAULT 'main',
            status             TEXT    NOT NULL DEFAULT 'pending',
            model              TEXT,
            analysis_content   TEXT,
            analysis_data      TEXT,               -- structured JSON or NULL
            error              TEXT,
            retry_count        INTEGER NOT NULL DEFAULT 0,
            prompt_tokens      INTEGER,
            completion_tokens  INTEGER,
            custom_prompt      TEXT,
            created_at         TEXT    NOT NULL,
            updated_at         TEXT    NOT NULL,
            generated_at       TEXT,
            completed_at       TEXT,
            UNIQUE (conversation_id, branch_id)
        );
        CREATE INDEX IF NOT EXISTS idx_analyses_pending
            ON conversation_analyses (created_at) WHERE status = 'pending';

        CREATE TABLE IF NOT EXISTS analysis_audit_log (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp       TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            branch_id       TEXT NOT NULL,
            action          TEXT NOT NULL,
            actor           TEXT NOT NULL,
            details_json    TEXT,
            analysis_id     INTEGER
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = open(":memory:").unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn chunk_uniqueness_enforced() {
        let conn = open(":memory:").unwrap();
        init_db(&conn).unwrap();
        conn.execute(
            "INSERT INTO streaming_chunks (request_id, chunk_index, timestamp, data) VALUES ('r1', 0, 't', 'a')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO streaming_chunks (request_id, chunk_index, timestamp, data) VALUES ('r1', 0, 't', 'b')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn analysis_unique_per_conversation_branch() {
        let conn = open(":memory:").unwrap();
        init_db(&conn).unwrap();
        conn.execute(
            "INSERT INTO conversation_analyses (conversation_id, branch_id, created_at, updated_at)
             VALUES ('c1', 'main', 't', 't')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO conversation_analyses (conversation_id, branch_id, created_at, updated_at)
             VALUES ('c1', 'main', 't', 't')",
            [],
        );
        assert!(dup.is_err());
    }
}
