//! Conversation-analysis queue. The table itself is the queue: API calls
//! insert `pending` rows, worker instances claim them atomically, and a
//! periodic sweep recovers rows orphaned by a crashed worker.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::types::{AnalysisRow, AnalysisStatus};

/// Outcome of a create call: a fresh pending row, or the row that already
/// occupies the `(conversation_id, branch_id)` slot.
pub enum CreateOutcome {
    Created(AnalysisRow),
    Exists(AnalysisRow),
}

pub struct AnalysisStore {
    db: Mutex<Connection>,
}

impl AnalysisStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    pub fn create(
        &self,
        conversation_id: &str,
        branch_id: &str,
        custom_prompt: Option<&str>,
        actor: &str,
    ) -> Result<CreateOutcome> {
        let conn = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();

        let inserted = conn.execute(
            "INSERT INTO conversation_analyses
               (conversation_id, branch_id, status, custom_prompt, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?4)
             ON CONFLICT (conversation_id, branch_id) DO NOTHING",
            params![conversation_id, branch_id, custom_prompt, now],
        )?;

        let row = get_row(&conn, conversation_id, branch_id)?.ok_or_else(|| {
            StorageError::NotFound(format!("analysis {conversation_id}/{branch_id}"))
        })?;

        if inserted > 0 {
            audit(&conn, conversation_id, branch_id, "create", actor, None, Some(row.id))?;
            Ok(CreateOutcome::Created(row))
        } else {
            Ok(CreateOutcome::Exists(row))
        }
    }

    pub fn get(&self, conversation_id: &str, branch_id: &str) -> Result<Option<AnalysisRow>> {
        let conn = self.db.lock().unwrap();
        get_row(&conn, conversation_id, branch_id)
    }

    /// Atomically claim the oldest pending row: select-and-update in one
    /// statement, so concurrent claimants (in this process or another) can
    /// never take the same row. Returns None when the queue is empty.
    pub fn claim(&self, worker: &str) -> Result<Option<AnalysisRow>> {
        let conn = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();

        let row = conn
            .query_row(
                &format!(
                    "UPDATE conversation_analyses
                     SET status = 'processing', updated_at = ?1
                     WHERE id = (SELECT id FROM conversation_analyses
                                 WHERE status = 'pending'
                                 ORDER BY created_at, id LIMIT 1)
                     RETURNING {COLUMNS}"
                ),
                params![now],
                row_to_analysis,
            )
            .optional()?;

        if let Some(row) = &row {
            audit(
                &conn,
                &row.conversation_id,
                &row.branch_id,
                "claim",
                worker,
                None,
                Some(row.id),
            )?;
        }
        Ok(row)
    }

    pub fn complete(
        &self,
        id: i64,
        model: &str,
        content: &str,
        data: Option<&serde_json::Value>,
        prompt_tokens: u64,
        completion_tokens: u64,
        actor: &str,
    ) -> Result<()> {
        let conn = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE conversation_analyses
             SET status = 'completed', model = ?2, analysis_content = ?3,
                 analysis_data = ?4, prompt_tokens = ?5, completion_tokens = ?6,
                 error = NULL, updated_at = ?7, generated_at = ?7, completed_at = ?7
             WHERE id = ?1 AND status = 'processing'",
            params![
                id,
                model,
                content,
                data.map(|v| v.to_string()),
                prompt_tokens,
                completion_tokens,
                now
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("processing analysis {id}")));
        }
        audit_by_id(&conn, id, "complete", actor, None)?;
        Ok(())
    }

    /// Return a failed job to the queue for another attempt.
    pub fn retry(&self, id: i64, error: &str, actor: &str) -> Result<u32> {
        let conn = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let retry_count: u32 = conn.query_row(
            "UPDATE conversation_analyses
             SET status = 'pending', retry_count = retry_count + 1,
                 error = ?2, updated_at = ?3
             WHERE id = ?1
             RETURNING retry_count",
            params![id, error, now],
            |row| row.get(0),
        )?;
        audit_by_id(&conn, id, "retry", actor, Some(error))?;
        Ok(retry_count)
    }

    pub fn fail(&self, id: i64, error: &str, actor: &str) -> Result<()> {
        let conn = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE conversation_analyses
             SET status = 'failed', error = ?2, updated_at = ?3, completed_at = ?3
             WHERE id = ?1",
            params![id, error, now],
        )?;
        audit_by_id(&conn, id, "fail", actor, Some(error))?;
        Ok(())
    }

    /// Recover rows stuck in `processing` past the threshold. Over-budget
    /// rows become `failed`; the rest go back to `pending` with the retry
    /// counter bumped. Returns (repended, failed).
    pub fn sweep_stuck(
        &self,
        stuck_threshold_ms: u64,
        max_retries: u32,
    ) -> Result<(usize, usize)> {
        let mut conn = self.db.lock().unwrap();
        let cutoff = (chrono::Utc::now()
            - chrono::Duration::milliseconds(stuck_threshold_ms as i64))
        .to_rfc3339();
        let now = chrono::Utc::now().to_rfc3339();

        let tx = conn.transaction()?;
        let failed = tx.execute(
            "UPDATE conversation_analyses
             SET status = 'failed', error = 'stuck in processing; retries exhausted',
                 updated_at = ?1, completed_at = ?1
             WHERE status = 'processing' AND updated_at < ?2 AND retry_count >= ?3",
            params![now, cutoff, max_retries],
        )?;
        let repended = tx.execute(
            "UPDATE conversation_analyses
             SET status = 'pending', retry_count = retry_count + 1, updated_at = ?1
             WHERE status = 'processing' AND updated_at < ?2",
            params![now, cutoff],
        )?;
        tx.commit()?;

        if repended > 0 || failed > 0 {
            warn!(repended, failed, "stuck analysis sweep recovered rows");
        }
        Ok((repended, failed))
    }

    /// Delete-then-insert in one transaction so regeneration can never leave
    /// the slot empty or doubled.
    pub fn regenerate(
        &self,
        conversation_id: &str,
        branch_id: &str,
        custom_prompt: Option<&str>,
        actor: &str,
    ) -> Result<AnalysisRow> {
        let mut conn = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();

        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM conversation_analyses WHERE conversation_id = ?1 AND branch_id = ?2",
            params![conversation_id, branch_id],
        )?;
        tx.execute(
            "INSERT INTO conversation_analyses
               (conversation_id, branch_id, status, custom_prompt, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?4)",
            params![conversation_id, branch_id, custom_prompt, now],
        )?;
        let row = get_row(&tx, conversation_id, branch_id)?.ok_or_else(|| {
            StorageError::NotFound(format!("analysis {conversation_id}/{branch_id}"))
        })?;
        audit(&tx, conversation_id, branch_id, "regenerate", actor, None, Some(row.id))?;
        tx.commit()?;

        info!(conversation_id, branch_id, "analysis regeneration queued");
        Ok(row)
    }

    pub fn pending_count(&self) -> Result<u64> {
        let conn = self.db.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM conversation_analyses WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?)
    }
}

const COLUMNS: &str = "id, conversation_id, branch_id, status, model, analysis_content, \
     analysis_data, error, retry_count, prompt_tokens, completion_tokens, custom_prompt, \
     created_at, updated_at, generated_at, completed_at";

fn get_row(
    conn: &Connection,
    conversation_id: &str,
    branch_id: &str,
) -> Result<Option<AnalysisRow>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM conversation_analyses
                 WHERE conversation_id = ?1 AND branch_id = ?2"
            ),
            params![conversation_id, branch_id],
            row_to_analysis,
        )
        .optional()?)
}

fn row_to_analysis(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisRow> {
    let status_str: String = row.get(3)?;
    let data_str: Option<String> = row.get(6)?;
    Ok(AnalysisRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        branch_id: row.get(2)?,
        status: status_str.parse().unwrap_or(AnalysisStatus::Failed),
        model: row.get(4)?,
        analysis_content: row.get(5)?,
        analysis_data: data_str.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(7)?,
        retry_count: row.get(8)?,
        prompt_tokens: row.get(9)?,
        completion_tokens: row.get(10)?,
        custom_prompt: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        generated_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

fn audit(
    conn: &Connection,
    conversation_id: &str,
    branch_id: &str,
    action: &str,
    actor: &str,
    details: Option<&str>,
    analysis_id: Option<i64>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO analysis_audit_log
           (timestamp, conversation_id, branch_id, action, actor, details_json, analysis_id)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            chrono::Utc::now().to_rfc3339(),
            conversation_id,
            branch_id,
            action,
            actor,
            details.map(|d| serde_json::json!({ "detail": d }).to_string()),
            analysis_id,
        ],
    )?;
    Ok(())
}

fn audit_by_id(
    conn: &Connection,
    id: i64,
    action: &str,
    actor: &str,
    details: Option<&str>,
) -> Result<()> {
    let ids: Option<(String, String)> = conn
        .query_row(
            "SELECT conversation_id, branch_id FROM conversation_analyses WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some((conv, branch)) = ids {
        audit(conn, &conv, &branch, action, actor, details, Some(id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, open};

    fn store() -> AnalysisStore {
        let conn = open(":memory:").unwrap();
        init_db(&conn).unwrap();
        AnalysisStore::new(conn)
    }

    #[test]
    fn create_then_conflict() {
        let store = store();
        let first = store.create("c1", "main", None, "api").unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));

        let second = store.create("c1", "main", None, "api").unwrap();
        match second {
            CreateOutcome::Exists(row) => assert_eq!(row.status, AnalysisStatus::Pending),
            _ => panic!("expected conflict"),
        }
    }

    #[test]
    fn claim_takes_oldest_pending_exactly_once() {
        let store = store();
        store.create("c1", "main", None, "api").unwrap();
        store.create("c2", "main", None, "api").unwrap();

        let first = store.claim("w1").unwrap().expect("row available");
        assert_eq!(first.conversation_id, "c1");
        assert_eq!(first.status, AnalysisStatus::Processing);

        let second = store.claim("w1").unwrap().expect("second row");
        assert_eq!(second.conversation_id, "c2");

        assert!(store.claim("w1").unwrap().is_none());
    }

    #[test]
    fn complete_requires_processing_state() {
        let store = store();
        store.create("c1", "main", None, "api").unwrap();
        let row = store.claim("w1").unwrap().unwrap();

        store
            .complete(row.id, "model-a", "summary text", None, 100, 20, "w1")
            .unwrap();
        let done = store.get("c1", "main").unwrap().unwrap();
        assert_eq!(done.status, AnalysisStatus::Completed);
        assert_eq!(done.prompt_tokens, Some(100));

        // A second completion attempt finds no processing row.
        assert!(store
            .complete(row.id, "model-a", "again", None, 1, 1, "w1")
            .is_err());
    }

    #[test]
    fn retry_increments_and_repends() {
        let store = store();
        store.create("c1", "main", None, "api").unwrap();
        let row = store.claim("w1").unwrap().unwrap();

        let count = store.retry(row.id, "timeout", "w1").unwrap();
        assert_eq!(count, 1);
        let back = store.get("c1", "main").unwrap().unwrap();
        assert_eq!(back.status, AnalysisStatus::Pending);
        assert_eq!(back.retry_count, 1);
    }

    #[test]
    fn sweep_repends_stuck_rows() {
        let store = store();
        store.create("c1", "main", None, "api").unwrap();
        let row = store.claim("w1").unwrap().unwrap();

        // Backdate updated_at to look stuck.
        {
            let conn = store.db.lock().unwrap();
            let old = (chrono::Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
            conn.execute(
                "UPDATE conversation_analyses SET updated_at = ?1 WHERE id = ?2",
                params![old, row.id],
            )
            .unwrap();
        }

        let (repended, failed) = store.sweep_stuck(5 * 60 * 1000, 3).unwrap();
        assert_eq!((repended, failed), (1, 0));
        let back = store.get("c1", "main").unwrap().unwrap();
        assert_eq!(back.status, AnalysisStatus::Pending);
        assert_eq!(back.retry_count, 1);
    }

    #[test]
    fn sweep_fails_rows_out_of_retries() {
        let store = store();
        store.create("c1", "main", None, "api").unwrap();
        let row = store.claim("w1").unwrap().unwrap();
        {
            let conn = store.db.lock().unwrap();
            let old = (chrono::Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
            conn.execute(
                "UPDATE conversation_analyses SET updated_at = ?1, retry_count = 3 WHERE id = ?2",
                params![old, row.id],
            )
            .unwrap();
        }

        let (repended, failed) = store.sweep_stuck(5 * 60 * 1000, 3).unwrap();
        assert_eq!((repended, failed), (0, 1));
        let back = store.get("c1", "main").unwrap().unwrap();
        assert_eq!(back.status, AnalysisStatus::Failed);
    }

    #[test]
    fn regenerate_resets_the_slot() {
        let store = store();
        store.create("c1", "main", None, "api").unwrap();
        let row = store.claim("w1").unwrap().unwrap();
        store
            .complete(row.id, "model-a", "old summary", None, 10, 5, "w1")
            .unwrap();

        let fresh = store
            .regenerate("c1", "main", Some("focus on errors"), "api")
            .unwrap();
        assert_eq!(fresh.status, AnalysisStatus::Pending);
        assert_eq!(fresh.retry_count, 0);
        assert_eq!(fresh.custom_prompt.as_deref(), Some("focus on errors"));
        assert!(fresh.analysis_content.is_none());
    }

    #[test]
    fn audit_log_records_lifecycle() {
        let store = store();
        store.create("c1", "main", None, "api").unwrap();
        let row = store.claim("w1").unwrap().unwrap();
        store
            .complete(row.id, "model-a", "done", None, 1, 1, "w1")
            .unwrap();

        let conn = store.db.lock().unwrap();
        let actions: Vec<String> = conn
            .prepare("SELECT action FROM analysis_audit_log ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(actions, vec!["create", "claim", "complete"]);
    }
}
