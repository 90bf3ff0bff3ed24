//! Rolling-window and daily token accounting.
//!
//! Aggregations are recomputed on demand as single indexed scans — nothing
//! is materialized. Only `inference` requests count toward windows; quota
//! probes and query evaluations are tracked but never accrue.

use rusqlite::ToSql;

use crate::error::Result;
use crate::requests::RequestStore;
use crate::types::{DailyUsage, DomainTokenStats, WindowUsage};

impl RequestStore {
    /// Usage over the trailing `window_minutes` ending now, optionally
    /// narrowed to one domain and/or model.
    pub fn current_window(
        &self,
        account_id: &str,
        window_minutes: u32,
        domain: Option<&str>,
        model: Option<&str>,
    ) -> Result<WindowUsage> {
        let window_end = chrono::Utc::now();
        let window_start = window_end - chrono::Duration::minutes(window_minutes as i64);

        self.timed("current_window", |conn| {
            let mut sql = String::from(
                "SELECT COALESCE(SUM(input_tokens),0), COALESCE(SUM(output_tokens),0),
                        COALESCE(SUM(total_tokens),0), COUNT(*),
                        COALESCE(SUM(cache_creation_tokens),0), COALESCE(SUM(cache_read_tokens),0)
                 FROM api_requests
                 WHERE account_id = ?1 AND timestamp >= ?2 AND request_type = 'inference'",
            );
            let start_str = window_start.to_rfc3339();
            let mut args: Vec<&dyn ToSql> = vec![&account_id, &start_str];
            if let Some(d) = &domain {
                sql.push_str(" AND domain = ?3");
                args.push(d);
            }
            if let Some(m) = &model {
                sql.push_str(&format!(" AND model = ?{}", args.len() + 1));
                args.push(m);
            }

            let usage = conn.query_row(&sql, args.as_slice(), |row| {
                Ok(WindowUsage {
                    window_start: window_start.to_rfc3339(),
                    window_end: window_end.to_rfc3339(),
                    input_tokens: row.get::<_, i64>(0)? as u64,
                    output_tokens: row.get::<_, i64>(1)? as u64,
                    total_tokens: row.get::<_, i64>(2)? as u64,
                    request_count: row.get::<_, i64>(3)? as u64,
                    cache_creation_tokens: row.get::<_, i64>(4)? as u64,
                    cache_read_tokens: row.get::<_, i64>(5)? as u64,
                })
            })?;
            Ok(usage)
        })
    }

    /// Per-day aggregation over the trailing `days`. With `aggregate` the
    /// per-domain split collapses into one row per day.
    pub fn daily_usage(
        &self,
        account_id: Option<&str>,
        days: u32,
        domain: Option<&str>,
        aggregate: bool,
    ) -> Result<Vec<DailyUsage>> {
        let since = (chrono::Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();

        self.timed("daily_usage", |conn| {
            let group_cols = if aggregate {
                "date(timestamp)"
            } else {
                "date(timestamp), account_id, domain"
            };
            let select_ids = if aggregate {
                "NULL, NULL"
            } else {
                "account_id, domain"
            };
            let mut sql = format!(
                "SELECT date(timestamp), {select_ids},
                        COALESCE(SUM(input_tokens),0), COALESCE(SUM(output_tokens),0),
                        COALESCE(SUM(total_tokens),0), COUNT(*)
                 FROM api_requests
                 WHERE timestamp >= ?1 AND request_type = 'inference'"
            );
            let mut args: Vec<&dyn ToSql> = vec![&since];
            if let Some(a) = &account_id {
                sql.push_str(&format!(" AND account_id = ?{}", args.len() + 1));
                args.push(a);
            }
            if let Some(d) = &domain {
                sql.push_str(&format!(" AND domain = ?{}", args.len() + 1));
                args.push(d);
            }
            sql.push_str(&format!(" GROUP BY {group_cols} ORDER BY date(timestamp) DESC"));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(args.as_slice(), |row| {
                Ok(DailyUsage {
                    date: row.get(0)?,
                    account_id: row.get(1)?,
                    domain: row.get(2)?,
                    input_tokens: row.get::<_, i64>(3)? as u64,
                    output_tokens: row.get::<_, i64>(4)? as u64,
                    total_tokens: row.get::<_, i64>(5)? as u64,
                    request_count: row.get::<_, i64>(6)? as u64,
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// All-time per-domain counters for the dashboard summary.
    pub fn domain_token_stats(&self, domain: Option<&str>) -> Result<Vec<DomainTokenStats>> {
        self.timed("domain_token_stats", |conn| {
            let mut sql = String::from(
                "SELECT domain, COUNT(*),
                        COALESCE(SUM(input_tokens),0), COALESCE(SUM(output_tokens),0),
                        COALESCE(SUM(total_tokens),0)
                 FROM api_requests",
            );
            let mut args: Vec<&dyn ToSql> = Vec::new();
            if let Some(d) = &domain {
                sql.push_str(" WHERE domain = ?1");
                args.push(d);
            }
            sql.push_str(" GROUP BY domain ORDER BY domain");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(args.as_slice(), |row| {
                Ok(DomainTokenStats {
                    domain: row.get(0)?,
                    request_count: row.get::<_, i64>(1)? as u64,
                    input_tokens: row.get::<_, i64>(2)? as u64,
                    output_tokens: row.get::<_, i64>(3)? as u64,
                    total_tokens: row.get::<_, i64>(4)? as u64,
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, open};
    use crate::requests::insert_request;
    use crate::types::RequestRecord;
    use prism_core::types::RequestType;
    use rusqlite::params;

    fn seeded_store() -> RequestStore {
        let conn = open(":memory:").unwrap();
        init_db(&conn).unwrap();
        RequestStore::new(conn, 5000)
    }

    fn insert(
        store: &RequestStore,
        id: &str,
        request_type: RequestType,
        minutes_ago: i64,
        output_tokens: u64,
    ) {
        store
            .with_conn(|conn| {
                let rec = RequestRecord {
                    request_id: id.to_string(),
                    domain: "t.example".to_string(),
                    account_id: "acct-1".to_string(),
                    timestamp: chrono::Utc::now() - chrono::Duration::minutes(minutes_ago),
                    model: Some("model-1".to_string()),
                    request_type,
                    request_body: serde_json::json!({}),
                    response_streaming: false,
                    conversation_id: None,
                    branch_id: None,
                    message_count: None,
                    parent_request_id: None,
                    current_message_hash: None,
                    parent_message_hash: None,
                    system_hash: None,
                    parent_task_request_id: None,
                    is_subtask: false,
                };
                insert_request(conn, &rec)?;
                conn.execute(
                    "UPDATE api_requests SET input_tokens = 100, output_tokens = ?2,
                     total_tokens = 100 + ?2 WHERE request_id = ?1",
                    params![id, output_tokens],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn window_counts_only_inference_inside_window() {
        let store = seeded_store();
        insert(&store, "r1", RequestType::Inference, 5, 50);
        insert(&store, "r2", RequestType::Inference, 500, 70); // outside 60 min
        insert(&store, "r3", RequestType::Quota, 5, 90); // wrong type
        insert(&store, "r4", RequestType::QueryEvaluation, 5, 30); // wrong type

        let usage = store.current_window("acct-1", 60, None, None).unwrap();
        assert_eq!(usage.request_count, 1);
        assert_eq!(usage.output_tokens, 50);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn window_filters_by_domain_and_model() {
        let store = seeded_store();
        insert(&store, "r1", RequestType::Inference, 5, 50);

        let hit = store
            .current_window("acct-1", 60, Some("t.example"), Some("model-1"))
            .unwrap();
        assert_eq!(hit.request_count, 1);

        let miss = store
            .current_window("acct-1", 60, Some("other.example"), None)
            .unwrap();
        assert_eq!(miss.request_count, 0);
    }

    #[test]
    fn daily_usage_groups_by_date() {
        let store = seeded_store();
        insert(&store, "r1", RequestType::Inference, 5, 50);
        insert(&store, "r2", RequestType::Inference, 10, 25);

        let rows = store.daily_usage(Some("acct-1"), 7, None, true).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].output_tokens, 75);
        assert_eq!(rows[0].request_count, 2);
        assert!(rows[0].account_id.is_none());
    }

    #[test]
    fn domain_stats_cover_all_request_types() {
        let store = seeded_store();
        insert(&store, "r1", RequestType::Inference, 5, 50);
        insert(&store, "r3", RequestType::Quota, 5, 0);

        let stats = store.domain_token_stats(None).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].domain, "t.example");
        assert_eq!(stats[0].request_count, 2);
    }
}
