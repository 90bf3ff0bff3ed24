//! Batched, back-pressured write pipeline.
//!
//! One process-wide bounded queue feeds a writer task that owns its own
//! connection. Items flush in arrival order — which preserves per-request
//! chunk ordering and guarantees the completion patch lands after every
//! chunk of its request — in a single transaction per batch.
//!
//! Persistence loss is always preferred over response loss: a full queue
//! blocks the producer briefly, then drops the item and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use prism_core::config::PipelineConfig;

use crate::requests::{insert_chunk, insert_request, patch_request};
use crate::types::{ChunkRecord, RequestPatch, RequestRecord};

#[derive(Debug)]
pub enum WriteItem {
    InsertRequest(Box<RequestRecord>),
    PatchRequest(Box<RequestPatch>),
    InsertChunk(ChunkRecord),
}

/// Cloneable producer handle. A disabled pipeline (storage off) swallows
/// every enqueue.
#[derive(Clone)]
pub struct WritePipeline {
    tx: Option<mpsc::Sender<WriteItem>>,
    capacity: usize,
    enqueue_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl WritePipeline {
    /// Spawn the writer task. The returned handle enqueues; the join handle
    /// completes once shutdown has drained the queue.
    pub fn spawn(
        conn: Connection,
        config: &PipelineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let writer = Writer {
            conn,
            rx,
            shutdown,
            batch_size: config.batch_size,
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            shutdown_flush_timeout: Duration::from_millis(config.shutdown_flush_timeout_ms),
        };
        let handle = tokio::spawn(writer.run());

        (
            Self {
                tx: Some(tx),
                capacity: config.queue_capacity,
                enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
                dropped,
            },
            handle,
        )
    }

    /// No-op pipeline for `storage_enabled = false`.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            capacity: 0,
            enqueue_timeout: Duration::ZERO,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueue with bounded blocking. On timeout the item is dropped and
    /// counted; the caller's request proceeds regardless.
    pub async fn enqueue(&self, item: WriteItem) {
        let Some(tx) = &self.tx else { return };
        match tx.send_timeout(item, self.enqueue_timeout).await {
            Ok(()) => {}
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "write pipeline full; item dropped");
            }
        }
    }

    /// Items currently queued (not yet picked up by the writer).
    pub fn depth(&self) -> usize {
        match &self.tx {
            Some(tx) => self.capacity - tx.capacity(),
            None => 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Writer {
    conn: Connection,
    rx: mpsc::Receiver<WriteItem>,
    shutdown: watch::Receiver<bool>,
    batch_size: usize,
    flush_interval: Duration,
    shutdown_flush_timeout: Duration,
}

impl Writer {
    async fn run(self) {
        info!("write pipeline started");
        let Writer {
            mut conn,
            mut rx,
            mut shutdown,
            batch_size,
            flush_interval,
            shutdown_flush_timeout,
        } = self;
        let mut buffer: Vec<WriteItem> = Vec::with_capacity(batch_size);
        let mut oldest: Option<Instant> = None;

        loop {
            let sleep_for = oldest
                .map(|t| (t + flush_interval).saturating_duration_since(Instant::now()))
                .unwrap_or(flush_interval);

            tokio::select! {
                item = rx.recv() => {
                    match item {
                        Some(item) => {
                            if oldest.is_none() {
                                oldest = Some(Instant::now());
                            }
                            buffer.push(item);
                            if buffer.len() >= batch_size {
                                flush_batch(&mut conn, &mut buffer);
                                oldest = None;
                            }
                        }
                        // all senders gone — final flush and exit
                        None => {
                            flush_batch(&mut conn, &mut buffer);
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(sleep_for), if oldest.is_some() => {
                    flush_batch(&mut conn, &mut buffer);
                    oldest = None;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        drain(&mut conn, &mut rx, buffer, batch_size, shutdown_flush_timeout).await;
                        break;
                    }
                }
            }
        }
        info!("write pipeline stopped");
    }
}

/// Shutdown drain: flush what is buffered, then keep pulling until the
/// queue is empty or the timeout expires.
async fn drain(
    conn: &mut Connection,
    rx: &mut mpsc::Receiver<WriteItem>,
    mut buffer: Vec<WriteItem>,
    batch_size: usize,
    flush_timeout: Duration,
) {
    let deadline = Instant::now() + flush_timeout;
    loop {
        if buffer.len() >= batch_size {
            flush_batch(conn, &mut buffer);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(pending = buffer.len(), "shutdown flush timeout; remaining items lost");
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(item)) => buffer.push(item),
            Ok(None) => break,
            Err(_) => {
                warn!("shutdown flush timeout while draining queue");
                break;
            }
        }
    }
    flush_batch(conn, &mut buffer);
}

/// One transaction per batch. A failed item is logged and skipped —
/// storage is best-effort and must never wedge the queue.
fn flush_batch(conn: &mut Connection, buffer: &mut Vec<WriteItem>) {
    if buffer.is_empty() {
        return;
    }
    let count = buffer.len();
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            error!(error = %e, count, "failed to open write transaction; batch lost");
            buffer.clear();
            return;
        }
    };

    for item in buffer.drain(..) {
        let result = match &item {
            WriteItem::InsertRequest(rec) => insert_request(&tx, rec),
            WriteItem::PatchRequest(patch) => patch_request(&tx, patch),
            WriteItem::InsertChunk(chunk) => insert_chunk(&tx, chunk),
        };
        if let Err(e) = result {
            error!(error = %e, "write item failed; skipped");
        }
    }

    if let Err(e) = tx.commit() {
        error!(error = %e, count, "batch commit failed");
    } else {
        debug!(count, "batch flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, open};
    use crate::requests::RequestStore;
    use prism_core::types::RequestType;

    fn record(id: &str) -> RequestRecord {
        RequestRecord {
            request_id: id.to_string(),
            domain: "t.example".to_string(),
            account_id: "acct".to_string(),
            timestamp: chrono::Utc::now(),
            model: Some("model-1".to_string()),
            request_type: RequestType::Inference,
            request_body: serde_json::json!({"model": "model-1", "messages": []}),
            response_streaming: true,
            conversation_id: Some("conv".to_string()),
            branch_id: Some("main".to_string()),
            message_count: Some(1),
            parent_request_id: None,
            current_message_hash: Some("h1".to_string()),
            parent_message_hash: None,
            system_hash: None,
            parent_task_request_id: None,
            is_subtask: false,
        }
    }

    fn chunk(id: &str, index: u32) -> ChunkRecord {
        ChunkRecord {
            request_id: id.to_string(),
            chunk_index: index,
            timestamp: chrono::Utc::now(),
            data: format!("event: content_block_delta\ndata: {{\"i\":{index}}}"),
            token_count: 1,
        }
    }

    /// Shared in-memory DB across connections via a named URI.
    fn shared_pair(name: &str) -> (Connection, Connection) {
        let uri = format!("file:{name}?mode=memory&cache=shared");
        let a = Connection::open(&uri).unwrap();
        let b = Connection::open(&uri).unwrap();
        init_db(&a).unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn insert_chunks_and_patch_flush_in_order() {
        let (writer_conn, read_conn) = shared_pair("writer_order");
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut cfg = prism_core::config::PipelineConfig::default();
        cfg.flush_interval_ms = 10;

        let (pipeline, handle) = WritePipeline::spawn(writer_conn, &cfg, stop_rx);

        pipeline
            .enqueue(WriteItem::InsertRequest(Box::new(record("r1"))))
            .await;
        for i in 0..5 {
            pipeline.enqueue(WriteItem::InsertChunk(chunk("r1", i))).await;
        }
        pipeline
            .enqueue(WriteItem::PatchRequest(Box::new(RequestPatch {
                request_id: "r1".to_string(),
                response_status: Some(200),
                input_tokens: Some(10),
                output_tokens: Some(20),
                ..Default::default()
            })))
            .await;

        // Give the age-based flush a chance to run.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let store = RequestStore::new(read_conn, 5000);
        let detail = store.get("r1").unwrap().expect("row exists");
        assert_eq!(detail.chunks.len(), 5);
        let indices: Vec<u32> = detail.chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(detail.summary.total_tokens, Some(30));
        assert_eq!(detail.summary.response_status, Some(200));

        drop(pipeline);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn batch_size_triggers_flush_without_waiting() {
        let (writer_conn, read_conn) = shared_pair("writer_batch");
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut cfg = prism_core::config::PipelineConfig::default();
        cfg.batch_size = 3;
        cfg.flush_interval_ms = 60_000; // age flush effectively off

        let (pipeline, handle) = WritePipeline::spawn(writer_conn, &cfg, stop_rx);
        pipeline
            .enqueue(WriteItem::InsertRequest(Box::new(record("r1"))))
            .await;
        pipeline.enqueue(WriteItem::InsertChunk(chunk("r1", 0))).await;
        pipeline.enqueue(WriteItem::InsertChunk(chunk("r1", 1))).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let store = RequestStore::new(read_conn, 5000);
        assert!(store.get("r1").unwrap().is_some());

        drop(pipeline);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_pending_items() {
        let (writer_conn, read_conn) = shared_pair("writer_drain");
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut cfg = prism_core::config::PipelineConfig::default();
        cfg.flush_interval_ms = 60_000;

        let (pipeline, handle) = WritePipeline::spawn(writer_conn, &cfg, stop_rx);
        pipeline
            .enqueue(WriteItem::InsertRequest(Box::new(record("r9"))))
            .await;

        stop_tx.send(true).unwrap();
        drop(pipeline);
        handle.await.unwrap();

        let store = RequestStore::new(read_conn, 5000);
        assert!(store.get("r9").unwrap().is_some());
    }

    #[tokio::test]
    async fn disabled_pipeline_swallows_items() {
        let pipeline = WritePipeline::disabled();
        pipeline
            .enqueue(WriteItem::InsertRequest(Box::new(record("r1"))))
            .await;
        assert_eq!(pipeline.depth(), 0);
        assert!(!pipeline.is_enabled());
    }

    #[tokio::test]
    async fn duplicate_chunk_insert_is_ignored() {
        let (conn, read_conn) = shared_pair("writer_dup");
        insert_request(&conn, &record("r1")).unwrap();
        insert_chunk(&conn, &chunk("r1", 0)).unwrap();
        insert_chunk(&conn, &chunk("r1", 0)).unwrap();

        let store = RequestStore::new(read_conn, 5000);
        assert_eq!(store.get("r1").unwrap().unwrap().chunks.len(), 1);
    }
}
