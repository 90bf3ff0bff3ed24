//! Background analysis worker.
//!
//! The `conversation_analyses` table is the queue. Each loop iteration
//! claims as many pending rows as free concurrency slots allow; a separate
//! slower tick sweeps rows a crashed instance left in `processing`.
//! Instances on other machines cooperate through the same claim statement —
//! no coordination channel exists besides the database.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use prism_core::config::AnalysisConfig;
use prism_storage::types::AnalysisRow;
use prism_storage::{AnalysisStore, RequestStore};

use crate::client::AnalysisClient;
use crate::error::{AnalysisError, Result};
use crate::prompt;
use crate::truncate::Truncator;

const BACKOFF_BASE_MS: u64 = 2_000;
const BACKOFF_CAP_MS: u64 = 60_000;

pub struct AnalysisWorker {
    analyses: Arc<AnalysisStore>,
    requests: Arc<RequestStore>,
    client: Arc<AnalysisClient>,
    truncator: Arc<Truncator>,
    config: AnalysisConfig,
    slots: Arc<Semaphore>,
    worker_id: String,
}

impl AnalysisWorker {
    pub fn new(
        analyses: Arc<AnalysisStore>,
        requests: Arc<RequestStore>,
        config: AnalysisConfig,
    ) -> Result<Self> {
        let client = AnalysisClient::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.model.clone(),
            config.ai_analysis_timeout_ms,
        )?;
        let truncator = Truncator::new(
            config.ai_analysis_max_prompt_tokens,
            config.ai_head_messages,
            config.ai_tail_messages,
        )?;
        let slots = Arc::new(Semaphore::new(config.ai_worker_max_concurrent_jobs));
        let worker_id = format!("worker-{}", std::process::id());
        Ok(Self {
            analyses,
            requests,
            client: Arc::new(client),
            truncator: Arc::new(truncator),
            config,
            slots,
            worker_id,
        })
    }

    /// Main loop. Polls the queue until `shutdown` flips; in-flight jobs
    /// finish on their own tasks.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, "analysis worker started");
        let mut poll = tokio::time::interval(std::time::Duration::from_millis(
            self.config.ai_worker_poll_interval_ms,
        ));
        let mut sweep = tokio::time::interval(std::time::Duration::from_millis(
            self.config.stuck_sweep_interval_ms,
        ));

        loop {
            tokio::select! {
                _ = poll.tick() => self.claim_available(),
                _ = sweep.tick() => {
                    if let Err(e) = self.analyses.sweep_stuck(
                        self.config.stuck_threshold_ms,
                        self.config.ai_analysis_max_retries,
                    ) {
                        error!(error = %e, "stuck-job sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker = %self.worker_id, "analysis worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Claim pending rows while free slots remain, spawning one task each.
    fn claim_available(&self) {
        loop {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                return;
            };
            let row = match self.analyses.claim(&self.worker_id) {
                Ok(Some(row)) => row,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "claim query failed");
                    return;
                }
            };

            let analyses = Arc::clone(&self.analyses);
            let requests = Arc::clone(&self.requests);
            let client = Arc::clone(&self.client);
            let truncator = Arc::clone(&self.truncator);
            let worker_id = self.worker_id.clone();
            let max_retries = self.config.ai_analysis_max_retries;

            tokio::spawn(async move {
                let _permit = permit;
                process_job(
                    &analyses, &requests, &client, &truncator, &worker_id, max_retries, row,
                )
                .await;
            });
        }
    }
}

async fn process_job(
    analyses: &AnalysisStore,
    requests: &RequestStore,
    client: &AnalysisClient,
    truncator: &Truncator,
    worker_id: &str,
    max_retries: u32,
    row: AnalysisRow,
) {
    debug!(
        conversation = %row.conversation_id,
        branch = %row.branch_id,
        retry = row.retry_count,
        "processing analysis job"
    );

    match run_analysis(requests, client, truncator, &row).await {
        Ok((content, data, prompt_tokens, completion_tokens)) => {
            if let Err(e) = analyses.complete(
                row.id,
                client.model(),
                &content,
                data.as_ref(),
                prompt_tokens,
                completion_tokens,
                worker_id,
            ) {
                error!(error = %e, id = row.id, "failed to store completed analysis");
            }
        }
        Err(e) if e.is_permanent() => {
            warn!(id = row.id, error = %e, "analysis failed permanently");
            if let Err(e2) = analyses.fail(row.id, &e.to_string(), worker_id) {
                error!(error = %e2, id = row.id, "failed to mark analysis failed");
            }
        }
        Err(e) => {
            let attempt = row.retry_count + 1;
            if attempt > max_retries {
                warn!(id = row.id, error = %e, "analysis retries exhausted");
                if let Err(e2) = analyses.fail(row.id, &e.to_string(), worker_id) {
                    error!(error = %e2, id = row.id, "failed to mark analysis failed");
                }
                return;
            }
            // Hold the processing slot through the backoff so other
            // instances cannot re-claim the row early; the stuck sweep
            // threshold is far above the backoff cap.
            let delay = backoff_ms(row.retry_count);
            warn!(id = row.id, error = %e, delay_ms = delay, "analysis failed; retrying");
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            if let Err(e2) = analyses.retry(row.id, &e.to_string(), worker_id) {
                error!(error = %e2, id = row.id, "failed to re-queue analysis");
            }
        }
    }
}

/// One analysis attempt: load, truncate, prompt, call, parse.
async fn run_analysis(
    requests: &RequestStore,
    client: &AnalysisClient,
    truncator: &Truncator,
    row: &AnalysisRow,
) -> Result<(String, Option<serde_json::Value>, u64, u64)> {
    let messages = requests.branch_messages(&row.conversation_id, &row.branch_id)?;
    if messages.is_empty() {
        return Err(AnalysisError::EmptyConversation);
    }

    let (kept, _tokens) = truncator.truncate(messages);
    let prompt_text = prompt::render(&kept, row.custom_prompt.as_deref());

    let outcome = client.analyze(&prompt_text).await?;

    // A reply that fails to parse as JSON is still a completed analysis:
    // the raw text goes in the content column and the data stays NULL.
    let parsed: Option<serde_json::Value> =
        serde_json::from_str(prompt::strip_code_fence(&outcome.text)).ok();

    let (content, data) = match parsed {
        Some(value) if value.is_object() => (prompt::render_readable(&value), Some(value)),
        _ => (outcome.text.clone(), None),
    };

    Ok((content, data, outcome.prompt_tokens, outcome.completion_tokens))
}

/// Exponential backoff with ±20% jitter: base 2 s, doubling, capped at 60 s.
fn backoff_ms(retry_count: u32) -> u64 {
    let exp = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(retry_count));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::rng().random_range(0.8..1.2);
    (capped as f64 * jitter) as u64
}
