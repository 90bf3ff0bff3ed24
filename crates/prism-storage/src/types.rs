use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use prism_core::types::RequestType;

/// Everything known about a request before the upstream call returns.
/// Inserted once; the matching [`RequestPatch`] completes the row.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request_id: String,
    pub domain: String,
    pub account_id: String,
    pub timestamp: DateTime<Utc>,
    pub model: Option<String>,
    pub request_type: RequestType,
    pub request_body: serde_json::Value,
    pub response_streaming: bool,
    pub conversation_id: Option<String>,
    pub branch_id: Option<String>,
    pub message_count: Option<u32>,
    pub parent_request_id: Option<String>,
    pub current_message_hash: Option<String>,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub parent_task_request_id: Option<String>,
    pub is_subtask: bool,
}

/// Response-completion patch: applied exactly once per request, after which
/// the row is append-only.
#[derive(Debug, Clone, Default)]
pub struct RequestPatch {
    pub request_id: String,
    pub response_body: Option<serde_json::Value>,
    pub response_status: Option<u16>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_creation_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub first_token_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub tool_call_count: Option<u32>,
    /// Task tool_use blocks extracted from the response, kept queryable for
    /// the sub-task look-back.
    pub task_tool_invocation: Option<serde_json::Value>,
}

/// One streamed SSE event, persisted in arrival order.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub request_id: String,
    pub chunk_index: u32,
    pub timestamp: DateTime<Utc>,
    pub data: String,
    pub token_count: u32,
}

/// Row shape returned by listing endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub request_id: String,
    pub domain: String,
    pub account_id: String,
    pub timestamp: String,
    pub model: Option<String>,
    pub request_type: String,
    pub response_status: Option<u16>,
    pub response_streaming: bool,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub conversation_id: Option<String>,
    pub branch_id: Option<String>,
    pub message_count: Option<u32>,
    pub is_subtask: bool,
}

/// Full request row plus its streaming chunks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetail {
    #[serde(flatten)]
    pub summary: RequestSummary,
    pub request_body: serde_json::Value,
    pub response_body: Option<serde_json::Value>,
    pub first_token_ms: Option<u64>,
    pub tool_call_count: Option<u32>,
    pub cache_creation_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub parent_request_id: Option<String>,
    pub current_message_hash: Option<String>,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub parent_task_request_id: Option<String>,
    pub chunks: Vec<ChunkSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSummary {
    pub chunk_index: u32,
    pub timestamp: String,
    pub data: String,
    pub token_count: u32,
}

/// Server-side filters for request listing. All optional; pagination is
/// mandatory with clamped limits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestFilter {
    pub domain: Option<String>,
    pub model: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub domain: String,
    pub account_id: String,
    pub first_timestamp: String,
    pub last_timestamp: String,
    pub request_count: u32,
    pub branch_count: u32,
    pub total_tokens: u64,
    pub latest_model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDetail {
    pub conversation_id: String,
    /// branch_id -> request count, "main" first.
    pub branches: Vec<BranchSummary>,
    pub requests: Vec<RequestSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchSummary {
    pub branch_id: String,
    pub request_count: u32,
}

/// Candidate parent found by hash look-back.
#[derive(Debug, Clone)]
pub struct ParentRow {
    pub request_id: String,
    pub conversation_id: Option<String>,
    pub branch_id: Option<String>,
    pub message_count: Option<u32>,
    pub system_hash: Option<String>,
}

/// Candidate spawner found by the Task-prompt look-back.
#[derive(Debug, Clone)]
pub struct TaskCandidate {
    pub request_id: String,
    pub conversation_id: Option<String>,
    pub timestamp: String,
    /// Raw `prompt` strings of Task tool_use blocks in the response.
    pub task_prompts: Vec<String>,
}

/// A conversation turn handed to the analysis worker.
#[derive(Debug, Clone)]
pub struct BranchMessage {
    pub role: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for AnalysisStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "processing" => Ok(AnalysisStatus::Processing),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRow {
    pub id: i64,
    pub conversation_id: String,
    pub branch_id: String,
    pub status: AnalysisStatus,
    pub model: Option<String>,
    pub analysis_content: Option<String>,
    pub analysis_data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub custom_prompt: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub generated_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Rolling-window aggregation result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowUsage {
    pub window_start: String,
    pub window_end: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub request_count: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub date: String,
    pub account_id: Option<String>,
    pub domain: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub request_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainTokenStats {
    pub domain: String,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}
