//! Batch inference API client.
//!
//! The asynchronous alternative to the streaming pipeline: upload a JSONL
//! requests file, create a batch job against the chat-completions endpoint,
//! poll until a terminal state, download the JSONL output. Polling is
//! resilient: fixed interval on success, capped exponential backoff across
//! transient errors, optional hard wall-clock timeout.

use std::time::Duration;

use anyhow::{anyhow, Context};
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::ChatMessage;
use crate::run_config::BatchConfig;

const BATCHES_ENDPOINT: &str = "https://api.openai.com/v1/batches";
const FILES_ENDPOINT: &str = "https://api.openai.com/v1/files";

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequestBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
}

/// One line of the uploaded requests file, keyed by a caller-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatRequestBody,
}

impl BatchRequestLine {
    pub fn chat(
        custom_id: impl Into<String>,
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
        temperature: f64,
    ) -> Self {
        Self {
            custom_id: custom_id.into(),
            method: "POST".to_string(),
            url: "/v1/chat/completions".to_string(),
            body: ChatRequestBody {
                model: model.into(),
                messages,
                temperature,
            },
        }
    }
}

fn jsonl_content(requests: &[BatchRequestLine]) -> Result<Vec<u8>, serde_json::Error> {
    let mut content = Vec::new();
    for request in requests {
        let line = serde_json::to_string(request)?;
        content.extend_from_slice(line.as_bytes());
        content.push(b'\n');
    }
    Ok(content)
}

// ============================================================================
// Job Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Expired
                | BatchStatus::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BatchStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: BatchStatus,
    pub input_file_id: Option<String>,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub request_counts: RequestCounts,
    /// Epoch seconds; set once the provider starts working the job.
    pub in_progress_at: Option<i64>,
    pub created_at: Option<i64>,
}

impl BatchJob {
    fn started_at(&self) -> Option<i64> {
        self.in_progress_at.or(self.created_at)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BatchJobError {
    #[error("request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("failed to encode requests: {0}")]
    EncodeError(#[from] serde_json::Error),
}

async fn api_error_from(resp: reqwest::Response) -> BatchJobError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<super::ChatApiErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    BatchJobError::ApiError { status, message }
}

// ============================================================================
// API Client Functions
// ============================================================================

/// Upload the JSONL requests file; returns the uploaded file's id.
pub async fn upload_batch_file(
    http: &reqwest::Client,
    api_key: &str,
    jsonl: Vec<u8>,
) -> Result<String, BatchJobError> {
    #[derive(Deserialize)]
    struct FileUploadResponse {
        id: String,
    }

    let file_part = multipart::Part::bytes(jsonl)
        .file_name("requests.jsonl")
        .mime_str("application/jsonl")
        .map_err(|e| BatchJobError::ApiError {
            status: 0,
            message: format!("failed to build multipart body: {e}"),
        })?;
    let form = multipart::Form::new()
        .text("purpose", "batch")
        .part("file", file_part);

    let resp = http
        .post(FILES_ENDPOINT)
        .bearer_auth(api_key)
        .multipart(form)
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(api_error_from(resp).await);
    }

    Ok(resp.json::<FileUploadResponse>().await?.id)
}

/// Create a batch job over an uploaded requests file.
pub async fn create_batch(
    http: &reqwest::Client,
    api_key: &str,
    input_file_id: &str,
    completion_window: &str,
) -> Result<BatchJob, BatchJobError> {
    let resp = http
        .post(BATCHES_ENDPOINT)
        .bearer_auth(api_key)
        .json(&json!({
            "input_file_id": input_file_id,
            "endpoint": "/v1/chat/completions",
            "completion_window": completion_window,
        }))
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(api_error_from(resp).await);
    }

    Ok(resp.json::<BatchJob>().await?)
}

/// Build the requests file and create the job in one step.
pub async fn submit_batch(
    http: &reqwest::Client,
    api_key: &str,
    requests: &[BatchRequestLine],
    completion_window: &str,
) -> Result<BatchJob, BatchJobError> {
    let jsonl = jsonl_content(requests)?;
    let input_file_id = upload_batch_file(http, api_key, jsonl).await?;
    tracing::info!(file_id = %input_file_id, "uploaded batch requests file");
    let job = create_batch(http, api_key, &input_file_id, completion_window).await?;
    tracing::info!(batch_id = %job.id, status = ?job.status, "created batch job");
    Ok(job)
}

pub async fn get_batch(
    http: &reqwest::Client,
    api_key: &str,
    batch_id: &str,
) -> anyhow::Result<BatchJob> {
    let resp = http
        .get(format!("{BATCHES_ENDPOINT}/{batch_id}"))
        .bearer_auth(api_key)
        .send()
        .await
        .context("failed to get batch job status")?;

    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("failed to get batch job: {body}"));
    }

    resp.json::<BatchJob>()
        .await
        .context("failed to parse batch job response")
}

pub async fn download_file_content(
    http: &reqwest::Client,
    api_key: &str,
    file_id: &str,
) -> anyhow::Result<String> {
    let resp = http
        .get(format!("{FILES_ENDPOINT}/{file_id}/content"))
        .bearer_auth(api_key)
        .send()
        .await
        .context("failed to download file")?;

    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("failed to download file: {body}"));
    }

    resp.text().await.context("failed to read file content")
}

pub async fn delete_file(http: &reqwest::Client, api_key: &str, file_id: &str) {
    match http
        .delete(format!("{FILES_ENDPOINT}/{file_id}"))
        .bearer_auth(api_key)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            tracing::debug!(file_id, "deleted file");
        }
        Ok(resp) => {
            tracing::warn!(file_id, status = %resp.status(), "failed to delete file");
        }
        Err(e) => {
            tracing::warn!(file_id, "failed to delete file: {e}");
        }
    }
}

// ============================================================================
// Polling & ETA
// ============================================================================

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_backoff: Duration,
    pub hard_timeout: Option<Duration>,
}

impl PollSettings {
    pub fn from_config(cfg: &BatchConfig) -> Self {
        Self {
            interval: Duration::from_secs_f64(cfg.poll_interval_secs),
            max_backoff: Duration::from_secs_f64(cfg.max_poll_backoff_secs),
            hard_timeout: cfg.hard_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Remaining seconds from observed throughput; None ("unknown") when the
/// total is zero or no positive throughput has been observed yet.
pub fn estimate_eta_secs(completed: u64, total: u64, elapsed_secs: u64) -> Option<f64> {
    if total == 0 || elapsed_secs == 0 || completed == 0 {
        return None;
    }
    let rate = completed as f64 / elapsed_secs as f64;
    Some(total.saturating_sub(completed) as f64 / rate)
}

pub fn format_eta(eta: Option<f64>) -> String {
    let Some(secs) = eta else {
        return "unknown".to_string();
    };
    if !secs.is_finite() || secs < 0.0 {
        return "unknown".to_string();
    }
    let secs = secs as u64;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

/// Poll a batch job until it reaches a terminal state.
///
/// Transient errors (network failures, transient HTTP errors) back off
/// exponentially up to the cap, then the fixed interval resumes after the
/// next successful poll.
pub async fn poll_until_done(
    http: &reqwest::Client,
    api_key: &str,
    batch_id: &str,
    settings: &PollSettings,
) -> anyhow::Result<BatchJob> {
    let start = std::time::Instant::now();
    let mut backoff = settings.interval;

    loop {
        if let Some(timeout) = settings.hard_timeout {
            if start.elapsed() > timeout {
                return Err(anyhow!(
                    "batch {batch_id} did not finish within {}s",
                    timeout.as_secs()
                ));
            }
        }

        match get_batch(http, api_key, batch_id).await {
            Ok(job) => {
                let counts = job.request_counts;
                let elapsed = job
                    .started_at()
                    .map(|t| (chrono::Utc::now().timestamp() - t).max(0) as u64)
                    .unwrap_or(0);
                let eta = estimate_eta_secs(counts.completed, counts.total, elapsed);
                tracing::info!(
                    batch_id,
                    status = ?job.status,
                    completed = counts.completed,
                    total = counts.total,
                    eta = %format_eta(eta),
                    "batch progress"
                );

                if job.status.is_terminal() {
                    return Ok(job);
                }

                backoff = settings.interval;
                tokio::time::sleep(settings.interval).await;
            }
            Err(e) => {
                tracing::warn!("poll error: {e:#}; backing off {}s", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(settings.max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    #[test]
    fn test_request_line_serialization() {
        let line = BatchRequestLine::chat(
            "p-42",
            "gpt-4.1-nano",
            vec![
                ChatMessage::system("classify"),
                ChatMessage::user("Prospect Id: p-42\nJob Title: CTO"),
            ],
            0.0,
        );
        let json = serde_json::to_string(&line).unwrap();
        assert!(json.contains("\"custom_id\":\"p-42\""));
        assert!(json.contains("\"url\":\"/v1/chat/completions\""));
        assert!(json.contains("\"method\":\"POST\""));
    }

    #[test]
    fn test_jsonl_one_line_per_request() {
        let lines = vec![
            BatchRequestLine::chat("1", "m", vec![], 0.0),
            BatchRequestLine::chat("2", "m", vec![], 0.0),
        ];
        let content = jsonl_content(&lines).unwrap();
        let text = String::from_utf8(content).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_status_terminality() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Expired.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(!BatchStatus::Validating.is_terminal());
        assert!(!BatchStatus::InProgress.is_terminal());
        assert!(BatchStatus::Completed.is_success());
        assert!(!BatchStatus::Failed.is_success());
    }

    #[test]
    fn test_status_accepts_both_cancel_spellings() {
        let a: BatchStatus = serde_json::from_str("\"cancelled\"").unwrap();
        let b: BatchStatus = serde_json::from_str("\"canceled\"").unwrap();
        assert_eq!(a, BatchStatus::Cancelled);
        assert_eq!(b, BatchStatus::Cancelled);
    }

    #[test]
    fn test_eta_unknown_without_throughput() {
        assert_eq!(estimate_eta_secs(0, 0, 100), None);
        assert_eq!(estimate_eta_secs(5, 10, 0), None);
        assert_eq!(estimate_eta_secs(0, 10, 100), None);
    }

    #[test]
    fn test_eta_is_nonnegative_seconds() {
        // 50 done of 100 in 100s -> 0.5 req/s -> 100s remaining.
        assert_eq!(estimate_eta_secs(50, 100, 100), Some(100.0));
        // Completed can exceed total in odd payloads; clamp to zero remaining.
        assert_eq!(estimate_eta_secs(100, 100, 10), Some(0.0));
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "unknown");
        assert_eq!(format_eta(Some(45.0)), "45s");
        assert_eq!(format_eta(Some(125.0)), "2m 5s");
        assert_eq!(format_eta(Some(3725.0)), "1h 2m 5s");
        assert_eq!(format_eta(Some(f64::NAN)), "unknown");
    }
}
