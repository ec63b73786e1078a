use crate::core::config::ApiConfig;
use crate::core::error::{ErrorContext, SyncError};
use crate::core::events::{ChannelMessage, ProgressStream};
use crate::core::models::{RunRecord, RunStatusSummary, StartedJob, SyncParams};
use crate::core::sse::{SseDecoder, parse_channel_message};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

const USER_AGENT: &str = "sentimenta-sync/0.1";
const RETRY_DELAY: Duration = Duration::from_millis(300);

/// Backend operations the progress tracker depends on
#[async_trait]
pub trait PipelineApi: Send + Sync {
    /// Ask the backend to start a sync for a connection
    async fn start_job(&self, target_id: &str, params: &SyncParams)
    -> Result<StartedJob, SyncError>;

    /// Open the push channel for a task. The future may stay pending while connecting.
    async fn stream_job(&self, task_id: &str) -> Result<ProgressStream, SyncError>;

    /// Recent and ongoing runs across all connections of the account
    async fn list_runs(&self) -> Result<Vec<RunRecord>, SyncError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

/// `PipelineApi` over the REST backend
pub struct HttpPipelineApi {
    config: ApiConfig,
    client: Client,
    error_log: Option<PathBuf>,
}

impl HttpPipelineApi {
    pub fn new(config: ApiConfig) -> Result<Self, SyncError> {
        url::Url::parse(&config.base_url).map_err(|e| {
            SyncError::Configuration(format!("Invalid API URL '{}': {e}", config.base_url))
        })?;

        Ok(Self {
            config,
            client: Client::new(),
            error_log: None,
        })
    }

    /// Append failed requests to this JSON-lines file
    pub fn with_error_log(mut self, path: PathBuf) -> Self {
        self.error_log = Some(path);
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("User-Agent", USER_AGENT);
        if self.config.token.is_empty() {
            request
        } else {
            request.header("Authorization", format!("Bearer {}", self.config.token))
        }
    }

    fn report(&self, context: ErrorContext) {
        context.log_error(self.error_log.as_deref());
    }

    /// Send a request, retrying once after a short pause on transport failure
    async fn send_with_retry<F>(
        &self,
        operation: &str,
        url: &str,
        build: F,
    ) -> Result<Response, SyncError>
    where
        F: Fn() -> RequestBuilder,
    {
        match build().send().await {
            Ok(response) => Ok(response),
            Err(first) => {
                debug!("{operation} failed ({first}), retrying once");
                tokio::time::sleep(RETRY_DELAY).await;
                build().send().await.map_err(|e| {
                    self.report(
                        ErrorContext::new(operation)
                            .with_error("network_error", &e.to_string())
                            .with_request_details(url, None, None),
                    );
                    SyncError::Network(format!("Failed to reach API: {e}"))
                })
            }
        }
    }

    /// Map a non-success response to an error carrying the backend detail
    async fn check_status(
        &self,
        operation: &str,
        url: &str,
        target_id: Option<&str>,
        response: Response,
    ) -> Result<Response, SyncError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let mut context = ErrorContext::new(operation)
            .with_error("api_error", &format!("HTTP {status}"))
            .with_request_details(url, Some(status.as_u16()), Some(&body));
        if let Some(target) = target_id {
            context = context.with_target(target);
        }
        self.report(context);

        if status.as_u16() == 401 {
            return Err(SyncError::Unauthorized);
        }

        Err(SyncError::Api {
            status: status.as_u16(),
            detail: extract_detail(&body)
                .unwrap_or_else(|| format!("API error: {}", status.as_u16())),
        })
    }

    async fn parse_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: &str,
        response: Response,
    ) -> Result<T, SyncError> {
        response.json().await.map_err(|e| {
            self.report(
                ErrorContext::new(operation)
                    .with_error("json_parse_error", &e.to_string())
                    .with_request_details(url, None, None),
            );
            SyncError::DataParse(format!("Invalid JSON from {operation}: {e}"))
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, path: &str) -> Result<T, SyncError> {
        let url = self.endpoint(path);
        let response = self
            .send_with_retry(operation, &url, || self.authorized(self.client.get(&url)))
            .await?;
        let response = self.check_status(operation, &url, None, response).await?;
        self.parse_json(operation, &url, response).await
    }

    /// Status of a single run
    pub async fn run_status(&self, run_id: &str) -> Result<RunStatusSummary, SyncError> {
        self.get_json("run_status", &format!("/pipeline/runs/{run_id}/status"))
            .await
    }
}

/// Pull the human-readable message out of `{"detail": ...}`
fn extract_detail(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    match parsed.detail? {
        serde_json::Value::String(detail) => Some(detail),
        // Validation errors come back as a list of objects
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl PipelineApi for HttpPipelineApi {
    async fn start_job(
        &self,
        target_id: &str,
        params: &SyncParams,
    ) -> Result<StartedJob, SyncError> {
        info!("Starting sync for connection {target_id}");

        let url = self.endpoint(&format!("/connections/{target_id}/sync"));
        let payload = params.to_payload();

        // Never retried; the backend does not deduplicate start requests
        let response = self
            .authorized(self.client.post(&url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                self.report(
                    ErrorContext::new("start_sync")
                        .with_target(target_id)
                        .with_error("network_error", &e.to_string())
                        .with_request_details(&url, None, None)
                        .with_metadata("max_posts", &payload.max_posts.to_string()),
                );
                SyncError::Network(format!("Failed to reach API: {e}"))
            })?;

        let response = self
            .check_status("start_sync", &url, Some(target_id), response)
            .await?;
        let started: StartedJob = self.parse_json("start_sync", &url, response).await?;

        info!("Sync for {target_id} accepted as task {}", started.task_id);
        Ok(started)
    }

    async fn stream_job(&self, task_id: &str) -> Result<ProgressStream, SyncError> {
        let url = self.endpoint(&format!("/pipeline/runs/{task_id}/stream"));
        debug!("Opening live channel {url}");

        let response = self
            .authorized(self.client.get(&url))
            .header("Accept", "text/event-stream")
            .query(&[("token", self.config.token.as_str())])
            .send()
            .await
            .map_err(|e| SyncError::Channel(format!("Failed to open stream: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Channel(format!("Stream rejected with HTTP {status}")));
        }

        Ok(decode_event_stream(response))
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>, SyncError> {
        self.get_json("list_runs", "/pipeline/runs").await
    }
}

/// Turn a streaming response body into decoded channel messages
fn decode_event_stream(response: Response) -> ProgressStream {
    struct State {
        body: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
        decoder: SseDecoder,
        pending: VecDeque<Result<ChannelMessage, SyncError>>,
        finished: bool,
    }

    let state = State {
        body: response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.decoder.feed(&chunk) {
                        if let Some(item) = parse_channel_message(&frame).transpose() {
                            state.pending.push_back(item);
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state
                        .pending
                        .push_back(Err(SyncError::Channel(format!("Stream interrupted: {e}"))));
                }
                None => {
                    state.finished = true;
                    if let Some(frame) = state.decoder.finish() {
                        if let Some(item) = parse_channel_message(&frame).transpose() {
                            state.pending.push_back(item);
                        }
                    }
                }
            }
        }
    })
    .boxed()
}
