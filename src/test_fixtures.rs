use crate::core::api::PipelineApi;
use crate::core::error::SyncError;
use crate::core::events::{ChannelMessage, ProgressStream};
use crate::core::models::{RunRecord, RunStatus, StartedJob, SyncParams};
use crate::core::notifier::Notifier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

type StreamItem = Result<ChannelMessage, SyncError>;

/// How `stream_job` behaves for a scripted backend
#[derive(Debug, Clone)]
pub enum StreamScript {
    OpenImmediately,
    OpenAfter(Duration),
    NeverOpen,
    Fail(SyncError),
}

/// Feeds messages into the stream a `ScriptedApi` hands out
#[derive(Clone)]
pub struct StreamHandle {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<StreamItem>>>>,
}

impl StreamHandle {
    pub fn send(&self, item: StreamItem) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(item);
        }
    }

    /// Close the stream after whatever was already sent
    pub fn end(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// In-memory backend with canned responses
pub struct ScriptedApi {
    start: Mutex<Result<StartedJob, SyncError>>,
    stream_script: Mutex<StreamScript>,
    stream: Mutex<Option<mpsc::UnboundedReceiver<StreamItem>>>,
    runs: Mutex<VecDeque<Result<Vec<RunRecord>, SyncError>>>,
    start_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    poll_times: Mutex<Vec<Instant>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self {
            start: Mutex::new(Ok(started_job("t1"))),
            stream_script: Mutex::new(StreamScript::NeverOpen),
            stream: Mutex::new(None),
            runs: Mutex::new(VecDeque::new()),
            start_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            poll_times: Mutex::new(Vec::new()),
        }
    }

    pub fn with_stream(script: StreamScript) -> (Self, StreamHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let api = Self::new().with_stream_script(script);
        *api.stream.lock().unwrap() = Some(rx);
        let handle = StreamHandle {
            tx: Arc::new(Mutex::new(Some(tx))),
        };
        (api, handle)
    }

    pub fn with_stream_script(self, script: StreamScript) -> Self {
        *self.stream_script.lock().unwrap() = script;
        self
    }

    pub fn with_start(self, result: Result<StartedJob, SyncError>) -> Self {
        *self.start.lock().unwrap() = result;
        self
    }

    /// Responses for successive `list_runs` calls; the last one repeats
    pub fn with_runs(self, runs: Vec<Result<Vec<RunRecord>, SyncError>>) -> Self {
        *self.runs.lock().unwrap() = runs.into();
        self
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.poll_times.lock().unwrap().len()
    }

    pub fn poll_times(&self) -> Vec<Instant> {
        self.poll_times.lock().unwrap().clone()
    }

    fn open_stream(&self) -> ProgressStream {
        match self.stream.lock().unwrap().take() {
            Some(rx) => futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed(),
            None => futures::stream::pending().boxed(),
        }
    }
}

#[async_trait]
impl PipelineApi for ScriptedApi {
    async fn start_job(
        &self,
        _target_id: &str,
        _params: &SyncParams,
    ) -> Result<StartedJob, SyncError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.start.lock().unwrap().clone()
    }

    async fn stream_job(&self, _task_id: &str) -> Result<ProgressStream, SyncError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.stream_script.lock().unwrap().clone();
        match script {
            StreamScript::OpenImmediately => Ok(self.open_stream()),
            StreamScript::OpenAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.open_stream())
            }
            StreamScript::NeverOpen => std::future::pending().await,
            StreamScript::Fail(e) => Err(e),
        }
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>, SyncError> {
        self.poll_times.lock().unwrap().push(Instant::now());
        let mut runs = self.runs.lock().unwrap();
        let next = if runs.len() > 1 {
            runs.pop_front()
        } else {
            runs.front().cloned()
        };
        next.unwrap_or_else(|| Ok(Vec::new()))
    }
}

pub fn started_job(task_id: &str) -> StartedJob {
    StartedJob {
        task_id: task_id.to_string(),
        connection_id: Some("conn-1".to_string()),
        message: Some("Sync started".to_string()),
    }
}

pub fn run_record(
    id: &str,
    connection_id: &str,
    status: RunStatus,
    comments_fetched: u64,
    comments_analyzed: u64,
    started_at: DateTime<Utc>,
) -> RunRecord {
    RunRecord {
        id: id.to_string(),
        connection_id: Some(connection_id.to_string()),
        platform: Some("instagram".to_string()),
        connection_username: Some("sample_account".to_string()),
        run_type: "sync".to_string(),
        status,
        posts_fetched: if comments_fetched > 0 { 2 } else { 0 },
        comments_fetched,
        comments_analyzed,
        llm_calls: comments_analyzed,
        errors_count: 0,
        total_cost_usd: 0.0,
        started_at,
        ended_at: None,
        notes: None,
    }
}

impl RunRecord {
    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Success(String),
    Failure(String),
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn success(&self, note: &str) {
        self.notices
            .lock()
            .unwrap()
            .push(Notice::Success(note.to_string()));
    }

    fn failure(&self, note: &str) {
        self.notices
            .lock()
            .unwrap()
            .push(Notice::Failure(note.to_string()));
    }
}
