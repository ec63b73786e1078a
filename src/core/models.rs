use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct DataPath {
    pub root: PathBuf,
}

impl DataPath {
    pub fn new(data_path: Option<PathBuf>) -> io::Result<Self> {
        let root = match data_path {
            Some(path) => path,
            None => dirs::home_dir()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        "Home directory not found. Please specify --data-path.",
                    )
                })?
                .join(".sentimenta"),
        };

        Ok(Self { root })
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.root.join("error.log")
    }
}

/// Server-side status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Partial,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Partial
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
            RunStatus::Unknown => "unknown",
        }
    }
}

/// Incremental progress message pushed by the backend for one task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(default)]
    pub posts_fetched: u64,
    #[serde(default)]
    pub comments_fetched: u64,
    #[serde(default)]
    pub comments_analyzed: u64,
    #[serde(default)]
    pub errors_count: u64,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ProgressEvent {
    pub fn counts(posts_fetched: u64, comments_fetched: u64, comments_analyzed: u64) -> Self {
        Self {
            posts_fetched,
            comments_fetched,
            comments_analyzed,
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }

    /// Terminal outcome carried by this event, if any
    pub fn outcome(&self) -> Option<Outcome> {
        self.status.and_then(Outcome::from_status)
    }
}

/// One pipeline run as reported by the run list endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub connection_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub connection_username: Option<String>,
    #[serde(default)]
    pub run_type: String,
    pub status: RunStatus,
    #[serde(default)]
    pub posts_fetched: u64,
    #[serde(default)]
    pub comments_fetched: u64,
    #[serde(default)]
    pub comments_analyzed: u64,
    #[serde(default)]
    pub llm_calls: u64,
    #[serde(default)]
    pub errors_count: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl RunRecord {
    pub fn to_progress_event(&self) -> ProgressEvent {
        ProgressEvent {
            posts_fetched: self.posts_fetched,
            comments_fetched: self.comments_fetched,
            comments_analyzed: self.comments_analyzed,
            errors_count: self.errors_count,
            status: Some(self.status),
            notes: self.notes.clone(),
        }
    }
}

/// Response of the single run status endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusSummary {
    pub status: RunStatus,
    pub posts_fetched: u64,
    pub comments_fetched: u64,
    pub comments_analyzed: u64,
    pub errors_count: u64,
}

/// Acknowledgement of a sync start request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartedJob {
    pub task_id: String,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn from_status(status: RunStatus) -> Option<Self> {
        match status {
            RunStatus::Completed => Some(Outcome::Succeeded),
            RunStatus::Failed | RunStatus::Partial => Some(Outcome::Failed),
            RunStatus::Running | RunStatus::Unknown => None,
        }
    }
}

pub const DEFAULT_MAX_POSTS: u32 = 10;
pub const DEFAULT_MAX_COMMENTS_PER_POST: u32 = 100;

/// User-tunable parameters sent with a sync start request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncParams {
    #[serde(default = "default_max_posts")]
    pub max_posts: u32,
    #[serde(default = "default_max_comments")]
    pub max_comments_per_post: u32,
    #[serde(default)]
    pub since_date: String,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            max_posts: DEFAULT_MAX_POSTS,
            max_comments_per_post: DEFAULT_MAX_COMMENTS_PER_POST,
            since_date: String::new(),
        }
    }
}

fn default_max_posts() -> u32 {
    DEFAULT_MAX_POSTS
}
fn default_max_comments() -> u32 {
    DEFAULT_MAX_COMMENTS_PER_POST
}

impl SyncParams {
    /// Clamp limits into the ranges the backend accepts
    pub fn normalized(&self) -> Self {
        Self {
            max_posts: self.max_posts.clamp(1, 200),
            max_comments_per_post: self.max_comments_per_post.clamp(10, 1000),
            since_date: self.since_date.trim().to_string(),
        }
    }

    pub fn to_payload(&self) -> SyncPayload {
        let normalized = self.normalized();
        SyncPayload {
            max_posts: normalized.max_posts,
            max_comments_per_post: normalized.max_comments_per_post,
            since_date: if normalized.since_date.is_empty() {
                None
            } else {
                Some(normalized.since_date)
            },
        }
    }
}

/// JSON body of `POST /connections/{id}/sync`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncPayload {
    pub max_posts: u32,
    pub max_comments_per_post: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_date: Option<String>,
}

pub fn validate_since_date(value: &str) -> io::Result<()> {
    if value.trim().is_empty() {
        return Ok(());
    }

    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map(|_| ())
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid since date '{value}' (expected YYYY-MM-DD): {e}"),
            )
        })
}

pub fn validate_connection_id(id: &str) -> io::Result<()> {
    if id.trim().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Connection id cannot be empty",
        ));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Connection id contains invalid characters",
        ));
    }

    Ok(())
}
