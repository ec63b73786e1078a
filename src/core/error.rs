use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

/// Errors raised while starting or tracking a sync
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Request never reached the backend
    Network(String),
    /// Backend answered with a non-success status
    Api { status: u16, detail: String },
    Unauthorized,
    DataParse(String),
    /// Live channel failed before delivering a terminal event
    Channel(String),
    Configuration(String),
}

impl SyncError {
    /// Transport-level failures worth a single immediate retry
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            SyncError::Api { status, .. } => Some(*status),
            SyncError::Unauthorized => Some(401),
            _ => None,
        }
    }

    /// Message shown to the user, the backend detail verbatim for API errors
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Api { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Network(msg) => write!(f, "Connection error: {msg}"),
            SyncError::Api { status, detail } => write!(f, "API error ({status}): {detail}"),
            SyncError::Unauthorized => write!(f, "Session expired or token rejected"),
            SyncError::DataParse(msg) => write!(f, "Data parse error: {msg}"),
            SyncError::Channel(msg) => write!(f, "Live channel error: {msg}"),
            SyncError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<SyncError> for io::Error {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Configuration(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            SyncError::DataParse(_) => io::Error::new(io::ErrorKind::InvalidData, err),
            _ => io::Error::other(err),
        }
    }
}

/// Structured error context for detailed error reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: String,
    pub target_id: Option<String>,
    pub timestamp: String,
    pub error_type: String,
    pub error_message: String,
    pub request_url: Option<String>,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            target_id: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            error_type: String::new(),
            error_message: String::new(),
            request_url: None,
            status_code: None,
            response_body: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_target(mut self, target_id: &str) -> Self {
        self.target_id = Some(target_id.to_string());
        self
    }

    pub fn with_error(mut self, error_type: &str, message: &str) -> Self {
        self.error_type = error_type.to_string();
        self.error_message = message.to_string();
        self
    }

    pub fn with_request_details(
        mut self,
        url: &str,
        status_code: Option<u16>,
        response_body: Option<&str>,
    ) -> Self {
        self.request_url = Some(url.to_string());
        self.status_code = status_code;
        self.response_body = response_body.map(|s| s.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Log the error and, when a log file is configured, append it as a JSON line
    pub fn log_error(&self, error_log: Option<&Path>) {
        log::error!(
            target: "sync_errors",
            "Sync error | Operation: {} | Type: {} | Message: {} | Target: {:?} | URL: {:?} | Status: {:?} | Context: {:?}",
            self.operation,
            self.error_type,
            self.error_message,
            self.target_id,
            self.request_url,
            self.status_code,
            self.metadata
        );

        if let Some(path) = error_log {
            if let Err(e) = self.append_to(path) {
                log::warn!("Failed to write to error log file: {e}");
            }
        }
    }

    fn append_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        let error_json = serde_json::to_string(self)?;
        writeln!(file, "{error_json}")?;

        Ok(())
    }
}

/// Utility functions for reading error logs
pub struct ErrorLogReader;

impl ErrorLogReader {
    /// Read recent errors, most recent first
    pub fn read_recent_errors(
        path: &Path,
        limit: usize,
        target_filter: Option<&str>,
    ) -> Result<Vec<ErrorContext>, Box<dyn std::error::Error + Send + Sync>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut errors = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if let Ok(error) = serde_json::from_str::<ErrorContext>(&line) {
                if let Some(target) = target_filter {
                    if error.target_id.as_deref() != Some(target) {
                        continue;
                    }
                }
                errors.push(error);
            }
        }

        errors.reverse();
        errors.truncate(limit);

        Ok(errors)
    }

    /// Error statistics grouped by operation
    pub fn get_error_stats(
        path: &Path,
    ) -> Result<HashMap<String, ErrorStats>, Box<dyn std::error::Error + Send + Sync>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut stats: HashMap<String, ErrorStats> = HashMap::new();

        for line in reader.lines() {
            let line = line?;
            if let Ok(error) = serde_json::from_str::<ErrorContext>(&line) {
                let entry = stats
                    .entry(error.operation.clone())
                    .or_insert_with(ErrorStats::new);
                entry.total_errors += 1;
                *entry.error_types.entry(error.error_type.clone()).or_insert(0) += 1;
                entry.last_error_time = Some(error.timestamp.clone());
            }
        }

        Ok(stats)
    }
}

/// Statistics about errors for one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_errors: usize,
    pub error_types: HashMap<String, usize>,
    pub last_error_time: Option<String>,
}

impl ErrorStats {
    fn new() -> Self {
        Self {
            total_errors: 0,
            error_types: HashMap::new(),
            last_error_time: None,
        }
    }
}
