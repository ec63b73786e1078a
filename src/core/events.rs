//! Messages flowing from the progress sources into the tracker

use crate::core::error::SyncError;
use crate::core::models::{Outcome, ProgressEvent};
use futures::stream::BoxStream;
use tokio::sync::mpsc;

/// One decoded message of the live push channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Progress(ProgressEvent),
    /// Final frame the server sends before closing the stream
    Complete(ProgressEvent),
    /// Server-side failure of the stream itself (e.g. run not found)
    ServerError(String),
}

/// Push stream returned by `PipelineApi::stream_job`
pub type ProgressStream = BoxStream<'static, Result<ChannelMessage, SyncError>>;

/// Which observer produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Live,
    Polling,
}

impl Source {
    pub fn as_str(&self) -> &str {
        match self {
            Source::Live => "live",
            Source::Polling => "polling",
        }
    }
}

/// Terminal report of a run
#[derive(Debug, Clone, PartialEq)]
pub struct Terminal {
    pub outcome: Outcome,
    pub note: String,
    pub comments_analyzed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Opened,
    Progress(ProgressEvent),
    Terminal(Terminal),
    ChannelError(String),
}

/// Event tagged with the attempt generation it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    pub generation: u64,
    pub source: Source,
    pub event: SourceEvent,
}

pub type EventSender = mpsc::Sender<SourceMessage>;
pub type EventReceiver = mpsc::Receiver<SourceMessage>;

pub fn create_event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(64)
}

/// Handle used by a producer to emit events for one attempt
#[derive(Debug, Clone)]
pub struct SourceEmitter {
    generation: u64,
    source: Source,
    tx: EventSender,
}

impl SourceEmitter {
    pub fn new(generation: u64, source: Source, tx: EventSender) -> Self {
        Self {
            generation,
            source,
            tx,
        }
    }

    /// Returns false once the tracker is gone
    pub async fn emit(&self, event: SourceEvent) -> bool {
        self.tx
            .send(SourceMessage {
                generation: self.generation,
                source: self.source,
                event,
            })
            .await
            .is_ok()
    }
}

impl Terminal {
    pub fn from_event(event: &ProgressEvent, outcome: Outcome) -> Self {
        let note = match outcome {
            Outcome::Succeeded => format!("{} comments analyzed", event.comments_analyzed),
            Outcome::Failed => event
                .notes
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "Analysis failed".to_string()),
        };

        Self {
            outcome,
            note,
            comments_analyzed: event.comments_analyzed,
        }
    }

    pub fn unconfirmed(reason: &str) -> Self {
        Self {
            outcome: Outcome::Failed,
            note: reason.to_string(),
            comments_analyzed: 0,
        }
    }
}
