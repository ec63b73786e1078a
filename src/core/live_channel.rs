//! Push-channel observer for one task.
//!
//! The observer owns a spawned task that opens the stream, forwards progress
//! and closes itself after the first terminal event or transport failure.
//! It never retries; fallback policy belongs to the tracker.

use crate::core::api::PipelineApi;
use crate::core::events::{ChannelMessage, SourceEmitter, SourceEvent, Terminal};
use crate::core::models::{Outcome, ProgressEvent};
use futures::StreamExt;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Connecting,
    Open,
    Closed,
}

pub struct LiveChannelObserver {
    task_id: String,
    phase: watch::Receiver<ChannelPhase>,
    handle: Option<JoinHandle<()>>,
}

impl LiveChannelObserver {
    pub fn open(api: Arc<dyn PipelineApi>, task_id: &str, emitter: SourceEmitter) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ChannelPhase::Connecting);
        let task = task_id.to_string();
        let handle = tokio::spawn(async move {
            run_channel(api, task, emitter, &phase_tx).await;
            phase_tx.send_replace(ChannelPhase::Closed);
        });

        Self {
            task_id: task_id.to_string(),
            phase: phase_rx,
            handle: Some(handle),
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        if self.handle.is_none() {
            return ChannelPhase::Closed;
        }
        *self.phase.borrow()
    }

    /// Receiver that observes phase changes
    #[cfg(test)]
    pub fn watch_phase(&self) -> watch::Receiver<ChannelPhase> {
        self.phase.clone()
    }

    /// Stop the subscription. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Closed live channel for task {}", self.task_id);
        }
    }
}

impl Drop for LiveChannelObserver {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_channel(
    api: Arc<dyn PipelineApi>,
    task_id: String,
    emitter: SourceEmitter,
    phase: &watch::Sender<ChannelPhase>,
) {
    let mut stream = match api.stream_job(&task_id).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Live channel for task {task_id} failed to open: {e}");
            emitter.emit(SourceEvent::ChannelError(e.to_string())).await;
            return;
        }
    };

    phase.send_replace(ChannelPhase::Open);
    debug!("Live channel for task {task_id} is open");
    if !emitter.emit(SourceEvent::Opened).await {
        return;
    }

    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(ChannelMessage::Progress(event)) => match event.outcome() {
                Some(outcome) => SourceEvent::Terminal(Terminal::from_event(&event, outcome)),
                None => SourceEvent::Progress(event),
            },
            Ok(ChannelMessage::Complete(event)) => SourceEvent::Terminal(complete_terminal(&event)),
            Ok(ChannelMessage::ServerError(message)) => {
                warn!("Live channel for task {task_id} reported: {message}");
                SourceEvent::ChannelError(message)
            }
            Err(e) => {
                warn!("Live channel for task {task_id} broke: {e}");
                SourceEvent::ChannelError(e.to_string())
            }
        };

        let closes = !matches!(event, SourceEvent::Progress(_));
        if !emitter.emit(event).await || closes {
            return;
        }
    }

    emitter
        .emit(SourceEvent::ChannelError(
            "stream ended before the run finished".to_string(),
        ))
        .await;
}

/// A `complete` frame without a terminal status still means the run finished
fn complete_terminal(event: &ProgressEvent) -> Terminal {
    let outcome = event.outcome().unwrap_or(Outcome::Succeeded);
    Terminal::from_event(event, outcome)
}
