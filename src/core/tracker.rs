//! Lifecycle of a sync attempt for one connection.
//!
//! `JobTracker` issues the start call and then hands the attempt to a driver
//! task. The driver is the single consumer of events from the live channel
//! and the polling monitor; it owns the attempt state and publishes it
//! through a `watch` channel. Every mutation first checks the attempt
//! generation so callbacks that outlive a disposed attempt are dropped.

use crate::core::api::PipelineApi;
use crate::core::error::SyncError;
use crate::core::estimator;
use crate::core::events::{
    EventReceiver, EventSender, Source, SourceEmitter, SourceEvent, SourceMessage, Terminal,
    create_event_channel,
};
use crate::core::live_channel::{ChannelPhase, LiveChannelObserver};
use crate::core::models::{Outcome, ProgressEvent, SyncParams};
use crate::core::notifier::Notifier;
use crate::core::polling::{PollingMonitor, PollingSettings};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Starting,
    Syncing,
    Done,
    Error,
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Done | SyncStatus::Error)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, SyncStatus::Starting | SyncStatus::Syncing)
    }
}

/// Which source currently drives the attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    None,
    Live,
    Polling,
}

impl From<Source> for ChannelKind {
    fn from(source: Source) -> Self {
        match source {
            Source::Live => ChannelKind::Live,
            Source::Polling => ChannelKind::Polling,
        }
    }
}

/// What the UI renders for one attempt
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub target_id: String,
    pub task_id: Option<String>,
    pub status: SyncStatus,
    pub progress_percent: u8,
    pub status_text: String,
    pub channel: ChannelKind,
}

impl SyncSnapshot {
    fn idle(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            task_id: None,
            status: SyncStatus::Idle,
            progress_percent: 0,
            status_text: String::new(),
            channel: ChannelKind::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    /// How long the live channel may stay unopened before polling starts
    pub live_connect_timeout: Duration,
    pub poll_interval: Duration,
    pub max_unmatched_polls: u32,
    /// Allowance for clock differences when matching finished runs to this attempt
    pub clock_skew: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            live_connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(3),
            max_unmatched_polls: 20,
            clock_skew: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStart {
    Started { task_id: String },
    /// An attempt is still running; the request was ignored
    AlreadyInFlight,
}

pub struct JobTracker {
    target_id: String,
    api: Arc<dyn PipelineApi>,
    notifier: Arc<dyn Notifier>,
    settings: TrackerSettings,
    snapshot: Arc<watch::Sender<SyncSnapshot>>,
    generation: Arc<AtomicU64>,
    driver: Option<JoinHandle<()>>,
}

impl JobTracker {
    pub fn new(
        target_id: &str,
        api: Arc<dyn PipelineApi>,
        notifier: Arc<dyn Notifier>,
        settings: TrackerSettings,
    ) -> Self {
        let (snapshot, _) = watch::channel(SyncSnapshot::idle(target_id));
        Self {
            target_id: target_id.to_string(),
            api,
            notifier,
            settings,
            snapshot: Arc::new(snapshot),
            generation: Arc::new(AtomicU64::new(0)),
            driver: None,
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot.subscribe()
    }

    /// True while the current attempt is still being tracked
    pub fn is_in_flight(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| !d.is_finished())
            && self.snapshot.borrow().status.is_busy()
    }

    /// Start a new attempt.
    ///
    /// A start rejection ends the attempt in `Error` and is returned to the
    /// caller. Once the backend accepts, tracking continues in the background
    /// and this returns immediately.
    pub async fn sync(&mut self, params: &SyncParams) -> Result<SyncStart, SyncError> {
        if self.is_in_flight() {
            debug!("Sync for {} already in flight, ignoring", self.target_id);
            return Ok(SyncStart::AlreadyInFlight);
        }
        self.driver = None;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Utc::now();
        self.publish(generation, |s| {
            *s = SyncSnapshot::idle(&s.target_id);
            s.status = SyncStatus::Starting;
            s.status_text = "Starting...".to_string();
        });

        let job = match self.api.start_job(&self.target_id, params).await {
            Ok(job) => job,
            Err(e) => {
                let message = e.user_message();
                warn!("Sync for {} rejected: {e}", self.target_id);
                if self.publish(generation, |s| {
                    s.status = SyncStatus::Error;
                    s.status_text = message.clone();
                }) {
                    self.notifier.failure(&message);
                }
                return Err(e);
            }
        };

        info!("Tracking task {} for {}", job.task_id, self.target_id);
        self.publish(generation, |s| {
            s.task_id = Some(job.task_id.clone());
            s.status = SyncStatus::Syncing;
            s.status_text = "Starting analysis...".to_string();
            s.channel = ChannelKind::Live;
        });

        let (tx, rx) = create_event_channel();
        let driver = AttemptDriver {
            generation,
            current: self.generation.clone(),
            target_id: self.target_id.clone(),
            task_id: job.task_id.clone(),
            api: self.api.clone(),
            notifier: self.notifier.clone(),
            settings: self.settings.clone(),
            snapshot: self.snapshot.clone(),
            started_at,
            tx,
            live: None,
            polling: None,
            progress: 0,
        };
        self.driver = Some(tokio::spawn(driver.run(rx)));

        Ok(SyncStart::Started {
            task_id: job.task_id,
        })
    }

    /// Wait until the current attempt reaches `Done` or `Error`.
    ///
    /// Returns the latest snapshot immediately when no attempt is in flight.
    pub async fn wait_settled(&self) -> SyncSnapshot {
        if !self.is_in_flight() {
            return self.snapshot();
        }
        let mut rx = self.subscribe();
        match rx.wait_for(|s| s.status.is_terminal()).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Tear down the current attempt; late events are discarded
    pub fn dispose(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(driver) = self.driver.take() {
            driver.abort();
            debug!("Disposed sync tracking for {}", self.target_id);
        }
    }

    fn publish<F>(&self, generation: u64, update: F) -> bool
    where
        F: FnOnce(&mut SyncSnapshot),
    {
        publish_if_current(&self.snapshot, &self.generation, generation, update)
    }
}

impl Drop for JobTracker {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn publish_if_current<F>(
    snapshot: &watch::Sender<SyncSnapshot>,
    current: &AtomicU64,
    generation: u64,
    update: F,
) -> bool
where
    F: FnOnce(&mut SyncSnapshot),
{
    snapshot.send_if_modified(|s| {
        if current.load(Ordering::SeqCst) != generation {
            return false;
        }
        update(s);
        true
    })
}

/// Between two terminal reports, keep the one that saw more analyzed comments
pub fn prefer_fresher(
    current: (Source, Terminal),
    candidate: (Source, Terminal),
) -> (Source, Terminal) {
    if current.1.outcome != candidate.1.outcome {
        warn!(
            "Sources disagree on outcome: {} says {:?}, {} says {:?}",
            current.0.as_str(),
            current.1.outcome,
            candidate.0.as_str(),
            candidate.1.outcome
        );
    }
    if candidate.1.comments_analyzed > current.1.comments_analyzed {
        candidate
    } else {
        current
    }
}

/// Consumer side of one attempt
struct AttemptDriver {
    generation: u64,
    current: Arc<AtomicU64>,
    target_id: String,
    task_id: String,
    api: Arc<dyn PipelineApi>,
    notifier: Arc<dyn Notifier>,
    settings: TrackerSettings,
    snapshot: Arc<watch::Sender<SyncSnapshot>>,
    started_at: DateTime<Utc>,
    tx: EventSender,
    live: Option<LiveChannelObserver>,
    polling: Option<PollingMonitor>,
    progress: u8,
}

impl AttemptDriver {
    async fn run(mut self, mut rx: EventReceiver) {
        self.live = Some(LiveChannelObserver::open(
            self.api.clone(),
            &self.task_id,
            SourceEmitter::new(self.generation, Source::Live, self.tx.clone()),
        ));

        let deadline = tokio::time::sleep(self.settings.live_connect_timeout);
        tokio::pin!(deadline);
        let mut deadline_armed = true;

        while self.is_current() {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    if let Some(terminal) = self.handle(message) {
                        let terminal = self.settle(terminal, &mut rx);
                        self.finish(terminal);
                        break;
                    }
                }
                _ = &mut deadline, if deadline_armed => {
                    deadline_armed = false;
                    self.on_connect_deadline();
                }
            }
        }

        self.teardown();
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn publish<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut SyncSnapshot),
    {
        publish_if_current(&self.snapshot, &self.current, self.generation, update)
    }

    /// Apply one message; returns the terminal report if the attempt just ended
    fn handle(&mut self, message: SourceMessage) -> Option<(Source, Terminal)> {
        if message.generation != self.generation || !self.is_current() {
            debug!(
                "Discarding stale {} event for {}",
                message.source.as_str(),
                self.target_id
            );
            return None;
        }

        match message.event {
            SourceEvent::Opened => {
                debug!("Live channel open for task {}", self.task_id);
                None
            }
            SourceEvent::Progress(event) => {
                self.apply_progress(&event);
                None
            }
            SourceEvent::ChannelError(reason) => {
                info!(
                    "Live channel for task {} unavailable ({reason}), falling back to polling",
                    self.task_id
                );
                self.start_polling();
                None
            }
            SourceEvent::Terminal(terminal) => Some((message.source, terminal)),
        }
    }

    fn apply_progress(&mut self, event: &ProgressEvent) {
        // Late deliveries must not move the bar backwards
        self.progress = self.progress.max(estimator::estimate_event(event));
        let percent = self.progress;
        let text = estimator::status_text(event);
        self.publish(|s| {
            s.progress_percent = percent;
            s.status_text = text;
        });
    }

    fn on_connect_deadline(&mut self) {
        let phase = self
            .live
            .as_ref()
            .map(|live| live.phase())
            .unwrap_or(ChannelPhase::Closed);
        if phase != ChannelPhase::Open {
            info!(
                "Live channel for task {} not open after {:?}, starting polling",
                self.task_id, self.settings.live_connect_timeout
            );
            self.start_polling();
        }
    }

    fn start_polling(&mut self) {
        if self.polling.is_some() {
            return;
        }

        // A skew too large to represent leaves finished runs unbounded
        let not_before = chrono::Duration::from_std(self.settings.clock_skew)
            .ok()
            .and_then(|skew| self.started_at.checked_sub_signed(skew));
        let settings = PollingSettings {
            interval: self.settings.poll_interval,
            run_id: Some(self.task_id.clone()),
            max_unmatched_polls: self.settings.max_unmatched_polls,
            not_before,
        };
        self.polling = Some(PollingMonitor::start(
            self.api.clone(),
            &self.target_id,
            settings,
            SourceEmitter::new(self.generation, Source::Polling, self.tx.clone()),
        ));
        self.publish(|s| s.channel = ChannelKind::Polling);
    }

    /// Collect terminal reports already queued behind the first one
    fn settle(&self, first: (Source, Terminal), rx: &mut EventReceiver) -> (Source, Terminal) {
        let mut best = first;
        while let Ok(message) = rx.try_recv() {
            if message.generation != self.generation {
                continue;
            }
            if let SourceEvent::Terminal(terminal) = message.event {
                best = prefer_fresher(best, (message.source, terminal));
            }
        }
        best
    }

    fn finish(&mut self, (source, terminal): (Source, Terminal)) {
        self.teardown();

        let succeeded = terminal.outcome == Outcome::Succeeded;
        let note = terminal.note.clone();
        let published = self.publish(|s| {
            s.channel = source.into();
            if succeeded {
                s.status = SyncStatus::Done;
                s.progress_percent = 100;
                s.status_text = "Completed!".to_string();
            } else {
                s.status = SyncStatus::Error;
                s.status_text = note.clone();
            }
        });
        if !published {
            return;
        }

        info!(
            "Sync for {} finished via {} ({:?}): {}",
            self.target_id,
            source.as_str(),
            terminal.outcome,
            terminal.note
        );
        if succeeded {
            self.notifier.success(&terminal.note);
        } else {
            self.notifier.failure(&terminal.note);
        }
    }

    fn teardown(&mut self) {
        if let Some(live) = self.live.as_mut() {
            live.close();
        }
        if let Some(polling) = self.polling.as_mut() {
            polling.cancel();
        }
    }
}
