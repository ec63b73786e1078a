//! Pull-based fallback: re-derive the attempt's state from the run list

use crate::core::api::PipelineApi;
use crate::core::error::SyncError;
use crate::core::events::{SourceEmitter, SourceEvent, Terminal};
use crate::core::models::{RunRecord, RunStatus};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const UNCONFIRMED_NOTE: &str = "Unable to confirm sync status";

#[derive(Debug, Clone)]
pub struct PollingSettings {
    pub interval: Duration,
    /// Run id the backend assigned to the attempt
    pub run_id: Option<String>,
    /// Consecutive polls that failed or found no matching run before giving up
    pub max_unmatched_polls: u32,
    /// Finished runs started before this instant belong to earlier attempts
    pub not_before: Option<DateTime<Utc>>,
}

/// Pick the run that represents the attempt for `target_id`.
///
/// The record whose id is the attempt's run id always wins. Without one, a
/// running record wins (the most recently started one if several are
/// running). Otherwise the most recently started finished record is taken as
/// the attempt's resolution.
pub fn select_run<'a>(
    runs: &'a [RunRecord],
    target_id: &str,
    run_id: Option<&str>,
    not_before: Option<DateTime<Utc>>,
) -> Option<&'a RunRecord> {
    if let Some(run) = run_id.and_then(|id| runs.iter().find(|run| run.id == id)) {
        return Some(run);
    }

    let candidates: Vec<&RunRecord> = runs
        .iter()
        .filter(|run| run.connection_id.as_deref() == Some(target_id))
        .collect();

    let running = candidates
        .iter()
        .copied()
        .filter(|run| run.status == RunStatus::Running)
        .max_by_key(|run| run.started_at);
    if let Some(run) = running {
        return Some(run);
    }

    candidates
        .into_iter()
        .filter(|run| not_before.is_none_or(|bound| run.started_at >= bound))
        .max_by_key(|run| run.started_at)
}

pub struct PollingMonitor {
    target_id: String,
    handle: Option<JoinHandle<()>>,
}

impl PollingMonitor {
    pub fn start(
        api: Arc<dyn PipelineApi>,
        target_id: &str,
        settings: PollingSettings,
        emitter: SourceEmitter,
    ) -> Self {
        info!(
            "Polling run list every {:?} for connection {target_id}",
            settings.interval
        );
        let target = target_id.to_string();
        let handle = tokio::spawn(async move { run_polling(api, target, settings, emitter).await });

        Self {
            target_id: target_id.to_string(),
            handle: Some(handle),
        }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop polling. Safe to call any number of times.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Stopped polling for connection {}", self.target_id);
        }
    }
}

impl Drop for PollingMonitor {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_polling(
    api: Arc<dyn PipelineApi>,
    target_id: String,
    settings: PollingSettings,
    emitter: SourceEmitter,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut misses = 0u32;

    loop {
        ticker.tick().await;

        let runs = match api.list_runs().await {
            Ok(runs) => runs,
            Err(SyncError::Unauthorized) => {
                warn!("Poll for connection {target_id} was rejected, stopping");
                emitter
                    .emit(SourceEvent::Terminal(Terminal::unconfirmed(
                        &SyncError::Unauthorized.user_message(),
                    )))
                    .await;
                return;
            }
            Err(e) => {
                misses += 1;
                if e.is_transient() {
                    // The next tick re-reads full state
                    debug!("Poll for connection {target_id} failed, retrying next tick: {e}");
                } else {
                    warn!("Poll for connection {target_id} failed: {e}");
                }
                if misses >= settings.max_unmatched_polls {
                    give_up(&emitter, &target_id, misses).await;
                    return;
                }
                continue;
            }
        };

        let Some(run) = select_run(
            &runs,
            &target_id,
            settings.run_id.as_deref(),
            settings.not_before,
        ) else {
            misses += 1;
            debug!(
                "No run for connection {target_id} yet ({misses}/{})",
                settings.max_unmatched_polls
            );
            if misses >= settings.max_unmatched_polls {
                give_up(&emitter, &target_id, misses).await;
                return;
            }
            continue;
        };
        misses = 0;

        let event = run.to_progress_event();
        match event.outcome() {
            Some(outcome) => {
                debug!("Run {} for {target_id} finished as {}", run.id, run.status.as_str());
                emitter
                    .emit(SourceEvent::Terminal(Terminal::from_event(&event, outcome)))
                    .await;
                return;
            }
            None => {
                if !emitter.emit(SourceEvent::Progress(event)).await {
                    return;
                }
            }
        }
    }
}

async fn give_up(emitter: &SourceEmitter, target_id: &str, misses: u32) {
    warn!("Giving up on connection {target_id} after {misses} polls without a run");
    emitter
        .emit(SourceEvent::Terminal(Terminal::unconfirmed(UNCONFIRMED_NOTE)))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{Source, create_event_channel};
    use crate::core::models::Outcome;
    use crate::test_fixtures::{ScriptedApi, run_record};
    use chrono::Duration as ChronoDuration;

    fn settings(max_unmatched_polls: u32) -> PollingSettings {
        PollingSettings {
            interval: Duration::from_secs(3),
            run_id: None,
            max_unmatched_polls,
            not_before: None,
        }
    }

    #[test]
    fn test_select_prefers_running_record() {
        let now = Utc::now();
        let runs = vec![
            run_record("r3", "conn-1", RunStatus::Completed, 10, 10, now),
            run_record("r2", "conn-1", RunStatus::Running, 10, 4, now - ChronoDuration::minutes(5)),
            run_record("r1", "conn-2", RunStatus::Running, 10, 4, now),
        ];

        let selected = select_run(&runs, "conn-1", None, None).expect("Should match a run");
        assert_eq!(selected.id, "r2");
    }

    #[test]
    fn test_select_most_recent_finished_record() {
        let now = Utc::now();
        let runs = vec![
            run_record("old", "conn-1", RunStatus::Failed, 10, 1, now - ChronoDuration::hours(2)),
            run_record("new", "conn-1", RunStatus::Completed, 10, 10, now),
            run_record("other", "conn-2", RunStatus::Completed, 10, 10, now),
        ];

        assert_eq!(select_run(&runs, "conn-1", None, None).map(|r| r.id.as_str()), Some("new"));
        assert!(select_run(&runs, "conn-3", None, None).is_none());
    }

    #[test]
    fn test_select_ignores_finished_runs_from_earlier_attempts() {
        let now = Utc::now();
        let runs = vec![run_record(
            "yesterday",
            "conn-1",
            RunStatus::Completed,
            10,
            10,
            now - ChronoDuration::days(1),
        )];

        assert!(select_run(&runs, "conn-1", None, Some(now - ChronoDuration::minutes(1))).is_none());

        // A running record is accepted regardless of when it started
        let runs = vec![run_record(
            "long",
            "conn-1",
            RunStatus::Running,
            10,
            2,
            now - ChronoDuration::days(1),
        )];
        assert!(select_run(&runs, "conn-1", None, Some(now)).is_some());
    }

    #[test]
    fn test_select_prefers_attempt_run_id() {
        let now = Utc::now();
        let runs = vec![
            run_record("other-tab", "conn-1", RunStatus::Running, 10, 4, now),
            run_record("t1", "conn-1", RunStatus::Running, 10, 2, now - ChronoDuration::minutes(1)),
        ];
        assert_eq!(
            select_run(&runs, "conn-1", Some("t1"), None).map(|r| r.id.as_str()),
            Some("t1")
        );

        // The attempt's own record is accepted even if the clocks disagree
        let runs = vec![
            run_record("t1", "conn-1", RunStatus::Completed, 10, 10, now - ChronoDuration::hours(1)),
            run_record("other-tab", "conn-1", RunStatus::Running, 10, 4, now),
        ];
        assert_eq!(
            select_run(&runs, "conn-1", Some("t1"), Some(now)).map(|r| r.id.as_str()),
            Some("t1")
        );

        // Unknown run id falls back to matching by connection
        assert_eq!(
            select_run(&runs, "conn-1", Some("t9"), Some(now)).map(|r| r.id.as_str()),
            Some("other-tab")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_terminal_and_swallows_failures() {
        let now = Utc::now();
        let api = Arc::new(ScriptedApi::new().with_runs(vec![
            Err(SyncError::Network("timeout".to_string())),
            Ok(vec![run_record("r1", "conn-1", RunStatus::Running, 20, 5, now)]),
            Ok(vec![
                run_record("r1", "conn-1", RunStatus::Partial, 20, 12, now).with_notes("quota"),
            ]),
        ]));

        let (tx, mut rx) = create_event_channel();
        let monitor = PollingMonitor::start(
            api.clone(),
            "conn-1",
            settings(5),
            SourceEmitter::new(1, Source::Polling, tx),
        );

        let first = rx.recv().await.expect("Should report progress");
        assert_eq!(first.source, Source::Polling);
        assert!(matches!(first.event, SourceEvent::Progress(ref e) if e.comments_analyzed == 5));

        let second = rx.recv().await.expect("Should report terminal");
        match second.event {
            SourceEvent::Terminal(terminal) => {
                assert_eq!(terminal.outcome, Outcome::Failed);
                assert_eq!(terminal.note, "quota");
            }
            other => panic!("expected terminal, got {other:?}"),
        }

        assert!(rx.recv().await.is_none());
        assert_eq!(api.poll_count(), 3);
        drop(monitor);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_unmatched_polls() {
        let api = Arc::new(ScriptedApi::new().with_runs(vec![Ok(Vec::new())]));

        let (tx, mut rx) = create_event_channel();
        let _monitor = PollingMonitor::start(
            api.clone(),
            "conn-1",
            settings(3),
            SourceEmitter::new(1, Source::Polling, tx),
        );

        let message = rx.recv().await.expect("Should give up");
        assert_eq!(
            message.event,
            SourceEvent::Terminal(Terminal::unconfirmed(UNCONFIRMED_NOTE))
        );
        assert_eq!(api.poll_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let now = Utc::now();
        let api = Arc::new(ScriptedApi::new().with_runs(vec![Ok(vec![run_record(
            "r1",
            "conn-1",
            RunStatus::Running,
            20,
            5,
            now,
        )])]));

        let (tx, mut rx) = create_event_channel();
        let mut monitor = PollingMonitor::start(
            api.clone(),
            "conn-1",
            settings(3),
            SourceEmitter::new(1, Source::Polling, tx),
        );

        rx.recv().await.expect("Should poll once");
        monitor.cancel();
        monitor.cancel();
        assert!(!monitor.is_active());

        let polls = api.poll_count();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.poll_count(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_polls_count_toward_the_bound() {
        let api = Arc::new(
            ScriptedApi::new().with_runs(vec![Err(SyncError::DataParse("bad json".to_string()))]),
        );

        let (tx, mut rx) = create_event_channel();
        let _monitor = PollingMonitor::start(
            api.clone(),
            "conn-1",
            settings(3),
            SourceEmitter::new(1, Source::Polling, tx),
        );

        let message = rx.recv().await.expect("Should give up");
        assert_eq!(
            message.event,
            SourceEvent::Terminal(Terminal::unconfirmed(UNCONFIRMED_NOTE))
        );
        assert_eq!(api.poll_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_token_stops_polling_at_once() {
        let api = Arc::new(ScriptedApi::new().with_runs(vec![Err(SyncError::Unauthorized)]));

        let (tx, mut rx) = create_event_channel();
        let _monitor = PollingMonitor::start(
            api.clone(),
            "conn-1",
            settings(20),
            SourceEmitter::new(1, Source::Polling, tx),
        );

        let message = rx.recv().await.expect("Should stop");
        match message.event {
            SourceEvent::Terminal(terminal) => {
                assert_eq!(terminal.outcome, Outcome::Failed);
                assert_eq!(terminal.note, "Session expired or token rejected");
            }
            other => panic!("expected terminal, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.poll_count(), 1);
    }
}
