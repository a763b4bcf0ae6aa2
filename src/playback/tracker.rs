//! # Position Tracking
//!
//! Follows a receiver's playback position and forwards it to a sync callback,
//! but only once it has moved by at least `sync_threshold_seconds` since the
//! last forwarded value. Observations come from two places: push
//! notifications and a fixed-interval poll.
//!
//! ## Terminal states:
//! - idle + finished → `on_finished(last_position)`, tracking stops
//! - idle + error, a failed poll, or a closed notification channel →
//!   `on_error(message)`, tracking stops
//!
//! Nothing is retried; reconnecting is the caller's business.

use crate::playback::client::{IdleReason, PlaybackClient, PlayerState, PlayerStatus, SyncCallback};
use anyhow::{bail, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type FinishedCallback = Arc<dyn Fn(f64) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerOptions {
    pub poll_interval: Duration,
    pub sync_threshold_seconds: f64,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            sync_threshold_seconds: 5.0,
        }
    }
}

#[derive(Debug, Default)]
struct Positions {
    last_synced: Option<f64>,
    last_known: f64,
}

/// What one observation asks the tracker to do.
#[derive(Debug, PartialEq)]
enum Observation {
    Ignore,
    Sync(f64),
    Finished(f64),
    Failed(String),
}

pub struct PositionTracker {
    client: Arc<dyn PlaybackClient>,
    options: TrackerOptions,
    on_sync: SyncCallback,
    on_finished: Option<FinishedCallback>,
    on_error: Option<ErrorCallback>,
    positions: Arc<Mutex<Positions>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PositionTracker {
    pub fn new(client: Arc<dyn PlaybackClient>, options: TrackerOptions, on_sync: SyncCallback) -> Self {
        Self {
            client,
            options,
            on_sync,
            on_finished: None,
            on_error: None,
            positions: Arc::new(Mutex::new(Positions::default())),
            task: Mutex::new(None),
        }
    }

    pub fn on_finished(mut self, callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.on_finished = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Subscribe to push updates and begin polling.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|(cancel, _)| !cancel.is_cancelled()) {
            bail!("position tracker already running");
        }

        let cancel = CancellationToken::new();
        let updates = self.client.subscribe();
        let handle = tokio::spawn(track(
            self.client.clone(),
            updates,
            self.options.clone(),
            self.positions.clone(),
            self.on_sync.clone(),
            self.on_finished.clone(),
            self.on_error.clone(),
            cancel.clone(),
        ));
        *task = Some((cancel, handle));
        info!(poll_ms = self.options.poll_interval.as_millis() as u64, "Position tracking started");
        Ok(())
    }

    /// Stop polling, drop the subscription, and report where playback was.
    pub fn stop(&self) -> f64 {
        if let Some((cancel, handle)) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            cancel.cancel();
            handle.abort();
        }
        let position = self.last_position();
        info!(position, "Position tracking stopped");
        position
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(cancel, handle)| !cancel.is_cancelled() && !handle.is_finished())
    }

    pub fn last_position(&self) -> f64 {
        self.positions.lock().unwrap_or_else(PoisonError::into_inner).last_known
    }
}

impl Drop for PositionTracker {
    fn drop(&mut self) {
        if let Some((cancel, handle)) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            cancel.cancel();
            handle.abort();
        }
    }
}

fn observe(positions: &Mutex<Positions>, status: &PlayerStatus, threshold: f64) -> Observation {
    let mut positions = positions.lock().unwrap_or_else(PoisonError::into_inner);
    match status.player_state {
        PlayerState::Idle => match status.idle_reason {
            Some(IdleReason::Finished) => Observation::Finished(positions.last_known),
            Some(IdleReason::Error) => Observation::Failed("receiver went idle with an error".to_string()),
            _ => Observation::Ignore,
        },
        PlayerState::Playing => {
            let position = status.current_time;
            positions.last_known = position;
            let moved = positions
                .last_synced
                .map_or(true, |last| (position - last).abs() >= threshold);
            if moved {
                positions.last_synced = Some(position);
                Observation::Sync(position)
            } else {
                Observation::Ignore
            }
        }
        PlayerState::Paused | PlayerState::Buffering => {
            positions.last_known = status.current_time;
            Observation::Ignore
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn track(
    client: Arc<dyn PlaybackClient>,
    mut updates: broadcast::Receiver<PlayerStatus>,
    options: TrackerOptions,
    positions: Arc<Mutex<Positions>>,
    on_sync: SyncCallback,
    on_finished: Option<FinishedCallback>,
    on_error: Option<ErrorCallback>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let status = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let polled = tokio::select! {
                    _ = cancel.cancelled() => return,
                    polled = client.get_status() => polled,
                };
                match polled {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(error = %e, "Polling playback status failed");
                        fail(&on_error, &cancel, format!("status poll failed: {:#}", e));
                        return;
                    }
                }
            }
            update = updates.recv() => match update {
                Ok(status) => status,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Status notifications lagged");
                    continue;
                }
                Err(RecvError::Closed) => {
                    fail(&on_error, &cancel, "status notifications closed".to_string());
                    return;
                }
            },
        };

        match observe(&positions, &status, options.sync_threshold_seconds) {
            Observation::Ignore => {}
            Observation::Sync(position) => {
                if let Err(e) = on_sync(position).await {
                    warn!(position, error = %e, "Position sync failed");
                }
            }
            Observation::Finished(position) => {
                info!(position, "Playback finished");
                cancel.cancel();
                if let Some(callback) = &on_finished {
                    callback(position);
                }
                return;
            }
            Observation::Failed(message) => {
                fail(&on_error, &cancel, message);
                return;
            }
        }
    }
}

fn fail(on_error: &Option<ErrorCallback>, cancel: &CancellationToken, message: String) {
    warn!(error = %message, "Position tracking ended");
    cancel.cancel();
    if let Some(callback) = on_error {
        callback(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::client::sync_callback;
    use crate::playback::client::testing::FakePlaybackClient;

    fn recording_sync() -> (Arc<Mutex<Vec<f64>>>, SyncCallback) {
        let synced = Arc::new(Mutex::new(Vec::new()));
        let sink = synced.clone();
        let callback = sync_callback(move |position| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(position);
                Ok(())
            }
        });
        (synced, callback)
    }

    fn options() -> TrackerOptions {
        TrackerOptions {
            poll_interval: Duration::from_secs(1),
            sync_threshold_seconds: 5.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_suppresses_small_moves() {
        let client = FakePlaybackClient::new(PlayerStatus::playing(0.0));
        client.script([
            PlayerStatus::playing(100.0),
            PlayerStatus::playing(102.0),
            PlayerStatus::playing(104.9),
            PlayerStatus::playing(106.0),
        ]);
        let (synced, on_sync) = recording_sync();
        let tracker = PositionTracker::new(client.clone(), options(), on_sync);

        tracker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(client.count("get_status"), 4);
        assert_eq!(*synced.lock().unwrap(), vec![100.0, 106.0]);
        assert_eq!(tracker.stop(), 106.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_updates_are_observed() {
        let client = FakePlaybackClient::new(PlayerStatus::playing(10.0));
        let (synced, on_sync) = recording_sync();
        let tracker = PositionTracker::new(client.clone(), options(), on_sync);

        tracker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.push(PlayerStatus::playing(30.0));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*synced.lock().unwrap(), vec![10.0, 30.0]);
        assert_eq!(tracker.last_position(), 30.0);
        tracker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_updates_position_without_sync() {
        let client = FakePlaybackClient::new(PlayerStatus::playing(50.0));
        let (synced, on_sync) = recording_sync();
        let tracker = PositionTracker::new(client.clone(), options(), on_sync);

        tracker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.set_status(PlayerStatus::paused(80.0));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*synced.lock().unwrap(), vec![50.0]);
        assert_eq!(tracker.stop(), 80.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_is_terminal() {
        let client = FakePlaybackClient::new(PlayerStatus::playing(200.0));
        let (synced, on_sync) = recording_sync();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let sink = finished.clone();
        let tracker = PositionTracker::new(client.clone(), options(), on_sync)
            .on_finished(move |position| sink.lock().unwrap().push(position));

        tracker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.push(PlayerStatus::idle(IdleReason::Finished));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*finished.lock().unwrap(), vec![200.0]);
        assert!(!tracker.is_running());

        let polls = client.count("get_status");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(client.count("get_status"), polls);
        assert_eq!(synced.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_error_and_poll_failure_report_errors() {
        let client = FakePlaybackClient::new(PlayerStatus::playing(1.0));
        let (_synced, on_sync) = recording_sync();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let tracker = PositionTracker::new(client.clone(), options(), on_sync)
            .on_error(move |message| sink.lock().unwrap().push(message));

        tracker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.push(PlayerStatus::idle(IdleReason::Error));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(!tracker.is_running());

        // Restartable once it has stopped itself.
        client.fail_status(true);
        tracker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(errors.lock().unwrap().len(), 2);
        assert!(errors.lock().unwrap()[1].contains("status poll failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails() {
        let client = FakePlaybackClient::new(PlayerStatus::playing(0.0));
        let (_synced, on_sync) = recording_sync();
        let tracker = PositionTracker::new(client, options(), on_sync);

        tracker.start().unwrap();
        assert!(tracker.start().is_err());
        tracker.stop();
        assert!(tracker.start().is_ok());
    }

    #[test]
    fn test_cancelled_idle_is_ignored() {
        let positions = Mutex::new(Positions::default());
        let status = PlayerStatus::idle(IdleReason::Cancelled);
        assert_eq!(observe(&positions, &status, 5.0), Observation::Ignore);
    }
}
