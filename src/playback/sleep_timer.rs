//! # Sleep Timer
//!
//! Counts down, fades the session's gain stage to silence, then pauses the
//! receiver. The speaker never gets a volume command, so the fade is silent
//! on the device side.
//!
//! ## Phases:
//! ```text
//! inactive → countdown → fading → completing → inactive
//!                │           │
//!                └───────────┴──→ inactive   (cancel, playback ended)
//! ```
//! - **countdown**: a progress ticker reports the remaining time; a position
//!   ticker polls the receiver and syncs. Idle while polling ends the timer
//!   without a fade.
//! - **fading**: the progress ticker stops, the position ticker keeps the
//!   final position fresh, and the gain steps down to 0.0.
//! - **completing**: one last status read (falling back to the last known
//!   position), a best-effort sync, then pause.
//!
//! Every path back to `inactive` goes through `finish`, which tears down the
//! tickers and resolves the caller's [`TimerCompletion`] exactly once.

use crate::audio::fade::{fade_out, FadeOptions};
use crate::audio::gain::GainStage;
use crate::playback::client::{PlaybackClient, SyncCallback};
use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerPhase {
    Inactive,
    Countdown,
    Fading,
    Completing,
}

impl fmt::Display for TimerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerPhase::Inactive => "inactive",
            TimerPhase::Countdown => "countdown",
            TimerPhase::Fading => "fading",
            TimerPhase::Completing => "completing",
        };
        f.write_str(name)
    }
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepTimerState {
    pub active: bool,
    pub phase: TimerPhase,
    pub remaining_ms: u64,
    pub position_seconds: f64,
    pub total_duration_ms: u64,
    pub fade_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SleepTimerOptions {
    /// Total time until the receiver should be paused
    pub duration: Duration,
    pub fade_duration: Duration,
    pub fade_steps: u32,
    /// Subtracted from `duration` so the fade starts ahead of buffered audio
    pub latency_compensation: Duration,
    pub position_poll_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for SleepTimerOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30 * 60),
            fade_duration: Duration::from_secs(30),
            fade_steps: 20,
            latency_compensation: Duration::from_secs(2),
            position_poll_interval: Duration::from_secs(10),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// How a timer run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerOutcome {
    /// Faded and paused. `gain_before_fade` lets the caller restore volume
    /// before resuming.
    Completed {
        position_seconds: f64,
        gain_before_fade: f32,
    },
    Cancelled { position_seconds: f64 },
    /// The receiver went idle on its own during the countdown.
    PlaybackEnded { position_seconds: f64 },
    /// The receiver became unreachable, or refused to pause.
    Failed { position_seconds: f64, error: String },
    /// The timer's tasks were torn down without reporting, e.g. on runtime
    /// shutdown. No position is known.
    Abandoned,
}

impl TimerOutcome {
    pub fn position_seconds(&self) -> Option<f64> {
        match self {
            TimerOutcome::Completed { position_seconds, .. }
            | TimerOutcome::Cancelled { position_seconds }
            | TimerOutcome::PlaybackEnded { position_seconds }
            | TimerOutcome::Failed { position_seconds, .. } => Some(*position_seconds),
            TimerOutcome::Abandoned => None,
        }
    }
}

/// Resolves once the timer run returns to `inactive`.
pub struct TimerCompletion {
    rx: oneshot::Receiver<TimerOutcome>,
}

impl Future for TimerCompletion {
    type Output = TimerOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(TimerOutcome::Abandoned))
    }
}

type TickCallback = Arc<dyn Fn(u64) + Send + Sync>;
type FadeStepCallback = Arc<dyn Fn(f32, u32, u32) + Send + Sync>;
type PositionCallback = Arc<dyn Fn(f64) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    on_tick: Option<TickCallback>,
    on_sync: Option<SyncCallback>,
    on_fade_step: Option<FadeStepCallback>,
    on_complete: Option<PositionCallback>,
    on_error: Option<ErrorCallback>,
}

struct Run {
    phase: TimerPhase,
    /// Bumped on every start so stale tasks can't finish a newer run
    generation: u64,
    fade_at: Option<Instant>,
    position_seconds: f64,
    cancel: Option<CancellationToken>,
    progress_ticker: Option<JoinHandle<()>>,
    position_ticker: Option<JoinHandle<()>>,
    completion: Option<oneshot::Sender<TimerOutcome>>,
}

struct TimerInner {
    client: Arc<dyn PlaybackClient>,
    gain: GainStage,
    options: SleepTimerOptions,
    callbacks: RwLock<Callbacks>,
    run: Mutex<Run>,
}

/// Cheap handle; clones control the same timer.
#[derive(Clone)]
pub struct SleepTimer {
    inner: Arc<TimerInner>,
}

impl SleepTimer {
    pub fn new(client: Arc<dyn PlaybackClient>, gain: GainStage, options: SleepTimerOptions) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                client,
                gain,
                options,
                callbacks: RwLock::new(Callbacks::default()),
                run: Mutex::new(Run {
                    phase: TimerPhase::Inactive,
                    generation: 0,
                    fade_at: None,
                    position_seconds: 0.0,
                    cancel: None,
                    progress_ticker: None,
                    position_ticker: None,
                    completion: None,
                }),
            }),
        }
    }

    /// Callbacks are shared by every clone of the handle. A run that is
    /// already in flight picks up a new callback at its next use.
    fn with_callbacks(self, update: impl FnOnce(&mut Callbacks)) -> Self {
        update(&mut self.inner.callbacks.write().unwrap_or_else(PoisonError::into_inner));
        self
    }

    /// Remaining time in ms, reported every `tick_interval` during countdown.
    pub fn on_tick(self, callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.with_callbacks(|c| c.on_tick = Some(Arc::new(callback)))
    }

    pub fn on_sync(self, callback: SyncCallback) -> Self {
        self.with_callbacks(|c| c.on_sync = Some(callback))
    }

    pub fn on_fade_step(self, callback: impl Fn(f32, u32, u32) + Send + Sync + 'static) -> Self {
        self.with_callbacks(|c| c.on_fade_step = Some(Arc::new(callback)))
    }

    /// Called with the final position after a successful pause.
    pub fn on_complete(self, callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.with_callbacks(|c| c.on_complete = Some(Arc::new(callback)))
    }

    pub fn on_error(self, callback: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.with_callbacks(|c| c.on_error = Some(Arc::new(callback)))
    }

    /// Arm the timer. Fails unless inactive.
    pub fn start(&self) -> Result<TimerCompletion> {
        let inner = &self.inner;
        let options = &inner.options;
        let mut run = inner.lock();
        if run.phase != TimerPhase::Inactive {
            bail!("sleep timer already active ({})", run.phase);
        }

        run.generation += 1;
        let generation = run.generation;
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let countdown = options.duration.saturating_sub(options.latency_compensation);
        let fade_at = Instant::now() + countdown;

        run.phase = TimerPhase::Countdown;
        run.fade_at = Some(fade_at);
        run.cancel = Some(cancel.clone());
        run.completion = Some(tx);
        run.progress_ticker = Some(tokio::spawn(progress_ticker(inner.clone(), generation)));
        run.position_ticker = Some(tokio::spawn(position_ticker(inner.clone(), generation)));
        drop(run);

        tokio::spawn(drive(inner.clone(), generation, fade_at, cancel));

        info!(
            duration_ms = options.duration.as_millis() as u64,
            fade_ms = options.fade_duration.as_millis() as u64,
            fade_in_ms = countdown.as_millis() as u64,
            "Sleep timer started"
        );
        Ok(TimerCompletion { rx })
    }

    /// Abort the run from any active phase, including mid-fade. The gain is
    /// left where the fade stopped. Returns the last known position.
    pub fn cancel(&self) -> f64 {
        let (generation, position) = {
            let run = self.inner.lock();
            (run.generation, run.position_seconds)
        };
        if self.inner.finish(generation, TimerOutcome::Cancelled { position_seconds: position }) {
            info!(position, "Sleep timer cancelled");
        }
        position
    }

    pub fn phase(&self) -> TimerPhase {
        self.inner.lock().phase
    }

    pub fn is_active(&self) -> bool {
        self.phase() != TimerPhase::Inactive
    }

    /// Time until the fade starts; 0 outside the countdown.
    pub fn remaining_ms(&self) -> u64 {
        self.inner.remaining_ms()
    }

    pub fn state(&self) -> SleepTimerState {
        let run = self.inner.lock();
        SleepTimerState {
            active: run.phase != TimerPhase::Inactive,
            phase: run.phase,
            remaining_ms: remaining_in(&run),
            position_seconds: run.position_seconds,
            total_duration_ms: self.inner.options.duration.as_millis() as u64,
            fade_duration_ms: self.inner.options.fade_duration.as_millis() as u64,
        }
    }
}

fn remaining_in(run: &Run) -> u64 {
    match (run.phase, run.fade_at) {
        (TimerPhase::Countdown, Some(at)) => {
            at.saturating_duration_since(Instant::now()).as_millis() as u64
        }
        _ => 0,
    }
}

impl TimerInner {
    fn lock(&self) -> MutexGuard<'_, Run> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remaining_ms(&self) -> u64 {
        remaining_in(&self.lock())
    }

    fn is_current(&self, generation: u64, phase: TimerPhase) -> bool {
        let run = self.lock();
        run.generation == generation && run.phase == phase
    }

    /// Move from `from` to `to` if this run is still in `from`.
    fn advance(&self, generation: u64, from: TimerPhase, to: TimerPhase) -> bool {
        let mut run = self.lock();
        if run.generation != generation || run.phase != from {
            return false;
        }
        run.phase = to;
        if to != TimerPhase::Countdown {
            run.fade_at = None;
            if let Some(ticker) = run.progress_ticker.take() {
                ticker.abort();
            }
        }
        debug!(from = %from, to = %to, "Sleep timer phase change");
        true
    }

    fn record_position(&self, generation: u64, position: f64) {
        let mut run = self.lock();
        if run.generation == generation {
            run.position_seconds = position;
        }
    }

    /// Return to `inactive` and resolve the caller. Only the first call per
    /// run does anything.
    fn finish(&self, generation: u64, outcome: TimerOutcome) -> bool {
        let (completion, tickers) = {
            let mut run = self.lock();
            if run.generation != generation || run.phase == TimerPhase::Inactive {
                return false;
            }
            run.phase = TimerPhase::Inactive;
            run.fade_at = None;
            if let Some(position) = outcome.position_seconds() {
                run.position_seconds = position;
            }
            if let Some(cancel) = run.cancel.take() {
                cancel.cancel();
            }
            (
                run.completion.take(),
                [run.progress_ticker.take(), run.position_ticker.take()],
            )
        };

        for ticker in tickers.into_iter().flatten() {
            ticker.abort();
        }
        debug!(?outcome, "Sleep timer finished");
        if let Some(completion) = completion {
            let _ = completion.send(outcome);
        }
        true
    }

    /// Clone one callback out so it runs without the lock held.
    fn callback<T: Clone>(&self, pick: impl FnOnce(&Callbacks) -> &Option<T>) -> Option<T> {
        let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
        pick(&callbacks).clone()
    }

    fn report_error(&self, message: String) {
        if let Some(callback) = self.callback(|c| &c.on_error) {
            callback(message);
        }
    }

    async fn sync(&self, position: f64) -> Result<()> {
        match self.callback(|c| &c.on_sync) {
            Some(sync) => sync(position).await,
            None => Ok(()),
        }
    }
}

/// Deadline → fade → final read, sync and pause.
async fn drive(inner: Arc<TimerInner>, generation: u64, fade_at: Instant, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep_until(fade_at) => {}
    }

    if !inner.advance(generation, TimerPhase::Countdown, TimerPhase::Fading) {
        return;
    }

    let gain_before_fade = inner.gain.gain();
    info!(from = gain_before_fade, "Sleep timer fading out");

    let mut fade_options = FadeOptions::default()
        .with_steps(inner.options.fade_steps)
        .with_cancel(cancel.clone());
    if let Some(callback) = inner.callback(|c| &c.on_fade_step) {
        fade_options = fade_options.on_step(move |gain, index, total| callback(gain, index, total));
    }
    let result = fade_out(&inner.gain, inner.options.fade_duration, fade_options).await;

    if result.cancelled {
        debug!(steps = result.steps_executed, "Fade cancelled");
        return;
    }
    if !inner.advance(generation, TimerPhase::Fading, TimerPhase::Completing) {
        return;
    }

    // Each await below races the run's token; a cancelled run never pauses.
    let last_known = inner.lock().position_seconds;
    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        status = inner.client.get_status() => status,
    };
    let position = match status {
        Ok(status) if !status.is_idle() => status.current_time,
        Ok(_) => last_known,
        Err(e) => {
            warn!(phase = %TimerPhase::Completing, error = %e, "Final status read failed, using last known position");
            last_known
        }
    };
    inner.record_position(generation, position);

    if !inner.is_current(generation, TimerPhase::Completing) {
        return;
    }
    let synced = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        synced = inner.sync(position) => synced,
    };
    if let Err(e) = synced {
        warn!(phase = %TimerPhase::Completing, position, error = %e, "Final position sync failed");
    }

    if !inner.is_current(generation, TimerPhase::Completing) {
        debug!(position, "Sleep timer cancelled before pause");
        return;
    }
    let paused = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        paused = inner.client.pause() => paused,
    };
    match paused {
        Ok(()) => {
            let finished = inner.finish(
                generation,
                TimerOutcome::Completed {
                    position_seconds: position,
                    gain_before_fade,
                },
            );
            if finished {
                info!(position, "Sleep timer complete, playback paused");
                if let Some(callback) = inner.callback(|c| &c.on_complete) {
                    callback(position);
                }
            }
        }
        Err(e) => {
            let message = format!("pause failed while completing sleep timer: {:#}", e);
            error!(phase = %TimerPhase::Completing, error = %e, "Pause failed");
            if inner.finish(
                generation,
                TimerOutcome::Failed {
                    position_seconds: position,
                    error: message.clone(),
                },
            ) {
                inner.report_error(message);
            }
        }
    }
}

async fn progress_ticker(inner: Arc<TimerInner>, generation: u64) {
    let mut ticker = tokio::time::interval(inner.options.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !inner.is_current(generation, TimerPhase::Countdown) {
            return;
        }
        let remaining = inner.remaining_ms();
        if let Some(callback) = inner.callback(|c| &c.on_tick) {
            callback(remaining);
        }
    }
}

async fn position_ticker(inner: Arc<TimerInner>, generation: u64) {
    let period = inner.options.position_poll_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let phase = {
            let run = inner.lock();
            if run.generation != generation {
                return;
            }
            run.phase
        };

        match inner.client.get_status().await {
            Ok(status) if status.is_idle() => {
                if phase == TimerPhase::Countdown {
                    let position = inner.lock().position_seconds;
                    info!(position, reason = ?status.idle_reason, "Playback ended during countdown");
                    inner.finish(generation, TimerOutcome::PlaybackEnded { position_seconds: position });
                    return;
                }
            }
            Ok(status) => {
                inner.record_position(generation, status.current_time);
                if let Err(e) = inner.sync(status.current_time).await {
                    warn!(phase = %phase, error = %e, "Position sync failed");
                }
            }
            Err(e) if phase == TimerPhase::Countdown => {
                let message = format!("status poll failed during countdown: {:#}", e);
                warn!(phase = %phase, error = %e, "Lost playback client");
                let position = inner.lock().position_seconds;
                if inner.finish(
                    generation,
                    TimerOutcome::Failed {
                        position_seconds: position,
                        error: message.clone(),
                    },
                ) {
                    inner.report_error(message);
                }
                return;
            }
            Err(e) => {
                debug!(phase = %phase, error = %e, "Status poll failed, keeping last known position");
            }
        }
    }
}
