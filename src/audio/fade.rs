//! # Stepped Fades
//!
//! Drives a [`GainStage`] from one gain to another in discrete steps spread
//! over a duration. The fade suspends between steps, so a multi-second fade
//! never blocks the runtime.
//!
//! ## Step Schedule:
//! For step `i` of `n` the gain is `from - (from - to) * i / n`. Each step is
//! applied *before* the following wait, so the first audible change happens
//! immediately. The last step writes `to` exactly.
//!
//! ## Cancellation:
//! A `CancellationToken` is checked before every wait and after every wake.
//! A cancelled fade leaves the gain wherever the last step put it.

use crate::audio::gain::GainStage;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of steps when the caller does not choose one.
pub const DEFAULT_FADE_STEPS: u32 = 20;

/// Progress callback: `(gain, step_index, total_steps)`, 1-based index.
pub type StepCallback = Box<dyn FnMut(f32, u32, u32) + Send>;

/// Optional knobs for a fade.
pub struct FadeOptions {
    pub steps: u32,
    pub cancel: Option<CancellationToken>,
    pub on_step: Option<StepCallback>,
}

impl Default for FadeOptions {
    fn default() -> Self {
        Self {
            steps: DEFAULT_FADE_STEPS,
            cancel: None,
            on_step: None,
        }
    }
}

impl FadeOptions {
    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_step(mut self, callback: impl FnMut(f32, u32, u32) + Send + 'static) -> Self {
        self.on_step = Some(Box::new(callback));
        self
    }
}

/// What a fade actually did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeResult {
    pub completed: bool,
    pub final_gain: f32,
    pub steps_executed: u32,
    pub cancelled: bool,
}

impl FadeResult {
    fn cancelled(stage: &GainStage, steps_executed: u32) -> Self {
        Self {
            completed: false,
            final_gain: stage.gain(),
            steps_executed,
            cancelled: true,
        }
    }
}

/// Gain at step `index` of `total` (1-based).
pub fn step_gain(from: f32, to: f32, index: u32, total: u32) -> f32 {
    if index >= total {
        return to;
    }
    from - (from - to) * (index as f32 / total as f32)
}

/// Fade `stage` from `from` to `to` over `duration`.
///
/// `steps == 0` is treated as a single step.
pub async fn fade(
    stage: &GainStage,
    from: f32,
    to: f32,
    duration: Duration,
    options: FadeOptions,
) -> FadeResult {
    let steps = options.steps.max(1);
    let interval = duration / steps;
    let cancel = options.cancel.unwrap_or_default();
    let mut on_step = options.on_step;

    if cancel.is_cancelled() {
        return FadeResult::cancelled(stage, 0);
    }

    debug!(from, to, steps, duration_ms = duration.as_millis() as u64, "Fade started");
    stage.set_gain(from);

    for index in 1..=steps {
        let applied = stage.set_gain(step_gain(from, to, index, steps));
        if let Some(callback) = on_step.as_mut() {
            callback(applied, index, steps);
        }

        if cancel.is_cancelled() {
            debug!(step = index, gain = applied, "Fade cancelled");
            return FadeResult::cancelled(stage, index);
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
        }

        if cancel.is_cancelled() {
            debug!(step = index, gain = applied, "Fade cancelled");
            return FadeResult::cancelled(stage, index);
        }
    }

    // Written last so rounding in the step formula can't leave us off-target.
    stage.set_gain(to);

    FadeResult {
        completed: true,
        final_gain: stage.gain(),
        steps_executed: steps,
        cancelled: false,
    }
}

/// Fade from the stage's current gain down to silence.
pub async fn fade_out(stage: &GainStage, duration: Duration, options: FadeOptions) -> FadeResult {
    let from = stage.gain();
    fade(stage, from, 0.0, duration, options).await
}

/// Fade from silence up to `target`.
pub async fn fade_in(
    stage: &GainStage,
    target: f32,
    duration: Duration,
    options: FadeOptions,
) -> FadeResult {
    fade(stage, 0.0, target, duration, options).await
}
