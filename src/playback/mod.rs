//! Receiver-facing control: position tracking and the sleep timer.

pub mod client;
pub mod sleep_timer;
pub mod tracker;

pub use client::{MediaRequest, PlaybackClient, PlayerState, PlayerStatus, SyncCallback};
pub use sleep_timer::{SleepTimer, SleepTimerOptions, SleepTimerState, TimerOutcome, TimerPhase};
pub use tracker::{PositionTracker, TrackerOptions};
