//! The speaker-side collaborator: a cast-style media client.
//!
//! Only the interface lives here. The tracker and sleep timer talk to the
//! receiver exclusively through [`PlaybackClient`], so tests drive them with
//! a scripted double.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    Idle,
    Buffering,
    Playing,
    Paused,
}

/// Why a receiver went idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdleReason {
    Finished,
    Error,
    Cancelled,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStatus {
    pub player_state: PlayerState,
    pub idle_reason: Option<IdleReason>,
    /// Seconds into the loaded media
    pub current_time: f64,
}

impl PlayerStatus {
    pub fn playing(current_time: f64) -> Self {
        Self {
            player_state: PlayerState::Playing,
            idle_reason: None,
            current_time,
        }
    }

    pub fn paused(current_time: f64) -> Self {
        Self {
            player_state: PlayerState::Paused,
            idle_reason: None,
            current_time,
        }
    }

    pub fn idle(reason: IdleReason) -> Self {
        Self {
            player_state: PlayerState::Idle,
            idle_reason: Some(reason),
            current_time: 0.0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.player_state == PlayerState::Idle
    }
}

/// What to ask the receiver to play, normally a relay `/stream` URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRequest {
    pub url: String,
    pub content_type: String,
    pub title: Option<String>,
    pub start_time: f64,
}

#[async_trait]
pub trait PlaybackClient: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn load_media(&self, media: &MediaRequest) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn play(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn seek(&self, position_seconds: f64) -> Result<()>;
    async fn get_status(&self) -> Result<PlayerStatus>;

    /// Push notifications for status changes. Dropping the receiver
    /// unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<PlayerStatus>;
}

/// Forwards a position to wherever progress is persisted.
pub type SyncCallback = Arc<dyn Fn(f64) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn sync_callback<F, Fut>(f: F) -> SyncCallback
where
    F: Fn(f64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |position| Box::pin(f(position)))
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use anyhow::bail;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct FakeState {
        current: PlayerStatus,
        script: VecDeque<PlayerStatus>,
        fail_status: bool,
        fail_pause: bool,
        calls: Vec<&'static str>,
    }

    /// Scripted receiver. `get_status` pops scripted statuses first, then
    /// keeps returning the current one.
    pub struct FakePlaybackClient {
        state: Mutex<FakeState>,
        updates: broadcast::Sender<PlayerStatus>,
    }

    impl FakePlaybackClient {
        pub fn new(current: PlayerStatus) -> Arc<Self> {
            let (updates, _) = broadcast::channel(16);
            Arc::new(Self {
                state: Mutex::new(FakeState {
                    current,
                    script: VecDeque::new(),
                    fail_status: false,
                    fail_pause: false,
                    calls: Vec::new(),
                }),
                updates,
            })
        }

        pub fn set_status(&self, status: PlayerStatus) {
            self.state.lock().unwrap().current = status;
        }

        pub fn script(&self, statuses: impl IntoIterator<Item = PlayerStatus>) {
            let mut state = self.state.lock().unwrap();
            for status in statuses {
                state.script.push_back(status.clone());
                state.current = status;
            }
        }

        pub fn fail_status(&self, fail: bool) {
            self.state.lock().unwrap().fail_status = fail;
        }

        pub fn fail_pause(&self, fail: bool) {
            self.state.lock().unwrap().fail_pause = fail;
        }

        /// Deliver a push notification to every subscriber.
        pub fn push(&self, status: PlayerStatus) {
            let _ = self.updates.send(status);
        }

        pub fn count(&self, call: &str) -> usize {
            self.state.lock().unwrap().calls.iter().filter(|c| **c == call).count()
        }

        fn record(&self, call: &'static str) {
            self.state.lock().unwrap().calls.push(call);
        }
    }

    #[async_trait]
    impl PlaybackClient for FakePlaybackClient {
        async fn connect(&self) -> Result<()> {
            self.record("connect");
            Ok(())
        }

        async fn load_media(&self, _media: &MediaRequest) -> Result<()> {
            self.record("load_media");
            Ok(())
        }

        async fn pause(&self) -> Result<()> {
            self.record("pause");
            let mut state = self.state.lock().unwrap();
            if state.fail_pause {
                bail!("receiver rejected pause");
            }
            state.current.player_state = PlayerState::Paused;
            Ok(())
        }

        async fn play(&self) -> Result<()> {
            self.record("play");
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.record("stop");
            Ok(())
        }

        async fn seek(&self, position_seconds: f64) -> Result<()> {
            self.record("seek");
            self.state.lock().unwrap().current.current_time = position_seconds;
            Ok(())
        }

        async fn get_status(&self) -> Result<PlayerStatus> {
            self.record("get_status");
            let mut state = self.state.lock().unwrap();
            if state.fail_status {
                bail!("receiver connection lost");
            }
            Ok(state.script.pop_front().unwrap_or_else(|| state.current.clone()))
        }

        fn subscribe(&self) -> broadcast::Receiver<PlayerStatus> {
            self.updates.subscribe()
        }
    }
}
