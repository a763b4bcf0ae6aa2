//! # Stream Session Management
//!
//! Tracks every open relay stream. Each session owns exactly one
//! [`TranscodingPipeline`] (and through it one gain stage), so sessions never
//! influence each other.
//!
//! ## Session Lifecycle:
//! 1. **Created**: `create_session` registers the session and starts its pipeline
//! 2. **Streaming**: the HTTP response pulls encoded audio from the pipeline
//! 3. **Closed**: the listener disconnects (stream dropped) or the session is
//!    deleted explicitly; either path stops the pipeline and removes the entry

use crate::audio::gain::{MAX_GAIN, MIN_GAIN};
use crate::audio::pipeline::{PipelineSettings, PipelineState, TranscodingPipeline};
use crate::audio::process::ProcessLauncher;
use crate::error::{AppError, AppResult};
use crate::library::AudioLibrary;
use crate::proxy::stream::SessionStream;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

/// One listener's transcode-and-stream request.
pub struct StreamSession {
    /// Derived from the book id and creation time
    pub id: String,
    pub book_id: String,
    pub start_time: DateTime<Utc>,
    pub start_position_seconds: f64,
    pub pipeline: TranscodingPipeline,
}

impl StreamSession {
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            book_id: self.book_id.clone(),
            volume: self.pipeline.gain(),
            position: self.pipeline.current_position(),
            running: self.pipeline.is_running(),
            start_time: self.start_time.timestamp_millis(),
            state: self.pipeline.state(),
        }
    }
}

/// Snapshot returned by `GET /status/{sessionId}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub book_id: String,
    pub volume: f32,
    pub position: f64,
    pub running: bool,
    /// Milliseconds since the Unix epoch
    pub start_time: i64,
    pub state: PipelineState,
}

/// Owns the map of open sessions.
///
/// ## Thread Safety:
/// actix-web runs several worker threads, so the map sits behind a `RwLock`.
/// Pipelines are started and stopped outside the lock.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    library: Arc<dyn AudioLibrary>,
    launcher: Arc<dyn ProcessLauncher>,
    settings: PipelineSettings,
    max_concurrent_sessions: usize,
}

impl SessionManager {
    pub fn new(
        library: Arc<dyn AudioLibrary>,
        launcher: Arc<dyn ProcessLauncher>,
        settings: PipelineSettings,
        max_concurrent_sessions: usize,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            library,
            launcher,
            settings,
            max_concurrent_sessions,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<StreamSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<StreamSession>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session for `book_id`, start its pipeline and return the
    /// stream the listener should receive.
    ///
    /// Dropping the returned stream closes the session.
    pub fn create_session(
        self: &Arc<Self>,
        book_id: &str,
        start_position_seconds: f64,
    ) -> AppResult<(Arc<StreamSession>, SessionStream)> {
        if !start_position_seconds.is_finite() || start_position_seconds < 0.0 {
            return Err(AppError::ValidationError(format!(
                "start must be a non-negative number of seconds, got {}",
                start_position_seconds
            )));
        }

        let source = self
            .library
            .stream_source(book_id)
            .map_err(|e| AppError::BadRequest(e.to_string()))?;

        let session = {
            let mut sessions = self.write();
            if sessions.len() >= self.max_concurrent_sessions {
                return Err(AppError::Unavailable(format!(
                    "Maximum concurrent sessions ({}) reached",
                    self.max_concurrent_sessions
                )));
            }

            let start_time = Utc::now();
            let id = unique_session_id(book_id, start_time, &sessions);
            let pipeline = TranscodingPipeline::new(
                id.clone(),
                source,
                start_position_seconds,
                self.settings.clone(),
                self.launcher.clone(),
            );
            let session = Arc::new(StreamSession {
                id: id.clone(),
                book_id: book_id.to_string(),
                start_time,
                start_position_seconds,
                pipeline,
            });
            sessions.insert(id, session.clone());
            session
        };

        if let Err(e) = session.pipeline.start() {
            self.release(&session);
            return Err(AppError::Internal(format!(
                "failed to start stream for session {}: {:#}",
                session.id, e
            )));
        }

        let output = match session.pipeline.take_output() {
            Some(output) => output,
            None => {
                self.release(&session);
                return Err(AppError::Internal(format!(
                    "stream output for session {} already taken",
                    session.id
                )));
            }
        };

        info!(
            session_id = %session.id,
            book_id = %session.book_id,
            start = start_position_seconds,
            "Stream session created"
        );

        let stream = SessionStream::new(session.clone(), output, Arc::downgrade(self));
        Ok((session, stream))
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<StreamSession>> {
        self.read().get(session_id).cloned()
    }

    /// Set a session's gain. Returns `Ok(false)` for an unknown session;
    /// out-of-range volumes are rejected before any lookup.
    pub fn set_volume(&self, session_id: &str, volume: f64) -> AppResult<bool> {
        if !volume.is_finite() || volume < MIN_GAIN as f64 || volume > MAX_GAIN as f64 {
            return Err(AppError::ValidationError(format!(
                "volume must be between {} and {}, got {}",
                MIN_GAIN, MAX_GAIN, volume
            )));
        }

        match self.get_session(session_id) {
            Some(session) => {
                let applied = session.pipeline.set_gain(volume as f32);
                info!(session_id = %session_id, volume = applied, "Session volume changed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Position estimate for a session, `None` when unknown.
    pub fn position(&self, session_id: &str) -> Option<f64> {
        self.get_session(session_id)
            .map(|session| session.pipeline.current_position())
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.get_session(session_id).map(|session| session.status())
    }

    /// Tear down and forget a session. Returns whether it existed.
    pub fn stop_session(&self, session_id: &str) -> bool {
        let removed = self.write().remove(session_id);
        match removed {
            Some(session) => {
                session.pipeline.stop();
                info!(session_id = %session_id, "Stream session stopped");
                true
            }
            None => false,
        }
    }

    /// Close a specific session instance. Only removes the map entry if it
    /// still refers to `session`, so a stale stream can't close a newer
    /// session that reused the id.
    pub(crate) fn release(&self, session: &Arc<StreamSession>) {
        {
            let mut sessions = self.write();
            if sessions
                .get(&session.id)
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(&session.id);
            }
        }
        session.pipeline.stop();
    }

    pub fn active_session_count(&self) -> usize {
        self.read().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.max_concurrent_sessions
    }

    /// Stop every session, e.g. on shutdown.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<_> = self.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.pipeline.stop();
        }
        if !drained.is_empty() {
            warn!(count = drained.len(), "Stopped all stream sessions");
        }
        drained.len()
    }
}

/// `{book_id}-{epoch_ms}`, with a random suffix if that is already taken.
fn unique_session_id(
    book_id: &str,
    created: DateTime<Utc>,
    sessions: &HashMap<String, Arc<StreamSession>>,
) -> String {
    let base = format!("{}-{}", book_id, created.timestamp_millis());
    let mut id = base.clone();
    while sessions.contains_key(&id) {
        let suffix = Uuid::new_v4().simple().to_string();
        id = format!("{}-{}", base, &suffix[..8]);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::process::testing::FakeLauncher;
    use crate::audio::process::ProcessRole;
    use crate::library::TemplateLibrary;

    fn manager(launcher: &FakeLauncher, max: usize) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(TemplateLibrary::new("http://lib/{book_id}", None)),
            Arc::new(launcher.clone()),
            PipelineSettings::default(),
            max,
        ))
    }

    #[tokio::test]
    async fn test_create_registers_and_starts() {
        let launcher = FakeLauncher::new();
        let manager = manager(&launcher, 4);

        let (session, _stream) = manager.create_session("book1", 30.0).unwrap();

        assert!(session.id.starts_with("book1-"));
        assert_eq!(manager.active_session_count(), 1);
        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(manager.position(&session.id), Some(30.0));

        let status = manager.status(&session.id).unwrap();
        assert_eq!(status.book_id, "book1");
        assert_eq!(status.volume, 1.0);
        assert!(status.running);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_independent() {
        let launcher = FakeLauncher::new();
        let manager = manager(&launcher, 4);

        let (a, _sa) = manager.create_session("book1", 0.0).unwrap();
        let (b, _sb) = manager.create_session("book1", 0.0).unwrap();
        assert_ne!(a.id, b.id);

        assert!(manager.set_volume(&a.id, 0.25).unwrap());
        assert_eq!(manager.status(&a.id).unwrap().volume, 0.25);
        assert_eq!(manager.status(&b.id).unwrap().volume, 1.0);
    }

    #[tokio::test]
    async fn test_volume_validation() {
        let launcher = FakeLauncher::new();
        let manager = manager(&launcher, 4);
        let (session, _stream) = manager.create_session("book1", 0.0).unwrap();

        assert!(matches!(
            manager.set_volume(&session.id, 2.0),
            Err(AppError::ValidationError(_))
        ));
        assert!(manager.set_volume(&session.id, -0.1).is_err());
        assert!(manager.set_volume(&session.id, f64::NAN).is_err());
        assert!(manager.set_volume(&session.id, 1.5).unwrap());
        assert!(!manager.set_volume("missing", 0.5).unwrap());
    }

    #[tokio::test]
    async fn test_stop_session_kills_processes() {
        let launcher = FakeLauncher::new();
        let manager = manager(&launcher, 4);
        let (session, _stream) = manager.create_session("book1", 0.0).unwrap();

        assert!(manager.stop_session(&session.id));
        assert!(launcher.stop_requested(0));
        assert!(launcher.stop_requested(1));
        assert!(manager.status(&session.id).is_none());
        assert!(manager.position(&session.id).is_none());
        assert!(!manager.stop_session(&session.id));
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_session() {
        let launcher = FakeLauncher::new();
        let manager = manager(&launcher, 4);
        let (session, stream) = manager.create_session("book1", 0.0).unwrap();
        let id = session.id.clone();
        drop(session);

        drop(stream);

        assert_eq!(manager.active_session_count(), 0);
        assert!(manager.status(&id).is_none());
        assert!(launcher.stop_requested(0));
        assert!(launcher.stop_requested(1));
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let launcher = FakeLauncher::new();
        let manager = manager(&launcher, 1);
        let (_session, _stream) = manager.create_session("book1", 0.0).unwrap();

        assert!(matches!(
            manager.create_session("book2", 0.0),
            Err(AppError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_session() {
        let launcher = FakeLauncher::failing(ProcessRole::Decode);
        let manager = manager(&launcher, 4);

        assert!(matches!(
            manager.create_session("book1", 0.0),
            Err(AppError::Internal(_))
        ));
        assert_eq!(manager.active_session_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_inputs_rejected() {
        let launcher = FakeLauncher::new();
        let manager = manager(&launcher, 4);

        assert!(matches!(
            manager.create_session("../etc", 0.0),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            manager.create_session("book1", -5.0),
            Err(AppError::ValidationError(_))
        ));
        assert_eq!(launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let launcher = FakeLauncher::new();
        let manager = manager(&launcher, 4);
        let (_a, _sa) = manager.create_session("book1", 0.0).unwrap();
        let (_b, _sb) = manager.create_session("book2", 0.0).unwrap();

        assert_eq!(manager.stop_all(), 2);
        assert_eq!(manager.active_session_count(), 0);
        for i in 0..4 {
            assert!(launcher.stop_requested(i));
        }
    }

    #[tokio::test]
    async fn test_session_id_collision_gets_suffix() {
        let created = Utc::now();
        let mut sessions = HashMap::new();
        let first = unique_session_id("b", created, &sessions);
        assert_eq!(first, format!("b-{}", created.timestamp_millis()));

        // Only the key matters here.
        let launcher = FakeLauncher::new();
        let placeholder = Arc::new(StreamSession {
            id: first.clone(),
            book_id: "b".into(),
            start_time: created,
            start_position_seconds: 0.0,
            pipeline: TranscodingPipeline::new(
                first.clone(),
                crate::library::StreamSource { url: "x".into(), auth_header: None },
                0.0,
                PipelineSettings::default(),
                Arc::new(launcher),
            ),
        });
        sessions.insert(first.clone(), placeholder);

        let second = unique_session_id("b", created, &sessions);
        assert_ne!(second, first);
        assert!(second.starts_with(&first));
    }
}
