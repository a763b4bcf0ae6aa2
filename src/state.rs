//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: every actix worker thread holds a clone of `AppState`, and all
//!   clones point at the same session manager and metrics
//! - **Cleanup**: the manager is dropped when the last clone goes away
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Metrics**: written on every request by the metrics middleware, read by `/metrics`
//! - **Sessions**: the manager guards its own map internally, so `AppState`
//!   only needs an `Arc` around it
//!
//! Configuration is read-only after startup, so it sits in a plain `Arc`.

use crate::config::AppConfig;
use crate::proxy::SessionManager;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// State shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Owns every live relay session
    pub sessions: Arc<SessionManager>,

    /// Updated by the metrics middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub start_time: Instant,
}

/// Request counters collected across all HTTP requests.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: relay reliability
/// - **endpoint_metrics**: per-route latency; long-lived `/stream` requests
///   are counted when their handler returns, not when the stream ends
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Keyed by `METHOD pattern`, e.g. `POST /volume/{session_id}`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, sessions: Arc<SessionManager>) -> Self {
        Self {
            config: Arc::new(config),
            sessions,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    ///
    /// ## Poisoning:
    /// A panic while holding the lock can only leave a counter half-updated,
    /// so a poisoned lock is recovered rather than propagated.
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## HashMap operations:
    /// `.entry().or_default()` creates the metric the first time a route is seen.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the current metrics, so the lock isn't held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pipeline::PipelineSettings;
    use crate::audio::process::testing::FakeLauncher;
    use crate::library::TemplateLibrary;

    fn state() -> AppState {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(TemplateLibrary::new("http://lib/{book_id}", None)),
            Arc::new(FakeLauncher::new()),
            PipelineSettings::default(),
            2,
        ));
        AppState::new(AppConfig::default(), sessions)
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_error_rate_without_requests() {
        let state = state();
        assert_eq!(state.get_metrics_snapshot().error_rate(), 0.0);

        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();
        assert_eq!(state.get_metrics_snapshot().error_rate(), 0.5);
    }
}
